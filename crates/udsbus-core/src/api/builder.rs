//! Builder for configuring an `Ipc` participant.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::api::state::IpcState;
use crate::config::IpcOptions;
use crate::error::{IpcError, Result};
use crate::ipc::client::SessionHook;
use crate::logging::{LogLevel, LogSink, Logger};
use crate::message::{Message, MessageHandler, MessageRegistry};
use crate::Ipc;

/// Builder for configuring an [`Ipc`] participant.
///
/// # Example
///
/// ```rust,ignore
/// use udsbus::{Inbound, Ipc, Json};
///
/// let ipc = Ipc::builder("/tmp/app.sock", "shared-secret")
///     .compression(true)
///     .heartbeat_step(Duration::from_millis(500))
///     .register::<Json<Chat>>()
///     .on_message(|msg: Inbound| println!("got {}", msg.key()))
///     .build()?;
///
/// tokio::spawn({
///     let ipc = ipc.clone();
///     async move { ipc.run().await }
/// });
/// ipc.send(Json(Chat { text: "hello".into() })).await?;
/// ```
pub struct IpcBuilder {
    options: IpcOptions,
    log_sink: Option<LogSink>,
    hook: Option<Arc<dyn SessionHook>>,
    handler: Option<Arc<dyn MessageHandler>>,
    registry: MessageRegistry,
}

impl IpcBuilder {
    /// Create a builder for the rendezvous socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>, secret: impl Into<String>) -> Self {
        Self {
            options: IpcOptions::new(socket_path, secret),
            log_sink: None,
            hook: None,
            handler: None,
            registry: MessageRegistry::new(),
        }
    }

    /// Start from a complete set of options.
    pub fn from_options(options: IpcOptions) -> Self {
        Self {
            options,
            log_sink: None,
            hook: None,
            handler: None,
            registry: MessageRegistry::new(),
        }
    }

    /// Gzip payloads larger than the compression threshold.
    ///
    /// Default: `false`
    pub fn compression(mut self, enable: bool) -> Self {
        self.options.enable_compression = enable;
        self
    }

    /// Payload size above which compression kicks in.
    ///
    /// Default: 4 KiB
    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.options.compression_threshold = bytes;
        self
    }

    /// Heartbeat interval. Values below 50 ms are raised to 50 ms.
    ///
    /// Default: 1 s
    pub fn heartbeat_step(mut self, step: Duration) -> Self {
        self.options.heartbeat_step = step;
        self
    }

    /// Identity announced in the handshake.
    ///
    /// Default: the OS process id. Override only when several participants
    /// share one process.
    pub fn identity(mut self, identity: u64) -> Self {
        self.options.identity = identity;
        self
    }

    /// Largest payload accepted or produced, in bytes.
    pub fn max_payload_size(mut self, bytes: u64) -> Self {
        self.options.max_payload_size = bytes;
        self
    }

    /// Connection attempts per arbitration cycle and the bound on each.
    pub fn dial(mut self, attempts: u32, timeout: Duration) -> Self {
        self.options.dial_attempts = attempts;
        self.options.dial_timeout = timeout;
        self
    }

    /// How long the broker waits for a new connection's handshake.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options.handshake_timeout = timeout;
        self
    }

    /// Forward engine log events to `sink` as `(level, unix_millis, message)`.
    pub fn on_log<F>(mut self, sink: F) -> Self
    where
        F: Fn(LogLevel, i64, &str) + Send + Sync + 'static,
    {
        self.log_sink = Some(Arc::new(sink));
        self
    }

    /// Run `hook` once after every successful handshake.
    pub fn after_handshake<H: SessionHook>(mut self, hook: H) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Handle inbound messages. Can also be set later with
    /// [`Ipc::on_message`].
    pub fn on_message<H: MessageHandler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Pre-register a message type so it can be received before this
    /// participant ever sends one.
    pub fn register<T: Message>(self) -> Self {
        self.registry.register::<T>();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.options.socket_path.as_os_str().is_empty() {
            return Err(IpcError::Config {
                message: "socket path must not be empty".to_string(),
            });
        }
        if self.options.secret.is_empty() {
            return Err(IpcError::Config {
                message: "secret must not be empty".to_string(),
            });
        }
        if self.options.dial_timeout.is_zero() || self.options.handshake_timeout.is_zero() {
            return Err(IpcError::Config {
                message: "dial and handshake timeouts must be non-zero".to_string(),
            });
        }
        if self.options.max_payload_size == 0 {
            return Err(IpcError::Config {
                message: "max payload size must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Build the participant. Nothing touches the socket until
    /// [`Ipc::run`] is called.
    pub fn build(self) -> Result<Ipc> {
        self.validate()?;

        let state = IpcState::new(
            self.options,
            Logger::new(self.log_sink),
            self.hook,
            self.handler,
            self.registry,
        );
        Ok(Ipc::from_state(Arc::new(state)))
    }
}
