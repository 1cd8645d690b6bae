//! udsbus - brokerless typed message bus over a shared Unix domain socket.
//!
//! Independent processes on one host point at the same socket path and
//! shared secret. The first to bind becomes the broker; the rest connect to
//! it. Every participant broadcasts typed messages to all others, and if the
//! broker dies one of the survivors takes over.
//!
//! # Example
//!
//! ```rust,ignore
//! use serde::{Deserialize, Serialize};
//! use udsbus::{Inbound, Ipc, Json};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Chat {
//!     text: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> udsbus::Result<()> {
//!     let ipc = Ipc::builder("/tmp/chat.sock", "shared-secret")
//!         .register::<Json<Chat>>()
//!         .on_message(|msg: Inbound| {
//!             if let Some(Json(chat)) = msg.downcast_ref::<Json<Chat>>() {
//!                 println!("{}", chat.text);
//!             }
//!         })
//!         .build()?;
//!
//!     let runner = ipc.clone();
//!     tokio::spawn(async move { runner.run().await });
//!
//!     ipc.send(Json(Chat { text: "hello".into() })).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod message;
pub mod retry;

mod api;

pub use api::IpcBuilder;
pub use config::{IpcConfig, IpcOptions};
pub use error::{IpcError, Result};
pub use ipc::{PeerInfo, SessionHook, SessionInfo};
pub use logging::{LogLevel, LogSink};
pub use message::{Inbound, Json, Message, MessageHandler};

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use api::IpcState;

/// Role a participant currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Role {
    /// Not yet arbitrated, or between sessions without hosting the broker.
    Undecided = 0,
    /// Hosts the broker (and runs a client session against it).
    Broker = 1,
    /// Connected to a broker hosted elsewhere.
    Client = 2,
}

impl Role {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Role::Broker,
            2 => Role::Client,
            _ => Role::Undecided,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Undecided => write!(f, "undecided"),
            Role::Broker => write!(f, "broker"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Snapshot of a participant's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcStatus {
    pub identity: u64,
    pub role: Role,
    /// True while a session is established.
    pub connected: bool,
    /// Sessions established so far.
    pub session_count: u64,
}

/// Per-send options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Deliver the message back to this participant as well.
    pub self_receive: bool,
    /// Wait for the write outcome.
    pub wait: bool,
}

/// Handle to one bus participant.
///
/// Cheap to clone; all clones drive the same participant. Build it with
/// [`Ipc::builder`], spawn [`Ipc::run`], then send from any clone.
#[derive(Clone)]
pub struct Ipc {
    state: Arc<IpcState>,
}

impl Ipc {
    /// Create a builder for a participant on `socket_path`.
    pub fn builder(socket_path: impl Into<std::path::PathBuf>, secret: impl Into<String>) -> IpcBuilder {
        IpcBuilder::new(socket_path, secret)
    }

    pub(crate) fn from_state(state: Arc<IpcState>) -> Self {
        Self { state }
    }

    pub(crate) fn state(&self) -> &Arc<IpcState> {
        &self.state
    }

    pub fn options(&self) -> &IpcOptions {
        &self.state.options
    }

    /// Register `T` so inbound frames of that type can be decoded.
    ///
    /// Types are also registered on first send.
    pub fn register<T: Message>(&self) -> &'static str {
        self.state.registry.register::<T>()
    }

    /// Replace the inbound message handler.
    pub fn on_message<H: MessageHandler>(&self, handler: H) {
        self.state.set_handler(Arc::new(handler));
    }

    /// Run role arbitration and sessions forever.
    ///
    /// Only returns, with a `Config` error, if this participant is already
    /// running.
    pub async fn run(&self) -> Result<Infallible> {
        if !self.state.try_start() {
            return Err(IpcError::Config {
                message: "participant is already running".to_string(),
            });
        }
        Ok(ipc::arbiter::run(self).await)
    }

    pub fn status(&self) -> IpcStatus {
        IpcStatus {
            identity: self.state.options.identity,
            role: self.state.role(),
            connected: self.state.is_connected(),
            session_count: self.state.session_count(),
        }
    }

    /// Identities registered with the broker, if this participant hosts it.
    pub async fn peers(&self) -> Vec<u64> {
        match self.state.broker() {
            Some(broker) => broker.connections().identities().await,
            None => Vec::new(),
        }
    }

    /// Registered peers and how long each has been silent, if this
    /// participant hosts the broker.
    pub async fn peer_info(&self) -> Vec<PeerInfo> {
        match self.state.broker() {
            Some(broker) => broker.connections().peer_info().await,
            None => Vec::new(),
        }
    }
}

impl fmt::Debug for Ipc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ipc")
            .field("socket_path", &self.state.options.socket_path)
            .field("status", &self.status())
            .finish()
    }
}
