//! Centralized configuration for udsbus.
//!
//! `IpcConfig` holds the protocol constants and defaults. `IpcOptions` is the
//! per-participant configuration surface, normally filled in through
//! [`IpcBuilder`](crate::IpcBuilder).

use std::path::PathBuf;
use std::time::Duration;

/// Protocol constants and defaults.
pub struct IpcConfig;

impl IpcConfig {
    // Heartbeat
    pub const DEFAULT_HEARTBEAT_STEP: Duration = Duration::from_secs(1);
    pub const MIN_HEARTBEAT_STEP: Duration = Duration::from_millis(50);
    /// A peer silent for longer than this many heartbeat steps is dead.
    pub const HEARTBEAT_TIMEOUT_STEPS: u32 = 2;

    // Handshake
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(100);
    pub const HANDSHAKE_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

    // Role arbitration
    pub const DIAL_ATTEMPTS: u32 = 10;
    pub const DIAL_TIMEOUT: Duration = Duration::from_millis(100);
    pub const DIAL_RETRY_BASE_DELAY: Duration = Duration::from_millis(5);
    pub const DIAL_RETRY_MAX_DELAY: Duration = Duration::from_millis(50);
    pub const ARBITRATION_BACKOFF: Duration = Duration::from_millis(50);
    pub const BIND_LOCK_SUFFIX: &'static str = ".lock";

    // Framing
    pub const SHORT_LENGTH_MAX: usize = u16::MAX as usize;
    pub const MAX_EVENT_NAME_LEN: usize = 1024;
    pub const MAX_PAYLOAD_SIZE: u64 = 256 * 1024 * 1024;
    pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 4096;

    // Buffers and queues
    pub const PEER_QUEUE_DEPTH: usize = 1024;
    pub const FRAME_POOL_CAPACITY: usize = 64;
    pub const POOL_RETAIN_BYTES: usize = 1024 * 1024;
    pub const IO_BUFFER_SIZE: usize = 8 * 1024;
}

/// Runtime options of a single participant.
#[derive(Debug, Clone)]
pub struct IpcOptions {
    /// Filesystem path of the rendezvous socket.
    pub socket_path: PathBuf,
    /// Shared secret proven during the handshake.
    pub secret: String,
    /// Compress payloads larger than `compression_threshold`.
    pub enable_compression: bool,
    /// Payload size in bytes above which compression kicks in.
    pub compression_threshold: usize,
    /// Heartbeat interval. Peers silent for twice this long are dropped.
    pub heartbeat_step: Duration,
    /// Identity announced in the handshake. Defaults to the OS pid.
    pub identity: u64,
    /// Dial attempts per arbitration cycle before trying to bind.
    pub dial_attempts: u32,
    /// Time allowed for a single dial.
    pub dial_timeout: Duration,
    /// Time the broker waits for a peer's handshake request.
    pub handshake_timeout: Duration,
    /// Largest payload accepted on the wire or after decompression.
    pub max_payload_size: u64,
}

impl IpcOptions {
    /// Create options with defaults for everything but path and secret.
    pub fn new(socket_path: impl Into<PathBuf>, secret: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            secret: secret.into(),
            enable_compression: false,
            compression_threshold: IpcConfig::DEFAULT_COMPRESSION_THRESHOLD,
            heartbeat_step: IpcConfig::DEFAULT_HEARTBEAT_STEP,
            identity: u64::from(std::process::id()),
            dial_attempts: IpcConfig::DIAL_ATTEMPTS,
            dial_timeout: IpcConfig::DIAL_TIMEOUT,
            handshake_timeout: IpcConfig::HANDSHAKE_TIMEOUT,
            max_payload_size: IpcConfig::MAX_PAYLOAD_SIZE,
        }
    }

    /// Heartbeat step with the floor applied.
    pub fn effective_heartbeat_step(&self) -> Duration {
        self.heartbeat_step.max(IpcConfig::MIN_HEARTBEAT_STEP)
    }

    /// Silence after which a peer counts as dead.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.effective_heartbeat_step() * IpcConfig::HEARTBEAT_TIMEOUT_STEPS
    }

    /// Compression threshold, or `None` when compression is off.
    pub fn compression(&self) -> Option<usize> {
        if self.enable_compression && self.compression_threshold > 0 {
            Some(self.compression_threshold)
        } else {
            None
        }
    }

    /// Path of the advisory lock file guarding the bind critical section.
    pub fn bind_lock_path(&self) -> PathBuf {
        let mut name = self.socket_path.clone().into_os_string();
        name.push(IpcConfig::BIND_LOCK_SUFFIX);
        PathBuf::from(name)
    }
}
