//! Role arbitration: dial the rendezvous socket or become its broker.
//!
//! Each cycle first tries to dial an existing broker. If every attempt fails
//! the participant tries to bind the socket itself; the winner spawns the
//! broker and then dials its own socket like everyone else. Whatever the
//! outcome, the cycle ends in one client session, and when that session
//! ends the next cycle starts. The loop never exits.
//!
//! Binding is serialized across processes with an advisory lock on
//! `<socket>.lock`. Inside the lock a leftover socket file is probed: a live
//! listener means another broker exists, otherwise the file is stale and is
//! removed before one more bind attempt.

use super::client;
use super::server::Broker;
use crate::config::{IpcConfig, IpcOptions};
use crate::logging::emit;
use crate::retry::{jittered, retry_async, RetryPolicy};
use crate::{Ipc, IpcError, Result, Role};
use fs2::FileExt;
use std::convert::Infallible;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};

/// Arbitrate and run sessions forever.
pub(crate) async fn run(ipc: &Ipc) -> Infallible {
    let state = ipc.state();
    loop {
        if let Err(e) = cycle(ipc).await {
            emit!(
                state.logger,
                WARN,
                "Session ended: {} ({}); re-arbitrating",
                e,
                e.kind_name()
            );
        }
        state.set_role(if state.hosts_broker() {
            Role::Broker
        } else {
            Role::Undecided
        });
        tokio::time::sleep(jittered(IpcConfig::ARBITRATION_BACKOFF)).await;
    }
}

/// One arbitration cycle, ending when its session ends.
async fn cycle(ipc: &Ipc) -> Result<()> {
    let state = ipc.state();
    let options = &state.options;

    let stream = match dial(options).await {
        Ok(stream) => stream,
        Err(dial_err) => {
            emit!(
                state.logger,
                DEBUG,
                "No broker reachable ({}); trying to bind",
                dial_err
            );
            let listener = bind_rendezvous(options).await?;
            let broker = Arc::new(Broker::new(
                options,
                Arc::clone(&state.pool),
                state.logger.clone(),
            ));
            state.install_broker(broker.spawn(listener));
            emit!(
                state.logger,
                INFO,
                "Became broker at {}",
                options.socket_path.display()
            );
            dial(options).await?
        }
    };

    let broker = state.hosts_broker();
    state.set_role(if broker { Role::Broker } else { Role::Client });
    client::run_session(ipc, stream, broker).await
}

/// Dial the rendezvous socket with bounded, jittered retries.
pub async fn dial(options: &IpcOptions) -> Result<UnixStream> {
    let policy = RetryPolicy::new()
        .with_max_attempts(options.dial_attempts)
        .with_base_delay(IpcConfig::DIAL_RETRY_BASE_DELAY)
        .with_max_delay(IpcConfig::DIAL_RETRY_MAX_DELAY);

    let path = options.socket_path.as_path();
    let timeout = options.dial_timeout;
    let (result, stats) = retry_async(
        &policy,
        || dial_once(path, timeout),
        |e: &IpcError| e.is_retryable(),
    )
    .await;

    result.map_err(|e| IpcError::DialExhausted {
        path: options.socket_path.clone(),
        attempts: stats.attempts,
        last_error: e.to_string(),
    })
}

async fn dial_once(path: &Path, timeout: Duration) -> Result<UnixStream> {
    tokio::time::timeout(timeout, UnixStream::connect(path))
        .await
        .map_err(|_| IpcError::Io {
            message: format!("connect timed out after {:?}", timeout),
            source: None,
        })?
        .map_err(IpcError::from)
}

/// Bind the rendezvous socket, reclaiming it if a dead broker left it behind.
///
/// Fails with `SocketUnavailable` when a live broker holds the path or
/// another participant is binding right now.
pub async fn bind_rendezvous(options: &IpcOptions) -> Result<UnixListener> {
    let path = options.socket_path.as_path();
    let unavailable = |reason: String| IpcError::SocketUnavailable {
        path: path.to_path_buf(),
        reason,
    };

    let lock_path = options.bind_lock_path();
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| IpcError::Io {
            message: format!("Failed to open bind lock {}", lock_path.display()),
            source: Some(e),
        })?;
    lock_file
        .try_lock_exclusive()
        .map_err(|e| unavailable(format!("bind in progress elsewhere: {}", e)))?;

    let result = match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            if dial_once(path, options.dial_timeout).await.is_ok() {
                Err(unavailable("a live broker is listening".to_string()))
            } else {
                tracing::debug!("Removing stale socket {}", path.display());
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        let _ = FileExt::unlock(&lock_file);
                        return Err(unavailable(format!("cannot remove stale socket: {}", e)));
                    }
                }
                UnixListener::bind(path)
                    .map_err(|e| unavailable(format!("bind after removing stale socket: {}", e)))
            }
        }
        Err(e) => Err(unavailable(e.to_string())),
    };

    let _ = FileExt::unlock(&lock_file);
    result
}
