//! Client session: one participant's connection to the current broker.
//!
//! Every participant runs exactly one session at a time, including the
//! process that currently hosts the broker (it dials its own socket). A
//! session lives until its connection fails; the arbiter then starts over.
//!
//! # Tasks
//!
//! - A spawned read task decodes frames, refreshes liveness and dispatches
//!   typed messages to the application handler on their own tasks.
//! - The session task itself is the only writer. It selects over the read
//!   task's terminal error, the participant's outbound queue and the
//!   heartbeat ticker.

use super::frame::{Flags, Frame};
use super::handshake;
use super::liveness::Liveness;
use super::protocol::write_encoded;
use crate::api::IpcState;
use crate::config::IpcConfig;
use crate::logging::emit;
use crate::message::{AnyMessage, Inbound};
use crate::{Ipc, IpcError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Facts about an established session, handed to the [`SessionHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// Identity this participant proved in the handshake.
    pub identity: u64,
    /// Counts sessions of this participant, starting at 1.
    pub session_id: u64,
    /// True when this participant also hosts the broker.
    pub broker: bool,
}

/// Extension point run once per established session, on its own task.
#[async_trait]
pub trait SessionHook: Send + Sync + 'static {
    async fn after_handshake(&self, ipc: Ipc, session: SessionInfo);
}

#[async_trait]
impl<F> SessionHook for F
where
    F: Fn(Ipc, SessionInfo) + Send + Sync + 'static,
{
    async fn after_handshake(&self, ipc: Ipc, session: SessionInfo) {
        self(ipc, session)
    }
}

/// A message waiting for the writer.
pub(crate) struct OutboundItem {
    pub key: &'static str,
    pub message: Box<dyn AnyMessage>,
    pub self_receive: bool,
    /// Signalled as soon as the writer takes the item.
    pub taken: Option<oneshot::Sender<()>>,
    /// Receives the write outcome when the caller asked to wait.
    pub done: Option<oneshot::Sender<Result<()>>>,
}

impl std::fmt::Debug for OutboundItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundItem")
            .field("key", &self.key)
            .field("self_receive", &self.self_receive)
            .field("wait", &self.done.is_some())
            .finish()
    }
}

/// Clears the connected flag however the session ends.
struct ConnectedGuard<'a>(&'a IpcState);

impl Drop for ConnectedGuard<'_> {
    fn drop(&mut self) {
        self.0.set_connected(false);
    }
}

/// Run one session over `stream` until it fails.
///
/// Always returns an error describing why the session ended.
pub(crate) async fn run_session(ipc: &Ipc, stream: UnixStream, broker: bool) -> Result<()> {
    let state = ipc.state();
    let options = &state.options;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(IpcConfig::IO_BUFFER_SIZE, read_half);

    {
        let mut frame = state.pool.acquire();
        handshake::initiate(
            &state.codec,
            &mut reader,
            &mut write_half,
            &mut frame,
            options.identity,
            &options.secret,
            IpcConfig::HANDSHAKE_REPLY_TIMEOUT,
        )
        .await?;
    }

    let info = SessionInfo {
        identity: options.identity,
        session_id: state.next_session_id(),
        broker,
    };
    state.set_connected(true);
    let _connected = ConnectedGuard(state);
    emit!(
        state.logger,
        INFO,
        "Session {} established (broker: {})",
        info.session_id,
        broker
    );

    if let Some(hook) = state.hook.clone() {
        let ipc = ipc.clone();
        tokio::spawn(async move {
            hook.after_handshake(ipc, info).await;
        });
    }

    let liveness = Arc::new(Liveness::new());
    liveness.touch();
    let (err_tx, err_rx) = oneshot::channel();
    let read_task = tokio::spawn(read_loop(
        Arc::clone(state),
        reader,
        Arc::clone(&liveness),
        err_tx,
    ));

    let result = write_loop(state, &mut write_half, &liveness, err_rx).await;
    read_task.abort();
    result
}

async fn read_loop(
    state: Arc<IpcState>,
    mut reader: BufReader<OwnedReadHalf>,
    liveness: Arc<Liveness>,
    err_tx: oneshot::Sender<IpcError>,
) {
    let mut frame = state.pool.acquire();
    let err = loop {
        if let Err(e) = state.codec.read_frame(&mut reader, &mut frame).await {
            break e;
        }
        liveness.touch();
        if frame.is_ping() || frame.is_handshake() {
            continue;
        }
        dispatch(&state, &frame);
    };
    let _ = err_tx.send(err);
}

/// Decode `frame` and hand it to the application handler on its own task.
///
/// Unknown event names and undecodable payloads are dropped.
fn dispatch(state: &IpcState, frame: &Frame) {
    let Some(decode) = state.registry.resolve(&frame.event) else {
        tracing::trace!("No decoder for event {:?}; dropping", frame.event);
        return;
    };
    let message = match decode(&frame.payload) {
        Ok(message) => message,
        Err(e) => {
            emit!(
                state.logger,
                WARN,
                "Dropping undecodable {} payload: {}",
                frame.event,
                e
            );
            return;
        }
    };
    if let Some(handler) = state.handler() {
        tokio::spawn(async move {
            handler.handle(Inbound::new(message)).await;
        });
    }
}

async fn write_loop(
    state: &IpcState,
    writer: &mut OwnedWriteHalf,
    liveness: &Liveness,
    mut err_rx: oneshot::Receiver<IpcError>,
) -> Result<()> {
    let step = state.options.effective_heartbeat_step();
    let limit = state.options.heartbeat_timeout();
    // Ping whenever nothing else went out for half a step, so the broker
    // hears from us well inside its own timeout.
    let quiet = step / 2;

    let mut ping = BytesMut::new();
    state.codec.encode(&Frame::ping(), &mut ping)?;
    let mut frame = state.pool.acquire();
    let mut scratch = BytesMut::new();
    let mut last_write = Instant::now();

    let mut ticker = interval_at(Instant::now() + step, step);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Sessions run one at a time, so this lock is never contended.
    let mut outbound = state.outbound_rx.lock().await;

    loop {
        tokio::select! {
            biased;
            read_err = &mut err_rx => {
                return Err(read_err.unwrap_or_else(|_| IpcError::ConnectionReadFailed {
                    message: "read task stopped".to_string(),
                    source: None,
                }));
            }
            _ = ticker.tick() => {
                if liveness.expired(limit) {
                    return Err(IpcError::PingTimeout {
                        silent: liveness.silent_for(),
                        limit,
                    });
                }
                if last_write.elapsed() >= quiet {
                    write_encoded(writer, &ping).await?;
                    last_write = Instant::now();
                }
            }
            item = outbound.recv() => {
                let Some(mut item) = item else {
                    return Err(IpcError::Other("outbound queue closed".to_string()));
                };
                if let Some(taken) = item.taken.take() {
                    let _ = taken.send(());
                }
                let outcome = write_item(state, writer, &mut frame, &mut scratch, &item).await;
                last_write = Instant::now();
                let session_err = outcome.as_ref().err().map(IpcError::detached);
                if let Some(done) = item.done {
                    let _ = done.send(outcome);
                }
                if let Some(err) = session_err {
                    return Err(err);
                }
            }
        }
    }
}

async fn write_item(
    state: &IpcState,
    writer: &mut OwnedWriteHalf,
    frame: &mut Frame,
    scratch: &mut BytesMut,
    item: &OutboundItem,
) -> Result<()> {
    frame.reset();
    frame.event.push_str(item.key);
    frame.flags.set(Flags::SELF_RECEIVE, item.self_receive);
    item.message
        .encode_into(&mut frame.payload)
        .map_err(|e| IpcError::PacketEncodeFailed {
            message: format!("{}: {}", item.key, e),
        })?;
    state.codec.write_frame(writer, frame, scratch).await
}
