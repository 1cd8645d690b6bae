//! Broker: the listening side of the rendezvous socket.
//!
//! Accepts connections, proves each peer's identity, registers it and relays
//! every application frame it sends to the other registered peers.
//!
//! # Connection tasks
//!
//! Each accepted connection gets one handler task. After the handshake the
//! handler splits the stream: a spawned read task decodes frames and relays
//! them, while the handler itself becomes the connection's only writer. It
//! multiplexes three sources with `tokio::select!`: the read task's terminal
//! error, the connection's relay queue, and the heartbeat ticker. A closed
//! relay queue means the record was pruned or replaced by a reconnect.

use super::connections::{ConnectionRecord, ConnectionRegistry};
use super::frame::{Flags, Frame, FramePool};
use super::handshake;
use super::liveness::Liveness;
use super::protocol::{write_encoded, FrameCodec};
use crate::config::{IpcConfig, IpcOptions};
use crate::logging::{emit, Logger};
use crate::{IpcError, Result};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Handle to a running broker. Dropping it stops the accept loop.
pub struct BrokerHandle {
    broker: Arc<Broker>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl BrokerHandle {
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// True once the accept loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Stop accepting. Established connections keep running until they fail.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Broker state shared by the accept loop and every connection handler.
#[derive(Debug)]
pub struct Broker {
    secret: String,
    heartbeat_step: Duration,
    heartbeat_timeout: Duration,
    handshake_timeout: Duration,
    codec: FrameCodec,
    pool: Arc<FramePool>,
    logger: Logger,
    connections: ConnectionRegistry,
}

impl Broker {
    pub fn new(options: &IpcOptions, pool: Arc<FramePool>, logger: Logger) -> Self {
        Self {
            secret: options.secret.clone(),
            heartbeat_step: options.effective_heartbeat_step(),
            heartbeat_timeout: options.heartbeat_timeout(),
            handshake_timeout: options.handshake_timeout,
            codec: FrameCodec::from_options(options),
            pool,
            logger,
            connections: ConnectionRegistry::new(),
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Start accepting on `listener` in a background task.
    pub fn spawn(self: Arc<Self>, listener: UnixListener) -> BrokerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task_handle = tokio::spawn(Arc::clone(&self).accept_loop(listener, shutdown_rx));
        BrokerHandle {
            broker: self,
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: UnixListener, mut shutdown_rx: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    emit!(self.logger, DEBUG, "Broker accept loop shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let broker = Arc::clone(&self);
                            let conn_id = broker.connections.next_conn_id();
                            tokio::spawn(async move {
                                if let Err(e) = Arc::clone(&broker).handle_connection(stream, conn_id).await {
                                    emit!(
                                        broker.logger,
                                        DEBUG,
                                        "Connection {} ended: {} ({})",
                                        conn_id,
                                        e,
                                        e.kind_name()
                                    );
                                }
                            });
                        }
                        Err(e) => {
                            emit!(self.logger, ERROR, "Broker accept error: {}", e);
                            // Descriptor exhaustion and similar are transient
                            tokio::time::sleep(self.heartbeat_step / 4).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream, conn_id: u64) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::with_capacity(IpcConfig::IO_BUFFER_SIZE, read_half);

        let (identity, liveness, mut queue_rx) = {
            let mut frame = self.pool.acquire();
            let identity = handshake::read_request(
                &self.codec,
                &mut reader,
                &mut frame,
                &self.secret,
                self.handshake_timeout,
            )
            .await?;

            let liveness = Arc::new(Liveness::new());
            liveness.touch();
            let (queue_tx, queue_rx) = mpsc::channel(IpcConfig::PEER_QUEUE_DEPTH);
            self.connections
                .register(ConnectionRecord::new(identity, conn_id, Arc::clone(&liveness), queue_tx))
                .await;

            if let Err(e) = handshake::reply(&self.codec, &mut write_half, &mut frame).await {
                self.connections.remove(identity, conn_id).await;
                return Err(e);
            }
            emit!(
                self.logger,
                INFO,
                "Peer {} registered (connection {})",
                identity,
                conn_id
            );

            (identity, liveness, queue_rx)
        };

        let (err_tx, mut err_rx) = oneshot::channel();
        let read_task = tokio::spawn(Arc::clone(&self).read_loop(
            reader,
            identity,
            Arc::clone(&liveness),
            err_tx,
        ));

        let result = self
            .write_loop(&mut write_half, &mut queue_rx, &liveness, &mut err_rx)
            .await;

        read_task.abort();
        if self.connections.remove(identity, conn_id).await {
            emit!(
                self.logger,
                INFO,
                "Peer {} removed (connection {})",
                identity,
                conn_id
            );
        }
        result
    }

    /// Decode frames from one peer and relay them to the others.
    async fn read_loop(
        self: Arc<Self>,
        mut reader: BufReader<OwnedReadHalf>,
        identity: u64,
        liveness: Arc<Liveness>,
        err_tx: oneshot::Sender<IpcError>,
    ) {
        let mut frame = self.pool.acquire();
        let mut encoded = BytesMut::new();

        let err = loop {
            if let Err(e) = self.codec.read_frame(&mut reader, &mut frame).await {
                break e;
            }
            liveness.touch();
            if frame.is_ping() || frame.is_handshake() {
                continue;
            }

            if let Err(e) = self.codec.encode(&frame, &mut encoded) {
                break e;
            }
            let self_receive = frame.flags.contains(Flags::SELF_RECEIVE);
            let outcome = self
                .connections
                .relay(
                    identity,
                    encoded.split().freeze(),
                    self_receive,
                    self.heartbeat_timeout,
                )
                .await;
            // Waiting on a backlogged peer is not silence from this one.
            liveness.touch();
            for pruned in outcome.pruned {
                emit!(
                    self.logger,
                    WARN,
                    "Dropping peer {}: relay queue closed or stuck full",
                    pruned
                );
            }
        };

        let _ = err_tx.send(err);
    }

    /// Single writer for one peer: relayed frames and heartbeats.
    async fn write_loop(
        &self,
        writer: &mut OwnedWriteHalf,
        queue_rx: &mut mpsc::Receiver<Bytes>,
        liveness: &Liveness,
        err_rx: &mut oneshot::Receiver<IpcError>,
    ) -> Result<()> {
        let mut ping = BytesMut::new();
        self.codec.encode(&Frame::ping(), &mut ping)?;

        let mut ticker = interval_at(Instant::now() + self.heartbeat_step, self.heartbeat_step);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                read_err = &mut *err_rx => {
                    return Err(read_err.unwrap_or_else(|_| IpcError::ConnectionReadFailed {
                        message: "read task stopped".to_string(),
                        source: None,
                    }));
                }
                _ = ticker.tick() => {
                    if liveness.expired(self.heartbeat_timeout) {
                        return Err(IpcError::PingTimeout {
                            silent: liveness.silent_for(),
                            limit: self.heartbeat_timeout,
                        });
                    }
                    write_encoded(writer, &ping).await?;
                }
                queued = queue_rx.recv() => {
                    match queued {
                        Some(bytes) => write_encoded(writer, &bytes).await?,
                        None => {
                            return Err(IpcError::Other(
                                "connection pruned or replaced".to_string(),
                            ));
                        }
                    }
                }
            }
        }
    }
}
