//! Participant state shared by the public handle and the engine tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

use crate::config::IpcOptions;
use crate::ipc::client::{OutboundItem, SessionHook};
use crate::ipc::frame::FramePool;
use crate::ipc::protocol::FrameCodec;
use crate::ipc::server::{Broker, BrokerHandle};
use crate::logging::Logger;
use crate::message::{MessageHandler, MessageRegistry};
use crate::Role;

/// Everything one participant owns.
///
/// Wrapped in `Arc` so that the arbiter, the session tasks and every
/// clone of [`Ipc`](crate::Ipc) see the same registry, queue and role.
pub(crate) struct IpcState {
    pub(crate) options: IpcOptions,
    pub(crate) codec: FrameCodec,
    pub(crate) pool: Arc<FramePool>,
    pub(crate) registry: MessageRegistry,
    pub(crate) logger: Logger,
    pub(crate) hook: Option<Arc<dyn SessionHook>>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    /// Single-slot queue into the active session's writer.
    pub(crate) outbound_tx: mpsc::Sender<OutboundItem>,
    pub(crate) outbound_rx: tokio::sync::Mutex<mpsc::Receiver<OutboundItem>>,
    /// Broker hosted by this participant, if it won the bind.
    broker: Mutex<Option<BrokerHandle>>,
    role: AtomicU8,
    connected: AtomicBool,
    sessions: AtomicU64,
    running: AtomicBool,
}

impl IpcState {
    pub(crate) fn new(
        options: IpcOptions,
        logger: Logger,
        hook: Option<Arc<dyn SessionHook>>,
        handler: Option<Arc<dyn MessageHandler>>,
        registry: MessageRegistry,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        Self {
            codec: FrameCodec::from_options(&options),
            pool: Arc::new(FramePool::default()),
            options,
            registry,
            logger,
            hook,
            handler: RwLock::new(handler),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            broker: Mutex::new(None),
            role: AtomicU8::new(Role::Undecided as u8),
            connected: AtomicBool::new(false),
            sessions: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler.read().ok().and_then(|handler| handler.clone())
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(handler);
        }
    }

    /// Claim the right to run the arbiter. Only the first caller wins.
    pub(crate) fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.sessions.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn session_count(&self) -> u64 {
        self.sessions.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    pub(crate) fn set_role(&self, role: Role) {
        self.role.store(role as u8, Ordering::Release);
    }

    pub(crate) fn install_broker(&self, handle: BrokerHandle) {
        if let Ok(mut slot) = self.broker.lock() {
            *slot = Some(handle);
        }
    }

    /// True while this participant's broker is still accepting.
    ///
    /// A broker whose accept loop has exited is dropped here.
    pub(crate) fn hosts_broker(&self) -> bool {
        let Ok(mut slot) = self.broker.lock() else {
            return false;
        };
        if slot.as_ref().is_some_and(BrokerHandle::is_finished) {
            *slot = None;
        }
        slot.is_some()
    }

    pub(crate) fn broker(&self) -> Option<Arc<Broker>> {
        self.broker
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|handle| Arc::clone(handle.broker())))
    }
}
