//! Frame model and the shared frame pool.
//!
//! A frame is one unit on the wire: a flag byte, an event name and a payload.
//! Frames are recycled through [`FramePool`]; a frame is always reset before
//! it goes back, so one connection's bytes can never surface in another's
//! buffer.

use crate::config::IpcConfig;
use bytes::BytesMut;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Frame flag bitmask.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const COMPRESSED: Flags = Flags(0b0000_0001);
    pub const PING: Flags = Flags(0b0000_0010);
    pub const HANDSHAKE: Flags = Flags(0b0000_0100);
    pub const LONG_LENGTH: Flags = Flags(0b0000_1000);
    pub const SELF_RECEIVE: Flags = Flags(0b0001_0000);

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Flags, value: bool) {
        if value {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 5] = [
            (Flags::COMPRESSED, "COMPRESSED"),
            (Flags::PING, "PING"),
            (Flags::HANDSHAKE, "HANDSHAKE"),
            (Flags::LONG_LENGTH, "LONG_LENGTH"),
            (Flags::SELF_RECEIVE, "SELF_RECEIVE"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Flags({:#010b} {})", self.0, set.join("|"))
    }
}

/// One unit of the wire protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub flags: Flags,
    pub event: String,
    pub payload: BytesMut,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// A heartbeat frame: only the `PING` flag, no name, no payload.
    pub fn ping() -> Self {
        Self {
            flags: Flags::PING,
            ..Self::default()
        }
    }

    /// Build an application frame.
    pub fn message(event: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            flags: Flags::empty(),
            event: event.into(),
            payload: BytesMut::from(payload),
        }
    }

    pub fn is_ping(&self) -> bool {
        self.flags.contains(Flags::PING)
    }

    pub fn is_handshake(&self) -> bool {
        self.flags.contains(Flags::HANDSHAKE)
    }

    /// Clear flags, name and payload. Capacity is kept for reuse.
    pub fn reset(&mut self) -> &mut Self {
        self.flags = Flags::empty();
        self.event.clear();
        self.payload.clear();
        self
    }
}

/// Pool of reusable frames shared by every connection of a participant.
#[derive(Debug)]
pub struct FramePool {
    free: Mutex<Vec<Frame>>,
    capacity: usize,
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(IpcConfig::FRAME_POOL_CAPACITY)
    }
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Take a clean frame out of the pool.
    ///
    /// The returned guard hands the frame back on drop.
    pub fn acquire(self: &Arc<Self>) -> PooledFrame {
        let frame = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_default();
        PooledFrame {
            frame,
            pool: Arc::clone(self),
        }
    }

    /// Return a frame to the pool, resetting it first.
    ///
    /// Oversized payload buffers are dropped instead of retained.
    pub fn release(&self, mut frame: Frame) {
        frame.reset();
        if frame.payload.capacity() > IpcConfig::POOL_RETAIN_BYTES {
            frame.payload = BytesMut::new();
        }
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.capacity {
                free.push(frame);
            }
        }
    }

    /// Number of idle frames currently held.
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

/// A frame on loan from a [`FramePool`].
pub struct PooledFrame {
    frame: Frame,
    pool: Arc<FramePool>,
}

impl Deref for PooledFrame {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

impl DerefMut for PooledFrame {
    fn deref_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        let frame = std::mem::take(&mut self.frame);
        self.pool.release(frame);
    }
}

impl fmt::Debug for PooledFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledFrame").field(&self.frame).finish()
    }
}
