//! Type-key to decoder table shared by the send and receive paths.

use super::{AnyMessage, Message};
use crate::Result;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Builds a fresh message instance from payload bytes.
pub type DecodeFn = fn(&[u8]) -> Result<Box<dyn AnyMessage>>;

fn decode_boxed<T: Message>(buf: &[u8]) -> Result<Box<dyn AnyMessage>> {
    Ok(Box::new(T::decode(buf)?))
}

/// Registry of message types known to this participant.
///
/// Entries are added explicitly at start-up and lazily whenever a type is
/// first sent. Lookups and inserts may race between the writer loop and the
/// read loop, so the table sits behind a read/write lock.
#[derive(Default)]
pub struct MessageRegistry {
    entries: RwLock<HashMap<&'static str, DecodeFn>>,
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&'static str> = self
            .entries
            .read()
            .map(|entries| entries.keys().copied().collect())
            .unwrap_or_default();
        f.debug_struct("MessageRegistry").field("keys", &keys).finish()
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` and return the key to stamp into outgoing frames.
    pub fn register<T: Message>(&self) -> &'static str {
        let key = T::type_key();
        self.insert(key, decode_boxed::<T>);
        key
    }

    /// Register a decoder under an explicit key.
    ///
    /// The first registration of a key wins; later ones are ignored.
    pub fn insert(&self, key: &'static str, decode: DecodeFn) {
        // Fast path: already known
        if let Ok(entries) = self.entries.read() {
            if entries.contains_key(key) {
                return;
            }
        }

        if let Ok(mut entries) = self.entries.write() {
            entries.entry(key).or_insert(decode);
        }
    }

    /// Decoder for `key`, or `None` when the type is unknown.
    pub fn resolve(&self, key: &str) -> Option<DecodeFn> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(key).copied())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.resolve(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decoder function for `T`, for callers building entries by hand.
pub fn decoder_for<T: Message>() -> DecodeFn {
    decode_boxed::<T>
}
