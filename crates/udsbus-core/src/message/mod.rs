//! Typed messages carried by the bus.
//!
//! Each message type supplies its own payload encoding through [`Message`] and
//! is identified on the wire by a stable type key, by default its
//! fully-qualified Rust type name. [`Json`] covers the common case of a serde
//! type shipped as JSON.

pub mod registry;

pub use registry::{DecodeFn, MessageRegistry};

use crate::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;

/// A message type that can travel over the bus.
pub trait Message: Send + Sync + 'static {
    /// Stable key stamped into the frame's event name.
    ///
    /// Every participant must agree on it, so override it when processes are
    /// built from different sources.
    fn type_key() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }

    /// Append the payload bytes for this message.
    fn encode(&self, buf: &mut BytesMut) -> Result<()>;

    /// Rebuild a message from payload bytes.
    fn decode(buf: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// Object-safe view of a [`Message`], used on dispatch paths.
pub trait AnyMessage: Send + Sync + 'static {
    fn key(&self) -> &'static str;
    fn encode_into(&self, buf: &mut BytesMut) -> Result<()>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T: Message> AnyMessage for T {
    fn key(&self) -> &'static str {
        T::type_key()
    }

    fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        self.encode(buf)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

/// A decoded inbound message handed to the application.
pub struct Inbound {
    message: Box<dyn AnyMessage>,
}

impl Inbound {
    pub fn new(message: Box<dyn AnyMessage>) -> Self {
        Self { message }
    }

    /// Type key the message arrived under.
    pub fn key(&self) -> &'static str {
        self.message.key()
    }

    pub fn is<T: Message>(&self) -> bool {
        self.message.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.message.as_any().downcast_ref::<T>()
    }

    /// Take the concrete message out, or get `self` back on a type mismatch.
    pub fn downcast<T: Message>(self) -> std::result::Result<T, Self> {
        if self.is::<T>() {
            self.message
                .into_any()
                .downcast::<T>()
                .map(|boxed| *boxed)
                .map_err(|_| unreachable!("type checked above"))
        } else {
            Err(self)
        }
    }
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound").field("key", &self.key()).finish()
    }
}

/// Application callback for inbound messages.
///
/// Each message is handled on its own task, so a slow handler never stalls
/// the connection's read loop.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Inbound);
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(Inbound) + Send + Sync + 'static,
{
    async fn handle(&self, message: Inbound) {
        self(message)
    }
}

/// JSON-encoded wrapper for any serde type.
///
/// The type key is the inner type's name, so `Json<Chat>` travels as
/// `"my_app::Chat"`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T> Message for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn type_key() -> &'static str {
        std::any::type_name::<T>()
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let bytes = serde_json::to_vec(&self.0)?;
        buf.extend_from_slice(&bytes);
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Json(serde_json::from_slice(buf)?))
    }
}
