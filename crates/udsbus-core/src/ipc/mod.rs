//! Protocol engine over a shared Unix domain socket.
//!
//! Whichever participant binds the rendezvous socket first runs the broker;
//! every participant, the broker's own process included, runs one client
//! session against it. When a session fails the participant re-arbitrates,
//! so a dead broker is replaced by one of the survivors.
//!
//! # Architecture
//!
//! ```text
//! Participant A (broker)              Participant B
//! +-------------------+               +-------------------+
//! | arbiter           |               | arbiter           |
//! |  server (accept)  |<--- dial -----|  client session   |
//! |  client session --+--> own socket |                   |
//! +-------------------+               +-------------------+
//! ```
//!
//! # Wire protocol
//!
//! `[flags][event name][0x00][u16 | u64 BE length][payload]`, see
//! [`protocol`].

pub mod arbiter;
pub mod client;
pub mod connections;
pub mod frame;
pub mod handshake;
pub mod liveness;
pub mod protocol;
pub mod server;

pub use client::{SessionHook, SessionInfo};
pub use connections::PeerInfo;
pub use frame::{Flags, Frame, FramePool, PooledFrame};
pub use protocol::FrameCodec;
pub use server::{Broker, BrokerHandle};
