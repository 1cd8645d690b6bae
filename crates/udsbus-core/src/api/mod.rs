//! API implementation submodules.
//!
//! `builder` configures a participant, `state` holds what it owns, and
//! `send` extends [`Ipc`](crate::Ipc) with the outbound methods. The handle
//! itself is defined in `lib.rs`.

mod builder;
mod send;
mod state;

pub use builder::IpcBuilder;
pub(crate) use state::IpcState;
