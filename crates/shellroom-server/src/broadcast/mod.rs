//! Observer fan-out and presence.

pub mod broadcaster;

pub use broadcaster::{Broadcaster, ConnId};
