//! Persistent client connections.

pub mod websocket;
