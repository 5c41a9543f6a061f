//! Chat collaborator.

pub mod service;

pub use service::{ChatLimits, ChatService};
