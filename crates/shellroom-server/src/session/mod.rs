//! Terminal sessions: PTY processes, output producers, scrollback.

pub mod manager;
pub mod pty;
pub mod ring_buffer;

pub use manager::{SessionEvent, SessionId, SessionManager, SessionOutput};
pub use ring_buffer::RingBuffer;
