//! shellroom-core: shared protocol library for the shell study room.
//!
//! Provides the client/server message set, the CBOR codec, the error
//! taxonomy surfaced to clients, and the username/password boundary policy.

pub mod codec;
pub mod error;
pub mod messages;
pub mod policy;

// Re-export commonly used items at crate root.
pub use codec::{decode_message, encode_message, MAX_MESSAGE_SIZE};
pub use error::{ErrorCode, RoomError, RoomResult};
pub use messages::Message;
pub use policy::{PasswordPolicy, UsernamePolicy};
