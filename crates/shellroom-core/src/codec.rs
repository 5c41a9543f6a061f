//! CBOR codec for the study room wire protocol.
//!
//! Wire format: one CBOR-encoded [`Message`] per WebSocket binary frame.

use crate::error::{RoomError, RoomResult};
use crate::messages::Message;
use std::io::Cursor;

/// Largest accepted encoded message (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Encode a message into a CBOR payload.
pub fn encode_message(message: &Message) -> RoomResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(message, &mut payload)?;
    Ok(payload)
}

/// Decode a CBOR payload into a message.
pub fn decode_message(data: &[u8]) -> RoomResult<Message> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(RoomError::InvalidMessage(format!(
            "message too large: {} bytes (max {MAX_MESSAGE_SIZE})",
            data.len()
        )));
    }
    let message: Message = ciborium::from_reader(Cursor::new(data))?;
    Ok(message)
}
