// shellroom client/server message set.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};

/// Every message exchanged over a connection, tagged by `type`.
///
/// Client → server: `join`, `terminal-input`, `terminal-resize`,
/// `reset-container`, `extend-container`, `list-users`, `chat-send`,
/// `chat-history`, `ping`. Everything else flows server → client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Message {
    Join(JoinPayload),
    TerminalInput(DataPayload),
    TerminalResize(ResizePayload),
    ResetContainer,
    ExtendContainer,
    ListUsers,
    ChatSend(ChatSendPayload),
    ChatHistory(ChatHistoryPayload),
    Ping(PingPongPayload),

    Progress(ProgressPayload),
    Ready(ReadyPayload),
    Error(ErrorPayload),
    TerminalOutput(DataPayload),
    TerminalEnded(EndedPayload),
    ObservedOutput(ObservedOutputPayload),
    ObservedEnded(UserPayload),
    UserJoined(UserPayload),
    UserLeft(UserPayload),
    Presence(PresencePayload),
    ActiveUsers(ActiveUsersPayload),
    Extended(ExtendedPayload),
    ChatMessage(ChatMessagePayload),
    ChatMessages(ChatMessagesPayload),
    Pong(PingPongPayload),
    Shutdown(ShutdownPayload),
}

impl Message {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join(_) => "join",
            Message::TerminalInput(_) => "terminal-input",
            Message::TerminalResize(_) => "terminal-resize",
            Message::ResetContainer => "reset-container",
            Message::ExtendContainer => "extend-container",
            Message::ListUsers => "list-users",
            Message::ChatSend(_) => "chat-send",
            Message::ChatHistory(_) => "chat-history",
            Message::Ping(_) => "ping",
            Message::Progress(_) => "progress",
            Message::Ready(_) => "ready",
            Message::Error(_) => "error",
            Message::TerminalOutput(_) => "terminal-output",
            Message::TerminalEnded(_) => "terminal-ended",
            Message::ObservedOutput(_) => "observed-output",
            Message::ObservedEnded(_) => "observed-ended",
            Message::UserJoined(_) => "user-joined",
            Message::UserLeft(_) => "user-left",
            Message::Presence(_) => "presence",
            Message::ActiveUsers(_) => "active-users",
            Message::Extended(_) => "extended",
            Message::ChatMessage(_) => "chat-message",
            Message::ChatMessages(_) => "chat-messages",
            Message::Pong(_) => "pong",
            Message::Shutdown(_) => "shutdown",
        }
    }

    /// Build an error message from a code and human-readable reason.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }
}

// ── Payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub username: String,
    pub password: String,
}

/// Raw terminal bytes, no framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPayload {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizePayload {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSendPayload {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatHistoryPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPongPayload {
    pub id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub percent: u8,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub handle: String,
    pub username: String,
    /// False when an existing container was reused, so the UI can skip the
    /// creation animation.
    pub created: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedOutputPayload {
    pub username: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPayload {
    pub username: String,
}

/// Authoritative list of online usernames, pushed on every change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePayload {
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveUser {
    pub username: String,
    pub handle: String,
    pub created_at_ms: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveUsersPayload {
    pub users: Vec<ActiveUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendedPayload {
    pub expires_in_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub id: i64,
    pub username: String,
    pub text: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagesPayload {
    pub messages: Vec<ChatMessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownPayload {
    pub reason: String,
}

// ── CBOR byte strings ────────────────────────────────────────────────

mod serde_bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let buf: ByteBuf = Deserialize::deserialize(deserializer)?;
        Ok(buf.0)
    }

    struct ByteBuf(Vec<u8>);

    impl<'de> Deserialize<'de> for ByteBuf {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct ByteBufVisitor;

            impl<'de> serde::de::Visitor<'de> for ByteBufVisitor {
                type Value = ByteBuf;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("bytes")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v.to_vec()))
                }

                fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v))
                }

                // Browser clients may send a plain array of numbers.
                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: serde::de::SeqAccess<'de>,
                {
                    let mut bytes = Vec::new();
                    while let Some(b) = seq.next_element::<u8>()? {
                        bytes.push(b);
                    }
                    Ok(ByteBuf(bytes))
                }
            }

            deserializer.deserialize_any(ByteBufVisitor)
        }
    }
}
