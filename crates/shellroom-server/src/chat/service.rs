//! Study room chat: flood control in front of a sqlite message log.

use crate::db::{now_ms, storage_err};
use crate::rate_limit::RateLimiter;
use shellroom_core::messages::ChatMessagePayload;
use shellroom_core::{RoomError, RoomResult};
use sqlx::{FromRow, SqlitePool};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Flood-control thresholds.
#[derive(Debug, Clone)]
pub struct ChatLimits {
    pub max_message_len: usize,
    pub per_minute: u32,
    pub per_hour: u32,
    pub min_interval: Duration,
    /// How many of a user's latest messages are checked for repeats.
    pub duplicate_window: usize,
}

impl Default for ChatLimits {
    fn default() -> Self {
        Self {
            max_message_len: 500,
            per_minute: 10,
            per_hour: 100,
            min_interval: Duration::from_secs(1),
            duplicate_window: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ChatMessage {
    pub id: i64,
    pub username: String,
    pub text: String,
    pub created_at: i64,
}

impl From<ChatMessage> for ChatMessagePayload {
    fn from(m: ChatMessage) -> Self {
        ChatMessagePayload {
            id: m.id,
            username: m.username,
            text: m.text,
            created_at_ms: m.created_at,
        }
    }
}

struct FloodState {
    per_minute: RateLimiter,
    per_hour: RateLimiter,
    last_post: HashMap<String, Instant>,
    recent: HashMap<String, VecDeque<String>>,
}

pub struct ChatService {
    pool: SqlitePool,
    limits: ChatLimits,
    flood: Mutex<FloodState>,
}

impl ChatService {
    pub fn new(pool: SqlitePool, limits: ChatLimits) -> Self {
        let flood = FloodState {
            per_minute: RateLimiter::new(limits.per_minute, Duration::from_secs(60)),
            per_hour: RateLimiter::new(limits.per_hour, Duration::from_secs(60 * 60)),
            last_post: HashMap::new(),
            recent: HashMap::new(),
        };
        Self {
            pool,
            limits,
            flood: Mutex::new(flood),
        }
    }

    /// Validate, rate-limit and store a message.
    pub async fn post(&self, username: &str, text: &str) -> RoomResult<ChatMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RoomError::InvalidMessage("message is empty".into()));
        }
        if text.chars().count() > self.limits.max_message_len {
            return Err(RoomError::InvalidMessage(format!(
                "message longer than {} characters",
                self.limits.max_message_len
            )));
        }

        self.admit(username, text)?;

        let created_at = now_ms();
        let done = sqlx::query("INSERT INTO chat_messages (username, text, created_at) VALUES (?, ?, ?)")
            .bind(username)
            .bind(text)
            .bind(created_at)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        let message = ChatMessage {
            id: done.last_insert_rowid(),
            username: username.to_string(),
            text: text.to_string(),
            created_at,
        };
        info!(username, id = message.id, len = text.len(), "chat message stored");
        Ok(message)
    }

    /// Flood checks, recorded atomically with the decision.
    fn admit(&self, username: &str, text: &str) -> RoomResult<()> {
        let mut flood = self.flood.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(last) = flood.last_post.get(username) {
            if last.elapsed() < self.limits.min_interval {
                return Err(RoomError::RateLimited("sending too fast".into()));
            }
        }
        if !flood.per_minute.check(username) {
            return Err(RoomError::RateLimited(format!(
                "at most {} messages per minute",
                self.limits.per_minute
            )));
        }
        if !flood.per_hour.check(username) {
            return Err(RoomError::RateLimited(format!(
                "at most {} messages per hour",
                self.limits.per_hour
            )));
        }
        let repeats = flood
            .recent
            .get(username)
            .map(|recent| recent.iter().filter(|t| t.as_str() == text).count())
            .unwrap_or(0);
        if repeats >= 2 {
            debug!(username, "duplicate chat message rejected");
            return Err(RoomError::RateLimited("same message sent repeatedly".into()));
        }

        flood.per_minute.record(username);
        flood.per_hour.record(username);
        flood.last_post.insert(username.to_string(), Instant::now());
        let window = self.limits.duplicate_window;
        let recent = flood.recent.entry(username.to_string()).or_default();
        recent.push_back(text.to_string());
        while recent.len() > window {
            recent.pop_front();
        }
        Ok(())
    }

    /// Latest `limit` messages, oldest first.
    pub async fn recent(&self, limit: u32) -> RoomResult<Vec<ChatMessage>> {
        let mut messages = sqlx::query_as::<_, ChatMessage>(
            "SELECT id, username, text, created_at FROM chat_messages ORDER BY id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        messages.reverse();
        Ok(messages)
    }

    /// Drop flood state for quiet users.
    pub fn gc(&self) {
        let mut flood = self.flood.lock().unwrap_or_else(PoisonError::into_inner);
        flood.per_minute.gc();
        flood.per_hour.gc();
        let idle = Duration::from_secs(60 * 60);
        let FloodState {
            last_post, recent, ..
        } = &mut *flood;
        last_post.retain(|_, t| t.elapsed() < idle);
        recent.retain(|user, _| last_post.contains_key(user));
    }
}
