//! Boundary validation for usernames and passwords.
//!
//! Usernames become Linux accounts inside the user's container, so they
//! follow the Linux username grammar: a lowercase letter first, then
//! lowercase letters, digits, `_` or `-`, never ending in `-`.

use crate::error::{RoomError, RoomResult};

/// Names that collide with system accounts in the base image.
const RESERVED_USERNAMES: &[&str] = &[
    "root", "daemon", "bin", "sys", "sync", "nobody", "admin", "sudo", "ubuntu",
];

/// Username grammar with a configurable length bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsernamePolicy {
    pub max_len: usize,
}

impl Default for UsernamePolicy {
    fn default() -> Self {
        Self { max_len: 32 }
    }
}

impl UsernamePolicy {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// Validate a claimed username.
    pub fn validate(&self, username: &str) -> RoomResult<()> {
        let invalid = |reason: &str| {
            Err(RoomError::InvalidUsernameFormat(format!(
                "'{username}' {reason}"
            )))
        };

        let first = match username.chars().next() {
            Some(c) => c,
            None => return invalid("is empty"),
        };
        if username.len() > self.max_len {
            return invalid(format!("is longer than {} characters", self.max_len).as_str());
        }
        if !first.is_ascii_lowercase() {
            return invalid("must start with a lowercase letter");
        }
        let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-';
        if !username.chars().all(valid_char) {
            return invalid("may only contain lowercase letters, digits, '_' and '-'");
        }
        if username.ends_with('-') {
            return invalid("must not end with '-'");
        }
        if RESERVED_USERNAMES.contains(&username) {
            return invalid("is reserved");
        }
        Ok(())
    }

    pub fn is_valid(&self, username: &str) -> bool {
        self.validate(username).is_ok()
    }
}

/// Password strength policy. A password is always required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub min_len: usize,
    pub require_letter: bool,
    pub require_digit: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_len: 6,
            require_letter: true,
            require_digit: true,
        }
    }
}

impl PasswordPolicy {
    pub fn validate(&self, password: &str) -> RoomResult<()> {
        if password.chars().count() < self.min_len {
            return Err(RoomError::WeakPassword(format!(
                "must be at least {} characters",
                self.min_len
            )));
        }
        if self.require_letter && !password.chars().any(|c| c.is_alphabetic()) {
            return Err(RoomError::WeakPassword("must contain a letter".into()));
        }
        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            return Err(RoomError::WeakPassword("must contain a digit".into()));
        }
        Ok(())
    }
}
