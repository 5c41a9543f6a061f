//! Account persistence.

use crate::db::{now_ms, storage_err};
use async_trait::async_trait;
use shellroom_core::{RoomError, RoomResult};
use sqlx::{FromRow, SqlitePool};

/// A stored account. The password is only ever held as a bcrypt hash.
#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub container_name: Option<String>,
    pub created_at: i64,
    pub last_login: Option<i64>,
    pub is_active: bool,
}

/// Identity/credential store used by the registry.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_account(&self, username: &str) -> RoomResult<Option<Account>>;

    /// Fails with `UsernameTaken` when the name already exists.
    async fn create_account(&self, username: &str, password_hash: &str) -> RoomResult<Account>;

    async fn update_last_login(&self, username: &str) -> RoomResult<()>;

    async fn set_container(&self, username: &str, container_name: &str) -> RoomResult<()>;
}

/// SQLite-backed [`AccountStore`].
#[derive(Debug, Clone)]
pub struct SqliteAccountStore {
    pool: SqlitePool,
}

impl SqliteAccountStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
    async fn find_account(&self, username: &str) -> RoomResult<Option<Account>> {
        sqlx::query_as::<_, Account>(
            "SELECT id, username, password_hash, container_name, created_at, last_login, is_active
             FROM accounts WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)
    }

    async fn create_account(&self, username: &str, password_hash: &str) -> RoomResult<Account> {
        let now = now_ms();
        let result = sqlx::query(
            "INSERT INTO accounts (username, password_hash, created_at, is_active)
             VALUES (?, ?, ?, 1)",
        )
        .bind(username)
        .bind(password_hash)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(Account {
                id: done.last_insert_rowid(),
                username: username.to_string(),
                password_hash: password_hash.to_string(),
                container_name: None,
                created_at: now,
                last_login: None,
                is_active: true,
            }),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(RoomError::UsernameTaken(username.to_string()))
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn update_last_login(&self, username: &str) -> RoomResult<()> {
        sqlx::query("UPDATE accounts SET last_login = ? WHERE username = ?")
            .bind(now_ms())
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn set_container(&self, username: &str, container_name: &str) -> RoomResult<()> {
        sqlx::query("UPDATE accounts SET container_name = ? WHERE username = ?")
            .bind(container_name)
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}
