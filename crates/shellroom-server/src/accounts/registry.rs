//! Identity registry: username → account, with bcrypt credentials.

use super::store::{Account, AccountStore};
use crate::container::ContainerHandle;
use shellroom_core::{RoomError, RoomResult};
use std::sync::Arc;
use tracing::{debug, info};

/// Owns password hashing and verification on top of an [`AccountStore`].
///
/// Callers are expected to have validated the username and password policy
/// at the boundary; the registry only hashes and compares.
pub struct IdentityRegistry {
    store: Arc<dyn AccountStore>,
    cost: u32,
    /// Hash compared against for unknown users so both paths do a bcrypt.
    dummy_hash: String,
}

impl IdentityRegistry {
    pub fn new(store: Arc<dyn AccountStore>, cost: u32) -> RoomResult<Self> {
        let dummy_hash = bcrypt::hash("shellroom-dummy-password", cost)
            .map_err(|e| RoomError::Other(format!("bcrypt: {e}")))?;
        Ok(Self {
            store,
            cost,
            dummy_hash,
        })
    }

    /// Hash the password and create the account.
    pub async fn register(&self, username: &str, password: &str) -> RoomResult<Account> {
        let password = password.to_string();
        let cost = self.cost;
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|e| RoomError::Other(format!("hash task failed: {e}")))?
            .map_err(|e| RoomError::Other(format!("bcrypt: {e}")))?;

        let account = self.store.create_account(username, &hash).await?;
        info!(username, "account registered");
        Ok(account)
    }

    /// `false` for a wrong password, an unknown user or a disabled account.
    pub async fn verify(&self, username: &str, password: &str) -> RoomResult<bool> {
        let account = self.store.find_account(username).await?;
        let (hash, usable) = match &account {
            Some(a) => (a.password_hash.clone(), a.is_active),
            None => (self.dummy_hash.clone(), false),
        };

        let password = password.to_string();
        let matched = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| RoomError::Other(format!("verify task failed: {e}")))?
            // A corrupt stored hash is a mismatch, not a server error.
            .unwrap_or(false);

        debug!(username, matched, "credential check");
        Ok(matched && usable)
    }

    pub async fn touch_last_login(&self, username: &str) -> RoomResult<()> {
        self.store.update_last_login(username).await
    }

    pub async fn find(&self, username: &str) -> RoomResult<Option<Account>> {
        self.store.find_account(username).await
    }

    pub async fn record_container(&self, username: &str, handle: &ContainerHandle) -> RoomResult<()> {
        self.store.set_container(username, handle.as_str()).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::accounts::SqliteAccountStore;
    use crate::db::Database;

    /// Registry over in-memory sqlite with the cheapest bcrypt cost.
    pub(crate) async fn registry() -> Arc<IdentityRegistry> {
        let db = Database::in_memory().await.unwrap();
        let store = Arc::new(SqliteAccountStore::new(db.pool().clone()));
        Arc::new(IdentityRegistry::new(store, 4).unwrap())
    }

    #[tokio::test]
    async fn register_stores_a_hash_not_the_password() {
        let registry = registry().await;
        let account = registry.register("carol", "secret1").await.unwrap();
        assert_ne!(account.password_hash, "secret1");
        assert!(account.password_hash.starts_with("$2"));
    }

    #[tokio::test]
    async fn verify_matches_only_the_right_password() {
        let registry = registry().await;
        registry.register("carol", "secret1").await.unwrap();
        assert!(registry.verify("carol", "secret1").await.unwrap());
        assert!(!registry.verify("carol", "secret2").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_user_is_false_not_error() {
        let registry = registry().await;
        assert!(!registry.verify("nobody-here", "secret1").await.unwrap());
    }

    #[tokio::test]
    async fn second_registration_is_taken() {
        let registry = registry().await;
        registry.register("carol", "secret1").await.unwrap();
        let err = registry.register("carol", "other1").await.unwrap_err();
        assert!(matches!(err, RoomError::UsernameTaken(_)));
    }

    #[tokio::test]
    async fn disabled_account_fails_verification() {
        let db = Database::in_memory().await.unwrap();
        let store = Arc::new(SqliteAccountStore::new(db.pool().clone()));
        let registry = IdentityRegistry::new(store, 4).unwrap();
        registry.register("erin", "secret1").await.unwrap();

        // Accounts are disabled by an operator, directly in the database.
        sqlx::query("UPDATE accounts SET is_active = 0 WHERE username = 'erin'")
            .execute(db.pool())
            .await
            .unwrap();
        assert!(!registry.verify("erin", "secret1").await.unwrap());
    }

    #[tokio::test]
    async fn container_and_login_are_recorded() {
        let registry = registry().await;
        registry.register("carol", "secret1").await.unwrap();
        registry
            .record_container("carol", &ContainerHandle::new("linuxdo-carol"))
            .await
            .unwrap();
        registry.touch_last_login("carol").await.unwrap();

        let account = registry.find("carol").await.unwrap().unwrap();
        assert_eq!(account.container_name.as_deref(), Some("linuxdo-carol"));
        assert!(account.last_login.is_some());
    }
}
