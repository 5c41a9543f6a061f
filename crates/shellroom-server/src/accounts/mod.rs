//! Accounts: credential store and identity registry.

pub mod registry;
pub mod store;

pub use registry::IdentityRegistry;
pub use store::SqliteAccountStore;
