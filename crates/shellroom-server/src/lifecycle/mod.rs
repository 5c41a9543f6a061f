//! Container lifecycle: one container per username, created, reused,
//! reset, extended and expired through [`LifecycleManager`].

pub mod manager;
pub mod provision;
pub mod sweeper;

pub use manager::{LifecycleManager, ProvisionStage, Resolution};
pub use sweeper::ExpirySweeper;

use std::time::Duration;

/// Container shape and time budgets.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub name_prefix: String,
    pub image: String,
    pub memory: String,
    pub cpu_shares: u32,
    pub network_mode: String,
    /// Hard lifetime of a container, counted from creation or last extend.
    pub lifetime: Duration,
    pub build_timeout: Duration,
    pub start_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            name_prefix: "linuxdo".into(),
            image: "linuxdo-ubuntu:latest".into(),
            memory: "512m".into(),
            cpu_shares: 512,
            network_mode: "bridge".into(),
            lifetime: Duration::from_secs(2 * 60 * 60),
            build_timeout: Duration::from_secs(30 * 60),
            start_timeout: Duration::from_secs(60),
        }
    }
}
