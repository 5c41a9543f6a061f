//! Container runtime abstraction.
//!
//! The lifecycle manager and the PTY layer only talk to the runtime through
//! [`ContainerRuntime`]; [`DockerCli`] drives a docker-compatible CLI and the
//! test-only fake keeps everything in memory.

mod docker;
mod error;
#[cfg(test)]
pub mod fake;

pub use docker::DockerCli;
pub use error::{ContainerError, ContainerResult};

use async_trait::async_trait;
use std::fmt;

/// Deterministic container name, used as the only handle to a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// `<prefix>-<username>`.
    pub fn for_user(prefix: &str, username: &str) -> Self {
        Self(format!("{prefix}-{username}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the username from a handle carrying `prefix`.
    pub fn username<'a>(&'a self, prefix: &str) -> Option<&'a str> {
        self.0
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|name| !name.is_empty())
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to create one user container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: ContainerHandle,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
    /// Memory ceiling in runtime syntax (`512m`).
    pub memory: String,
    pub cpu_shares: u32,
    pub network_mode: String,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    pub command: Vec<String>,
}

/// Result of `inspect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub id: String,
    pub state: String,
    pub running: bool,
}

/// One row of `list_containers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    pub id: String,
    pub state: String,
}

impl ContainerSummary {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Output of a non-interactive exec.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Container runtime operations used by the lifecycle core.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers (running or not) whose name starts with `name_prefix`.
    async fn list_containers(&self, name_prefix: &str) -> ContainerResult<Vec<ContainerSummary>>;

    /// Create (but do not start) a container.
    async fn create_container(&self, spec: &ContainerSpec) -> ContainerResult<ContainerHandle>;

    async fn start_container(&self, handle: &ContainerHandle) -> ContainerResult<()>;

    async fn stop_container(&self, handle: &ContainerHandle) -> ContainerResult<()>;

    async fn remove_container(&self, handle: &ContainerHandle) -> ContainerResult<()>;

    /// `Ok(None)` when the container does not exist.
    async fn inspect(&self, handle: &ContainerHandle) -> ContainerResult<Option<ContainerStatus>>;

    /// Run a command to completion inside a running container as `user`.
    async fn exec(
        &self,
        handle: &ContainerHandle,
        user: &str,
        argv: &[String],
    ) -> ContainerResult<ExecOutcome>;

    /// Argv of the interactive login shell for `username`, to be spawned
    /// under a PTY on the host.
    fn interactive_command(&self, handle: &ContainerHandle, username: &str) -> Vec<String>;

    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;

    /// Build `image` from an in-memory Dockerfile.
    async fn build_image(&self, image: &str, dockerfile: &str) -> ContainerResult<()>;

    /// Engine version string, or an error when the engine is unreachable.
    async fn health_check(&self) -> ContainerResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_is_prefix_and_username() {
        let handle = ContainerHandle::for_user("linuxdo", "carol");
        assert_eq!(handle.as_str(), "linuxdo-carol");
        assert_eq!(handle.username("linuxdo"), Some("carol"));
        assert_eq!(handle.username("other"), None);
        assert_eq!(ContainerHandle::new("linuxdo-").username("linuxdo"), None);
    }
}
