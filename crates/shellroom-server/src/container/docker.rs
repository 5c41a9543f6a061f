//! Docker-compatible CLI backend.
//!
//! Every operation shells out to the runtime binary (`docker` or `podman`)
//! with `tokio::process::Command`, so slow engine calls never block the
//! async workers.

use super::{
    ContainerError, ContainerHandle, ContainerResult, ContainerRuntime, ContainerSpec,
    ContainerStatus, ContainerSummary, ExecOutcome,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

/// Validate a container name before it reaches the command line.
fn validate_container_name(name: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    }

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{name}' contains invalid characters"
        )));
    }

    Ok(())
}

/// One line of `ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "State", default)]
    state: String,
}

/// Container runtime driven through its command-line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run the binary to completion and capture its output.
    async fn run(&self, command: &str, args: &[String]) -> ContainerResult<Output> {
        trace!(binary = %self.binary, ?args, "running container command");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(command, e))
    }

    /// Like [`run`](Self::run) but fails on a non-zero exit.
    async fn run_checked(&self, command: &str, args: &[String]) -> ContainerResult<String> {
        let output = self.run(command, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn spawn_error(&self, command: &str, e: std::io::Error) -> ContainerError {
        if e.kind() == std::io::ErrorKind::NotFound {
            ContainerError::NoRuntimeAvailable(format!("'{}' not found in PATH", self.binary))
        } else {
            ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            }
        }
    }

    fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            spec.name.to_string(),
            "--tty".into(),
            "--interactive".into(),
            "--memory".into(),
            spec.memory.clone(),
            "--cpu-shares".into(),
            spec.cpu_shares.to_string(),
            "--network".into(),
            spec.network_mode.clone(),
        ];

        for cap in &spec.cap_drop {
            args.push("--cap-drop".into());
            args.push(cap.clone());
        }
        for cap in &spec.cap_add {
            args.push("--cap-add".into());
            args.push(cap.clone());
        }
        for opt in &spec.security_opt {
            args.push("--security-opt".into());
            args.push(opt.clone());
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        if let Some(ref workdir) = spec.workdir {
            args.push("-w".into());
            args.push(workdir.clone());
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_containers(&self, name_prefix: &str) -> ContainerResult<Vec<ContainerSummary>> {
        let args: Vec<String> = vec![
            "ps".into(),
            "-a".into(),
            "--filter".into(),
            format!("name=^{name_prefix}-"),
            "--format".into(),
            "{{json .}}".into(),
        ];
        let stdout = self.run_checked("ps", &args).await?;

        let mut containers = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let row: PsLine = serde_json::from_str(line)
                .map_err(|e| ContainerError::ParseError(e.to_string()))?;
            // `Names` may hold several comma-separated names.
            let name = row
                .names
                .split(',')
                .find(|n| n.starts_with(name_prefix))
                .unwrap_or(&row.names)
                .to_string();
            containers.push(ContainerSummary {
                name,
                id: row.id,
                state: row.state.to_lowercase(),
            });
        }
        Ok(containers)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> ContainerResult<ContainerHandle> {
        validate_container_name(spec.name.as_str())?;
        let args = Self::create_args(spec);
        let id = self.run_checked("create", &args).await?;
        debug!(name = %spec.name, id = %id.trim(), "container created");
        Ok(spec.name.clone())
    }

    async fn start_container(&self, handle: &ContainerHandle) -> ContainerResult<()> {
        validate_container_name(handle.as_str())?;
        self.run_checked("start", &["start".into(), handle.to_string()])
            .await
            .map(|_| ())
    }

    async fn stop_container(&self, handle: &ContainerHandle) -> ContainerResult<()> {
        validate_container_name(handle.as_str())?;
        self.run_checked(
            "stop",
            &["stop".into(), "-t".into(), "10".into(), handle.to_string()],
        )
        .await
        .map(|_| ())
    }

    async fn remove_container(&self, handle: &ContainerHandle) -> ContainerResult<()> {
        validate_container_name(handle.as_str())?;
        self.run_checked("rm", &["rm".into(), "-f".into(), handle.to_string()])
            .await
            .map(|_| ())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> ContainerResult<Option<ContainerStatus>> {
        validate_container_name(handle.as_str())?;
        let args: Vec<String> = vec![
            "inspect".into(),
            "--type".into(),
            "container".into(),
            "--format".into(),
            "{{.Id}} {{.State.Status}}".into(),
            handle.to_string(),
        ];
        let output = self.run("inspect", &args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // A missing container is an answer, not a failure.
            if stderr.contains("No such") || stderr.contains("no such") {
                return Ok(None);
            }
            return Err(ContainerError::CommandFailed {
                command: "inspect".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut parts = stdout.split_whitespace();
        let (Some(id), Some(state)) = (parts.next(), parts.next()) else {
            return Err(ContainerError::ParseError(format!(
                "unexpected inspect output: {}",
                stdout.trim()
            )));
        };
        let state = state.trim_matches('"').to_lowercase();
        Ok(Some(ContainerStatus {
            id: id.to_string(),
            running: state == "running",
            state,
        }))
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        user: &str,
        argv: &[String],
    ) -> ContainerResult<ExecOutcome> {
        validate_container_name(handle.as_str())?;
        if argv.is_empty() {
            return Err(ContainerError::InvalidInput("empty exec command".into()));
        }

        let mut args: Vec<String> = vec![
            "exec".into(),
            "-u".into(),
            user.to_string(),
            handle.to_string(),
        ];
        args.extend(argv.iter().cloned());

        let output = self.run("exec", &args).await?;
        Ok(ExecOutcome {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn interactive_command(&self, handle: &ContainerHandle, username: &str) -> Vec<String> {
        vec![
            self.binary.clone(),
            "exec".into(),
            "-it".into(),
            "-e".into(),
            "TERM=xterm-256color".into(),
            handle.to_string(),
            "su".into(),
            "-".into(),
            username.to_string(),
        ]
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        let output = self
            .run("image inspect", &["image".into(), "inspect".into(), image.to_string()])
            .await?;
        Ok(output.status.success())
    }

    async fn build_image(&self, image: &str, dockerfile: &str) -> ContainerResult<()> {
        let mut child = Command::new(&self.binary)
            .args(["build", "-t", image, "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error("build", e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(dockerfile.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "build".to_string(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn health_check(&self) -> ContainerResult<String> {
        let args: Vec<String> = vec![
            "version".into(),
            "--format".into(),
            "{{.Server.Version}}".into(),
        ];
        let stdout = self.run_checked("version", &args).await?;
        Ok(stdout.trim().to_string())
    }
}
