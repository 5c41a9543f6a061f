//! What a user container looks like: base image, creation spec and the
//! best-effort setup steps run after start.

use super::LifecycleConfig;
use crate::container::{ContainerHandle, ContainerRuntime, ContainerSpec};
use tracing::{debug, warn};

/// Base image, built with `<runtime> build -t <image> -` when missing.
pub const BASE_DOCKERFILE: &str = r#"FROM ubuntu:22.04

ENV DEBIAN_FRONTEND=noninteractive

RUN apt-get update && apt-get install -y --no-install-recommends \
        sudo curl wget git vim nano htop tree unzip ca-certificates \
        build-essential python3 python3-pip nodejs npm \
    && rm -rf /var/lib/apt/lists/*

RUN groupadd -f sudo \
    && echo "dash dash/sh boolean false" | debconf-set-selections \
    && dpkg-reconfigure dash

CMD ["/bin/bash"]
"#;

const CAP_ADD: &[&str] = &["CHOWN", "DAC_OVERRIDE", "FOWNER", "SETGID", "SETUID"];

/// Creation spec for `username`'s container.
pub fn container_spec(config: &LifecycleConfig, username: &str) -> ContainerSpec {
    ContainerSpec {
        name: ContainerHandle::for_user(&config.name_prefix, username),
        image: config.image.clone(),
        env: vec![
            ("USER".into(), username.to_string()),
            ("TERM".into(), "xterm-256color".into()),
        ],
        workdir: Some(format!("/home/{username}")),
        memory: config.memory.clone(),
        cpu_shares: config.cpu_shares,
        network_mode: config.network_mode.clone(),
        cap_drop: vec!["ALL".into()],
        cap_add: CAP_ADD.iter().map(|c| c.to_string()).collect(),
        security_opt: vec!["no-new-privileges".into()],
        command: vec!["/bin/bash".into()],
    }
}

/// One setup command, run as root inside the container.
#[derive(Debug, Clone)]
pub struct SetupStep {
    pub name: &'static str,
    pub argv: Vec<String>,
}

/// How a setup step went.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

fn sh(script: String) -> Vec<String> {
    vec!["sh".into(), "-c".into(), script]
}

/// The fixed setup sequence. `username` has already passed the username
/// policy, so it is safe to interpolate into shell scripts.
pub fn setup_steps(username: &str) -> Vec<SetupStep> {
    let home = format!("/home/{username}");
    vec![
        SetupStep {
            name: "create user",
            argv: vec![
                "useradd".into(),
                "-m".into(),
                "-s".into(),
                "/bin/bash".into(),
                username.to_string(),
            ],
        },
        SetupStep {
            name: "join sudo group",
            argv: vec![
                "usermod".into(),
                "-aG".into(),
                "sudo".into(),
                username.to_string(),
            ],
        },
        SetupStep {
            name: "passwordless sudo",
            argv: sh(format!(
                "echo '{username} ALL=(ALL) NOPASSWD:ALL' > /etc/sudoers.d/{username} \
                 && chmod 0440 /etc/sudoers.d/{username}"
            )),
        },
        SetupStep {
            name: "home ownership",
            argv: vec![
                "chown".into(),
                "-R".into(),
                format!("{username}:{username}"),
                home.clone(),
            ],
        },
        SetupStep {
            name: "welcome note",
            argv: sh(format!(
                "printf '%s\\n' 'Welcome to the study room, {username}!' \
                 'You have passwordless sudo inside this container.' \
                 'The container is removed after its lifetime runs out; extend it to keep working.' \
                 > {home}/welcome.txt && chown {username}:{username} {home}/welcome.txt"
            )),
        },
    ]
}

/// Run every step in order. Failures are logged and reported, never fatal.
pub async fn run_setup(
    runtime: &dyn ContainerRuntime,
    handle: &ContainerHandle,
    username: &str,
) -> Vec<StepOutcome> {
    let mut outcomes = Vec::new();
    for step in setup_steps(username) {
        let outcome = match runtime.exec(handle, "root", &step.argv).await {
            Ok(out) if out.success() => StepOutcome {
                name: step.name,
                ok: true,
                detail: String::new(),
            },
            Ok(out) => {
                // Some setup commands report on stdout only.
                let message = match out.stderr.trim() {
                    "" => out.stdout.trim(),
                    stderr => stderr,
                };
                StepOutcome {
                    name: step.name,
                    ok: false,
                    detail: format!(
                        "exit {}: {}",
                        out.exit_code.map_or("?".to_string(), |c| c.to_string()),
                        message
                    ),
                }
            }
            Err(e) => StepOutcome {
                name: step.name,
                ok: false,
                detail: e.to_string(),
            },
        };

        if outcome.ok {
            debug!(username, step = step.name, "setup step done");
        } else {
            warn!(username, step = step.name, detail = %outcome.detail, "setup step failed");
        }
        outcomes.push(outcome);
    }
    outcomes
}

/// Warning strings for the failed steps.
pub fn warnings(outcomes: &[StepOutcome]) -> Vec<String> {
    outcomes
        .iter()
        .filter(|o| !o.ok)
        .map(|o| format!("setup step '{}' failed: {}", o.name, o.detail))
        .collect()
}

pub fn welcome_new(username: &str) -> String {
    format!("Welcome to the study room, {username}! Your container is ready.")
}

pub fn welcome_recreated(username: &str) -> String {
    format!("Welcome back, {username}. Your previous container was gone, so a fresh one was created.")
}

pub fn welcome_restored(username: &str) -> String {
    format!("Welcome back, {username}. Reconnected to your existing container.")
}

pub fn welcome_reset(username: &str) -> String {
    format!("Container reset, {username}. You are in a brand-new environment.")
}
