//! In-memory runtime for tests.

use super::{
    ContainerError, ContainerHandle, ContainerResult, ContainerRuntime, ContainerSpec,
    ContainerStatus, ContainerSummary, ExecOutcome,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    running: bool,
}

/// Counts every mutating call so tests can assert on side effects.
#[derive(Debug)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    image_present: AtomicBool,
    pub creates: AtomicUsize,
    pub builds: AtomicUsize,
    pub starts: AtomicUsize,
    pub removes: AtomicUsize,
    pub execs: Mutex<Vec<(String, String, Vec<String>)>>,
    create_delay: Duration,
    fail_exec: AtomicBool,
    shell: Vec<String>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            image_present: AtomicBool::new(true),
            creates: AtomicUsize::new(0),
            builds: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
            execs: Mutex::new(Vec::new()),
            create_delay: Duration::ZERO,
            fail_exec: AtomicBool::new(false),
            shell: vec!["/bin/sh".into()],
        }
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start without the base image so the first provision has to build it.
    pub fn without_image(self) -> Self {
        self.image_present.store(false, Ordering::SeqCst);
        self
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_shell(mut self, argv: &[&str]) -> Self {
        self.shell = argv.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn fail_setup(&self, fail: bool) {
        self.fail_exec.store(fail, Ordering::SeqCst);
    }

    /// Simulate the container stopping on its own.
    pub fn stop_behind_back(&self, name: &str) {
        if let Some(c) = self.lock().get_mut(name) {
            c.running = false;
        }
    }

    /// Simulate the container being removed outside the server.
    pub fn lose(&self, name: &str) {
        self.lock().remove(name);
    }

    /// Seed a container as if it survived a server restart.
    pub fn seed(&self, name: &str, running: bool) {
        self.lock().insert(
            name.to_string(),
            FakeContainer {
                id: format!("seed-{name}"),
                running,
            },
        );
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock().get(name).map(|c| c.running).unwrap_or(false)
    }

    pub fn container_id(&self, name: &str) -> Option<String> {
        self.lock().get(name).map(|c| c.id.clone())
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, FakeContainer>> {
        self.containers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn missing(handle: &ContainerHandle) -> ContainerError {
        ContainerError::ContainerNotFound(handle.to_string())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self, name_prefix: &str) -> ContainerResult<Vec<ContainerSummary>> {
        let prefix = format!("{name_prefix}-");
        let mut rows: Vec<ContainerSummary> = self
            .lock()
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, c)| ContainerSummary {
                name: name.clone(),
                id: c.id.clone(),
                state: if c.running { "running" } else { "exited" }.to_string(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> ContainerResult<ContainerHandle> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        let mut containers = self.lock();
        if containers.contains_key(spec.name.as_str()) {
            return Err(ContainerError::CommandFailed {
                command: "create".into(),
                message: format!("name {} already in use", spec.name),
            });
        }
        containers.insert(
            spec.name.to_string(),
            FakeContainer {
                id: format!("fake-{n}"),
                running: false,
            },
        );
        Ok(spec.name.clone())
    }

    async fn start_container(&self, handle: &ContainerHandle) -> ContainerResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let mut containers = self.lock();
        let c = containers
            .get_mut(handle.as_str())
            .ok_or_else(|| Self::missing(handle))?;
        c.running = true;
        Ok(())
    }

    async fn stop_container(&self, handle: &ContainerHandle) -> ContainerResult<()> {
        let mut containers = self.lock();
        let c = containers
            .get_mut(handle.as_str())
            .ok_or_else(|| Self::missing(handle))?;
        c.running = false;
        Ok(())
    }

    async fn remove_container(&self, handle: &ContainerHandle) -> ContainerResult<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .remove(handle.as_str())
            .map(|_| ())
            .ok_or_else(|| Self::missing(handle))
    }

    async fn inspect(&self, handle: &ContainerHandle) -> ContainerResult<Option<ContainerStatus>> {
        Ok(self.lock().get(handle.as_str()).map(|c| ContainerStatus {
            id: c.id.clone(),
            state: if c.running { "running" } else { "exited" }.to_string(),
            running: c.running,
        }))
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        user: &str,
        argv: &[String],
    ) -> ContainerResult<ExecOutcome> {
        if !self.is_running(handle.as_str()) {
            return Err(Self::missing(handle));
        }
        self.execs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((handle.to_string(), user.to_string(), argv.to_vec()));
        let failed = self.fail_exec.load(Ordering::SeqCst);
        Ok(ExecOutcome {
            exit_code: Some(if failed { 1 } else { 0 }),
            // Reported on stdout, the way some setup tools do.
            stdout: if failed { "simulated failure\n".into() } else { String::new() },
            stderr: String::new(),
        })
    }

    fn interactive_command(&self, _handle: &ContainerHandle, _username: &str) -> Vec<String> {
        self.shell.clone()
    }

    async fn image_exists(&self, _image: &str) -> ContainerResult<bool> {
        Ok(self.image_present.load(Ordering::SeqCst))
    }

    async fn build_image(&self, _image: &str, _dockerfile: &str) -> ContainerResult<()> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.image_present.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> ContainerResult<String> {
        Ok("fake".into())
    }
}
