//! The single authority over username → container.
//!
//! Every decision that reads the runtime and then acts on it (resolve,
//! reset, extend, expiry teardown) runs under a per-username async lock, so
//! two joins for the same name can never both provision. Different names
//! never contend except on the one-time base image build.

use super::provision;
use super::LifecycleConfig;
use crate::accounts::IdentityRegistry;
use crate::container::{ContainerHandle, ContainerRuntime};
use shellroom_core::{PasswordPolicy, RoomError, RoomResult, UsernamePolicy};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, Mutex, OnceCell, RwLock};
use tracing::{debug, error, info, warn};

/// Real provisioning stages, reported while a join is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    BuildingImage,
    RemovingStale,
    Creating,
    Starting,
    Configuring,
    Ready,
}

impl ProvisionStage {
    pub fn percent(self) -> u8 {
        match self {
            ProvisionStage::BuildingImage => 10,
            ProvisionStage::RemovingStale => 25,
            ProvisionStage::Creating => 40,
            ProvisionStage::Starting => 60,
            ProvisionStage::Configuring => 80,
            ProvisionStage::Ready => 100,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ProvisionStage::BuildingImage => "Building base image (first run only)",
            ProvisionStage::RemovingStale => "Cleaning up old container",
            ProvisionStage::Creating => "Creating container",
            ProvisionStage::Starting => "Starting container",
            ProvisionStage::Configuring => "Setting up user account",
            ProvisionStage::Ready => "Ready",
        }
    }
}

/// Where progress stages are sent.
pub type ProgressSink = mpsc::UnboundedSender<ProvisionStage>;

fn report(progress: Option<&ProgressSink>, stage: ProvisionStage) {
    if let Some(tx) = progress {
        let _ = tx.send(stage);
    }
}

/// In-memory record of a live container, keyed by username.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub handle: ContainerHandle,
    /// Start of the expiry countdown.
    pub created_at: Instant,
    pub created_wall: SystemTime,
}

impl ContainerRecord {
    fn fresh(handle: ContainerHandle) -> Self {
        Self {
            handle,
            created_at: Instant::now(),
            created_wall: SystemTime::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Outcome of a successful `resolve` or `reset_container`.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub handle: ContainerHandle,
    /// False when an existing container was reused or restarted.
    pub created: bool,
    pub welcome: String,
    /// Non-fatal setup failures.
    pub warnings: Vec<String>,
}

/// One row of `list_active`.
#[derive(Debug, Clone)]
pub struct ActiveContainer {
    pub username: String,
    pub handle: ContainerHandle,
    pub created_at: SystemTime,
    pub uptime: Duration,
}

pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<IdentityRegistry>,
    config: LifecycleConfig,
    username_policy: UsernamePolicy,
    password_policy: PasswordPolicy,
    records: RwLock<HashMap<String, ContainerRecord>>,
    user_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    image_ready: OnceCell<()>,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<IdentityRegistry>,
        config: LifecycleConfig,
        username_policy: UsernamePolicy,
        password_policy: PasswordPolicy,
    ) -> Self {
        Self {
            runtime,
            registry,
            config,
            username_policy,
            password_policy,
            records: RwLock::new(HashMap::new()),
            user_locks: StdMutex::new(HashMap::new()),
            image_ready: OnceCell::new(),
        }
    }

    pub fn handle_for(&self, username: &str) -> ContainerHandle {
        ContainerHandle::for_user(&self.config.name_prefix, username)
    }

    /// Lock for one username. Entries nobody holds are pruned on the way.
    fn user_lock(&self, username: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(username.to_string()).or_default().clone()
    }

    /// Map a claimed identity to exactly one running container.
    ///
    /// New username: provision and register. Known username: verify, then
    /// reuse a running container, start a stopped one or recreate a lost one.
    pub async fn resolve(
        &self,
        username: &str,
        password: &str,
        progress: Option<&ProgressSink>,
    ) -> RoomResult<Resolution> {
        self.username_policy.validate(username)?;

        let lock = self.user_lock(username);
        let _guard = lock.lock().await;

        let account = self.registry.find(username).await?;
        let resolution = match account {
            None => {
                self.password_policy.validate(password)?;
                let (handle, warnings) = self.provision(username, progress).await?;
                if let Err(e) = self.registry.register(username, password).await {
                    self.teardown(&handle).await;
                    return Err(e);
                }
                self.insert_fresh(username, handle.clone()).await;
                Resolution {
                    handle,
                    created: true,
                    welcome: provision::welcome_new(username),
                    warnings,
                }
            }
            Some(_) => {
                if !self.registry.verify(username, password).await? {
                    info!(username, "credential rejected");
                    return Err(RoomError::BadCredential);
                }
                self.reuse_or_recreate(username, progress).await?
            }
        };

        self.registry
            .record_container(username, &resolution.handle)
            .await?;
        self.registry.touch_last_login(username).await?;
        report(progress, ProvisionStage::Ready);

        info!(
            username,
            handle = %resolution.handle,
            created = resolution.created,
            warnings = resolution.warnings.len(),
            "identity resolved"
        );
        Ok(resolution)
    }

    async fn reuse_or_recreate(
        &self,
        username: &str,
        progress: Option<&ProgressSink>,
    ) -> RoomResult<Resolution> {
        let handle = self.handle_for(username);
        let status = self.runtime.inspect(&handle).await?;

        match status {
            Some(status) if status.running => {
                debug!(username, "reusing running container");
                self.adopt(username, handle.clone()).await;
                Ok(Resolution {
                    handle,
                    created: false,
                    welcome: provision::welcome_restored(username),
                    warnings: Vec::new(),
                })
            }
            Some(_) => {
                info!(username, "starting stopped container");
                report(progress, ProvisionStage::Starting);
                self.start_with_timeout(&handle).await?;
                self.adopt(username, handle.clone()).await;
                Ok(Resolution {
                    handle,
                    created: false,
                    welcome: provision::welcome_restored(username),
                    warnings: Vec::new(),
                })
            }
            None => {
                info!(username, "container lost, recreating");
                let (handle, warnings) = self.provision(username, progress).await?;
                self.insert_fresh(username, handle.clone()).await;
                Ok(Resolution {
                    handle,
                    created: true,
                    welcome: provision::welcome_recreated(username),
                    warnings,
                })
            }
        }
    }

    /// Destroy the user's container and provision a new one under the same
    /// name. Live terminal sessions must be closed by the caller first.
    pub async fn reset_container(
        &self,
        username: &str,
        progress: Option<&ProgressSink>,
    ) -> RoomResult<Resolution> {
        let lock = self.user_lock(username);
        let _guard = lock.lock().await;

        if self.registry.find(username).await?.is_none() {
            return Err(RoomError::NoActiveContainer(username.to_string()));
        }

        info!(username, "resetting container");
        let old = self.records.write().await.remove(username);
        let handle = old.map(|r| r.handle).unwrap_or_else(|| self.handle_for(username));
        self.teardown(&handle).await;

        let (handle, warnings) = self.provision(username, progress).await?;
        self.insert_fresh(username, handle.clone()).await;
        self.registry.record_container(username, &handle).await?;
        report(progress, ProvisionStage::Ready);

        Ok(Resolution {
            handle,
            created: true,
            welcome: provision::welcome_reset(username),
            warnings,
        })
    }

    /// Restart the expiry countdown. Returns the time left.
    pub async fn extend_container(&self, username: &str) -> RoomResult<Duration> {
        let lock = self.user_lock(username);
        let _guard = lock.lock().await;

        let mut records = self.records.write().await;
        let record = records
            .get_mut(username)
            .ok_or_else(|| RoomError::NoActiveContainer(username.to_string()))?;
        record.created_at = Instant::now();
        record.created_wall = SystemTime::now();
        info!(username, "container lifetime extended");
        Ok(self.config.lifetime)
    }

    /// Running containers, sorted by username. Records whose container has
    /// vanished are pruned.
    pub async fn list_active(&self) -> Vec<ActiveContainer> {
        let snapshot: Vec<(String, ContainerRecord)> = self
            .records
            .read()
            .await
            .iter()
            .map(|(u, r)| (u.clone(), r.clone()))
            .collect();

        let mut active = Vec::new();
        for (username, record) in snapshot {
            match self.runtime.inspect(&record.handle).await {
                Ok(Some(status)) if status.running => active.push(ActiveContainer {
                    username,
                    handle: record.handle.clone(),
                    created_at: record.created_wall,
                    uptime: record.age(),
                }),
                Ok(Some(_)) => {}
                Ok(None) => {
                    let mut records = self.records.write().await;
                    let unchanged = records
                        .get(&username)
                        .is_some_and(|r| r.created_at == record.created_at);
                    if unchanged {
                        records.remove(&username);
                        info!(username = %username, "pruned record of vanished container");
                    }
                }
                Err(e) => {
                    warn!(username = %username, error = %e, "inspect failed while listing");
                }
            }
        }
        active.sort_by(|a, b| a.username.cmp(&b.username));
        active
    }

    /// Adopt running `<prefix>-*` containers left over from a previous run.
    pub async fn reattach_existing(&self) -> RoomResult<usize> {
        let containers = self.runtime.list_containers(&self.config.name_prefix).await?;
        let mut adopted = 0;

        for summary in containers.into_iter().filter(|c| c.is_running()) {
            let handle = ContainerHandle::new(summary.name);
            let Some(username) = handle.username(&self.config.name_prefix) else {
                continue;
            };
            if !self.username_policy.is_valid(username)
                || self.registry.find(username).await?.is_none()
            {
                debug!(handle = %handle, "ignoring container without account");
                continue;
            }
            let username = username.to_string();
            self.insert_fresh(&username, handle.clone()).await;
            info!(username = %username, handle = %handle, "reattached existing container");
            adopted += 1;
        }
        Ok(adopted)
    }

    /// Usernames whose record is past the lifetime budget.
    pub async fn expired_users(&self) -> Vec<String> {
        let lifetime = self.config.lifetime;
        self.records
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.age() > lifetime)
            .map(|(u, _)| u.clone())
            .collect()
    }

    /// Tear the container down if it is still expired once the user's lock
    /// is held. The record is dropped even when teardown fails.
    pub async fn teardown_if_expired(&self, username: &str) -> bool {
        let lock = self.user_lock(username);
        let _guard = lock.lock().await;

        let record = self.records.read().await.get(username).cloned();
        let Some(record) = record else {
            return false;
        };
        if record.age() <= self.config.lifetime {
            return false;
        }

        info!(
            username,
            handle = %record.handle,
            age_secs = record.age().as_secs(),
            "container expired"
        );
        self.teardown(&record.handle).await;
        self.records.write().await.remove(username);
        true
    }

    #[cfg(test)]
    pub async fn record(&self, username: &str) -> Option<ContainerRecord> {
        self.records.read().await.get(username).cloned()
    }

    #[cfg(test)]
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    // ── Provisioning ─────────────────────────────────────────────────

    /// Only the first caller builds; concurrent callers wait for that build.
    async fn ensure_image(&self, progress: Option<&ProgressSink>) -> RoomResult<()> {
        self.image_ready
            .get_or_try_init(|| self.build_image_if_missing(progress))
            .await
            .map(|_| ())
    }

    async fn build_image_if_missing(&self, progress: Option<&ProgressSink>) -> RoomResult<()> {
        if self.runtime.image_exists(&self.config.image).await? {
            return Ok(());
        }
        report(progress, ProvisionStage::BuildingImage);
        info!(image = %self.config.image, "building base image");
        tokio::time::timeout(
            self.config.build_timeout,
            self.runtime
                .build_image(&self.config.image, provision::BASE_DOCKERFILE),
        )
        .await
        .map_err(|_| {
            RoomError::ProvisioningFailed(format!(
                "image build timed out after {}s",
                self.config.build_timeout.as_secs()
            ))
        })??;
        info!(image = %self.config.image, "base image built");
        Ok(())
    }

    /// Create, start and set up a fresh container for `username`.
    async fn provision(
        &self,
        username: &str,
        progress: Option<&ProgressSink>,
    ) -> RoomResult<(ContainerHandle, Vec<String>)> {
        self.ensure_image(progress).await?;

        let spec = provision::container_spec(&self.config, username);
        report(progress, ProvisionStage::RemovingStale);
        self.remove_stale(&spec.name).await?;

        report(progress, ProvisionStage::Creating);
        let handle = self.runtime.create_container(&spec).await?;

        report(progress, ProvisionStage::Starting);
        if let Err(e) = self.start_with_timeout(&handle).await {
            error!(username, error = %e, "container failed to start");
            self.teardown(&handle).await;
            return Err(e);
        }

        report(progress, ProvisionStage::Configuring);
        let outcomes = provision::run_setup(self.runtime.as_ref(), &handle, username).await;
        let warnings = provision::warnings(&outcomes);

        info!(username, handle = %handle, "container provisioned");
        Ok((handle, warnings))
    }

    /// Remove an orphan that already carries the deterministic name.
    async fn remove_stale(&self, handle: &ContainerHandle) -> RoomResult<()> {
        if let Some(status) = self.runtime.inspect(handle).await? {
            warn!(handle = %handle, state = %status.state, "removing stale container");
            if status.running {
                if let Err(e) = self.runtime.stop_container(handle).await {
                    warn!(handle = %handle, error = %e, "stop of stale container failed");
                }
            }
            self.runtime.remove_container(handle).await?;
        }
        Ok(())
    }

    async fn start_with_timeout(&self, handle: &ContainerHandle) -> RoomResult<()> {
        tokio::time::timeout(self.config.start_timeout, self.runtime.start_container(handle))
            .await
            .map_err(|_| {
                RoomError::ProvisioningFailed(format!(
                    "container start timed out after {}s",
                    self.config.start_timeout.as_secs()
                ))
            })??;
        Ok(())
    }

    /// Stop then remove, logging failures.
    async fn teardown(&self, handle: &ContainerHandle) {
        if let Err(e) = self.runtime.stop_container(handle).await {
            debug!(handle = %handle, error = %e, "stop during teardown failed");
        }
        if let Err(e) = self.runtime.remove_container(handle).await {
            warn!(handle = %handle, error = %e, "remove during teardown failed");
        }
    }

    async fn insert_fresh(&self, username: &str, handle: ContainerHandle) {
        self.records
            .write()
            .await
            .insert(username.to_string(), ContainerRecord::fresh(handle));
    }

    /// Keep an existing countdown; only start one if there is none.
    async fn adopt(&self, username: &str, handle: ContainerHandle) {
        let mut records = self.records.write().await;
        match records.get_mut(username) {
            Some(record) => record.handle = handle,
            None => {
                records.insert(username.to_string(), ContainerRecord::fresh(handle));
            }
        }
    }
}
