//! Container supervision
//!
//! Idempotently brings the per-user container to the desired state:
//! directories exist, meta is current, the container runs the configured
//! image with the right mounts and network, and broken engine states are
//! cleared instead of wedging every later call.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ContainerConfiguration;
use crate::error::{AgentError, Result};
use crate::run::LogRetention;
use crate::workspace::{MetaStore, UserLocks, WorkspaceLayout, WorkspaceMeta};

use super::engine::{is_name_in_use, ContainerEngine, ContainerStatus};
use super::spec::RunSpec;

#[derive(Clone)]
pub struct Supervisor {
    engine: ContainerEngine,
    layout: WorkspaceLayout,
    meta_store: MetaStore,
    retention: LogRetention,
    config: ContainerConfiguration,
    locks: Arc<UserLocks>,
}

impl Supervisor {
    pub fn new(
        engine: ContainerEngine,
        layout: WorkspaceLayout,
        meta_store: MetaStore,
        retention: LogRetention,
        config: ContainerConfiguration,
        locks: Arc<UserLocks>,
    ) -> Self {
        Self {
            engine,
            layout,
            meta_store,
            retention,
            config,
            locks,
        }
    }

    /// Bring the user's container up. Safe to call repeatedly and from
    /// concurrent requests; the per-user lock serializes the work and the
    /// result is the same container name and host port every time.
    pub async fn ensure(&self, user_id: u64) -> Result<WorkspaceMeta> {
        let _guard = self.locks.acquire(user_id).await;

        tokio::fs::create_dir_all(self.layout.apps_dir(user_id)).await?;
        tokio::fs::create_dir_all(self.layout.run_dir(user_id)).await?;

        self.retention.prune(user_id).await;

        let meta = self.meta_store.load_or_init(user_id).await?;
        let name = &meta.container_name;

        self.try_registry_login().await;
        self.engine.network_ensure(&self.config.network).await?;

        let mut status = self.engine.status(name).await;
        debug!("User {} container {} is {}", user_id, name, status);

        if status.is_running() && self.has_drifted(name, user_id, &meta).await {
            info!("User {} container drifted from desired spec, recreating", user_id);
            self.engine.remove(name).await?;
            status = ContainerStatus::NotCreated;
        }

        match status {
            ContainerStatus::Running => {}
            ContainerStatus::NotCreated => {
                self.create(user_id, &meta).await?;
            }
            ContainerStatus::Other(_) | ContainerStatus::Unknown => {
                // Created but stopped (or unreadable): try a plain start
                // before falling back to recreation.
                if let Err(e) = self.engine.start(name).await {
                    warn!("User {} container failed to start, recreating: {}", user_id, e);
                    self.engine.remove(name).await?;
                    self.create(user_id, &meta).await?;
                }
            }
        }

        self.engine
            .network_connect(&self.config.network, name)
            .await?;

        Ok(meta)
    }

    /// Stop the container if it is currently running. Used by the idle
    /// reaper; never creates anything.
    pub async fn stop_if_running(&self, user_id: u64) -> Result<bool> {
        let _guard = self.locks.acquire(user_id).await;
        let name = self.meta_store.container_name(user_id);
        if !self.engine.status(&name).await.is_running() {
            return Ok(false);
        }
        self.engine.stop(&name).await?;
        info!("User {} container stopped", user_id);
        Ok(true)
    }

    /// Remove the container outright, applying the engine's broken-state
    /// fallback. Used by cleanup when inspect reports a corpse, so later
    /// ensures do not loop on "name in use".
    pub async fn remove(&self, user_id: u64) -> Result<()> {
        let _guard = self.locks.acquire(user_id).await;
        let name = self.meta_store.container_name(user_id);
        self.engine.remove(&name).await
    }

    /// Inspect without holding the lock; used by observers and cleanup to
    /// recognize broken states.
    pub async fn raw_state(&self, user_id: u64) -> crate::command::CommandResult {
        let name = self.meta_store.container_name(user_id);
        self.engine.inspect_raw(&name).await
    }

    async fn create(&self, user_id: u64, meta: &WorkspaceMeta) -> Result<()> {
        let spec = self.build_spec(user_id, meta);
        let result = self.engine.run(&spec).await;
        if result.success() {
            info!("User {} container {} created", user_id, spec.name);
            return Ok(());
        }

        // Create race: a previous container still owns the name. Remove it
        // once and retry; anything after that is a real failure.
        if is_name_in_use(&result, &spec.name) {
            warn!("User {} container name in use, removing and retrying", user_id);
            self.engine.remove(&spec.name).await?;
            let retry = self.engine.run(&spec).await;
            if retry.success() {
                return Ok(());
            }
            return Err(AgentError::subprocess(
                format!("run container {}", spec.name),
                retry.output,
            ));
        }

        Err(AgentError::subprocess(
            format!("run container {}", spec.name),
            result.output,
        ))
    }

    fn build_spec(&self, user_id: u64, meta: &WorkspaceMeta) -> RunSpec {
        RunSpec {
            name: meta.container_name.clone(),
            restart_policy: "unless-stopped".to_string(),
            memory_mb: self.config.memory_mb,
            cpus: self.config.cpus,
            pids_limit: self.config.pids_limit,
            network: self.config.network.clone(),
            host_port: meta.host_port,
            container_port: meta.container_port,
            volumes: vec![(
                self.layout.user_dir(user_id).to_string_lossy().into_owned(),
                self.config.workspace_mount.clone(),
            )],
            env: Vec::new(),
            image: meta.image.clone(),
            command: RunSpec::idle_bootstrap(),
        }
    }

    /// A running container has drifted when its image or its workspace
    /// mount no longer match what we would create today.
    async fn has_drifted(&self, name: &str, user_id: u64, meta: &WorkspaceMeta) -> bool {
        match self.engine.image(name).await {
            Ok(image) if image != meta.image => {
                debug!("Image drift for {}: {} != {}", name, image, meta.image);
                return true;
            }
            Err(e) => {
                debug!("Cannot inspect image of {}: {}", name, e);
                return true;
            }
            Ok(_) => {}
        }

        let desired_source = self.layout.user_dir(user_id).to_string_lossy().into_owned();
        match self.engine.mounts(name).await {
            Ok(mounts) => !mounts.iter().any(|m| {
                m.source == desired_source && m.destination == self.config.workspace_mount
            }),
            Err(e) => {
                debug!("Cannot inspect mounts of {}: {}", name, e);
                true
            }
        }
    }

    /// Best-effort registry login when the image lives on a private
    /// registry and credentials are configured.
    async fn try_registry_login(&self) {
        if !self.config.registry.is_configured() {
            return;
        }
        let Some(registry) = registry_host(&self.config.image) else {
            return;
        };
        self.engine
            .registry_login(
                &registry,
                &self.config.registry.username,
                &self.config.registry.password,
            )
            .await;
    }
}

/// Registry host of an image reference, when it names one. Docker treats
/// the first path segment as a registry only when it looks like a host
/// (contains a dot or a port).
pub fn registry_host(image: &str) -> Option<String> {
    let first = image.split('/').next()?;
    if first == image {
        return None;
    }
    if first.contains('.') || first.contains(':') || first == "localhost" {
        Some(first.to_string())
    } else {
        None
    }
}
