//! Managed run engine
//!
//! Launches, tracks and tears down per-user tasks. The engine composes
//! shell executed inside the user's container and never blocks the caller
//! on task completion; clients poll the observer or subscribe to the
//! status stream.

use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use tracing::{debug, info, warn};

use crate::container::{ContainerEngine, ContainerStatus};
use crate::error::{AgentError, Result};
use crate::workspace::{ContainerLayout, MetaStore, UserLocks, WorkspaceLayout};

use super::logs::LogRetention;
use super::meta::RunMetaStore;
use super::project;
use super::script::{self, ScriptContext, EXIT_ALREADY_RUNNING, LAUNCHED_PREFIX};
use super::types::{RunState, RunType};
use crate::config::RunConfiguration;

/// What a launch attempt produced.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    /// False when the pid-file mutex reported another live task
    pub launched: bool,
    pub state: RunState,
    pub message: String,
    /// Container-side log path of the new task (when launched)
    pub log_path: Option<String>,
}

#[derive(Clone)]
pub struct RunEngine {
    layout: WorkspaceLayout,
    container_layout: ContainerLayout,
    engine: ContainerEngine,
    meta_store: MetaStore,
    run_meta: RunMetaStore,
    retention: LogRetention,
    run_config: RunConfiguration,
    container_port: u16,
    preview_prefix: String,
    locks: Arc<UserLocks>,
}

impl RunEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: WorkspaceLayout,
        container_layout: ContainerLayout,
        engine: ContainerEngine,
        meta_store: MetaStore,
        run_meta: RunMetaStore,
        retention: LogRetention,
        run_config: RunConfiguration,
        container_port: u16,
        preview_prefix: String,
        locks: Arc<UserLocks>,
    ) -> Self {
        Self {
            layout,
            container_layout,
            engine,
            meta_store,
            run_meta,
            retention,
            run_config,
            container_port,
            preview_prefix,
            locks,
        }
    }

    pub fn run_meta(&self) -> &RunMetaStore {
        &self.run_meta
    }

    /// Launch a task for the user's app. At most one long-running task can
    /// exist per user; the on-disk pid file is the cross-process guard and
    /// a second launch surfaces as `launched: false`.
    pub async fn launch(
        &self,
        user_id: u64,
        app_id: u64,
        run_type: RunType,
    ) -> Result<LaunchOutcome> {
        let _guard = self.locks.acquire(user_id).await;

        let container_name = self.meta_store.container_name(user_id);
        if self.meta_store.load(user_id).await?.is_none() {
            return Err(AgentError::PreconditionMissing(
                "workspace not provisioned; call the workspace ensure endpoint first".into(),
            ));
        }
        if !self.engine.status(&container_name).await.is_running() {
            return Err(AgentError::PreconditionMissing(
                "workspace container is not running; call the workspace ensure endpoint first"
                    .into(),
            ));
        }

        // The app directory is created by import, never here: a typoed id
        // must fail instead of leaving a garbage directory behind.
        let app_dir = self.layout.app_dir(user_id, app_id);
        if !app_dir.is_dir() {
            return Err(AgentError::PreconditionMissing(format!(
                "app {} has no directory; import or create the app through the app controller first",
                app_id
            )));
        }

        let Some(found) = project::discover(&app_dir)? else {
            return Err(AgentError::PreconditionMissing(format!(
                "app {} has no package.json; import a project through the app controller first",
                app_id
            )));
        };

        let plan = project::plan(
            run_type,
            &found,
            user_id,
            self.container_port,
            &self.preview_prefix,
        )?;

        let now_ms = crate::workspace::meta::epoch_ms();
        let workdir = if found.package_dir.is_empty() {
            self.container_layout.app_dir(app_id)
        } else {
            format!(
                "{}/{}",
                self.container_layout.app_dir(app_id),
                found.package_dir
            )
        };

        let ctx = ScriptContext {
            run_type,
            user_id,
            app_id,
            layout: self.container_layout.clone(),
            workdir,
            log_path: self.container_layout.log_file(run_type, app_id, now_ms),
            started_at: chrono::Utc::now().timestamp(),
            container_port: self.container_port,
            plan,
            run_config: self.run_config.clone(),
        };

        self.write_inner_script(user_id, &script::inner_script(&ctx))
            .await?;

        let result = self
            .engine
            .exec(&container_name, &script::outer_launcher(&ctx))
            .await;

        if result.exit_code == EXIT_ALREADY_RUNNING {
            debug!("User {} launch refused, task already running", user_id);
            let state = match self.run_meta.read(user_id).await.into_option() {
                Some(meta) => meta.run_type.initial_state(),
                None => run_type.initial_state(),
            };
            return Ok(LaunchOutcome {
                launched: false,
                state,
                message: "a task is already running; stop it first or wait".into(),
                log_path: None,
            });
        }

        if !result.success() {
            return Err(AgentError::subprocess(
                format!("launch {} for user {} app {}", run_type, user_id, app_id),
                result.output,
            ));
        }

        // Prune after the new log exists so retention holds right away
        self.retention.prune(user_id).await;

        let state = parse_launched_state(&result.output).unwrap_or(run_type.initial_state());
        info!("User {} launched {} for app {}", user_id, run_type, app_id);
        Ok(LaunchOutcome {
            launched: true,
            state,
            message: format!("{} launched", run_type),
            log_path: Some(ctx.log_path),
        })
    }

    /// Stop the current run. Returns true when a signal was delivered to a
    /// live process group. Idempotent: a stop with nothing running only
    /// clears stale files.
    pub async fn stop(&self, user_id: u64) -> Result<bool> {
        let _guard = self.locks.acquire(user_id).await;
        self.stop_locked(user_id).await
    }

    /// Stop for the idle reaper: identical to [`stop`](Self::stop) but
    /// documented apart because it must never create or start a container
    /// as a side effect. Returns true when a kill was issued.
    pub async fn stop_for_idle(&self, user_id: u64) -> Result<bool> {
        let _guard = self.locks.acquire(user_id).await;
        self.stop_locked(user_id).await
    }

    async fn stop_locked(&self, user_id: u64) -> Result<bool> {
        let container_name = self.meta_store.container_name(user_id);
        let mut killed = false;

        if self.engine.status(&container_name).await.is_running() {
            let result = self
                .engine
                .exec(&container_name, &script::stop_script(&self.container_layout))
                .await;
            if result.success() {
                killed = result.output.contains("STOPPED:1");
            } else {
                warn!("Stop script failed for user {}: {}", user_id, result.output);
            }
        }

        // The run files live on the shared mount; clearing host-side keeps
        // the teardown correct when the container is gone entirely.
        self.run_meta.clear(user_id).await;
        Ok(killed)
    }

    async fn write_inner_script(&self, user_id: u64, content: &str) -> Result<()> {
        let path = self.layout.inner_script(user_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        #[cfg(unix)]
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        Ok(())
    }

    /// Container status passthrough for callers that already depend on the
    /// engine wiring here.
    pub async fn container_status(&self, user_id: u64) -> ContainerStatus {
        self.engine
            .status(&self.meta_store.container_name(user_id))
            .await
    }
}

fn parse_launched_state(output: &str) -> Option<RunState> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with(LAUNCHED_PREFIX))?;
    match line.trim_start_matches(LAUNCHED_PREFIX) {
        "STARTING" => Some(RunState::Starting),
        "BUILDING" => Some(RunState::Building),
        "INSTALLING" => Some(RunState::Installing),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerConfiguration;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_parse_launched_state() {
        assert_eq!(
            parse_launched_state("Emulate Docker CLI using podman\nLAUNCHED:STARTING\n"),
            Some(RunState::Starting)
        );
        assert_eq!(
            parse_launched_state("LAUNCHED:BUILDING"),
            Some(RunState::Building)
        );
        assert_eq!(parse_launched_state("nothing here"), None);
        assert_eq!(parse_launched_state("LAUNCHED:NOPE"), None);
    }

    // End-to-end launch against a local shell: a fake engine binary
    // reports the container as running and passes exec scripts through to
    // the host shell, with the container mount pointed at the user dir so
    // the scripts operate on the scratch tree.

    fn write_executable(path: &std::path::Path, content: &str) {
        std::fs::write(path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    fn passthrough_engine(tmp: &TempDir) -> ContainerEngine {
        let fake = tmp.path().join("fake-engine");
        write_executable(
            &fake,
            "#!/bin/sh\ncmd=$1; shift\ncase \"$cmd\" in\n  inspect) echo running ;;\n  exec) shift; exec \"$@\" ;;\n  *) exit 0 ;;\nesac\n",
        );
        ContainerEngine::with_binary(fake.to_str().unwrap(), Duration::from_secs(10))
    }

    fn fake_npm_on_path(tmp: &TempDir) {
        let bin_dir = tmp.path().join("fake-bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        write_executable(&bin_dir.join("npm"), "#!/bin/sh\nsleep 30\n");
        let path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{}", bin_dir.display(), path));
    }

    async fn engine_fixture(tmp: &TempDir) -> RunEngine {
        let layout = WorkspaceLayout::new(tmp.path());
        let mut container = ContainerConfiguration::default();
        container.host_port_base = 44300;
        container.host_port_scan = 60;
        let meta_store = MetaStore::new(layout.clone(), container);
        meta_store.load_or_init(1).await.unwrap();

        // Container paths == host paths for the passthrough engine
        let container_layout =
            ContainerLayout::new(layout.user_dir(1).to_string_lossy().into_owned());

        RunEngine::new(
            layout.clone(),
            container_layout,
            passthrough_engine(tmp),
            meta_store,
            RunMetaStore::new(layout.clone()),
            LogRetention::new(layout, 3),
            RunConfiguration::default(),
            5173,
            "/ws".to_string(),
            Arc::new(UserLocks::new()),
        )
    }

    #[tokio::test]
    async fn test_launch_twice_yields_one_running_task() {
        let tmp = TempDir::new().unwrap();
        fake_npm_on_path(&tmp);

        let layout = WorkspaceLayout::new(tmp.path());
        std::fs::create_dir_all(layout.app_dir(1, 7)).unwrap();
        std::fs::write(
            layout.app_dir(1, 7).join("package.json"),
            r#"{"scripts":{"dev":"node server.js"}}"#,
        )
        .unwrap();

        let engine = engine_fixture(&tmp).await;

        let first = engine.launch(1, 7, RunType::Dev).await.unwrap();
        assert!(first.launched);
        assert_eq!(first.state, RunState::Starting);
        assert!(layout.pid_file(1).exists());
        assert!(layout.current_json(1).exists());

        let second = engine.launch(1, 7, RunType::Dev).await.unwrap();
        assert!(!second.launched);
        assert!(second.message.contains("already running"));

        let stopped = engine.stop(1).await.unwrap();
        assert!(stopped);
        assert!(!layout.pid_file(1).exists());
        assert!(!layout.current_json(1).exists());
    }

    #[tokio::test]
    async fn test_launch_rejects_unknown_app_dir() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_fixture(&tmp).await;

        let err = engine.launch(1, 999, RunType::Build).await.unwrap_err();
        assert!(matches!(err, AgentError::PreconditionMissing(_)));
        // A typoed id must not leave a directory behind
        assert!(!WorkspaceLayout::new(tmp.path()).app_dir(1, 999).exists());
    }

    #[tokio::test]
    async fn test_launch_rejects_app_without_package_json() {
        let tmp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(tmp.path());
        std::fs::create_dir_all(layout.app_dir(1, 8)).unwrap();

        let engine = engine_fixture(&tmp).await;
        let err = engine.launch(1, 8, RunType::Dev).await.unwrap_err();
        match err {
            AgentError::PreconditionMissing(message) => {
                assert!(message.contains("package.json"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_without_run_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_fixture(&tmp).await;
        assert!(!engine.stop(1).await.unwrap());
        assert!(!engine.stop(1).await.unwrap());
    }
}
