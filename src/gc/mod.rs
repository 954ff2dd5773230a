//! Orphan garbage collection
//!
//! Two reclamation paths share this module: the scheduled sweep that
//! reconciles every user directory against the authoritative set of
//! application ids, and the per-app cleanup hook the control plane fires
//! when an application is deleted. Directories that refuse to die are
//! quarantined under `apps/<id>.deleted-<ms>` so the id becomes usable
//! again immediately.

use std::collections::HashSet;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::command;
use crate::config::GcConfiguration;
use crate::container::{is_broken_container, Supervisor};
use crate::error::{AgentError, Result};
use crate::run::{LogRetention, RunEngine, RunMetaRead};
use crate::workspace::layout::{is_quarantine_dir, log_file_app_id};
use crate::workspace::WorkspaceLayout;

/// Delete attempts before quarantining, backing off 200 ms × attempt.
const DELETE_ATTEMPTS: u32 = 3;
const DELETE_BACKOFF: Duration = Duration::from_millis(200);

/// Counters from one reconciliation sweep.
#[derive(Debug, Default, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub app_dirs_deleted: usize,
    pub logs_deleted: usize,
    pub databases_dropped: usize,
}

#[derive(Clone)]
pub struct OrphanCollector {
    layout: WorkspaceLayout,
    run_engine: RunEngine,
    retention: LogRetention,
    supervisor: Supervisor,
    config: GcConfiguration,
}

impl OrphanCollector {
    pub fn new(
        layout: WorkspaceLayout,
        run_engine: RunEngine,
        retention: LogRetention,
        supervisor: Supervisor,
        config: GcConfiguration,
    ) -> Self {
        Self {
            layout,
            run_engine,
            retention,
            supervisor,
            config,
        }
    }

    /// Reconcile the on-disk tree against the authoritative id set:
    /// numeric app directories and run logs whose id is not in the set are
    /// deleted, and orphaned `db_<id>` databases are dropped. Quarantined
    /// directories are left alone.
    pub async fn sweep(&self, live_app_ids: &HashSet<u64>) -> SweepReport {
        let mut report = SweepReport::default();

        for user_id in self.user_ids().await {
            self.sweep_app_dirs(user_id, live_app_ids, &mut report).await;
            self.sweep_run_logs(user_id, live_app_ids, &mut report).await;
        }

        if self.config.mongo_enabled {
            self.sweep_databases(live_app_ids, &mut report).await;
        }

        info!(
            "Orphan sweep: {} app dirs, {} logs, {} databases",
            report.app_dirs_deleted, report.logs_deleted, report.databases_dropped
        );
        report
    }

    async fn user_ids(&self) -> Vec<u64> {
        let mut out = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(self.layout.root()).await else {
            return out;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            {
                if entry.path().is_dir() {
                    out.push(id);
                }
            }
        }
        out
    }

    async fn sweep_app_dirs(
        &self,
        user_id: u64,
        live: &HashSet<u64>,
        report: &mut SweepReport,
    ) {
        let apps_dir = self.layout.apps_dir(user_id);
        let Ok(mut entries) = tokio::fs::read_dir(&apps_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_quarantine_dir(&name) {
                continue;
            }
            let Ok(app_id) = name.parse::<u64>() else {
                continue;
            };
            if live.contains(&app_id) {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    info!("Swept orphaned app dir {}/{}", user_id, app_id);
                    report.app_dirs_deleted += 1;
                }
                Err(e) => warn!("Cannot sweep {}/{}: {}", user_id, app_id, e),
            }
        }
    }

    async fn sweep_run_logs(
        &self,
        user_id: u64,
        live: &HashSet<u64>,
        report: &mut SweepReport,
    ) {
        let run_dir = self.layout.run_dir(user_id);
        let Ok(mut entries) = tokio::fs::read_dir(&run_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(app_id) = log_file_app_id(&name) else {
                continue;
            };
            if live.contains(&app_id) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => report.logs_deleted += 1,
                Err(e) => warn!("Cannot sweep log {}: {}", name, e),
            }
        }
    }

    /// Drop every `db_<id>` database whose id is orphaned. All mongosh
    /// work is best-effort through the external shell.
    async fn sweep_databases(&self, live: &HashSet<u64>, report: &mut SweepReport) {
        let list = self
            .mongosh("db.adminCommand('listDatabases').databases.forEach(d => print(d.name))")
            .await;
        if !list.success() {
            warn!("Cannot list databases: {}", list.output);
            return;
        }

        for line in list.output.lines().map(str::trim) {
            let Some(app_id) = line
                .strip_prefix("db_")
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };
            if live.contains(&app_id) {
                continue;
            }
            let drop = self
                .mongosh(&format!(
                    "db.getSiblingDB('db_{}').dropDatabase()",
                    app_id
                ))
                .await;
            if drop.success() {
                info!("Dropped orphaned database db_{}", app_id);
                report.databases_dropped += 1;
            } else {
                warn!("Cannot drop db_{}: {}", app_id, drop.output);
            }
        }
    }

    async fn mongosh(&self, eval: &str) -> command::CommandResult {
        let argv = vec![
            self.config.mongosh_binary.clone(),
            self.config.mongo_uri.clone(),
            "--quiet".to_string(),
            "--eval".to_string(),
            eval.to_string(),
        ];
        command::run(
            &argv,
            None,
            Duration::from_secs(self.config.mongo_timeout_secs),
        )
        .await
    }

    /// Control-plane hook fired when an application is deleted. Stops the
    /// run when the deleted app is the current one, deletes the app tree
    /// (quarantining it when deletion keeps failing), sweeps its logs, and
    /// clears a broken container so later ensures do not wedge.
    pub async fn cleanup_app(&self, user_id: u64, app_id: u64) -> Result<()> {
        match self.run_engine.run_meta().read(user_id).await {
            RunMetaRead::Present(meta) if meta.app_id == app_id => {
                debug!("Deleted app {} is current for user {}, stopping run", app_id, user_id);
                let _ = self.run_engine.stop(user_id).await;
            }
            RunMetaRead::Corrupt => {
                self.run_engine.run_meta().clear(user_id).await;
            }
            _ => {}
        }

        self.delete_app_dir(user_id, app_id).await?;
        self.retention.delete_for_app(user_id, app_id).await;

        // A conmon/libpod corpse would make the next ensure loop on
        // "name in use"; clear it now while we know about it.
        let raw = self.supervisor.raw_state(user_id).await;
        if is_broken_container(&raw) {
            warn!("User {} container looks broken, removing", user_id);
            if let Err(e) = self.supervisor.remove(user_id).await {
                warn!("Broken container removal for user {} failed: {}", user_id, e);
            }
        }

        Ok(())
    }

    async fn delete_app_dir(&self, user_id: u64, app_id: u64) -> Result<()> {
        let app_dir = self.layout.app_dir(user_id, app_id);
        if !app_dir.exists() {
            return Ok(());
        }

        for attempt in 1..=DELETE_ATTEMPTS {
            match tokio::fs::remove_dir_all(&app_dir).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    debug!(
                        "Delete attempt {} for {}/{} failed: {}",
                        attempt, user_id, app_id, e
                    );
                    tokio::time::sleep(DELETE_BACKOFF * attempt).await;
                }
            }
        }

        // Quarantine: the rename frees the id even when something inside
        // the tree is undeletable right now.
        let quarantine =
            self.layout
                .quarantine_dir(user_id, app_id, crate::workspace::meta::epoch_ms());
        tokio::fs::rename(&app_dir, &quarantine).await.map_err(|e| {
            AgentError::Fatal(format!(
                "cannot delete or quarantine app {} for user {}: {}",
                app_id, user_id, e
            ))
        })?;
        warn!(
            "App {}/{} quarantined as {}",
            user_id,
            app_id,
            quarantine.display()
        );

        // One more try on the quarantined tree; leaving it behind is fine.
        let _ = tokio::fs::remove_dir_all(&quarantine).await;
        Ok(())
    }
}

/// Register the daily sweep. The id set comes from the control plane; when
/// no remote is configured the job logs and skips.
pub async fn schedule_daily_sweep(
    collector: OrphanCollector,
    api: Option<std::sync::Arc<crate::api::HttpClient>>,
    cron: &str,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(cron, move |_uuid, _lock| {
        let collector = collector.clone();
        let api = api.clone();
        Box::pin(async move {
            let Some(api) = api else {
                debug!("Orphan sweep skipped: no control plane configured");
                return;
            };
            match api.fetch_app_ids().await {
                Ok(ids) => {
                    collector.sweep(&ids).await;
                }
                Err(e) => error!("Orphan sweep aborted, cannot fetch app ids: {}", e),
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContainerConfiguration, RunConfiguration};
    use crate::container::ContainerEngine;
    use crate::workspace::{ContainerLayout, MetaStore, UserLocks};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn collector(root: &std::path::Path) -> OrphanCollector {
        let layout = WorkspaceLayout::new(root);
        let engine = ContainerEngine::with_binary("false", Duration::from_secs(1));
        let meta_store = MetaStore::new(layout.clone(), ContainerConfiguration::default());
        let retention = LogRetention::new(layout.clone(), 3);
        let locks = Arc::new(UserLocks::new());
        let run_engine = RunEngine::new(
            layout.clone(),
            ContainerLayout::new("/workspace"),
            engine.clone(),
            meta_store.clone(),
            crate::run::RunMetaStore::new(layout.clone()),
            retention.clone(),
            RunConfiguration::default(),
            5173,
            "/ws".to_string(),
            locks.clone(),
        );
        let supervisor = Supervisor::new(
            engine,
            layout.clone(),
            meta_store,
            retention.clone(),
            ContainerConfiguration::default(),
            locks,
        );
        OrphanCollector::new(layout, run_engine, retention, supervisor, GcConfiguration::default())
    }

    async fn seed(root: &std::path::Path, user_id: u64, apps: &[&str], logs: &[&str]) {
        let layout = WorkspaceLayout::new(root);
        for app in apps {
            tokio::fs::create_dir_all(layout.apps_dir(user_id).join(app))
                .await
                .unwrap();
        }
        tokio::fs::create_dir_all(layout.run_dir(user_id)).await.unwrap();
        for log in logs {
            tokio::fs::write(layout.run_dir(user_id).join(log), b"x")
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_sweep_deletes_orphans_and_keeps_live() {
        let tmp = TempDir::new().unwrap();
        seed(
            tmp.path(),
            1,
            &["7", "8", "9.deleted-1700000000000", "not-numeric"],
            &["run-dev-7-1.log", "run-build-8-2.log"],
        )
        .await;

        let live: HashSet<u64> = [7].into_iter().collect();
        let report = collector(tmp.path()).sweep(&live).await;

        assert_eq!(report.app_dirs_deleted, 1);
        assert_eq!(report.logs_deleted, 1);

        let layout = WorkspaceLayout::new(tmp.path());
        assert!(layout.app_dir(1, 7).exists());
        assert!(!layout.app_dir(1, 8).exists());
        // quarantine and non-numeric entries survive
        assert!(layout.apps_dir(1).join("9.deleted-1700000000000").exists());
        assert!(layout.apps_dir(1).join("not-numeric").exists());
        assert!(layout.run_dir(1).join("run-dev-7-1.log").exists());
        assert!(!layout.run_dir(1).join("run-build-8-2.log").exists());
    }

    #[tokio::test]
    async fn test_cleanup_app_removes_dir_and_logs() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path(), 2, &["5"], &["run-dev-5-1.log", "run-dev-6-1.log"]).await;

        collector(tmp.path()).cleanup_app(2, 5).await.unwrap();

        let layout = WorkspaceLayout::new(tmp.path());
        assert!(!layout.app_dir(2, 5).exists());
        assert!(!layout.run_dir(2).join("run-dev-5-1.log").exists());
        assert!(layout.run_dir(2).join("run-dev-6-1.log").exists());
    }

    #[tokio::test]
    async fn test_cleanup_app_missing_dir_is_ok() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path(), 3, &[], &[]).await;
        collector(tmp.path()).cleanup_app(3, 99).await.unwrap();
    }
}
