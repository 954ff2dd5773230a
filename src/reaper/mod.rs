//! Idle reaping
//!
//! A one-minute sweep over the activity snapshot. Users whose monotonic
//! idle age crosses the configured thresholds get their run stopped and
//! then their container stopped. Thresholds at or below zero disable the
//! respective sweep, so a misconfigured zero can never reap everyone
//! instantly.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IdleConfiguration;
use crate::container::Supervisor;
use crate::run::RunEngine;
use crate::workspace::ActivityTracker;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct IdleReaper {
    activity: Arc<ActivityTracker>,
    run_engine: RunEngine,
    supervisor: Supervisor,
    config: IdleConfiguration,
}

impl IdleReaper {
    pub fn new(
        activity: Arc<ActivityTracker>,
        run_engine: RunEngine,
        supervisor: Supervisor,
        config: IdleConfiguration,
    ) -> Self {
        Self {
            activity,
            run_engine,
            supervisor,
            config,
        }
    }

    /// Spawn the periodic sweep; lives until the token is cancelled.
    pub fn spawn(self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Idle reaper stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }

    /// One pass over the current activity snapshot. Every failure is
    /// non-fatal; the next sweep retries naturally.
    pub async fn sweep(&self) {
        let run_after = self.config.stop_run_after_secs;
        let container_after = self.config.stop_container_after_secs;
        if run_after <= 0 && container_after <= 0 {
            return;
        }

        for (user_id, idle) in self.activity.snapshot() {
            let idle_secs = idle.as_secs() as i64;

            if run_after > 0 && idle_secs >= run_after {
                match self.run_engine.stop_for_idle(user_id).await {
                    Ok(true) => info!("User {} run stopped after {}s idle", user_id, idle_secs),
                    Ok(false) => debug!("User {} had no live run to reap", user_id),
                    Err(e) => warn!("Idle run stop for user {} failed: {}", user_id, e),
                }
            }

            if container_after > 0 && idle_secs >= container_after {
                match self.supervisor.stop_if_running(user_id).await {
                    Ok(true) => {
                        info!("User {} container stopped after {}s idle", user_id, idle_secs)
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Idle container stop for user {} failed: {}", user_id, e),
                }
            }
        }
    }
}
