//! Main agent command - starts the daemon

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use workspace_agent::api::{Heartbeat, HttpClient};
use workspace_agent::config::Configuration;
use workspace_agent::container::{ContainerEngine, Supervisor};
use workspace_agent::gc::{self, OrphanCollector};
use workspace_agent::reaper::IdleReaper;
use workspace_agent::router::{self, middleware::NonceStore, AppState};
use workspace_agent::run::{LogRetention, RunEngine, RunMetaStore, RunObserver};
use workspace_agent::workspace::{
    ActivityTracker, ContainerLayout, MetaStore, UserLocks, WorkspaceLayout,
};

/// Run the agent until shutdown.
pub async fn run(config_path: &str) -> Result<()> {
    info!("Loading configuration from: {}", config_path);
    let config = Arc::new(Configuration::load(config_path)?);

    info!("Configuration loaded");
    info!("  API: {}:{}", config.api.host, config.api.port);
    info!("  Root: {}", config.system.root_directory.display());
    info!("  Image: {}", config.container.image);

    // Core wiring, leaves first
    let layout = WorkspaceLayout::new(&config.system.root_directory);
    let container_layout = ContainerLayout::new(&config.container.workspace_mount);
    let engine = ContainerEngine::new(&config.container);
    let meta_store = MetaStore::new(layout.clone(), config.container.clone());
    let run_meta = RunMetaStore::new(layout.clone());
    let retention = LogRetention::new(layout.clone(), config.run.log_keep_per_type);
    let locks = Arc::new(UserLocks::new());
    let activity = Arc::new(ActivityTracker::new());

    let run_engine = Arc::new(RunEngine::new(
        layout.clone(),
        container_layout.clone(),
        engine.clone(),
        meta_store.clone(),
        run_meta.clone(),
        retention.clone(),
        config.run.clone(),
        config.container.container_port,
        config.preview.path_prefix.clone(),
        locks.clone(),
    ));

    let observer = Arc::new(RunObserver::new(
        engine.clone(),
        meta_store.clone(),
        run_meta.clone(),
        config.run.clone(),
        config.preview.clone(),
        config.container.container_port,
    ));

    let supervisor = Arc::new(Supervisor::new(
        engine.clone(),
        layout.clone(),
        meta_store.clone(),
        retention.clone(),
        config.container.clone(),
        locks.clone(),
    ));

    let collector = Arc::new(OrphanCollector::new(
        layout.clone(),
        (*run_engine).clone(),
        retention.clone(),
        (*supervisor).clone(),
        config.gc.clone(),
    ));

    let api_client = HttpClient::from_config(&config.remote)?.map(Arc::new);

    let shutdown_token = CancellationToken::new();

    // Idle reaper
    let reaper = IdleReaper::new(
        activity.clone(),
        (*run_engine).clone(),
        (*supervisor).clone(),
        config.idle.clone(),
    );
    reaper.spawn(shutdown_token.clone());
    info!(
        "Idle reaper armed (run after {}s, container after {}s; <=0 disables)",
        config.idle.stop_run_after_secs, config.idle.stop_container_after_secs
    );

    // Daily orphan sweep
    let _gc_scheduler =
        gc::schedule_daily_sweep((*collector).clone(), api_client.clone(), &config.gc.cron)
            .await?;
    info!("Orphan sweep scheduled: {}", config.gc.cron);

    // Heartbeat reporter
    if let Some(api) = api_client.clone() {
        spawn_heartbeat(
            api,
            config.clone(),
            layout.clone(),
            activity.clone(),
            shutdown_token.clone(),
        );
        info!(
            "Heartbeat reporter started (every {}s)",
            config.remote.heartbeat_interval_secs
        );
    }

    // HTTP surface
    let state = AppState {
        config: config.clone(),
        supervisor,
        run_engine,
        observer,
        collector,
        activity,
        nonces: Arc::new(NonceStore::new(config.auth.nonce_ttl_secs)),
        meta_store: Arc::new(meta_store),
        engine,
        container_layout,
    };
    let app = router::build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {}", e))?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let shutdown_token_clone = shutdown_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Cannot install CTRL+C handler; running without graceful shutdown");
            return;
        }
        warn!("Received shutdown signal");
        shutdown_token_clone.cancel();
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    info!("Starting HTTP server on {}", bind_addr);
    axum_server::bind(bind_addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    info!("Agent stopped");
    Ok(())
}

/// Periodic node heartbeat to the control plane; failures are logged and
/// the next beat retries naturally.
fn spawn_heartbeat(
    api: Arc<HttpClient>,
    config: Arc<Configuration>,
    layout: WorkspaceLayout,
    activity: Arc<ActivityTracker>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(config.remote.heartbeat_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Heartbeat reporter stopped");
                    return;
                }
                _ = interval.tick() => {
                    let heartbeat = Heartbeat {
                        node: config.system.node_name.clone(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                        users: activity.len(),
                        active_runs: count_active_runs(&layout).await,
                    };
                    if let Err(e) = api.send_heartbeat(&heartbeat).await {
                        warn!("Heartbeat failed: {}", e);
                    }
                }
            }
        }
    });
}

/// Live pid files under the workspace root; a cheap proxy for "how many
/// managed runs exist right now".
async fn count_active_runs(layout: &WorkspaceLayout) -> usize {
    let mut count = 0;
    let Ok(mut entries) = tokio::fs::read_dir(layout.root()).await else {
        return 0;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Some(user_id) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok())
        else {
            continue;
        };
        if layout.pid_file(user_id).exists() {
            count += 1;
        }
    }
    count
}
