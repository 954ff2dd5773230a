//! Workspace meta persistence and host port allocation

use std::net::TcpListener;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ContainerConfiguration;
use crate::error::{AgentError, Result};

use super::layout::WorkspaceLayout;

/// Durable per-user record tying a user to a container name and a sticky
/// host port. Never deleted; the image field is updated in place when the
/// desired image changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMeta {
    pub host_port: u16,
    pub container_port: u16,
    pub image: String,
    pub container_name: String,
    pub created_at: u64,
}

/// Loads, initializes and rewrites `workspace-meta.json`.
///
/// Callers must hold the per-user lock; the store itself is a single
/// writer under that lock and rewrites the file atomically.
#[derive(Clone)]
pub struct MetaStore {
    layout: WorkspaceLayout,
    container: ContainerConfiguration,
}

impl MetaStore {
    pub fn new(layout: WorkspaceLayout, container: ContainerConfiguration) -> Self {
        Self { layout, container }
    }

    pub fn container_name(&self, user_id: u64) -> String {
        format!("{}{}", self.container.name_prefix, user_id)
    }

    /// Load the meta if present.
    pub async fn load(&self, user_id: u64) -> Result<Option<WorkspaceMeta>> {
        let path = self.layout.meta_path(user_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let meta = serde_json::from_str(&content).map_err(|e| {
                    AgentError::Fatal(format!("corrupt {}: {}", path.display(), e))
                })?;
                Ok(Some(meta))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the meta, allocating a host port and creating the record on
    /// first use. When the desired image differs from the persisted one
    /// the record is updated in place; the host port stays sticky.
    pub async fn load_or_init(&self, user_id: u64) -> Result<WorkspaceMeta> {
        if let Some(mut meta) = self.load(user_id).await? {
            if meta.image != self.container.image {
                info!(
                    "User {} image changed {} -> {}",
                    user_id, meta.image, self.container.image
                );
                meta.image = self.container.image.clone();
                self.persist(user_id, &meta).await?;
            }
            return Ok(meta);
        }

        let host_port = allocate_host_port(
            user_id,
            self.container.host_port_base,
            self.container.host_port_scan,
        )?;

        let meta = WorkspaceMeta {
            host_port,
            container_port: self.container.container_port,
            image: self.container.image.clone(),
            container_name: self.container_name(user_id),
            created_at: epoch_ms(),
        };
        self.persist(user_id, &meta).await?;
        info!("User {} allocated host port {}", user_id, host_port);
        Ok(meta)
    }

    /// Atomic rewrite: temp file in the same directory, then rename.
    pub async fn persist(&self, user_id: u64, meta: &WorkspaceMeta) -> Result<()> {
        let path = self.layout.meta_path(user_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(meta)
            .map_err(|e| AgentError::Fatal(format!("serialize workspace meta: {}", e)))?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            AgentError::Fatal(format!("cannot write meta file {}: {}", path.display(), e))
        })?;
        Ok(())
    }
}

/// Scan the window `[base, base+scan)` starting at `user_id % scan` and
/// take the first port that accepts a bind probe. The offset spreads users
/// across the window so neighbours rarely collide.
pub fn allocate_host_port(user_id: u64, base: u16, scan: u16) -> Result<u16> {
    if scan == 0 {
        return Err(AgentError::Fatal("host port scan window is empty".into()));
    }
    let offset = (user_id % scan as u64) as u16;
    for i in 0..scan {
        let port = base + ((offset + i) % scan);
        if port_free(port) {
            return Ok(port);
        }
        debug!("Port {} busy, continuing scan", port);
    }
    Err(AgentError::Fatal(format!(
        "no free host port in [{}, {})",
        base,
        base as u32 + scan as u32
    )))
}

fn port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

pub fn epoch_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
