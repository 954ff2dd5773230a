//! HTTP client for control-plane communication
//!
//! The agent trusts the control plane; traffic here is outbound only:
//! node heartbeats, and the authoritative app-id set consumed by the
//! orphan sweep.

use std::collections::HashSet;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::RemoteConfiguration;
use crate::error::{AgentError, Result};

/// Heartbeat payload reported per node.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub node: String,
    pub version: String,
    pub users: usize,
    pub active_runs: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppIdsResponse {
    app_ids: Vec<u64>,
}

pub struct HttpClient {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpClient {
    /// Create a client, or `None` when no control plane is configured.
    pub fn from_config(config: &RemoteConfiguration) -> Result<Option<Self>> {
        if config.url.is_empty() {
            return Ok(None);
        }

        let parsed = url::Url::parse(&config.url)
            .map_err(|e| AgentError::Fatal(format!("remote.url is not a valid URL: {}", e)))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(AgentError::Fatal(
                "remote.url must start with http:// or https://".into(),
            ));
        }
        let base_url = config.url.trim_end_matches('/').to_string();

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AgentError::Fatal(format!("cannot build http client: {}", e)))?;

        Ok(Some(Self {
            client,
            base_url,
            token: config.token.clone(),
        }))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/agent/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Report node liveness. One shot, no retry; the next beat is seconds
    /// away anyway.
    pub async fn send_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        let response = self
            .client
            .post(self.url("heartbeat"))
            .bearer_auth(&self.token)
            .json(heartbeat)
            .send()
            .await
            .map_err(|e| AgentError::subprocess("heartbeat", e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::subprocess(
                "heartbeat",
                format!("control plane answered {}", response.status()),
            ));
        }
        Ok(())
    }

    /// The authoritative set of application ids that still exist.
    pub async fn fetch_app_ids(&self) -> Result<HashSet<u64>> {
        let response = self
            .client
            .get(self.url("apps"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| AgentError::subprocess("fetch app ids", e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::subprocess(
                "fetch app ids",
                format!("control plane answered {}", response.status()),
            ));
        }

        let parsed: AppIdsResponse = response
            .json()
            .await
            .map_err(|e| AgentError::subprocess("fetch app ids", e.to_string()))?;
        Ok(parsed.app_ids.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_url() {
        let config = RemoteConfiguration::default();
        assert!(HttpClient::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_rejects_bad_scheme() {
        let config = RemoteConfiguration {
            url: "ftp://plane".into(),
            ..Default::default()
        };
        assert!(HttpClient::from_config(&config).is_err());
    }

    #[test]
    fn test_url_composition() {
        let config = RemoteConfiguration {
            url: "https://plane.example.com/".into(),
            ..Default::default()
        };
        let client = HttpClient::from_config(&config).unwrap().unwrap();
        assert_eq!(
            client.url("/heartbeat"),
            "https://plane.example.com/api/agent/heartbeat"
        );
    }
}
