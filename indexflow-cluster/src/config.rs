use indexflow::{IndexingError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Missed heartbeats before a silent peer is declared dead.
const MISSED_HEARTBEATS: u64 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub host_id: String,
    pub hosts: Vec<HostConfig>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Overrides the timeout derived from the heartbeat interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub host_id: String,
    pub addr: String, // e.g. "10.0.1.2:7800"
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

impl ClusterConfig {
    /// A cluster of one: the local host, listening on the default port.
    pub fn single_host(host_id: impl Into<String>) -> Self {
        let host_id = host_id.into();
        ClusterConfig {
            hosts: vec![HostConfig {
                host_id: host_id.clone(),
                addr: "127.0.0.1:7800".to_string(),
            }],
            host_id,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: None,
        }
    }

    /// Reads `{data_dir}/cluster.json`. Without one the process runs as a
    /// single host named by `INDEXFLOW_HOST_ID` or the machine hostname. A
    /// file that is present but malformed or inconsistent is an error.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let cluster_json = data_dir.join("cluster.json");
        if !cluster_json.exists() {
            let host_id = std::env::var("INDEXFLOW_HOST_ID").unwrap_or_else(|_| {
                hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "unknown".to_string())
            });
            tracing::info!("No cluster.json in {}, single host {}", data_dir.display(), host_id);
            return Ok(Self::single_host(host_id));
        }

        let content = std::fs::read_to_string(&cluster_json)?;
        let config: ClusterConfig = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            "Loaded cluster config: host_id={}, hosts={}, heartbeat timeout {:?}",
            config.host_id,
            config.hosts.len(),
            config.heartbeat_timeout()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_id.is_empty() {
            return Err(IndexingError::Configuration("host_id is empty".into()));
        }
        let mut seen = HashSet::new();
        for host in &self.hosts {
            if host.addr.is_empty() {
                return Err(IndexingError::Configuration(format!(
                    "host {} has no address",
                    host.host_id
                )));
            }
            if !seen.insert(host.host_id.as_str()) {
                return Err(IndexingError::Configuration(format!(
                    "host {} is listed twice",
                    host.host_id
                )));
            }
        }
        if !seen.contains(self.host_id.as_str()) {
            return Err(IndexingError::Configuration(format!(
                "local host {} is not in the host list",
                self.host_id
            )));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(IndexingError::Configuration(
                "heartbeat_interval_secs must be positive".into(),
            ));
        }
        if let Some(timeout) = self.heartbeat_timeout_secs {
            if timeout <= self.heartbeat_interval_secs {
                return Err(IndexingError::Configuration(format!(
                    "heartbeat timeout {}s does not exceed the {}s interval",
                    timeout, self.heartbeat_interval_secs
                )));
            }
        }
        Ok(())
    }

    /// How long a peer may stay silent before it is considered dead.
    pub fn heartbeat_timeout(&self) -> Duration {
        let secs = self
            .heartbeat_timeout_secs
            .unwrap_or(self.heartbeat_interval_secs * MISSED_HEARTBEATS);
        Duration::from_secs(secs)
    }

    pub fn host_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.hosts.iter().map(|h| h.host_id.clone()).collect();
        ids.sort();
        ids
    }
}
