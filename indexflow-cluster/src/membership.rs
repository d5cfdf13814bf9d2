use crate::config::ClusterConfig;
use dashmap::{DashMap, DashSet};
use indexflow::{HostId, MembershipDirectory};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub host_id: HostId,
    pub live: bool,
    pub local: bool,
    pub last_seen_ms_ago: Option<u64>,
}

/// Heartbeat-based liveness over the configured host list. The local host
/// is always live; peers are live while heartbeats keep arriving within the
/// timeout and nobody marked them down.
pub struct ClusterMembership {
    local: HostId,
    hosts: Vec<HostId>,
    last_seen: DashMap<HostId, Instant>,
    marked_down: DashSet<HostId>,
    timeout: Duration,
}

impl ClusterMembership {
    pub fn from_config(config: &ClusterConfig) -> Self {
        let membership = ClusterMembership {
            local: config.host_id.clone(),
            hosts: config.host_ids(),
            last_seen: DashMap::new(),
            marked_down: DashSet::new(),
            timeout: config.heartbeat_timeout(),
        };
        // every configured host gets one timeout's grace at startup
        let now = Instant::now();
        for host in &membership.hosts {
            membership.last_seen.insert(host.clone(), now);
        }
        membership
    }

    pub fn record_heartbeat(&self, host: &str) {
        if !self.hosts.iter().any(|h| h == host) {
            tracing::warn!("Heartbeat from unknown host {}", host);
            return;
        }
        self.last_seen.insert(host.to_string(), Instant::now());
        if self.marked_down.remove(host).is_some() {
            tracing::info!("Host {} is back", host);
        }
    }

    pub fn mark_down(&self, host: &str) {
        if host == self.local {
            return;
        }
        if self.marked_down.insert(host.to_string()) {
            tracing::warn!("Host {} marked down", host);
        }
    }

    fn peer_is_live(&self, host: &str) -> bool {
        if self.marked_down.contains(host) {
            return false;
        }
        self.last_seen
            .get(host)
            .map_or(false, |seen| seen.elapsed() <= self.timeout)
    }

    pub fn status(&self) -> Vec<HostStatus> {
        self.hosts
            .iter()
            .map(|host| {
                let local = *host == self.local;
                HostStatus {
                    host_id: host.clone(),
                    live: local || self.peer_is_live(host),
                    local,
                    last_seen_ms_ago: self
                        .last_seen
                        .get(host)
                        .map(|seen| seen.elapsed().as_millis() as u64),
                }
            })
            .collect()
    }
}

impl MembershipDirectory for ClusterMembership {
    fn live_hosts(&self) -> Vec<HostId> {
        self.hosts
            .iter()
            .filter(|h| **h == self.local || self.peer_is_live(h))
            .cloned()
            .collect()
    }

    fn local_host(&self) -> HostId {
        self.local.clone()
    }
}
