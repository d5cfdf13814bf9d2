//! Collaborator seams: where actors and queues live, and which hosts are up.

use crate::error::{IndexingError, Result};
use crate::types::{ActorRef, HostId, QueueAddress, QueueId, WorkflowId};
use crate::workflow::WorkflowQueue;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::Arc;

/// Cluster membership as the engine sees it.
pub trait MembershipDirectory: Send + Sync {
    /// Hosts currently considered alive, in no particular order.
    fn live_hosts(&self) -> Vec<HostId>;

    /// The host this process runs on.
    fn local_host(&self) -> HostId;

    fn is_live(&self, host: &str) -> bool {
        self.live_hosts().iter().any(|h| h == host)
    }
}

/// Which host an actor is (or was last) activated on.
pub trait ActorPlacement: Send + Sync {
    fn host_of(&self, actor: &ActorRef) -> Option<HostId>;
}

/// The fault-tolerance surface of an indexed actor, as a queue handler sees it.
#[async_trait]
pub trait IndexedActorHandle: Send + Sync {
    async fn active_workflow_ids(&self) -> Result<HashSet<WorkflowId>>;

    async fn remove_from_active_workflow_ids(&self, ids: HashSet<WorkflowId>) -> Result<()>;
}

/// Resolves actor references, activating the actor if needed.
#[async_trait]
pub trait ActorDirectory: Send + Sync {
    async fn resolve(&self, actor: &ActorRef) -> Result<Arc<dyn IndexedActorHandle>>;
}

/// Locates workflow queues.
#[async_trait]
pub trait QueueDirectory: Send + Sync {
    /// Where the queue with this identity lives right now.
    fn current_address(&self, id: &QueueId) -> Result<QueueAddress>;

    /// The live queue at `address`, or [`IndexingError::UnreachableQueue`]
    /// if its host is gone.
    async fn queue_at(&self, address: &QueueAddress) -> Result<Arc<WorkflowQueue>>;

    /// A stand-in for a dead queue, rebuilt from the state the dead queue
    /// persisted under its own address.
    async fn reincarnate(&self, address: &QueueAddress) -> Result<Arc<WorkflowQueue>>;
}

/// Activation bookkeeping shared between the runtime, which records where
/// each actor lives, and host-partitioned indexes, which route by it.
#[derive(Default)]
pub struct ActivationTable {
    hosts: DashMap<ActorRef, HostId>,
}

impl ActivationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, actor: &ActorRef, host: &str) {
        self.hosts.insert(actor.clone(), host.to_string());
    }

    pub fn forget(&self, actor: &ActorRef) {
        self.hosts.remove(actor);
    }

    /// Actors last recorded on `host`.
    pub fn actors_on(&self, host: &str) -> Vec<ActorRef> {
        self.hosts
            .iter()
            .filter(|e| e.value() == host)
            .map(|e| e.key().clone())
            .collect()
    }
}

impl ActorPlacement for ActivationTable {
    fn host_of(&self, actor: &ActorRef) -> Option<HostId> {
        self.hosts.get(actor).map(|h| h.value().clone())
    }
}

/// Fixed host list with hosts that can be marked down and up again.
pub struct StaticMembership {
    local: HostId,
    hosts: Vec<HostId>,
    down: DashSet<HostId>,
}

impl StaticMembership {
    pub fn new(local: impl Into<HostId>, hosts: Vec<HostId>) -> Result<Self> {
        let local = local.into();
        if !hosts.contains(&local) {
            return Err(IndexingError::Configuration(format!(
                "local host {} is not in the host list",
                local
            )));
        }
        Ok(StaticMembership {
            local,
            hosts,
            down: DashSet::new(),
        })
    }

    /// Single-host membership.
    pub fn single(host: impl Into<HostId>) -> Self {
        let host = host.into();
        StaticMembership {
            local: host.clone(),
            hosts: vec![host],
            down: DashSet::new(),
        }
    }

    pub fn mark_down(&self, host: &str) {
        self.down.insert(host.to_string());
    }

    pub fn mark_up(&self, host: &str) {
        self.down.remove(host);
    }
}

impl MembershipDirectory for StaticMembership {
    fn live_hosts(&self) -> Vec<HostId> {
        self.hosts
            .iter()
            .filter(|h| !self.down.contains(*h))
            .cloned()
            .collect()
    }

    fn local_host(&self) -> HostId {
        self.local.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_membership_tracks_down_hosts() {
        let m = StaticMembership::new("a", vec!["a".into(), "b".into()]).unwrap();
        assert_eq!(m.live_hosts(), vec!["a".to_string(), "b".to_string()]);
        m.mark_down("b");
        assert!(!m.is_live("b"));
        m.mark_up("b");
        assert!(m.is_live("b"));
    }

    #[test]
    fn test_local_host_must_be_listed() {
        assert!(StaticMembership::new("c", vec!["a".into()]).is_err());
    }

    #[test]
    fn test_activation_table() {
        let table = ActivationTable::new();
        let p1 = ActorRef::new("Player", "p1");
        table.record(&p1, "a");
        assert_eq!(table.host_of(&p1).as_deref(), Some("a"));
        assert_eq!(table.actors_on("a"), vec![p1.clone()]);
        table.forget(&p1);
        assert!(table.host_of(&p1).is_none());
    }
}
