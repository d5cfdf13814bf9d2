//! In-process runtime hosting indexed actors and workflow queues across a
//! set of (simulated) hosts.

use crate::actor::IndexableActor;
use crate::config::IndexingConfig;
use crate::directory::{
    ActivationTable, ActorDirectory, ActorPlacement, IndexedActorHandle, MembershipDirectory,
    QueueDirectory,
};
use crate::error::{IndexingError, Result};
use crate::partition::PartitionEnv;
use crate::registry::IndexRegistry;
use crate::store::StateStore;
use crate::types::{ActorRef, HostId, IndexValue, QueueAddress, QueueId};
use crate::workflow::WorkflowQueue;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

pub struct IndexingRuntime {
    config: IndexingConfig,
    registry: Arc<IndexRegistry>,
    store: Arc<dyn StateStore>,
    membership: Arc<dyn MembershipDirectory>,
    activations: Arc<ActivationTable>,
    queues: DashMap<QueueAddress, Arc<WorkflowQueue>>,
    /// Stand-ins for queues whose host failed, keyed by the dead address.
    reincarnated: DashMap<QueueAddress, Arc<WorkflowQueue>>,
    actors: DashMap<ActorRef, Arc<IndexableActor>>,
    failed_hosts: DashSet<HostId>,
    activation_lock: Mutex<()>,
    queue_lock: Mutex<()>,
    self_ref: Weak<IndexingRuntime>,
}

impl IndexingRuntime {
    pub fn new(
        config: IndexingConfig,
        registry: Arc<IndexRegistry>,
        store: Arc<dyn StateStore>,
        membership: Arc<dyn MembershipDirectory>,
        activations: Arc<ActivationTable>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| IndexingRuntime {
            config,
            registry,
            store,
            membership,
            activations,
            queues: DashMap::new(),
            reincarnated: DashMap::new(),
            actors: DashMap::new(),
            failed_hosts: DashSet::new(),
            activation_lock: Mutex::new(()),
            queue_lock: Mutex::new(()),
            self_ref: weak.clone(),
        })
    }

    /// Collaborators for building partitions that route the way this runtime
    /// places actors.
    pub fn partition_env(
        config: &IndexingConfig,
        store: &Arc<dyn StateStore>,
        membership: &Arc<dyn MembershipDirectory>,
        activations: &Arc<ActivationTable>,
    ) -> PartitionEnv {
        PartitionEnv {
            store: Arc::clone(store),
            membership: Arc::clone(membership),
            placement: Arc::clone(activations) as Arc<dyn ActorPlacement>,
            key_buckets: config.key_buckets,
        }
    }

    pub fn config(&self) -> &IndexingConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<IndexRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    fn directory(&self) -> Result<Arc<IndexingRuntime>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| IndexingError::Configuration("runtime dropped".to_string()))
    }

    /// Live hosts, sorted, minus the ones failed through this runtime.
    pub fn live_hosts(&self) -> Vec<HostId> {
        let mut hosts: Vec<HostId> = self
            .membership
            .live_hosts()
            .into_iter()
            .filter(|h| !self.failed_hosts.contains(h))
            .collect();
        hosts.sort();
        hosts
    }

    fn is_failed(&self, host: &str) -> bool {
        self.failed_hosts.contains(host) || !self.membership.is_live(host)
    }

    fn place(&self, hash: u64) -> Result<HostId> {
        let hosts = self.live_hosts();
        if hosts.is_empty() {
            return Err(IndexingError::Configuration("no live hosts".to_string()));
        }
        Ok(hosts[(hash % hosts.len() as u64) as usize].clone())
    }

    /// Activates `actor` on the host placement picks, or returns the
    /// existing activation.
    pub async fn activate(&self, actor: &ActorRef) -> Result<Arc<IndexableActor>> {
        if let Some(existing) = self.active_actor(actor) {
            return Ok(existing);
        }
        let host = self.place(actor.stable_hash())?;
        self.activate_on(actor, &host).await
    }

    pub async fn activate_on(&self, actor: &ActorRef, host: &str) -> Result<Arc<IndexableActor>> {
        let _guard = self.activation_lock.lock().await;
        if let Some(existing) = self.active_actor(actor) {
            return Ok(existing);
        }
        if self.is_failed(host) {
            return Err(IndexingError::ActorUnreachable(format!(
                "cannot activate {} on failed host {}",
                actor, host
            )));
        }
        let interfaces = self.registry.interfaces_of(&actor.kind)?;
        let instance = IndexableActor::load(
            actor.clone(),
            interfaces,
            self.directory()? as Arc<dyn QueueDirectory>,
            Arc::clone(&self.store),
            self.config.clone(),
        )
        .await?;
        self.activations.record(actor, host);
        instance.activate().await?;
        self.actors.insert(actor.clone(), Arc::clone(&instance));
        tracing::debug!("Actor {} activated on {}", actor, host);
        Ok(instance)
    }

    pub fn active_actor(&self, actor: &ActorRef) -> Option<Arc<IndexableActor>> {
        self.actors.get(actor).map(|a| Arc::clone(a.value()))
    }

    pub fn host_of(&self, actor: &ActorRef) -> Option<HostId> {
        self.activations.host_of(actor)
    }

    /// Graceful deactivation: active indexes forget the actor.
    pub async fn deactivate(&self, actor: &ActorRef) -> Result<()> {
        let Some((_, instance)) = self.actors.remove(actor) else {
            return Ok(());
        };
        instance.deactivate().await
    }

    /// Drops the activation without any callbacks, as a crash would.
    pub fn crash_actor(&self, actor: &ActorRef) {
        self.actors.remove(actor);
        tracing::debug!("Actor {} crashed", actor);
    }

    /// Simulates the failure of `host`: its queues stop and its actors are
    /// lost without deactivation.
    pub fn fail_host(&self, host: &str) {
        self.failed_hosts.insert(host.to_string());
        let dead: Vec<QueueAddress> = self
            .queues
            .iter()
            .filter(|q| q.key().host == host)
            .map(|q| q.key().clone())
            .collect();
        for address in &dead {
            if let Some((_, queue)) = self.queues.remove(address) {
                queue.stop();
            }
        }
        let lost = self.activations.actors_on(host);
        for actor in &lost {
            self.actors.remove(actor);
        }
        tracing::warn!(
            "Host {} failed: {} queue(s) and {} actor(s) lost",
            host,
            dead.len(),
            lost.len()
        );
    }

    /// Brings `host` back. Queues reincarnated on its behalf are retired; the
    /// next access reopens them from persisted state.
    pub fn recover_host(&self, host: &str) {
        self.failed_hosts.remove(host);
        let retired: Vec<QueueAddress> = self
            .reincarnated
            .iter()
            .filter(|q| q.key().host == host)
            .map(|q| q.key().clone())
            .collect();
        for address in retired {
            if let Some((_, queue)) = self.reincarnated.remove(&address) {
                queue.stop();
            }
        }
        tracing::info!("Host {} recovered", host);
    }

    pub async fn lookup(
        &self,
        interface: &str,
        index: &str,
        key: &IndexValue,
    ) -> Result<HashSet<ActorRef>> {
        self.registry.index(interface, index)?.partition.lookup(key).await
    }

    pub async fn lookup_unique(&self, interface: &str, index: &str, key: &IndexValue) -> Result<ActorRef> {
        self.registry
            .index(interface, index)?
            .partition
            .lookup_unique(key)
            .await
    }

    fn all_queues(&self) -> Vec<Arc<WorkflowQueue>> {
        self.queues
            .iter()
            .chain(self.reincarnated.iter())
            .map(|q| Arc::clone(q.value()))
            .collect()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Waits until every queue is idle, including queues woken up by the
    /// drains of others.
    pub async fn wait_for_quiescence(&self) {
        loop {
            for queue in self.all_queues() {
                queue.wait_until_idle().await;
            }
            tokio::task::yield_now().await;
            let mut idle = true;
            for queue in self.all_queues() {
                if !queue.is_idle().await {
                    idle = false;
                    break;
                }
            }
            if idle {
                return;
            }
        }
    }

    /// Stops every queue and disposes every partition.
    pub async fn shutdown(&self) -> Result<()> {
        for queue in self.all_queues() {
            queue.stop();
        }
        self.queues.clear();
        self.reincarnated.clear();
        self.actors.clear();
        self.registry.dispose_all().await?;
        tracing::info!("Indexing runtime shut down");
        Ok(())
    }

    async fn open_queue(&self, address: &QueueAddress) -> Result<Arc<WorkflowQueue>> {
        let interface = self.registry.interface(&address.id.interface)?;
        WorkflowQueue::open(
            address.clone(),
            interface,
            Arc::clone(&self.store),
            self.directory()? as Arc<dyn ActorDirectory>,
        )
        .await
    }
}

#[async_trait]
impl QueueDirectory for IndexingRuntime {
    fn current_address(&self, id: &QueueId) -> Result<QueueAddress> {
        Ok(QueueAddress::new(id.clone(), self.place(id.stable_hash())?))
    }

    async fn queue_at(&self, address: &QueueAddress) -> Result<Arc<WorkflowQueue>> {
        if self.is_failed(&address.host) {
            return Err(IndexingError::UnreachableQueue(address.to_string()));
        }
        if let Some(queue) = self.queues.get(address) {
            return Ok(Arc::clone(queue.value()));
        }
        let _guard = self.queue_lock.lock().await;
        if let Some(queue) = self.queues.get(address) {
            return Ok(Arc::clone(queue.value()));
        }
        let queue = self.open_queue(address).await?;
        self.queues.insert(address.clone(), Arc::clone(&queue));
        Ok(queue)
    }

    async fn reincarnate(&self, address: &QueueAddress) -> Result<Arc<WorkflowQueue>> {
        if !self.is_failed(&address.host) {
            return self.queue_at(address).await;
        }
        if let Some(queue) = self.reincarnated.get(address) {
            return Ok(Arc::clone(queue.value()));
        }
        let _guard = self.queue_lock.lock().await;
        if let Some(queue) = self.reincarnated.get(address) {
            return Ok(Arc::clone(queue.value()));
        }
        let queue = self.open_queue(address).await?;
        tracing::info!("[RECOVERY {}] queue reincarnated", address);
        self.reincarnated.insert(address.clone(), Arc::clone(&queue));
        Ok(queue)
    }
}

#[async_trait]
impl ActorDirectory for IndexingRuntime {
    async fn resolve(&self, actor: &ActorRef) -> Result<Arc<dyn IndexedActorHandle>> {
        let instance = self.activate(actor).await?;
        Ok(instance as Arc<dyn IndexedActorHandle>)
    }
}
