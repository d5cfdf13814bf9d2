#![allow(dead_code)]

use async_trait::async_trait;
use indexflow::partition::{
    create_partition, HashIndexBucket, IndexMetaData, IndexPartition, PartitionEnv,
};
use indexflow::{
    ActivationTable, ActorDirectory, ActorRef, FaultTolerancePolicy, IndexDescriptor,
    IndexRegistry, IndexValue, IndexedActorHandle, IndexedInterface, IndexingConfig,
    IndexingError, IndexingRuntime, MemberUpdate, MembershipDirectory, MemoryStateStore,
    StateStore, StaticMembership, WorkflowId,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const IFACE: &str = "IPlayer";
pub const KIND: &str = "Player";

pub struct Harness {
    pub runtime: Arc<IndexingRuntime>,
    pub store: Arc<MemoryStateStore>,
    pub membership: Arc<StaticMembership>,
    pub env: PartitionEnv,
}

impl Harness {
    pub async fn activate(&self, id: &str) -> Arc<indexflow::IndexableActor> {
        self.runtime.activate(&player(id)).await.unwrap()
    }

    pub async fn set(&self, id: &str, field: &str, value: &str) {
        self.activate(id)
            .await
            .set_property(field, Some(IndexValue::text(value)))
            .await
            .unwrap();
    }

    pub async fn lookup(&self, index: &str, key: &str) -> Vec<String> {
        let found = self
            .runtime
            .lookup(IFACE, index, &IndexValue::text(key))
            .await
            .unwrap();
        sorted_ids(found)
    }
}

pub fn player(id: &str) -> ActorRef {
    ActorRef::new(KIND, id)
}

pub fn sorted_ids(actors: HashSet<ActorRef>) -> Vec<String> {
    let mut ids: Vec<String> = actors.into_iter().map(|a| a.id).collect();
    ids.sort();
    ids
}

/// Builds a runtime over `hosts` with one interface whose indexes are keyed
/// on the property of the same name. Partitions come from `create_partition`
/// unless `overrides` supplies one.
pub async fn harness_with(
    hosts: &[&str],
    config: IndexingConfig,
    policy: FaultTolerancePolicy,
    indexes: &[(&str, IndexMetaData)],
    mut overrides: HashMap<String, Arc<dyn IndexPartition>>,
) -> Harness {
    let host_ids: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
    let membership = Arc::new(StaticMembership::new(host_ids[0].clone(), host_ids).unwrap());
    let store = Arc::new(MemoryStateStore::new());
    let store_dyn: Arc<dyn StateStore> = store.clone();
    let membership_dyn: Arc<dyn MembershipDirectory> = membership.clone();
    let activations = Arc::new(ActivationTable::new());
    let env = IndexingRuntime::partition_env(&config, &store_dyn, &membership_dyn, &activations);

    let mut interface = IndexedInterface::new(IFACE, policy);
    for (name, meta) in indexes {
        let partition = match overrides.remove(*name) {
            Some(p) => p,
            None => create_partition(name, meta, &env).await.unwrap(),
        };
        interface = interface.with_index(IndexDescriptor::for_field(*name, name, *meta, partition));
    }
    let registry = Arc::new(IndexRegistry::new());
    registry.register_interface(interface).unwrap();
    registry.bind(KIND, &[IFACE]).unwrap();

    let runtime = IndexingRuntime::new(config, registry, store_dyn, membership_dyn, activations);
    Harness {
        runtime,
        store,
        membership,
        env,
    }
}

pub async fn harness(
    hosts: &[&str],
    policy: FaultTolerancePolicy,
    indexes: &[(&str, IndexMetaData)],
) -> Harness {
    harness_with(hosts, IndexingConfig::default(), policy, indexes, HashMap::new()).await
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Bucket wrapper whose applies can be made to fail, and which records the
/// batches it was handed. `batches_failing` fails only queued batches, so
/// unique reservations made by the actor itself still go through.
pub struct FlakyPartition {
    inner: HashIndexBucket,
    failing: AtomicBool,
    batches_failing: AtomicBool,
    pub batches: Mutex<Vec<Vec<ActorRef>>>,
}

impl FlakyPartition {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(FlakyPartition {
            inner: HashIndexBucket::new(name, None),
            failing: AtomicBool::new(false),
            batches_failing: AtomicBool::new(false),
            batches: Mutex::new(Vec::new()),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_batches_failing(&self, failing: bool) {
        self.batches_failing.store(failing, Ordering::SeqCst);
    }

    /// Successful batches that carried updates of `actor`.
    pub fn batches_with(&self, actor: &ActorRef) -> usize {
        self.batches
            .lock()
            .map(|b| b.iter().filter(|batch| batch.contains(actor)).count())
            .unwrap_or(0)
    }

    pub async fn key_count(&self) -> usize {
        self.inner.key_count().await
    }

    fn check(&self) -> indexflow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(IndexingError::IndexUnavailable(self.inner.name().to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl IndexPartition for FlakyPartition {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn apply_one(
        &self,
        actor: &ActorRef,
        update: &MemberUpdate,
        is_unique: bool,
        meta: &IndexMetaData,
    ) -> indexflow::Result<bool> {
        self.check()?;
        self.inner.apply_one(actor, update, is_unique, meta).await
    }

    async fn apply_batch(
        &self,
        updates: HashMap<ActorRef, Vec<MemberUpdate>>,
        is_unique: bool,
        meta: &IndexMetaData,
    ) -> indexflow::Result<bool> {
        self.check()?;
        if self.batches_failing.load(Ordering::SeqCst) {
            return Err(IndexingError::IndexUnavailable(self.inner.name().to_string()));
        }
        let mut actors: Vec<ActorRef> = updates.keys().cloned().collect();
        actors.sort();
        if let Ok(mut batches) = self.batches.lock() {
            batches.push(actors);
        }
        self.inner.apply_batch(updates, is_unique, meta).await
    }

    async fn lookup(&self, key: &IndexValue) -> indexflow::Result<HashSet<ActorRef>> {
        self.check()?;
        self.inner.lookup(key).await
    }

    async fn is_available(&self) -> bool {
        !self.failing.load(Ordering::SeqCst)
    }

    async fn dispose(&self) -> indexflow::Result<()> {
        self.inner.dispose().await
    }
}

/// Directory whose actors report a fixed active-workflow set.
pub struct FixedDirectory {
    pub active: Mutex<HashMap<ActorRef, HashSet<WorkflowId>>>,
    pub reachable: bool,
}

impl FixedDirectory {
    pub fn unreachable() -> Arc<Self> {
        Arc::new(FixedDirectory {
            active: Mutex::new(HashMap::new()),
            reachable: false,
        })
    }

    pub fn with_active(active: HashMap<ActorRef, HashSet<WorkflowId>>) -> Arc<Self> {
        Arc::new(FixedDirectory {
            active: Mutex::new(active),
            reachable: true,
        })
    }
}

struct FixedHandle {
    ids: HashSet<WorkflowId>,
}

#[async_trait]
impl IndexedActorHandle for FixedHandle {
    async fn active_workflow_ids(&self) -> indexflow::Result<HashSet<WorkflowId>> {
        Ok(self.ids.clone())
    }

    async fn remove_from_active_workflow_ids(
        &self,
        _ids: HashSet<WorkflowId>,
    ) -> indexflow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ActorDirectory for FixedDirectory {
    async fn resolve(&self, actor: &ActorRef) -> indexflow::Result<Arc<dyn IndexedActorHandle>> {
        if !self.reachable {
            return Err(IndexingError::ActorUnreachable(actor.to_string()));
        }
        let ids = self
            .active
            .lock()
            .ok()
            .and_then(|m| m.get(actor).cloned())
            .unwrap_or_default();
        Ok(Arc::new(FixedHandle { ids }))
    }
}
