//! The indexed actor: diffs its properties against the last propagated
//! images and pushes the result to its indexes, eagerly or through
//! workflow queues.

use crate::config::{EagerApplyMode, IndexingConfig};
use crate::directory::{IndexedActorHandle, QueueDirectory};
use crate::error::{IndexingError, Result};
use crate::registry::{IndexDescriptor, IndexedInterface};
use crate::store::{read_json, write_json, StateStore};
use crate::types::{ActorProperties, ActorRef, IndexValue, QueueAddress, QueueId, WorkflowId};
use crate::update::{MemberUpdate, Operation};
use crate::workflow::WorkflowRecord;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// What an indexed actor persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexedActorState {
    pub properties: ActorProperties,
    /// Workflows enqueued but not yet confirmed applied. Fault-tolerant
    /// actors only; `None` when there are none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_workflows: Option<BTreeSet<WorkflowId>>,
    /// Last queue used per interface, consulted on recovery.
    #[serde(default)]
    pub workflow_queues: BTreeMap<String, QueueAddress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateScope {
    All,
    ActiveOnly,
    Deactivating,
}

struct PendingUpdate {
    interface: Arc<IndexedInterface>,
    index: IndexDescriptor,
    update: MemberUpdate,
}

struct ActorInner {
    state: IndexedActorState,
    /// (interface, index) -> value last propagated.
    before_images: HashMap<(String, String), Option<IndexValue>>,
    active: bool,
}

pub struct IndexableActor {
    actor: ActorRef,
    interfaces: Vec<Arc<IndexedInterface>>,
    queues: Arc<dyn QueueDirectory>,
    store: Arc<dyn StateStore>,
    config: IndexingConfig,
    inner: Mutex<ActorInner>,
}

impl IndexableActor {
    /// Loads the actor's persisted state. Call [`IndexableActor::activate`]
    /// before using it.
    pub async fn load(
        actor: ActorRef,
        interfaces: Vec<Arc<IndexedInterface>>,
        queues: Arc<dyn QueueDirectory>,
        store: Arc<dyn StateStore>,
        config: IndexingConfig,
    ) -> Result<Arc<Self>> {
        let state = read_json::<IndexedActorState>(store.as_ref(), &actor.state_key())
            .await?
            .unwrap_or_default();
        Ok(Arc::new(IndexableActor {
            actor,
            interfaces,
            queues,
            store,
            config,
            inner: Mutex::new(ActorInner {
                state,
                before_images: HashMap::new(),
                active: false,
            }),
        }))
    }

    pub fn actor_ref(&self) -> &ActorRef {
        &self.actor
    }

    pub fn is_fault_tolerant(&self) -> bool {
        self.interfaces
            .iter()
            .any(|i| i.fault_tolerance.is_fault_tolerant())
    }

    pub fn is_eager(&self) -> bool {
        self.interfaces
            .iter()
            .find_map(|i| i.is_eager())
            .unwrap_or(false)
    }

    fn has_active_index(&self) -> bool {
        self.interfaces.iter().any(|i| i.has_active_index())
    }

    /// Recovers pending workflows (fault-tolerant actors), seeds the
    /// before-images and inserts the actor into its active indexes.
    pub async fn activate(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.active {
            return Ok(());
        }
        if self.is_fault_tolerant() {
            self.recover(&mut inner).await;
        }

        inner.before_images.clear();
        for interface in &self.interfaces {
            for index in &interface.indexes {
                // total indexes already hold the persisted values
                let image = if index.meta.is_total() {
                    index.key_of(&inner.state.properties)
                } else {
                    None
                };
                inner
                    .before_images
                    .insert((interface.name.clone(), index.name.clone()), image);
            }
        }
        inner.active = true;

        if self.has_active_index() {
            let write_state = self.is_fault_tolerant();
            self.update_locked(&mut inner, UpdateScope::ActiveOnly, write_state)
                .await?;
        } else if self.is_fault_tolerant() {
            self.write_state(&inner.state).await?;
        }
        tracing::debug!("Activated {}", self.actor);
        Ok(())
    }

    /// Removes the actor from its active indexes. Total indexes are kept.
    pub async fn deactivate(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.active {
            return Ok(());
        }
        if self.has_active_index() {
            let write_state = self.is_fault_tolerant();
            if let Err(e) = self
                .update_locked(&mut inner, UpdateScope::Deactivating, write_state)
                .await
            {
                tracing::warn!("Deactivating {}: active index cleanup failed: {}", self.actor, e);
            }
        }
        inner.active = false;
        tracing::debug!("Deactivated {}", self.actor);
        Ok(())
    }

    /// Replaces the actor's properties, persists them and propagates the
    /// index changes. On a uniqueness violation the old properties are kept.
    pub async fn write_properties(&self, properties: ActorProperties) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.check_active(&inner)?;
        let previous = std::mem::replace(&mut inner.state.properties, properties);
        if let Err(e) = self
            .update_locked(&mut inner, UpdateScope::All, true)
            .await
        {
            if e.is_uniqueness_violation() {
                inner.state.properties = previous;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Sets (or with `None` clears) one property.
    pub async fn set_property(&self, field: &str, value: Option<IndexValue>) -> Result<()> {
        let mut properties = self.properties().await;
        properties.set(field, value);
        self.write_properties(properties).await
    }

    /// Propagates the difference between the current properties and the last
    /// propagated images.
    pub async fn update_indexes(&self, only_active: bool, write_state: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.check_active(&inner)?;
        let scope = if only_active {
            UpdateScope::ActiveOnly
        } else {
            UpdateScope::All
        };
        self.update_locked(&mut inner, scope, write_state).await
    }

    pub async fn properties(&self) -> ActorProperties {
        self.inner.lock().await.state.properties.clone()
    }

    pub async fn state(&self) -> IndexedActorState {
        self.inner.lock().await.state.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.active
    }

    fn check_active(&self, inner: &ActorInner) -> Result<()> {
        if inner.active {
            Ok(())
        } else {
            Err(IndexingError::ActorUnreachable(format!(
                "{} is not active",
                self.actor
            )))
        }
    }

    async fn write_state(&self, state: &IndexedActorState) -> Result<()> {
        write_json(self.store.as_ref(), &self.actor.state_key(), state).await
    }

    fn diff(&self, inner: &ActorInner, scope: UpdateScope) -> Vec<PendingUpdate> {
        let mut pending = Vec::new();
        for interface in &self.interfaces {
            for index in &interface.indexes {
                if scope != UpdateScope::All && index.meta.is_total() {
                    continue;
                }
                let before = inner
                    .before_images
                    .get(&(interface.name.clone(), index.name.clone()))
                    .cloned()
                    .flatten();
                let after = match scope {
                    UpdateScope::Deactivating => None,
                    _ => index.key_of(&inner.state.properties),
                };
                let update = MemberUpdate::new(before, after);
                if update.operation() != Operation::None {
                    pending.push(PendingUpdate {
                        interface: Arc::clone(interface),
                        index: index.clone(),
                        update,
                    });
                }
            }
        }
        pending
    }

    async fn update_locked(
        &self,
        inner: &mut ActorInner,
        scope: UpdateScope,
        write_state: bool,
    ) -> Result<()> {
        let pending = self.diff(inner, scope);
        if pending.is_empty() {
            if write_state {
                self.write_state(&inner.state).await?;
            }
            return Ok(());
        }

        let eager = self.is_eager();
        let unique: Vec<&PendingUpdate> =
            pending.iter().filter(|p| p.index.meta.is_unique).collect();
        // a lone eager unique index needs no reservation
        let tentative = !eager || unique.len() > 1;
        let reserved = self.reserve_unique(&unique, tentative).await?;

        if eager {
            if tentative {
                for (index, update) in &reserved {
                    index
                        .partition
                        .apply_one(&self.actor, &update.confirmed(), true, &index.meta)
                        .await?;
                }
            }
            self.apply_eager(inner, &pending, write_state).await?;
        } else {
            if let Err(e) = self.enqueue_lazy(inner, &pending).await {
                self.rollback(&reserved).await;
                return Err(e);
            }
            if write_state || self.is_fault_tolerant() {
                self.write_state(&inner.state).await?;
            }
        }

        for p in &pending {
            inner.before_images.insert(
                (p.interface.name.clone(), p.index.name.clone()),
                p.update.after_image().cloned(),
            );
        }
        Ok(())
    }

    /// Applies unique-index updates one by one, undoing the earlier ones if
    /// a later one fails.
    async fn reserve_unique(
        &self,
        unique: &[&PendingUpdate],
        tentative: bool,
    ) -> Result<Vec<(IndexDescriptor, MemberUpdate)>> {
        let mut applied = Vec::new();
        for p in unique {
            let update = if tentative {
                p.update.clone().into_tentative()
            } else {
                p.update.clone()
            };
            match p
                .index
                .partition
                .apply_one(&self.actor, &update, true, &p.index.meta)
                .await
            {
                Ok(_) => applied.push((p.index.clone(), update)),
                Err(e) => {
                    tracing::info!(
                        "{} rejected by unique index {} for key {}: {}",
                        self.actor,
                        p.index.name,
                        p.update.describe_key(),
                        e
                    );
                    self.rollback(&applied).await;
                    return Err(e);
                }
            }
        }
        Ok(applied)
    }

    async fn rollback(&self, applied: &[(IndexDescriptor, MemberUpdate)]) {
        for (index, update) in applied.iter().rev() {
            if let Err(e) = index
                .partition
                .apply_one(&self.actor, &update.reverse_tentative(), true, &index.meta)
                .await
            {
                tracing::warn!(
                    "{}: failed to undo reservation on {}: {}",
                    self.actor,
                    index.name,
                    e
                );
            }
        }
    }

    async fn apply_eager(
        &self,
        inner: &ActorInner,
        pending: &[PendingUpdate],
        write_state: bool,
    ) -> Result<()> {
        let apply = async {
            let applies = pending
                .iter()
                .filter(|p| !p.index.meta.is_unique)
                .map(|p| {
                    p.index
                        .partition
                        .apply_one(&self.actor, &p.update, false, &p.index.meta)
                });
            for result in join_all(applies).await {
                result?;
            }
            Ok::<_, IndexingError>(())
        };
        if !write_state {
            return apply.await;
        }
        match self.config.eager_apply {
            EagerApplyMode::ConcurrentWithWrite => {
                let (written, applied) = tokio::join!(self.write_state(&inner.state), apply);
                written?;
                applied
            }
            EagerApplyMode::AfterWrite => {
                self.write_state(&inner.state).await?;
                apply.await
            }
        }
    }

    /// One record per interface, appended to the shard owning this actor.
    async fn enqueue_lazy(&self, inner: &mut ActorInner, pending: &[PendingUpdate]) -> Result<()> {
        let mut per_interface: BTreeMap<String, (Arc<IndexedInterface>, BTreeMap<String, MemberUpdate>)> =
            BTreeMap::new();
        for p in pending {
            per_interface
                .entry(p.interface.name.clone())
                .or_insert_with(|| (Arc::clone(&p.interface), BTreeMap::new()))
                .1
                .insert(p.index.name.clone(), p.update.clone());
        }

        for (name, (interface, updates)) in per_interface {
            let record = WorkflowRecord::new(self.actor.clone(), updates);
            let workflow_id = record.workflow_id;
            let id = QueueId::for_actor(&name, &self.actor, self.config.queues_per_interface);
            let address = self.queues.current_address(&id)?;
            let queue = self.queues.queue_at(&address).await?;
            let appended = queue.add_to_queue(record).await;

            if interface.fault_tolerance.is_fault_tolerant() {
                inner
                    .state
                    .active_workflows
                    .get_or_insert_with(BTreeSet::new)
                    .insert(workflow_id);
                inner.state.workflow_queues.insert(name.clone(), address);
            }
            match appended {
                Ok(()) => {}
                Err(e @ IndexingError::UnreachableQueue(_)) => return Err(e),
                // the record is queued in memory even though the write failed
                Err(e) => tracing::warn!("{}: workflow {} not persisted: {}", self.actor, workflow_id, e),
            }
        }
        Ok(())
    }

    /// Reconciles the persisted active-workflow set with what the queues
    /// still hold, moving leftovers from a relocated queue to the current
    /// one. If any interface cannot be reconciled the set is left untouched.
    async fn recover(&self, inner: &mut ActorInner) {
        let Some(active) = inner.state.active_workflows.clone().filter(|s| !s.is_empty()) else {
            inner.state.active_workflows = None;
            inner.state.workflow_queues.clear();
            return;
        };
        let ids: HashSet<WorkflowId> = active.iter().copied().collect();
        let cached: Vec<(String, QueueAddress)> = inner
            .state
            .workflow_queues
            .iter()
            .filter(|(name, _)| self.interfaces.iter().any(|i| &i.name == *name))
            .map(|(n, a)| (n.clone(), a.clone()))
            .collect();

        let ids_ref = &ids;
        let lookups = cached.into_iter().map(|(name, old)| async move {
            let result = self.reconcile_queue(&name, &old, ids_ref).await;
            (name, result)
        });
        let mut outstanding = BTreeSet::new();
        let mut failed = false;
        for (name, result) in join_all(lookups).await {
            match result {
                Ok((address, remaining)) => {
                    outstanding.extend(remaining.iter().map(|r| r.workflow_id));
                    inner.state.workflow_queues.insert(name, address);
                }
                Err(e) => {
                    failed = true;
                    tracing::warn!("[RECOVERY {}] interface {} not reconciled: {}", self.actor, name, e);
                }
            }
        }
        if failed {
            return;
        }
        tracing::info!(
            "[RECOVERY {}] {} of {} workflow(s) still pending",
            self.actor,
            outstanding.len(),
            ids.len()
        );
        if outstanding.is_empty() {
            inner.state.active_workflows = None;
            inner.state.workflow_queues.clear();
        } else {
            inner.state.active_workflows = Some(outstanding);
        }
    }

    async fn reconcile_queue(
        &self,
        interface: &str,
        old: &QueueAddress,
        ids: &HashSet<WorkflowId>,
    ) -> Result<(QueueAddress, Vec<WorkflowRecord>)> {
        let id = QueueId::for_actor(interface, &self.actor, self.config.queues_per_interface);
        let current = self.queues.current_address(&id)?;
        if current == *old {
            let queue = self.queues.queue_at(&current).await?;
            let remaining = queue.get_remaining_workflows_in(ids).await?;
            if !remaining.is_empty() && queue.resume().await? {
                tracing::info!("[RECOVERY {}] restarted drain of {}", self.actor, current);
            }
            return Ok((current, remaining));
        }

        let source = match self.queues.queue_at(old).await {
            Ok(queue) => queue,
            Err(e) => {
                tracing::warn!("[RECOVERY {}] queue {} unreachable ({}), reincarnating", self.actor, old, e);
                self.queues.reincarnate(old).await?
            }
        };
        let remaining = source.get_remaining_workflows_in(ids).await?;
        if !remaining.is_empty() {
            let target = self.queues.queue_at(&current).await?;
            target.add_all_to_queue(remaining.clone()).await?;
            tracing::info!(
                "[RECOVERY {}] moved {} workflow(s) from {} to {}",
                self.actor,
                remaining.len(),
                old,
                current
            );
            // the old queue's drain is parked on this activation, so the
            // removal lands before it can apply the same records
            if let Err(e) = source.remove_all_from_queue(&remaining).await {
                tracing::warn!(
                    "[RECOVERY {}] could not remove handed-off workflows from {}: {}",
                    self.actor,
                    old,
                    e
                );
            }
        }
        Ok((current, remaining))
    }
}

#[async_trait]
impl IndexedActorHandle for IndexableActor {
    async fn active_workflow_ids(&self) -> Result<HashSet<WorkflowId>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .state
            .active_workflows
            .iter()
            .flatten()
            .copied()
            .collect())
    }

    async fn remove_from_active_workflow_ids(&self, ids: HashSet<WorkflowId>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(active) = inner.state.active_workflows.as_mut() else {
            return Ok(());
        };
        let before = active.len();
        active.retain(|id| !ids.contains(id));
        if active.len() == before {
            return Ok(());
        }
        if active.is_empty() {
            inner.state.active_workflows = None;
            inner.state.workflow_queues.clear();
        }
        self.write_state(&inner.state).await
    }
}
