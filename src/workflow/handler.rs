//! Drains a workflow queue batch by batch into the index partitions.

use super::queue::WorkflowQueue;
use super::record::WorkflowRecord;
use crate::directory::ActorDirectory;
use crate::error::Result;
use crate::registry::IndexedInterface;
use crate::types::{ActorRef, QueueAddress, WorkflowId};
use crate::update::{MemberUpdate, Operation};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

type ActiveSets = HashMap<ActorRef, HashSet<WorkflowId>>;

pub struct WorkflowQueueHandler {
    address: QueueAddress,
    interface: Arc<IndexedInterface>,
    directory: Arc<dyn ActorDirectory>,
}

impl WorkflowQueueHandler {
    pub fn new(
        address: QueueAddress,
        interface: Arc<IndexedInterface>,
        directory: Arc<dyn ActorDirectory>,
    ) -> Self {
        WorkflowQueueHandler {
            address,
            interface,
            directory,
        }
    }

    fn is_fault_tolerant(&self) -> bool {
        self.interface.fault_tolerance.is_fault_tolerant()
    }

    /// Processes batches until the queue reports idle. A failed batch stays
    /// queued and the drain stops; the next append restarts it.
    pub(crate) async fn drain(&self, queue: Arc<WorkflowQueue>, first: Vec<WorkflowRecord>) {
        let mut batch = first;
        loop {
            if queue.is_stopped() {
                queue.abandon_drain().await;
                return;
            }
            let size = batch.len();
            if let Err(e) = self.handle_workflows_until_punctuation(&queue, batch).await {
                tracing::error!(
                    "[HANDLER {}] batch of {} record(s) failed ({}): {}",
                    self.address,
                    size,
                    if e.is_retryable() { "transient" } else { "permanent" },
                    e
                );
                queue.abandon_drain().await;
                return;
            }
            match queue.give_more_workflows_or_set_as_idle().await {
                Ok(Some(next)) => batch = next,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!("[HANDLER {}] could not advance queue: {}", self.address, e);
                    queue.abandon_drain().await;
                    return;
                }
            }
        }
    }

    /// Applies one claimed batch: groups its updates by index and actor and
    /// hands each index its share in one call, all indexes concurrently.
    ///
    /// Under fault tolerance a record whose id the actor no longer lists as
    /// active is stale. Its updates are skipped, except on unique indexes,
    /// where their reverse undoes the tentative reservation it left behind.
    /// Records withdrawn from `queue` while the active sets were fetched are
    /// not applied.
    pub async fn handle_workflows_until_punctuation(
        &self,
        queue: &WorkflowQueue,
        batch: Vec<WorkflowRecord>,
    ) -> Result<()> {
        let fault_tolerant = self.is_fault_tolerant();
        let active = if fault_tolerant {
            self.fetch_active_workflow_sets(&batch).await?
        } else {
            ActiveSets::new()
        };
        let claimed = batch.len();
        let batch = queue.still_queued(batch).await;
        if batch.len() < claimed {
            tracing::debug!(
                "[HANDLER {}] {} record(s) handed off to another queue",
                self.address,
                claimed - batch.len()
            );
        }

        let mut per_index: HashMap<String, HashMap<ActorRef, Vec<MemberUpdate>>> = HashMap::new();
        let mut handled: ActiveSets = HashMap::new();
        let mut stale = 0usize;
        for record in &batch {
            let live = !fault_tolerant
                || active
                    .get(&record.actor)
                    .map_or(false, |ids| ids.contains(&record.workflow_id));
            if fault_tolerant {
                if live {
                    handled
                        .entry(record.actor.clone())
                        .or_default()
                        .insert(record.workflow_id);
                } else {
                    stale += 1;
                }
            }

            for (index_name, update) in &record.member_updates {
                if update.operation() == Operation::None {
                    continue;
                }
                let Some(index) = self.interface.index(index_name) else {
                    tracing::warn!(
                        "[HANDLER {}] record {} names unknown index {}",
                        self.address,
                        record.workflow_id,
                        index_name
                    );
                    continue;
                };
                let update = if live {
                    update.clone()
                } else if index.meta.is_unique {
                    update.reverse_tentative()
                } else {
                    continue;
                };
                per_index
                    .entry(index_name.clone())
                    .or_default()
                    .entry(record.actor.clone())
                    .or_default()
                    .push(update);
            }
        }
        if stale > 0 {
            tracing::debug!(
                "[HANDLER {}] {} stale record(s) in batch of {}",
                self.address,
                stale,
                batch.len()
            );
        }

        let applies = per_index.into_iter().filter_map(|(name, updates)| {
            let index = self.interface.index(&name)?.clone();
            Some(async move {
                index
                    .partition
                    .apply_batch(updates, index.meta.is_unique, &index.meta)
                    .await
            })
        });
        for result in join_all(applies).await {
            result?;
        }

        if fault_tolerant {
            self.release_handled(handled);
        }
        Ok(())
    }

    async fn fetch_active_workflow_sets(&self, batch: &[WorkflowRecord]) -> Result<ActiveSets> {
        let actors: HashSet<&ActorRef> = batch.iter().map(|r| &r.actor).collect();
        let fetches = actors.into_iter().map(|actor| async move {
            let handle = self.directory.resolve(actor).await?;
            let ids = handle.active_workflow_ids().await?;
            Ok::<_, crate::error::IndexingError>((actor.clone(), ids))
        });
        let mut sets = ActiveSets::new();
        for result in join_all(fetches).await {
            let (actor, ids) = result?;
            sets.insert(actor, ids);
        }
        Ok(sets)
    }

    /// Tells each actor its workflows are applied. Fire-and-forget: a lost
    /// notification only causes a harmless re-application after recovery.
    fn release_handled(&self, handled: ActiveSets) {
        for (actor, ids) in handled {
            let directory = Arc::clone(&self.directory);
            let address = self.address.clone();
            tokio::spawn(async move {
                let result = match directory.resolve(&actor).await {
                    Ok(handle) => handle.remove_from_active_workflow_ids(ids).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    tracing::warn!(
                        "[HANDLER {}] failed to release workflows of {}: {}",
                        address,
                        actor,
                        e
                    );
                }
            });
        }
    }
}
