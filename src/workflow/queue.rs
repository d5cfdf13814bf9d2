//! Per-shard workflow queue: producers append records, one drain at a time
//! consumes everything up to the punctuation.

use super::commit::GroupCommit;
use super::handler::WorkflowQueueHandler;
use super::list::WorkflowRecordList;
use super::record::WorkflowRecord;
use crate::directory::ActorDirectory;
use crate::error::{IndexingError, Result};
use crate::registry::IndexedInterface;
use crate::store::{read_json, write_json, StateStore};
use crate::types::{QueueAddress, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};

/// Durable form of a queue: its own address plus every record still in it,
/// claimed or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowQueueState {
    pub address: QueueAddress,
    pub records: Vec<WorkflowRecord>,
}

struct QueueInner {
    list: WorkflowRecordList,
    idle: bool,
}

pub struct WorkflowQueue {
    address: QueueAddress,
    persist: bool,
    inner: Mutex<QueueInner>,
    commit: GroupCommit,
    store: Arc<dyn StateStore>,
    handler: Arc<WorkflowQueueHandler>,
    idle_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    self_ref: Weak<WorkflowQueue>,
}

impl WorkflowQueue {
    /// Opens the queue at `address`, restoring any persisted records and
    /// starting a drain over them.
    pub async fn open(
        address: QueueAddress,
        interface: Arc<IndexedInterface>,
        store: Arc<dyn StateStore>,
        directory: Arc<dyn ActorDirectory>,
    ) -> Result<Arc<Self>> {
        let persist = interface.persists_queues();
        let restored = if persist {
            read_json::<WorkflowQueueState>(store.as_ref(), &address.state_key())
                .await?
                .map(|s| s.records)
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let handler = Arc::new(WorkflowQueueHandler::new(
            address.clone(),
            interface,
            directory,
        ));
        let (idle_tx, _) = watch::channel(true);
        let queue = Arc::new_cyclic(|weak| WorkflowQueue {
            address,
            persist,
            inner: Mutex::new(QueueInner {
                list: WorkflowRecordList::new(),
                idle: true,
            }),
            commit: GroupCommit::new(),
            store,
            handler,
            idle_tx,
            stopped: AtomicBool::new(false),
            self_ref: weak.clone(),
        });

        if restored.is_empty() {
            tracing::debug!("[WQ {}] opened", queue.address);
        } else {
            tracing::info!(
                "[RECOVERY {}] restored {} pending workflow record(s)",
                queue.address,
                restored.len()
            );
            queue.enqueue(restored).await?;
        }
        Ok(queue)
    }

    pub fn address(&self) -> &QueueAddress {
        &self.address
    }

    pub fn is_persistent(&self) -> bool {
        self.persist
    }

    /// Number of physical state writes this queue has issued.
    pub fn physical_writes(&self) -> usize {
        self.commit.physical_writes()
    }

    pub async fn add_to_queue(&self, record: WorkflowRecord) -> Result<()> {
        self.add_all_to_queue(vec![record]).await
    }

    /// Appends `records` in order, starting a drain if the queue was idle.
    /// With persistence on, returns only after a write covering the append.
    pub async fn add_all_to_queue(&self, records: Vec<WorkflowRecord>) -> Result<()> {
        self.check_running()?;
        if records.is_empty() {
            return Ok(());
        }
        let count = records.len();
        self.enqueue(records).await?;
        tracing::trace!("[WQ {}] appended {} record(s)", self.address, count);
        if self.persist {
            self.persist_state().await?;
        }
        Ok(())
    }

    async fn enqueue(&self, records: Vec<WorkflowRecord>) -> Result<()> {
        let kickoff = {
            let mut inner = self.inner.lock().await;
            for record in records {
                inner.list.append(record);
            }
            if inner.idle {
                inner.list.append_punctuation()?;
                inner.idle = false;
                self.idle_tx.send_replace(false);
                Some(inner.list.claimed_batch())
            } else {
                None
            }
        };
        if let Some(batch) = kickoff {
            self.start_drain(batch);
        }
        Ok(())
    }

    fn start_drain(&self, batch: Vec<WorkflowRecord>) {
        let Some(queue) = self.self_ref.upgrade() else {
            return;
        };
        let handler = Arc::clone(&self.handler);
        tracing::debug!("[WQ {}] drain started with {} record(s)", self.address, batch.len());
        tokio::spawn(async move {
            handler.drain(queue, batch).await;
        });
    }

    /// Restarts a drain over records an abandoned drain left behind.
    /// Returns whether a drain was started.
    pub async fn resume(&self) -> Result<bool> {
        self.check_running()?;
        let batch = {
            let mut inner = self.inner.lock().await;
            if !inner.idle || inner.list.is_empty() {
                return Ok(false);
            }
            inner.list.append_punctuation()?;
            inner.idle = false;
            self.idle_tx.send_replace(false);
            inner.list.claimed_batch()
        };
        self.start_drain(batch);
        Ok(true)
    }

    /// Removes the batch just processed. Returns the next batch, or `None`
    /// after marking the queue idle.
    pub async fn give_more_workflows_or_set_as_idle(&self) -> Result<Option<Vec<WorkflowRecord>>> {
        if self.is_stopped() {
            // a dead host's queue keeps its records for reincarnation
            self.abandon_drain().await;
            return Ok(None);
        }
        let removed = {
            let mut inner = self.inner.lock().await;
            // a handoff may have withdrawn the whole claimed batch
            if inner.list.has_punctuation() {
                inner.list.remove_until_punctuation()?
            } else {
                Vec::new()
            }
        };
        if self.persist && !removed.is_empty() {
            if let Err(e) = self.persist_state().await {
                // the records may be redelivered after a crash; applying them
                // twice is harmless
                tracing::warn!("[WQ {}] failed to persist removal: {}", self.address, e);
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.list.is_empty() {
            inner.idle = true;
            self.idle_tx.send_replace(true);
            tracing::trace!("[WQ {}] idle", self.address);
            return Ok(None);
        }
        inner.list.append_punctuation()?;
        Ok(Some(inner.list.claimed_batch()))
    }

    /// Removes the records with matching ids wherever they sit, including a
    /// batch a drain has claimed; used when an actor hands its workflows to
    /// a new queue.
    pub async fn remove_all_from_queue(&self, records: &[WorkflowRecord]) -> Result<usize> {
        let ids: HashSet<WorkflowId> = records.iter().map(|r| r.workflow_id).collect();
        let removed = self.inner.lock().await.list.remove_all(&ids).len();
        if self.persist && removed > 0 {
            self.persist_state().await?;
        }
        Ok(removed)
    }

    /// Records still queued, claimed or not, whose ids are in `ids`.
    pub async fn get_remaining_workflows_in(
        &self,
        ids: &HashSet<WorkflowId>,
    ) -> Result<Vec<WorkflowRecord>> {
        self.check_running()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .list
            .iter()
            .filter(|r| ids.contains(&r.workflow_id))
            .cloned()
            .collect())
    }

    /// The records of `batch` that are still queued. A drain calls this
    /// before applying so that withdrawn records are not applied here.
    pub async fn still_queued(&self, batch: Vec<WorkflowRecord>) -> Vec<WorkflowRecord> {
        let inner = self.inner.lock().await;
        let queued: HashSet<WorkflowId> = inner.list.iter().map(|r| r.workflow_id).collect();
        batch
            .into_iter()
            .filter(|r| queued.contains(&r.workflow_id))
            .collect()
    }

    /// Gives up on the in-flight batch without removing it. The records are
    /// retried by the next drain.
    pub async fn abandon_drain(&self) {
        let mut inner = self.inner.lock().await;
        inner.list.remove_punctuation();
        inner.idle = true;
        self.idle_tx.send_replace(true);
        tracing::warn!(
            "[WQ {}] drain abandoned, {} record(s) left for retry",
            self.address,
            inner.list.len()
        );
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.list.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_idle(&self) -> bool {
        self.inner.lock().await.idle
    }

    pub async fn wait_until_idle(&self) {
        let mut rx = self.idle_tx.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    pub async fn snapshot(&self) -> WorkflowQueueState {
        let inner = self.inner.lock().await;
        WorkflowQueueState {
            address: self.address.clone(),
            records: inner.list.iter().cloned().collect(),
        }
    }

    /// Stops accepting work. A running drain finishes its current batch and
    /// goes idle.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn check_running(&self) -> Result<()> {
        if self.is_stopped() {
            Err(IndexingError::UnreachableQueue(self.address.to_string()))
        } else {
            Ok(())
        }
    }

    async fn persist_state(&self) -> Result<()> {
        self.commit
            .commit(|| async {
                let state = self.snapshot().await;
                write_json(self.store.as_ref(), &self.address.state_key(), &state).await
            })
            .await
            .map(|_| ())
    }
}
