//! Lazy propagation: workflow records, the queues that hold them, and the
//! handlers that drain them into the indexes.

mod commit;
mod handler;
mod list;
mod queue;
mod record;

pub use commit::GroupCommit;
pub use handler::WorkflowQueueHandler;
pub use list::WorkflowRecordList;
pub use queue::{WorkflowQueue, WorkflowQueueState};
pub use record::WorkflowRecord;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ActorDirectory, IndexedActorHandle};
    use crate::error::{IndexingError, Result};
    use crate::partition::{HashIndexBucket, IndexLayout, IndexMetaData, IndexPartition};
    use crate::registry::{FaultTolerancePolicy, IndexDescriptor, IndexedInterface};
    use crate::store::{read_json, MemoryStateStore, StateStore};
    use crate::types::{ActorRef, IndexValue, QueueAddress, QueueId, WorkflowId};
    use crate::update::MemberUpdate;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Arc;

    struct NoActors;

    #[async_trait]
    impl ActorDirectory for NoActors {
        async fn resolve(&self, actor: &ActorRef) -> Result<Arc<dyn IndexedActorHandle>> {
            Err(IndexingError::ActorUnreachable(actor.to_string()))
        }
    }

    /// Resolution waits on `gate`; actors then report `active`, or are
    /// unreachable while it is `None`.
    struct GatedDirectory {
        gate: tokio::sync::Mutex<()>,
        active: std::sync::Mutex<Option<HashSet<WorkflowId>>>,
    }

    impl GatedDirectory {
        fn new(active: Option<HashSet<WorkflowId>>) -> Arc<Self> {
            Arc::new(GatedDirectory {
                gate: tokio::sync::Mutex::new(()),
                active: std::sync::Mutex::new(active),
            })
        }

        fn set_active(&self, active: Option<HashSet<WorkflowId>>) {
            *self.active.lock().unwrap() = active;
        }
    }

    struct Listed(HashSet<WorkflowId>);

    #[async_trait]
    impl IndexedActorHandle for Listed {
        async fn active_workflow_ids(&self) -> Result<HashSet<WorkflowId>> {
            Ok(self.0.clone())
        }

        async fn remove_from_active_workflow_ids(&self, _ids: HashSet<WorkflowId>) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ActorDirectory for GatedDirectory {
        async fn resolve(&self, actor: &ActorRef) -> Result<Arc<dyn IndexedActorHandle>> {
            let _open = self.gate.lock().await;
            let active = self.active.lock().unwrap().clone();
            match active {
                Some(ids) => Ok(Arc::new(Listed(ids))),
                None => Err(IndexingError::ActorUnreachable(actor.to_string())),
            }
        }
    }

    fn interface(policy: FaultTolerancePolicy) -> (Arc<IndexedInterface>, Arc<HashIndexBucket>) {
        let bucket = Arc::new(HashIndexBucket::new("location", None));
        let iface = IndexedInterface::new("IPlayer", policy).with_index(IndexDescriptor::for_field(
            "location",
            "location",
            IndexMetaData::total(IndexLayout::SingleBucket),
            bucket.clone() as Arc<dyn IndexPartition>,
        ));
        (Arc::new(iface), bucket)
    }

    fn record(id: &str, before: Option<&str>, after: &str) -> WorkflowRecord {
        let mut updates = BTreeMap::new();
        updates.insert(
            "location".to_string(),
            MemberUpdate::new(before.map(IndexValue::text), Some(IndexValue::text(after))),
        );
        WorkflowRecord::new(ActorRef::new("Player", id), updates)
    }

    fn address() -> QueueAddress {
        QueueAddress::new(QueueId::new("IPlayer", 0), "host-a")
    }

    #[tokio::test]
    async fn test_queue_drains_into_index() {
        let (iface, bucket) = interface(FaultTolerancePolicy::NonFaultTolerant);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let queue = WorkflowQueue::open(address(), iface, store, Arc::new(NoActors))
            .await
            .unwrap();
        assert!(!queue.is_persistent());

        queue.add_to_queue(record("p1", None, "Seattle")).await.unwrap();
        queue.add_to_queue(record("p2", None, "Seattle")).await.unwrap();
        queue.wait_until_idle().await;

        assert!(queue.is_empty().await);
        assert_eq!(
            bucket.lookup(&IndexValue::text("Seattle")).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_persistent_queue_survives_reopen() {
        let (iface, _) = interface(FaultTolerancePolicy::FaultTolerant);
        let memory = Arc::new(MemoryStateStore::new());
        let store: Arc<dyn StateStore> = memory.clone();

        // the handler cannot reach actors, so records stay queued
        let queue = WorkflowQueue::open(
            address(),
            Arc::clone(&iface),
            Arc::clone(&store),
            Arc::new(NoActors),
        )
        .await
        .unwrap();
        assert!(queue.is_persistent());
        let rec = record("p1", None, "Seattle");
        queue.add_to_queue(rec.clone()).await.unwrap();
        queue.wait_until_idle().await;
        assert_eq!(queue.len().await, 1);

        let persisted: WorkflowQueueState = read_json(store.as_ref(), &address().state_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.records, vec![rec.clone()]);

        let ids: HashSet<_> = [rec.workflow_id].into_iter().collect();
        let reopened = WorkflowQueue::open(address(), iface, store, Arc::new(NoActors))
            .await
            .unwrap();
        reopened.wait_until_idle().await;
        assert_eq!(
            reopened.get_remaining_workflows_in(&ids).await.unwrap(),
            vec![rec]
        );
    }

    #[tokio::test]
    async fn test_remove_all_only_touches_listed_records() {
        let (iface, _) = interface(FaultTolerancePolicy::FaultTolerant);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let queue = WorkflowQueue::open(address(), iface, store, Arc::new(NoActors))
            .await
            .unwrap();
        let a = record("p1", None, "Seattle");
        let b = record("p2", None, "SF");
        queue.add_all_to_queue(vec![a.clone(), b.clone()]).await.unwrap();
        queue.wait_until_idle().await;

        assert_eq!(queue.remove_all_from_queue(&[a]).await.unwrap(), 1);
        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot.records, vec![b]);
    }

    #[tokio::test]
    async fn test_withdrawn_claimed_record_is_not_applied() {
        let (iface, bucket) = interface(FaultTolerancePolicy::FaultTolerant);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let rec = record("p1", None, "Seattle");
        let directory = GatedDirectory::new(Some(HashSet::from([rec.workflow_id])));
        let closed = directory.gate.lock().await;
        let queue = WorkflowQueue::open(address(), iface, store, directory.clone())
            .await
            .unwrap();

        // the drain has claimed the record and waits on the actor
        queue.add_to_queue(rec.clone()).await.unwrap();
        assert!(!queue.is_idle().await);
        assert_eq!(queue.remove_all_from_queue(&[rec]).await.unwrap(), 1);
        drop(closed);
        queue.wait_until_idle().await;

        assert!(queue.is_empty().await);
        assert!(bucket
            .lookup(&IndexValue::text("Seattle"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_resume_retries_abandoned_records() {
        let (iface, bucket) = interface(FaultTolerancePolicy::FaultTolerant);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let directory = GatedDirectory::new(None);
        let queue = WorkflowQueue::open(address(), iface, store, directory.clone())
            .await
            .unwrap();
        let rec = record("p1", None, "Seattle");
        queue.add_to_queue(rec.clone()).await.unwrap();
        queue.wait_until_idle().await;
        assert_eq!(queue.len().await, 1);

        directory.set_active(Some(HashSet::from([rec.workflow_id])));
        assert!(queue.resume().await.unwrap());
        queue.wait_until_idle().await;

        assert!(queue.is_empty().await);
        assert_eq!(
            bucket.lookup(&IndexValue::text("Seattle")).await.unwrap(),
            HashSet::from([ActorRef::new("Player", "p1")])
        );
        // nothing left to resume
        assert!(!queue.resume().await.unwrap());
    }

    #[tokio::test]
    async fn test_stopped_queue_rejects_work() {
        let (iface, _) = interface(FaultTolerancePolicy::NonFaultTolerant);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let queue = WorkflowQueue::open(address(), iface, store, Arc::new(NoActors))
            .await
            .unwrap();
        queue.stop();
        assert!(matches!(
            queue.add_to_queue(record("p1", None, "x")).await,
            Err(IndexingError::UnreachableQueue(_))
        ));
    }
}
