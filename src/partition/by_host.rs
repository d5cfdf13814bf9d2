//! Active index with one bucket per host, each holding only the actors
//! activated there.

use super::bucket::HashIndexBucket;
use super::{IndexMetaData, IndexPartition};
use crate::directory::{ActorPlacement, MembershipDirectory};
use crate::error::{IndexingError, Result};
use crate::types::{ActorRef, HostId, IndexValue};
use crate::update::MemberUpdate;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct PartitionedByHostIndex {
    name: String,
    capacity: Option<usize>,
    buckets: DashMap<HostId, Arc<HashIndexBucket>>,
    membership: Arc<dyn MembershipDirectory>,
    placement: Arc<dyn ActorPlacement>,
    available: AtomicBool,
}

impl PartitionedByHostIndex {
    pub fn new(
        name: impl Into<String>,
        capacity: Option<usize>,
        membership: Arc<dyn MembershipDirectory>,
        placement: Arc<dyn ActorPlacement>,
    ) -> Self {
        PartitionedByHostIndex {
            name: name.into(),
            capacity,
            buckets: DashMap::new(),
            membership,
            placement,
            available: AtomicBool::new(true),
        }
    }

    /// The bucket on `host`, created on first use.
    pub fn bucket_on(&self, host: &str) -> Arc<HashIndexBucket> {
        self.buckets
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HashIndexBucket::new(
                    format!("{}@{}", self.name, host),
                    self.capacity,
                ))
            })
            .clone()
    }

    fn host_for(&self, actor: &ActorRef) -> HostId {
        self.placement
            .host_of(actor)
            .unwrap_or_else(|| self.membership.local_host())
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(IndexingError::IndexUnavailable(self.name.clone()))
        }
    }
}

#[async_trait]
impl IndexPartition for PartitionedByHostIndex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply_one(
        &self,
        actor: &ActorRef,
        update: &MemberUpdate,
        is_unique: bool,
        meta: &IndexMetaData,
    ) -> Result<bool> {
        self.check_available()?;
        let bucket = self.bucket_on(&self.host_for(actor));
        bucket.apply_one(actor, update, is_unique, meta).await
    }

    async fn apply_batch(
        &self,
        updates: HashMap<ActorRef, Vec<MemberUpdate>>,
        is_unique: bool,
        meta: &IndexMetaData,
    ) -> Result<bool> {
        self.check_available()?;
        let mut per_host: HashMap<HostId, HashMap<ActorRef, Vec<MemberUpdate>>> = HashMap::new();
        for (actor, list) in updates {
            let host = self.host_for(&actor);
            per_host.entry(host).or_default().insert(actor, list);
        }
        let applies = per_host.into_iter().map(|(host, batch)| {
            let bucket = self.bucket_on(&host);
            async move { bucket.apply_batch(batch, is_unique, meta).await }
        });
        for result in join_all(applies).await {
            result?;
        }
        Ok(true)
    }

    /// Unions the buckets of live hosts; a dead host's actors are gone.
    async fn lookup(&self, key: &IndexValue) -> Result<HashSet<ActorRef>> {
        self.check_available()?;
        let buckets: Vec<Arc<HashIndexBucket>> = self
            .membership
            .live_hosts()
            .iter()
            .filter_map(|h| self.buckets.get(h).map(|b| Arc::clone(b.value())))
            .collect();
        let mut found = HashSet::new();
        for result in join_all(buckets.iter().map(|b| b.lookup(key))).await {
            found.extend(result?);
        }
        Ok(found)
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn dispose(&self) -> Result<()> {
        self.available.store(false, Ordering::SeqCst);
        let buckets: Vec<Arc<HashIndexBucket>> =
            self.buckets.iter().map(|b| Arc::clone(b.value())).collect();
        self.buckets.clear();
        for bucket in buckets {
            bucket.dispose().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ActivationTable, StaticMembership};
    use crate::partition::IndexLayout;

    fn setup() -> (PartitionedByHostIndex, Arc<StaticMembership>, Arc<ActivationTable>) {
        let membership =
            Arc::new(StaticMembership::new("a", vec!["a".into(), "b".into()]).unwrap());
        let table = Arc::new(ActivationTable::new());
        let index = PartitionedByHostIndex::new(
            "location",
            None,
            membership.clone() as Arc<dyn MembershipDirectory>,
            table.clone() as Arc<dyn ActorPlacement>,
        );
        (index, membership, table)
    }

    fn meta() -> IndexMetaData {
        IndexMetaData::active(IndexLayout::PartitionedByHost)
    }

    #[tokio::test]
    async fn test_entries_land_on_activation_host() {
        let (index, _, table) = setup();
        let p1 = ActorRef::new("Player", "p1");
        let p2 = ActorRef::new("Player", "p2");
        table.record(&p1, "a");
        table.record(&p2, "b");
        let seattle = IndexValue::text("Seattle");
        for p in [&p1, &p2] {
            index
                .apply_one(p, &MemberUpdate::insert(seattle.clone()), false, &meta())
                .await
                .unwrap();
        }
        assert_eq!(index.bucket_on("a").lookup(&seattle).await.unwrap().len(), 1);
        assert_eq!(index.bucket_on("b").lookup(&seattle).await.unwrap().len(), 1);
        assert_eq!(index.lookup(&seattle).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dead_host_drops_out_of_lookups() {
        let (index, membership, table) = setup();
        let p2 = ActorRef::new("Player", "p2");
        table.record(&p2, "b");
        let mut batch = HashMap::new();
        batch.insert(p2.clone(), vec![MemberUpdate::insert(IndexValue::text("SF"))]);
        index.apply_batch(batch, false, &meta()).await.unwrap();
        assert_eq!(index.lookup(&IndexValue::text("SF")).await.unwrap().len(), 1);

        membership.mark_down("b");
        assert!(index.lookup(&IndexValue::text("SF")).await.unwrap().is_empty());
    }
}
