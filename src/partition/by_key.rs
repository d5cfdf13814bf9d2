//! Index split across a fixed number of buckets by key hash.

use super::bucket::HashIndexBucket;
use super::{IndexMetaData, IndexPartition};
use crate::error::{IndexingError, Result};
use crate::store::StateStore;
use crate::types::{ActorRef, IndexValue};
use crate::update::{MemberUpdate, Operation};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct PartitionedByKeyIndex {
    name: String,
    buckets: Vec<Arc<HashIndexBucket>>,
    available: AtomicBool,
}

impl PartitionedByKeyIndex {
    pub fn new(name: impl Into<String>, bucket_count: u32, capacity: Option<usize>) -> Self {
        let name = name.into();
        let buckets = (0..bucket_count.max(1))
            .map(|i| Arc::new(HashIndexBucket::new(bucket_name(&name, i), capacity)))
            .collect();
        PartitionedByKeyIndex {
            name,
            buckets,
            available: AtomicBool::new(true),
        }
    }

    pub async fn open(
        name: impl Into<String>,
        bucket_count: u32,
        capacity: Option<usize>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Result<Self> {
        let name = name.into();
        let mut buckets = Vec::new();
        for i in 0..bucket_count.max(1) {
            let bucket = HashIndexBucket::open(bucket_name(&name, i), capacity, store.clone()).await?;
            buckets.push(Arc::new(bucket));
        }
        Ok(PartitionedByKeyIndex {
            name,
            buckets,
            available: AtomicBool::new(true),
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket owning `key`.
    pub fn bucket_for(&self, key: &IndexValue) -> &Arc<HashIndexBucket> {
        let i = (key.stable_hash() % self.buckets.len() as u64) as usize;
        &self.buckets[i]
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(IndexingError::IndexUnavailable(self.name.clone()))
        }
    }

    /// Routes one update. An Update whose images hash to different buckets
    /// becomes a Delete on the old bucket and an Insert on the new one, after
    /// the new bucket has agreed the key is free.
    async fn route(
        &self,
        actor: &ActorRef,
        update: &MemberUpdate,
        is_unique: bool,
        meta: &IndexMetaData,
    ) -> Result<bool> {
        match update.operation() {
            Operation::None => Ok(true),
            Operation::Insert => match update.insert_key() {
                Some(key) => self.bucket_for(key).apply_one(actor, update, is_unique, meta).await,
                None => Ok(true),
            },
            Operation::Delete => match update.delete_key() {
                Some(key) => self.bucket_for(key).apply_one(actor, update, is_unique, meta).await,
                None => Ok(true),
            },
            Operation::Update => {
                let (Some(before), Some(after)) = (update.delete_key(), update.insert_key()) else {
                    return Ok(true);
                };
                let from = self.bucket_for(before);
                let to = self.bucket_for(after);
                if Arc::ptr_eq(from, to) {
                    return from.apply_one(actor, update, is_unique, meta).await;
                }
                if update.is_compensating() {
                    // each bucket only undoes the marker it holds
                    from.apply_one(actor, update, is_unique, meta).await?;
                    return to.apply_one(actor, update, is_unique, meta).await;
                }

                let mut delete = MemberUpdate::delete(before.clone());
                let mut insert = MemberUpdate::insert(after.clone());
                if update.is_tentative() {
                    delete = delete.into_tentative();
                    insert = insert.into_tentative();
                }
                if is_unique {
                    to.ensure_unique(after, actor).await?;
                }
                from.apply_one(actor, &delete, is_unique, meta).await?;
                to.apply_one(actor, &insert, is_unique, meta).await
            }
        }
    }
}

fn bucket_name(index: &str, i: u32) -> String {
    format!("{}-{}", index, i)
}

#[async_trait]
impl IndexPartition for PartitionedByKeyIndex {
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
        self.route(actor, update, is_unique, meta).await
    }

    async fn apply_batch(
        &self,
        updates: HashMap<ActorRef, Vec<MemberUpdate>>,
        is_unique: bool,
        meta: &IndexMetaData,
    ) -> Result<bool> {
        self.check_available()?;
        // actors in parallel, each actor's updates in order
        let per_actor = updates.iter().map(|(actor, list)| async move {
            for update in list {
                self.route(actor, update, is_unique, meta).await?;
            }
            Ok::<_, IndexingError>(())
        });
        for result in join_all(per_actor).await {
            result?;
        }
        Ok(true)
    }

    async fn lookup(&self, key: &IndexValue) -> Result<HashSet<ActorRef>> {
        self.check_available()?;
        self.bucket_for(key).lookup(key).await
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn dispose(&self) -> Result<()> {
        self.available.store(false, Ordering::SeqCst);
        for bucket in &self.buckets {
            bucket.dispose().await?;
        }
        Ok(())
    }
}
