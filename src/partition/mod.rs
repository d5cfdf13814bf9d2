//! Index partitions: the key to actor-set stores behind each index.

pub mod bucket;
pub mod by_host;
pub mod by_key;

use crate::directory::{ActorPlacement, MembershipDirectory};
use crate::error::{IndexingError, Result};
use crate::store::StateStore;
use crate::types::{ActorRef, IndexValue};
use crate::update::MemberUpdate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub use bucket::HashIndexBucket;
pub use by_host::PartitionedByHostIndex;
pub use by_key::PartitionedByKeyIndex;

/// Whether an index observes every actor of its type or only active ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexScope {
    Total,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexLayout {
    SingleBucket,
    PartitionedByKey,
    PartitionedByHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexType {
    pub scope: IndexScope,
    pub layout: IndexLayout,
}

/// Immutable configuration of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetaData {
    pub index_type: IndexType,
    pub is_unique: bool,
    pub is_eager: bool,
    /// `<= 0` keeps a single unbounded bucket; `> 0` chains successor
    /// buckets once a bucket holds this many keys.
    pub max_entries_per_bucket: i32,
}

impl IndexMetaData {
    pub fn new(scope: IndexScope, layout: IndexLayout) -> Self {
        IndexMetaData {
            index_type: IndexType { scope, layout },
            is_unique: false,
            is_eager: false,
            max_entries_per_bucket: 0,
        }
    }

    pub fn total(layout: IndexLayout) -> Self {
        Self::new(IndexScope::Total, layout)
    }

    pub fn active(layout: IndexLayout) -> Self {
        Self::new(IndexScope::Active, layout)
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn eager(mut self) -> Self {
        self.is_eager = true;
        self
    }

    pub fn chained(mut self, max_entries_per_bucket: i32) -> Self {
        self.max_entries_per_bucket = max_entries_per_bucket;
        self
    }

    pub fn is_total(&self) -> bool {
        self.index_type.scope == IndexScope::Total
    }

    pub fn is_chained(&self) -> bool {
        self.max_entries_per_bucket > 0
    }

    /// Bucket capacity in keys, `None` when unchained.
    pub fn bucket_capacity(&self) -> Option<usize> {
        if self.is_chained() {
            Some(self.max_entries_per_bucket as usize)
        } else {
            None
        }
    }

    pub fn validate(&self, index: &str) -> Result<()> {
        if self.is_total() && self.is_eager {
            return Err(IndexingError::Configuration(format!(
                "total index {} cannot be eager",
                index
            )));
        }
        if self.is_total() && self.index_type.layout == IndexLayout::PartitionedByHost {
            return Err(IndexingError::Configuration(format!(
                "total index {} cannot be partitioned by host",
                index
            )));
        }
        // each host bucket only sees its own actors' keys
        if self.is_unique && self.index_type.layout == IndexLayout::PartitionedByHost {
            return Err(IndexingError::Configuration(format!(
                "unique index {} cannot be partitioned by host",
                index
            )));
        }
        Ok(())
    }
}

/// The contract every partition variant implements.
///
/// Applying the same update twice must leave the partition as applying it
/// once: drains may redeliver after a crash.
#[async_trait]
pub trait IndexPartition: Send + Sync {
    fn name(&self) -> &str;

    async fn apply_one(
        &self,
        actor: &ActorRef,
        update: &MemberUpdate,
        is_unique: bool,
        meta: &IndexMetaData,
    ) -> Result<bool>;

    async fn apply_batch(
        &self,
        updates: HashMap<ActorRef, Vec<MemberUpdate>>,
        is_unique: bool,
        meta: &IndexMetaData,
    ) -> Result<bool>;

    /// Confirmed entries for `key`; tentative entries are not visible.
    async fn lookup(&self, key: &IndexValue) -> Result<HashSet<ActorRef>>;

    async fn lookup_unique(&self, key: &IndexValue) -> Result<ActorRef> {
        let found = self.lookup(key).await?;
        if found.len() > 1 {
            return Err(IndexingError::MultipleFound {
                index: self.name().to_string(),
                key: key.to_string(),
                count: found.len(),
            });
        }
        found
            .into_iter()
            .next()
            .ok_or_else(|| IndexingError::KeyNotFound {
                index: self.name().to_string(),
                key: key.to_string(),
            })
    }

    async fn is_available(&self) -> bool;

    async fn dispose(&self) -> Result<()>;
}

/// Collaborators a partition may need at construction.
#[derive(Clone)]
pub struct PartitionEnv {
    pub store: Arc<dyn StateStore>,
    pub membership: Arc<dyn MembershipDirectory>,
    pub placement: Arc<dyn ActorPlacement>,
    pub key_buckets: u32,
}

/// Builds the partition variant `meta` asks for. Buckets of total indexes
/// persist to the state store; active ones are memory only.
pub async fn create_partition(
    name: &str,
    meta: &IndexMetaData,
    env: &PartitionEnv,
) -> Result<Arc<dyn IndexPartition>> {
    meta.validate(name)?;
    let store = meta.is_total().then(|| Arc::clone(&env.store));
    let partition: Arc<dyn IndexPartition> = match meta.index_type.layout {
        IndexLayout::SingleBucket => {
            Arc::new(HashIndexBucket::open(name, meta.bucket_capacity(), store).await?)
        }
        IndexLayout::PartitionedByKey => Arc::new(
            PartitionedByKeyIndex::open(name, env.key_buckets, meta.bucket_capacity(), store)
                .await?,
        ),
        IndexLayout::PartitionedByHost => Arc::new(PartitionedByHostIndex::new(
            name,
            meta.bucket_capacity(),
            Arc::clone(&env.membership),
            Arc::clone(&env.placement),
        )),
    };
    Ok(partition)
}
