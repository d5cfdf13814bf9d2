//! Single hash bucket: key to actor-set map, optionally chained into
//! fixed-capacity successor segments.

use super::{IndexMetaData, IndexPartition};
use crate::error::{IndexingError, Result};
use crate::store::{read_json, write_json, StateStore};
use crate::types::{ActorRef, IndexValue};
use crate::update::{MemberUpdate, Operation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Pending uniqueness reservation on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TentativeOp {
    Insert,
    Delete,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketEntry {
    pub actors: BTreeSet<ActorRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tentative: Option<TentativeOp>,
}

type Segment = HashMap<IndexValue, BucketEntry>;

#[derive(Serialize, Deserialize)]
struct SegmentSnapshot {
    entries: Vec<(IndexValue, BucketEntry)>,
}

pub struct HashIndexBucket {
    name: String,
    capacity: Option<usize>,
    chain: Mutex<Vec<Segment>>,
    available: AtomicBool,
    store: Option<Arc<dyn StateStore>>,
}

impl HashIndexBucket {
    /// In-memory bucket. `capacity` bounds each segment in keys.
    pub fn new(name: impl Into<String>, capacity: Option<usize>) -> Self {
        HashIndexBucket {
            name: name.into(),
            capacity,
            chain: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            store: None,
        }
    }

    /// Bucket whose segments are written through to `store` and reloaded
    /// from it, successors included.
    pub async fn open(
        name: impl Into<String>,
        capacity: Option<usize>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Result<Self> {
        let name = name.into();
        let mut chain: Vec<Segment> = Vec::new();
        if let Some(store) = &store {
            loop {
                let key = segment_key(&name, chain.len());
                match read_json::<SegmentSnapshot>(store.as_ref(), &key).await? {
                    Some(snapshot) => chain.push(snapshot.entries.into_iter().collect()),
                    None => break,
                }
            }
            if !chain.is_empty() {
                tracing::info!(
                    "[BUCKET {}] loaded {} segment(s), {} keys",
                    name,
                    chain.len(),
                    chain.iter().map(|s| s.len()).sum::<usize>()
                );
            }
        }
        Ok(HashIndexBucket {
            name,
            capacity,
            chain: Mutex::new(chain),
            available: AtomicBool::new(true),
            store,
        })
    }

    /// Distinct keys across the chain, tentative ones included.
    pub async fn key_count(&self) -> usize {
        self.chain.lock().await.iter().map(|s| s.len()).sum()
    }

    pub async fn segment_count(&self) -> usize {
        self.chain.lock().await.len()
    }

    /// Fails if `key` is held, confirmed or tentatively, by another actor.
    pub async fn ensure_unique(&self, key: &IndexValue, actor: &ActorRef) -> Result<()> {
        self.check_available()?;
        let chain = self.chain.lock().await;
        ensure_unique_in(&chain, &self.name, key, actor)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(IndexingError::IndexUnavailable(self.name.clone()))
        }
    }

    async fn persist(&self, chain: &[Segment], dirty: &BTreeSet<usize>) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        for &i in dirty {
            let Some(segment) = chain.get(i) else {
                continue;
            };
            let snapshot = SegmentSnapshot {
                entries: segment
                    .iter()
                    .map(|(k, e)| (k.clone(), e.clone()))
                    .collect(),
            };
            write_json(store.as_ref(), &segment_key(&self.name, i), &snapshot).await?;
        }
        Ok(())
    }
}

fn segment_key(name: &str, n: usize) -> String {
    if n == 0 {
        format!("index-bucket/{}", name)
    } else {
        format!("index-bucket/{}_{}", name, n)
    }
}

fn ensure_unique_in(
    chain: &[Segment],
    index: &str,
    key: &IndexValue,
    actor: &ActorRef,
) -> Result<()> {
    for segment in chain {
        if let Some(entry) = segment.get(key) {
            if entry.actors.iter().any(|a| a != actor) {
                return Err(IndexingError::UniquenessViolation {
                    index: index.to_string(),
                    key: key.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Adds `actor` under `key`; returns the segment touched.
fn insert_into(
    chain: &mut Vec<Segment>,
    capacity: Option<usize>,
    key: &IndexValue,
    actor: &ActorRef,
    tentative: bool,
) -> usize {
    let mark = tentative.then_some(TentativeOp::Insert);
    for (i, segment) in chain.iter_mut().enumerate() {
        if let Some(entry) = segment.get_mut(key) {
            entry.actors.insert(actor.clone());
            entry.tentative = mark;
            return i;
        }
    }

    let target = match capacity {
        Some(cap) => match chain.iter().position(|s| s.len() < cap) {
            Some(i) => i,
            None => {
                chain.push(Segment::new());
                chain.len() - 1
            }
        },
        None => {
            if chain.is_empty() {
                chain.push(Segment::new());
            }
            0
        }
    };
    let mut actors = BTreeSet::new();
    actors.insert(actor.clone());
    chain[target].insert(
        key.clone(),
        BucketEntry {
            actors,
            tentative: mark,
        },
    );
    target
}

/// Removes (or tentatively marks) `actor` under `key`. `None` if absent.
fn delete_from(
    chain: &mut [Segment],
    key: &IndexValue,
    actor: &ActorRef,
    tentative: bool,
) -> Option<usize> {
    for (i, segment) in chain.iter_mut().enumerate() {
        let Some(entry) = segment.get_mut(key) else {
            continue;
        };
        if !entry.actors.contains(actor) {
            return None;
        }
        if tentative {
            entry.tentative = Some(TentativeOp::Delete);
        } else {
            entry.actors.remove(actor);
            entry.tentative = None;
            if entry.actors.is_empty() {
                segment.remove(key);
            }
        }
        return Some(i);
    }
    None
}

/// Rolls back `actor`'s reservation under `key` if the entry still carries
/// the `expected` tentative marker. Confirmed entries are left alone.
fn undo_tentative(
    chain: &mut [Segment],
    key: &IndexValue,
    actor: &ActorRef,
    expected: TentativeOp,
) -> Option<usize> {
    for (i, segment) in chain.iter_mut().enumerate() {
        let Some(entry) = segment.get_mut(key) else {
            continue;
        };
        if !entry.actors.contains(actor) || entry.tentative != Some(expected) {
            return None;
        }
        entry.tentative = None;
        if expected == TentativeOp::Insert {
            entry.actors.remove(actor);
            if entry.actors.is_empty() {
                segment.remove(key);
            }
        }
        return Some(i);
    }
    None
}

fn apply_update(
    chain: &mut Vec<Segment>,
    capacity: Option<usize>,
    index: &str,
    actor: &ActorRef,
    update: &MemberUpdate,
    is_unique: bool,
    dirty: &mut BTreeSet<usize>,
) -> Result<()> {
    if update.is_compensating() {
        // reversing an Insert clears an Insert mark, reversing a Delete a
        // Delete mark; a reversed Update carries both
        let undos = [
            (update.delete_key(), TentativeOp::Insert),
            (update.insert_key(), TentativeOp::Delete),
        ];
        for (key, expected) in undos {
            if let Some(i) = key.and_then(|k| undo_tentative(chain, k, actor, expected)) {
                dirty.insert(i);
            }
        }
        return Ok(());
    }

    let tentative = is_unique && update.is_tentative();
    match update.operation() {
        Operation::None => {}
        Operation::Insert => {
            let Some(key) = update.insert_key() else {
                return Ok(());
            };
            if is_unique {
                ensure_unique_in(chain, index, key, actor)?;
            }
            dirty.insert(insert_into(chain, capacity, key, actor, tentative));
        }
        Operation::Delete => {
            let Some(key) = update.delete_key() else {
                return Ok(());
            };
            match delete_from(chain, key, actor, tentative) {
                Some(i) => {
                    dirty.insert(i);
                }
                None => tracing::trace!("[BUCKET {}] {} not under {}, nothing to delete", index, actor, key),
            }
        }
        Operation::Update => {
            let (Some(before), Some(after)) = (update.delete_key(), update.insert_key()) else {
                return Ok(());
            };
            if is_unique {
                ensure_unique_in(chain, index, after, actor)?;
            }
            if let Some(i) = delete_from(chain, before, actor, tentative) {
                dirty.insert(i);
            }
            dirty.insert(insert_into(chain, capacity, after, actor, tentative));
        }
    }
    Ok(())
}

#[async_trait]
impl IndexPartition for HashIndexBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply_one(
        &self,
        actor: &ActorRef,
        update: &MemberUpdate,
        is_unique: bool,
        _meta: &IndexMetaData,
    ) -> Result<bool> {
        self.check_available()?;
        let mut chain = self.chain.lock().await;
        let mut dirty = BTreeSet::new();
        let applied = apply_update(
            &mut chain,
            self.capacity,
            &self.name,
            actor,
            update,
            is_unique,
            &mut dirty,
        );
        self.persist(&chain, &dirty).await?;
        applied.map(|_| true)
    }

    async fn apply_batch(
        &self,
        updates: HashMap<ActorRef, Vec<MemberUpdate>>,
        is_unique: bool,
        _meta: &IndexMetaData,
    ) -> Result<bool> {
        self.check_available()?;
        let mut chain = self.chain.lock().await;
        let mut dirty = BTreeSet::new();
        let mut first_err = None;
        for (actor, list) in &updates {
            for update in list {
                if let Err(e) = apply_update(
                    &mut chain,
                    self.capacity,
                    &self.name,
                    actor,
                    update,
                    is_unique,
                    &mut dirty,
                ) {
                    tracing::warn!("[BUCKET {}] update for {} rejected: {}", self.name, actor, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        self.persist(&chain, &dirty).await?;
        match first_err {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    async fn lookup(&self, key: &IndexValue) -> Result<HashSet<ActorRef>> {
        self.check_available()?;
        let chain = self.chain.lock().await;
        Ok(chain
            .iter()
            .filter_map(|segment| segment.get(key))
            .filter(|entry| entry.tentative.is_none())
            .flat_map(|entry| entry.actors.iter().cloned())
            .collect())
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn dispose(&self) -> Result<()> {
        self.available.store(false, Ordering::SeqCst);
        self.chain.lock().await.clear();
        Ok(())
    }
}
