//! Doubly-linked, punctuation-delimited list of workflow records.
//!
//! Nodes live in an index-addressed arena: links are slot indices, freed
//! slots are recycled, and no operation can leave a dangling link. A
//! punctuation node splits the list into the prefix claimed by the running
//! drain and the unclaimed suffix producers keep appending to.

use super::record::WorkflowRecord;
use crate::error::{IndexingError, Result};
use crate::types::WorkflowId;
use std::collections::HashSet;

enum NodeKind {
    Record(WorkflowRecord),
    Punctuation,
}

struct Node {
    kind: NodeKind,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
pub struct WorkflowRecordList {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    records: usize,
    punctuation: Option<usize>,
}

impl WorkflowRecordList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records, punctuation excluded.
    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub fn has_punctuation(&self) -> bool {
        self.punctuation.is_some()
    }

    pub fn append(&mut self, record: WorkflowRecord) {
        self.link_at_tail(NodeKind::Record(record));
        self.records += 1;
    }

    /// Marks everything currently in the list as claimed by a drain.
    pub fn append_punctuation(&mut self) -> Result<()> {
        if self.is_empty() {
            return Err(IndexingError::InvariantViolation(
                "punctuation inserted into an empty queue".to_string(),
            ));
        }
        if self.punctuation.is_some() {
            return Err(IndexingError::InvariantViolation(
                "a punctuation is already in flight".to_string(),
            ));
        }
        let idx = self.link_at_tail(NodeKind::Punctuation);
        self.punctuation = Some(idx);
        Ok(())
    }

    /// Drops the punctuation without removing any record, returning the
    /// claimed prefix to the unclaimed pool.
    pub fn remove_punctuation(&mut self) {
        if let Some(idx) = self.punctuation.take() {
            self.unlink(idx);
        }
    }

    /// Copies of the claimed records, head to punctuation exclusive.
    pub fn claimed_batch(&self) -> Vec<WorkflowRecord> {
        let mut batch = Vec::new();
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let Some(node) = self.slots[idx].as_ref() else {
                break;
            };
            match &node.kind {
                NodeKind::Punctuation => break,
                NodeKind::Record(r) => batch.push(r.clone()),
            }
            cursor = node.next;
        }
        batch
    }

    /// Unlinks the claimed prefix and its punctuation.
    pub fn remove_until_punctuation(&mut self) -> Result<Vec<WorkflowRecord>> {
        let punctuation = self.punctuation.ok_or_else(|| {
            IndexingError::InvariantViolation("no punctuation to drain up to".to_string())
        })?;
        if self.head == Some(punctuation) {
            return Err(IndexingError::InvariantViolation(
                "queue head is a punctuation".to_string(),
            ));
        }

        let mut removed = Vec::new();
        while let Some(idx) = self.head {
            let Some(node) = self.unlink(idx) else {
                break;
            };
            match node.kind {
                NodeKind::Punctuation => {
                    self.punctuation = None;
                    break;
                }
                NodeKind::Record(r) => {
                    self.records -= 1;
                    removed.push(r);
                }
            }
        }
        Ok(removed)
    }

    /// Unlinks every record whose workflow id is in `ids`, claimed or not.
    /// If that empties the claimed prefix the punctuation goes too, so the
    /// running drain finds nothing to remove and claims afresh.
    pub fn remove_all(&mut self, ids: &HashSet<WorkflowId>) -> Vec<WorkflowRecord> {
        let mut cursor = self.head;
        let mut removed = Vec::new();
        while let Some(idx) = cursor {
            let (next, matches) = match self.slots[idx].as_ref() {
                Some(node) => (
                    node.next,
                    matches!(&node.kind, NodeKind::Record(r) if ids.contains(&r.workflow_id)),
                ),
                None => break,
            };
            if matches {
                if let Some(Node {
                    kind: NodeKind::Record(r),
                    ..
                }) = self.unlink(idx)
                {
                    self.records -= 1;
                    removed.push(r);
                }
            }
            cursor = next;
        }
        if self.punctuation.is_some() && self.head == self.punctuation {
            self.remove_punctuation();
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkflowRecord> {
        let mut cursor = self.head;
        std::iter::from_fn(move || loop {
            let idx = cursor?;
            let node = self.slots[idx].as_ref()?;
            cursor = node.next;
            if let NodeKind::Record(r) = &node.kind {
                return Some(r);
            }
        })
    }

    fn link_at_tail(&mut self, kind: NodeKind) -> usize {
        let node = Node {
            kind,
            prev: self.tail,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        // wire the neighbour before publishing the new tail
        if let Some(tail) = self.tail {
            if let Some(t) = self.slots[tail].as_mut() {
                t.next = Some(idx);
            }
        }
        self.tail = Some(idx);
        if self.head.is_none() {
            self.head = Some(idx);
        }
        idx
    }

    fn unlink(&mut self, idx: usize) -> Option<Node> {
        let node = self.slots.get_mut(idx)?.take()?;
        match node.prev {
            Some(p) => {
                if let Some(prev) = self.slots[p].as_mut() {
                    prev.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => {
                if let Some(next) = self.slots[n].as_mut() {
                    next.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        self.free.push(idx);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActorRef;
    use std::collections::BTreeMap;

    fn rec(id: &str) -> WorkflowRecord {
        WorkflowRecord::new(ActorRef::new("Player", id), BTreeMap::new())
    }

    fn actor_ids(records: &[WorkflowRecord]) -> Vec<String> {
        records.iter().map(|r| r.actor.id.clone()).collect()
    }

    #[test]
    fn test_punctuation_requires_records() {
        let mut list = WorkflowRecordList::new();
        assert!(list.append_punctuation().is_err());
        list.append(rec("a"));
        list.append_punctuation().unwrap();
        assert!(list.append_punctuation().is_err());
    }

    #[test]
    fn test_batch_stops_at_punctuation() {
        let mut list = WorkflowRecordList::new();
        list.append(rec("a"));
        list.append(rec("b"));
        list.append_punctuation().unwrap();
        list.append(rec("c"));

        assert_eq!(actor_ids(&list.claimed_batch()), vec!["a", "b"]);
        let removed = list.remove_until_punctuation().unwrap();
        assert_eq!(actor_ids(&removed), vec!["a", "b"]);
        assert!(!list.has_punctuation());
        assert_eq!(list.len(), 1);
        assert_eq!(
            list.iter().map(|r| r.actor.id.as_str()).collect::<Vec<_>>(),
            vec!["c"]
        );
    }

    #[test]
    fn test_remove_until_punctuation_without_one_fails() {
        let mut list = WorkflowRecordList::new();
        list.append(rec("a"));
        assert!(list.remove_until_punctuation().is_err());
    }

    #[test]
    fn test_remove_all_reaches_into_claimed_prefix() {
        let mut list = WorkflowRecordList::new();
        let a = rec("a");
        let b = rec("b");
        let c = rec("c");
        let ids: HashSet<_> = [a.workflow_id, c.workflow_id].into_iter().collect();
        list.append(a.clone());
        list.append(b);
        list.append_punctuation().unwrap();
        list.append(c);

        let removed = list.remove_all(&ids);
        assert_eq!(actor_ids(&removed), vec!["a", "c"]);
        assert!(list.iter().all(|r| r.workflow_id != a.workflow_id));
        assert_eq!(actor_ids(&list.remove_until_punctuation().unwrap()), vec!["b"]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove_all_drops_punctuation_of_emptied_batch() {
        let mut list = WorkflowRecordList::new();
        let a = rec("a");
        let ids: HashSet<_> = [a.workflow_id].into_iter().collect();
        list.append(a);
        list.append_punctuation().unwrap();
        list.append(rec("b"));

        assert_eq!(list.remove_all(&ids).len(), 1);
        assert!(!list.has_punctuation());
        // the next claim starts from the surviving record
        list.append_punctuation().unwrap();
        assert_eq!(actor_ids(&list.claimed_batch()), vec!["b"]);
    }

    #[test]
    fn test_slots_are_recycled() {
        let mut list = WorkflowRecordList::new();
        for round in 0..3 {
            list.append(rec(&format!("a{}", round)));
            list.append(rec(&format!("b{}", round)));
            list.append_punctuation().unwrap();
            assert_eq!(list.remove_until_punctuation().unwrap().len(), 2);
        }
        assert!(list.is_empty());
        assert!(list.slots.len() <= 3);
    }

    #[test]
    fn test_remove_punctuation_keeps_records() {
        let mut list = WorkflowRecordList::new();
        list.append(rec("a"));
        list.append_punctuation().unwrap();
        list.append(rec("b"));
        list.remove_punctuation();
        assert_eq!(list.len(), 2);
        assert_eq!(list.claimed_batch().len(), 2);
        list.append_punctuation().unwrap();
        assert_eq!(list.remove_until_punctuation().unwrap().len(), 2);
    }
}
