//! Before/after-image diffs for one indexed field of one actor.

use crate::types::IndexValue;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    None,
    Insert,
    Update,
    Delete,
}

/// Immutable diff record. The operation is derived from the images unless a
/// compensating write forced one.
///
/// A tentative update is visible to uniqueness-conflict detection but not to
/// ordinary lookups until a non-tentative update for the same images
/// confirms it, or its reverse rolls it back. A reverse only touches entries
/// still marked tentative; confirmed entries are left alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdate {
    before: Option<IndexValue>,
    after: Option<IndexValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    forced: Option<Operation>,
    #[serde(default)]
    tentative: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    compensating: bool,
}

impl MemberUpdate {
    pub fn new(before: Option<IndexValue>, after: Option<IndexValue>) -> Self {
        MemberUpdate {
            before,
            after,
            forced: None,
            tentative: false,
            compensating: false,
        }
    }

    pub fn insert(after: IndexValue) -> Self {
        Self::new(None, Some(after))
    }

    pub fn delete(before: IndexValue) -> Self {
        Self::new(Some(before), None)
    }

    pub fn before_image(&self) -> Option<&IndexValue> {
        self.before.as_ref()
    }

    pub fn after_image(&self) -> Option<&IndexValue> {
        self.after.as_ref()
    }

    pub fn operation(&self) -> Operation {
        if let Some(op) = self.forced {
            return op;
        }
        match (&self.before, &self.after) {
            (None, None) => Operation::None,
            (None, Some(_)) => Operation::Insert,
            (Some(_), None) => Operation::Delete,
            (Some(b), Some(a)) if b == a => Operation::None,
            (Some(_), Some(_)) => Operation::Update,
        }
    }

    pub fn is_tentative(&self) -> bool {
        self.tentative
    }

    /// Whether this update rolls back a tentative reservation.
    pub fn is_compensating(&self) -> bool {
        self.compensating
    }

    pub fn into_tentative(self) -> Self {
        MemberUpdate {
            tentative: true,
            ..self
        }
    }

    /// Non-tentative version of this update; applying it confirms a tentative
    /// write made with the same images.
    pub fn confirmed(&self) -> Self {
        MemberUpdate {
            tentative: false,
            ..self.clone()
        }
    }

    /// Compensating update that undoes this one's tentative reservation: an
    /// Insert becomes a Delete of the same key, a Delete an Insert, and an
    /// Update swaps its images. Partitions apply it only to entries whose
    /// tentative marker is still set.
    pub fn reverse_tentative(&self) -> Self {
        let forced = match self.operation() {
            Operation::None => return MemberUpdate::new(self.before.clone(), self.before.clone()),
            Operation::Insert => Some(Operation::Delete),
            Operation::Delete => Some(Operation::Insert),
            Operation::Update => None,
        };
        MemberUpdate {
            before: self.after.clone(),
            after: self.before.clone(),
            forced,
            tentative: false,
            compensating: true,
        }
    }

    /// Key a Delete-like operation removes from.
    pub(crate) fn delete_key(&self) -> Option<&IndexValue> {
        match self.operation() {
            Operation::Delete => self.before.as_ref().or(self.after.as_ref()),
            _ => self.before.as_ref(),
        }
    }

    /// Key an Insert-like operation adds to.
    pub(crate) fn insert_key(&self) -> Option<&IndexValue> {
        match self.operation() {
            Operation::Insert => self.after.as_ref().or(self.before.as_ref()),
            _ => self.after.as_ref(),
        }
    }

    /// Human-readable key for error messages.
    pub(crate) fn describe_key(&self) -> String {
        self.insert_key()
            .or(self.delete_key())
            .map(|k| k.to_string())
            .unwrap_or_else(|| "<none>".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> IndexValue {
        IndexValue::text(s)
    }

    #[test]
    fn test_operation_is_derived_from_images() {
        assert_eq!(MemberUpdate::new(None, None).operation(), Operation::None);
        assert_eq!(MemberUpdate::insert(v("a")).operation(), Operation::Insert);
        assert_eq!(MemberUpdate::delete(v("a")).operation(), Operation::Delete);
        assert_eq!(
            MemberUpdate::new(Some(v("a")), Some(v("a"))).operation(),
            Operation::None
        );
        assert_eq!(
            MemberUpdate::new(Some(v("a")), Some(v("b"))).operation(),
            Operation::Update
        );
    }

    #[test]
    fn test_reverse_of_insert_deletes_same_key() {
        let u = MemberUpdate::insert(v("x")).into_tentative();
        let r = u.reverse_tentative();
        assert_eq!(r.operation(), Operation::Delete);
        assert_eq!(r.delete_key(), Some(&v("x")));
        assert!(!r.is_tentative());
        assert!(r.is_compensating());
        assert!(!u.is_compensating());
    }

    #[test]
    fn test_reverse_of_delete_inserts_same_key() {
        let r = MemberUpdate::delete(v("x")).reverse_tentative();
        assert_eq!(r.operation(), Operation::Insert);
        assert_eq!(r.insert_key(), Some(&v("x")));
    }

    #[test]
    fn test_reverse_of_update_swaps_images() {
        let r = MemberUpdate::new(Some(v("a")), Some(v("b"))).reverse_tentative();
        assert_eq!(r.operation(), Operation::Update);
        assert_eq!(r.before_image(), Some(&v("b")));
        assert_eq!(r.after_image(), Some(&v("a")));
        assert!(r.is_compensating());
    }

    #[test]
    fn test_tentative_flag_survives_serde() {
        let u = MemberUpdate::insert(v("a")).into_tentative();
        let json = serde_json::to_string(&u).unwrap();
        let back: MemberUpdate = serde_json::from_str(&json).unwrap();
        assert!(back.is_tentative());
        assert_eq!(back, u);
        assert!(!back.confirmed().is_tentative());
    }
}
