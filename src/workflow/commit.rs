//! Group commit: many logically concurrent persist requests, few physical writes.

use crate::error::Result;
use dashmap::DashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Coalesces concurrent persistence requests.
///
/// Each request registers a ticket, then waits for the write lock. The first
/// holder takes every ticket registered so far and performs one write of the
/// then-current state, which covers all of them. A caller whose ticket is gone
/// when it finally gets the lock returns without writing. A failed write hands
/// the taken tickets back, so each waiter it would have covered writes again
/// on its own turn.
#[derive(Default)]
pub struct GroupCommit {
    next_ticket: AtomicU64,
    pending: DashSet<u64>,
    write_lock: Mutex<()>,
    physical_writes: AtomicUsize,
}

impl GroupCommit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `write` unless an earlier holder already covered this request.
    /// Returns whether a physical write happened on this call.
    ///
    /// The state captured by `write` must be read after this method takes
    /// the lock, i.e. inside the closure's future.
    pub async fn commit<F, Fut>(&self, write: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending.insert(ticket);

        let _guard = self.write_lock.lock().await;
        if self.pending.remove(&ticket).is_none() {
            return Ok(false);
        }
        let covered: Vec<u64> = self.pending.iter().map(|t| *t).collect();
        for t in &covered {
            self.pending.remove(t);
        }

        if let Err(e) = write().await {
            // covered waiters have not passed the lock yet and write on their own turn
            for t in covered {
                self.pending.insert(t);
            }
            return Err(e);
        }
        self.physical_writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    pub fn physical_writes(&self) -> usize {
        self.physical_writes.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_single_request_writes_once() {
        let gc = GroupCommit::new();
        assert!(gc.commit(|| async { Ok(()) }).await.unwrap());
        assert_eq!(gc.physical_writes(), 1);
    }

    #[tokio::test]
    async fn test_waiters_are_covered_by_the_holder() {
        let gc = Arc::new(GroupCommit::new());
        let counter = Arc::new(AtomicUsize::new(0));

        // Hold the lock so every request below registers before any write.
        let guard = gc.write_lock.lock().await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gc = Arc::clone(&gc);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                gc.commit(|| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        while gc.pending.len() < 8 {
            tokio::task::yield_now().await;
        }
        drop(guard);

        let mut wrote = 0;
        for h in handles {
            if h.await.unwrap().unwrap() {
                wrote += 1;
            }
        }
        assert_eq!(wrote, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(gc.physical_writes(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_propagates_to_holder() {
        let gc = GroupCommit::new();
        let res = gc
            .commit(|| async {
                Err(crate::error::IndexingError::Store("disk full".into()))
            })
            .await;
        assert!(res.is_err());
        assert_eq!(gc.physical_writes(), 0);
        // a later request still writes
        assert!(gc.commit(|| async { Ok(()) }).await.unwrap());
        assert_eq!(gc.physical_writes(), 1);
    }

    async fn burst<F>(gc: &Arc<GroupCommit>, n: usize, write: F) -> Vec<Result<bool>>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let write = Arc::new(write);
        let guard = gc.write_lock.lock().await;
        let mut handles = Vec::new();
        for _ in 0..n {
            let gc = Arc::clone(gc);
            let write = Arc::clone(&write);
            handles.push(tokio::spawn(async move {
                gc.commit(|| async move {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    write()
                })
                .await
            }));
        }
        while gc.pending.len() < n {
            tokio::task::yield_now().await;
        }
        drop(guard);

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_no_waiter_succeeds_when_every_write_fails() {
        let gc = Arc::new(GroupCommit::new());
        let results = burst(&gc, 8, || {
            Err(crate::error::IndexingError::Store("disk full".into()))
        })
        .await;

        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(gc.physical_writes(), 0);
        assert!(gc.pending.is_empty());
    }

    #[tokio::test]
    async fn test_waiters_rewrite_after_a_failed_holder() {
        let gc = Arc::new(GroupCommit::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let results = burst(&gc, 8, move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(crate::error::IndexingError::Store("transient".into()))
            } else {
                Ok(())
            }
        })
        .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        let wrote = results
            .iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(failed, 1);
        // the second holder covers every remaining waiter
        assert_eq!(wrote, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(gc.physical_writes(), 1);
    }
}
