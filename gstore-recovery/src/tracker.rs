//! Chained transaction completion tracking.
//!
//! A transaction is written as one batch or as a chain of batches. The
//! tracker records batches in any order and reports a transaction complete
//! once its first batch, its last batch and every chunk in between have
//! been seen. Partial state is dropped on completion; the completed set is
//! kept for the tracker's lifetime.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use gstore_log::{CommandBatch, TxId};
use std::collections::BTreeSet;

#[derive(Debug, Default)]
struct ChainState {
    first_seen: bool,
    /// Number of chunks, known once the last batch has been seen.
    chunk_count: Option<u32>,
    chunks: BTreeSet<u32>,
}

impl ChainState {
    fn record(&mut self, chunk_index: u32, is_first: bool, is_last: bool) {
        self.first_seen |= is_first;
        if is_last {
            self.chunk_count = Some(chunk_index + 1);
        }
        self.chunks.insert(chunk_index);
    }

    fn is_complete(&self) -> bool {
        self.first_seen
            && self
                .chunk_count
                .is_some_and(|count| self.chunks.len() as u64 == u64::from(count))
    }
}

/// Tracks which transactions have had all of their batches recorded.
///
/// Safe to share between appliers: per-transaction transitions happen
/// under the map entry for that id, with no global lock.
#[derive(Debug, Default)]
pub struct TransactionIdTracker {
    partial: DashMap<TxId, ChainState>,
    completed: DashSet<TxId>,
}

impl TransactionIdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a batch. Returns whether its transaction is now complete.
    pub fn track_batch(&self, batch: &CommandBatch) -> bool {
        self.track(
            batch.tx_id(),
            batch.chunk_index(),
            batch.is_first(),
            batch.is_last(),
        )
    }

    /// Records one chunk of a transaction.
    pub fn track(&self, tx_id: TxId, chunk_index: u32, is_first: bool, is_last: bool) -> bool {
        if self.completed.contains(&tx_id) {
            return true;
        }

        match self.partial.entry(tx_id) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().record(chunk_index, is_first, is_last);
                if entry.get().is_complete() {
                    // Publish completion before the partial state disappears.
                    self.completed.insert(tx_id);
                    entry.remove();
                    return true;
                }
                false
            }
            Entry::Vacant(entry) => {
                // Another applier may have completed it while we waited.
                if self.completed.contains(&tx_id) {
                    return true;
                }
                let mut state = ChainState::default();
                state.record(chunk_index, is_first, is_last);
                if state.is_complete() {
                    self.completed.insert(tx_id);
                    return true;
                }
                entry.insert(state);
                false
            }
        }
    }

    pub fn is_completed_transaction(&self, tx_id: TxId) -> bool {
        self.completed.contains(&tx_id)
    }

    /// Number of transactions with batches recorded but not yet complete.
    pub fn pending_count(&self) -> usize {
        self.partial.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    /// (chunk_index, is_first, is_last) for each batch of an n-batch chain.
    fn chain(n: u32) -> Vec<(u32, bool, bool)> {
        (0..n).map(|i| (i, i == 0, i == n - 1)).collect()
    }

    #[test]
    fn test_single_batch_completes_immediately() {
        let tracker = TransactionIdTracker::new();
        assert!(tracker.track(5, 0, true, true));
        assert!(tracker.is_completed_transaction(5));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_intermediate_batches_never_complete() {
        let tracker = TransactionIdTracker::new();
        assert!(!tracker.track(9, 1, false, false));
        assert!(!tracker.track(9, 2, false, false));
        assert!(!tracker.is_completed_transaction(9));
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn test_last_before_first() {
        let tracker = TransactionIdTracker::new();
        assert!(!tracker.track(3, 1, false, true));
        assert!(tracker.track(3, 0, true, false));
        assert!(tracker.is_completed_transaction(3));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_first_and_last_without_middle_is_incomplete() {
        let tracker = TransactionIdTracker::new();
        tracker.track(4, 0, true, false);
        tracker.track(4, 2, false, true);
        assert!(!tracker.is_completed_transaction(4));
        assert!(tracker.track(4, 1, false, false));
    }

    #[test]
    fn test_completion_is_monotonic() {
        let tracker = TransactionIdTracker::new();
        tracker.track(1, 0, true, true);
        assert!(tracker.track(1, 0, true, false));
        assert!(tracker.is_completed_transaction(1));
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.completed_count(), 1);
    }

    #[test]
    fn test_concurrent_appliers() {
        let tracker = Arc::new(TransactionIdTracker::new());
        let handles: Vec<_> = (0..4u32)
            .map(|worker| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for tx in 0..200u64 {
                        tracker.track(tx, worker, worker == 0, worker == 3);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.completed_count(), 200);
        assert_eq!(tracker.pending_count(), 0);
    }

    fn permuted_chain() -> impl Strategy<Value = Vec<(u32, bool, bool)>> {
        (1u32..8).prop_flat_map(|n| Just(chain(n)).prop_shuffle())
    }

    proptest! {
        #[test]
        fn prop_complete_only_after_all_batches(batches in permuted_chain()) {
            let tracker = TransactionIdTracker::new();
            let n = batches.len();
            for (i, (chunk, first, last)) in batches.into_iter().enumerate() {
                let complete = tracker.track(77, chunk, first, last);
                prop_assert_eq!(complete, i == n - 1);
                prop_assert_eq!(tracker.is_completed_transaction(77), i == n - 1);
            }
        }

        #[test]
        fn prop_any_missing_batch_leaves_incomplete(
            (batches, skip) in permuted_chain().prop_flat_map(|b| {
                let len = b.len();
                (Just(b), 0..len)
            })
        ) {
            let tracker = TransactionIdTracker::new();
            for (i, (chunk, first, last)) in batches.into_iter().enumerate() {
                if i != skip {
                    tracker.track(11, chunk, first, last);
                }
            }
            prop_assert!(!tracker.is_completed_transaction(11));
        }
    }
}
