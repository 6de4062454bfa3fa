//! Valid-tail computation over the most-recent-first batch stream.
//!
//! A transaction whose newest batch is not its last one never completed
//! and is dangling. Dangling batches at the very end of the log are cut
//! off; dangling batches interleaved with committed ones stay in place and
//! are skipped on replay, so a committed transaction is never cut.

use crate::error::RecoveryError;
use gstore_log::{CommandBatch, LogPosition, ReversedBatchCursor, TailCorruption, TxId};
use std::collections::{HashMap, HashSet};

/// Outcome of the reverse pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidTail {
    /// Where the log should end.
    pub position: LogPosition,
    /// Batches before `position` that belong to complete transactions,
    /// i.e. the ones to replay.
    pub batches: usize,
    /// Transactions whose last batch lies before `position`.
    pub transactions: usize,
    /// Transactions left open by the crash, skipped on replay.
    pub incomplete: Vec<TxId>,
    /// Why the readable log ends where it does, if not cleanly.
    pub corruption: Option<TailCorruption>,
}

impl ValidTail {
    /// Whether a batch of `tx_id` is replayed.
    pub fn replays(&self, tx_id: TxId) -> bool {
        self.incomplete.binary_search(&tx_id).is_err()
    }
}

struct SeenBatch {
    tx_id: TxId,
    start: LogPosition,
    is_last: bool,
}

/// Walks `cursor` from newest to oldest batch, calling `visit` for each.
///
/// `start` is where the cursor was opened. The returned position is never
/// past the readable end of the log, and may lie before `start` when the
/// file at `start` has no readable header.
pub fn compute_valid_tail(
    start: LogPosition,
    mut cursor: ReversedBatchCursor,
    mut visit: impl FnMut(&CommandBatch) -> Result<(), RecoveryError>,
) -> Result<ValidTail, RecoveryError> {
    let readable_end = cursor.valid_position();
    let corruption = cursor.corruption().cloned();

    // Transactions seen whose first batch has not been reached yet.
    let mut awaiting_first: HashMap<TxId, LogPosition> = HashMap::new();
    let mut seen: HashSet<TxId> = HashSet::new();
    let mut dangling: HashSet<TxId> = HashSet::new();
    // Newest first.
    let mut batches: Vec<SeenBatch> = Vec::new();

    while let Some(batch) = cursor
        .next_batch()
        .map_err(RecoveryError::read_log(start))?
    {
        visit(&batch)?;

        let tx_id = batch.tx_id();
        if seen.insert(tx_id) && !batch.is_last() {
            dangling.insert(tx_id);
        }
        if batch.is_first() {
            awaiting_first.remove(&tx_id);
        } else {
            awaiting_first
                .entry(tx_id)
                .or_insert(batch.start_position);
        }

        batches.push(SeenBatch {
            tx_id,
            start: batch.start_position,
            is_last: batch.is_last(),
        });
    }

    if let Some((&tx_id, &position)) = awaiting_first.iter().min_by_key(|(_, p)| **p) {
        return Err(RecoveryError::InconsistentChain {
            tx_id,
            position,
            reason: format!("no first batch at or after {}", start),
        });
    }

    // Cut before the run of dangling batches that ends the log, if any.
    let position = batches
        .iter()
        .take_while(|b| dangling.contains(&b.tx_id))
        .last()
        .map_or(readable_end, |b| b.start);

    let kept = batches
        .iter()
        .filter(|b| b.start < position && !dangling.contains(&b.tx_id));
    let replayed = kept.clone().count();
    let transactions = kept.filter(|b| b.is_last).count();

    let mut incomplete: Vec<TxId> = dangling.into_iter().collect();
    incomplete.sort_unstable();

    Ok(ValidTail {
        position,
        batches: replayed,
        transactions,
        incomplete,
        corruption,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use gstore_log::{BatchDraft, LogFiles, LogWriter, StoreId};
    use tempfile::TempDir;

    fn cmd() -> Vec<Bytes> {
        vec![Bytes::from_static(b"c")]
    }

    fn tail(files: &LogFiles, start: LogPosition) -> Result<ValidTail, RecoveryError> {
        let cursor = ReversedBatchCursor::open(files, start).unwrap();
        compute_valid_tail(start, cursor, |_| Ok(()))
    }

    fn setup() -> (TempDir, LogFiles, LogWriter) {
        let dir = TempDir::new().unwrap();
        let files = LogFiles::new(dir.path(), "tx");
        let log = LogWriter::open(files.clone(), StoreId::new(1, 1)).unwrap();
        (dir, files, log)
    }

    #[test]
    fn test_clean_log_keeps_everything() {
        let (_dir, files, mut log) = setup();
        log.append_transaction(cmd()).unwrap();
        let last = log.append_transaction(cmd()).unwrap();
        let after_cp = log.check_point(last.end, "trailing").unwrap();

        let tail = tail(&files, LogPosition::start_of(0)).unwrap();
        assert_eq!(tail.position, after_cp);
        assert_eq!(tail.batches, 2);
        assert_eq!(tail.transactions, 2);
        assert!(tail.incomplete.is_empty());
    }

    #[test]
    fn test_dangling_chain_is_cut() {
        let (_dir, files, mut log) = setup();
        let done = log.append_transaction(cmd()).unwrap();
        let open = log.append_batch(BatchDraft::first(cmd())).unwrap();
        log.append_batch(BatchDraft::middle(open.tx_id, cmd()))
            .unwrap();

        let tail = tail(&files, LogPosition::start_of(0)).unwrap();
        assert_eq!(tail.position, done.end);
        assert_eq!(tail.batches, 1);
        assert_eq!(tail.incomplete, vec![open.tx_id]);
    }

    #[test]
    fn test_interleaved_committed_transaction_is_kept() {
        let (_dir, files, mut log) = setup();
        let a = log.append_batch(BatchDraft::first(cmd())).unwrap();
        let b = log.append_batch(BatchDraft::first(cmd())).unwrap();
        let a_last = log.append_batch(BatchDraft::last(a.tx_id, cmd())).unwrap();

        let tail = tail(&files, LogPosition::start_of(0)).unwrap();
        assert_eq!(tail.position, a_last.end);
        assert_eq!(tail.batches, 2);
        assert_eq!(tail.transactions, 1);
        assert_eq!(tail.incomplete, vec![b.tx_id]);
        assert!(tail.replays(a.tx_id));
        assert!(!tail.replays(b.tx_id));
    }

    #[test]
    fn test_trailing_dangling_batches_are_cut_behind_committed_one() {
        let (_dir, files, mut log) = setup();
        let b = log.append_batch(BatchDraft::first(cmd())).unwrap();
        let a = log.append_transaction(cmd()).unwrap();
        log.append_batch(BatchDraft::middle(b.tx_id, cmd()))
            .unwrap();

        let tail = tail(&files, LogPosition::start_of(0)).unwrap();
        assert_eq!(tail.position, a.end);
        assert_eq!(tail.batches, 1);
        assert_eq!(tail.incomplete, vec![b.tx_id]);
    }

    #[test]
    fn test_chain_started_before_start_is_inconsistent() {
        let (_dir, files, mut log) = setup();
        let a = log.append_batch(BatchDraft::first(cmd())).unwrap();
        let cut = log.current_position().unwrap();
        log.append_batch(BatchDraft::last(a.tx_id, cmd())).unwrap();

        assert!(matches!(
            tail(&files, cut),
            Err(RecoveryError::InconsistentChain { tx_id, .. }) if tx_id == a.tx_id
        ));
    }

    #[test]
    fn test_nothing_after_start() {
        let (_dir, files, mut log) = setup();
        let tx = log.append_transaction(cmd()).unwrap();
        let tail = tail(&files, tx.end).unwrap();
        assert_eq!(tail.position, tx.end);
        assert_eq!(tail.batches, 0);
    }
}
