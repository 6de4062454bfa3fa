//! Transaction-id stores.
//!
//! Two implementations of [`TransactionIdStore`]:
//! - [`InMemoryTransactionIdStore`] for embedding and tests
//! - [`JsonTransactionIdStore`], a JSON file replaced atomically on update

use crate::collaborators::{ClosedTransaction, TransactionIdStore};
use crate::error::{BoxError, RecoveryError};
use gstore_log::{StoreId, TxId, BASE_TX_ID};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default file name of the JSON store inside the store directory.
pub const TX_ID_STORE_FILE: &str = "txid.json";

/// Persisted transaction-id state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionIdState {
    pub store_id: Option<StoreId>,
    pub last_committed_tx_id: TxId,
    pub last_closed: Option<ClosedTransaction>,
}

impl TransactionIdState {
    /// State of a store that has never committed anything.
    pub fn empty(store_id: Option<StoreId>) -> Self {
        Self {
            store_id,
            last_committed_tx_id: BASE_TX_ID,
            last_closed: None,
        }
    }

    fn close(&mut self, tx: ClosedTransaction) {
        self.last_committed_tx_id = self.last_committed_tx_id.max(tx.tx_id);
        self.last_closed = Some(tx);
    }
}

/// In-memory store. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryTransactionIdStore {
    state: Arc<Mutex<TransactionIdState>>,
}

impl InMemoryTransactionIdStore {
    pub fn new(store_id: Option<StoreId>) -> Self {
        Self::with_state(TransactionIdState::empty(store_id))
    }

    pub fn with_state(state: TransactionIdState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn state(&self) -> TransactionIdState {
        *self.state.lock()
    }
}

impl TransactionIdStore for InMemoryTransactionIdStore {
    fn last_committed_tx_id(&self) -> TxId {
        self.state.lock().last_committed_tx_id
    }

    fn last_closed_transaction(&self) -> Option<ClosedTransaction> {
        self.state.lock().last_closed
    }

    fn store_id(&self) -> Option<StoreId> {
        self.state.lock().store_id
    }

    fn set_last_closed_transaction(&mut self, tx: ClosedTransaction) -> Result<(), BoxError> {
        self.state.lock().close(tx);
        Ok(())
    }
}

/// JSON file store.
#[derive(Debug)]
pub struct JsonTransactionIdStore {
    path: PathBuf,
    state: TransactionIdState,
}

impl JsonTransactionIdStore {
    /// Opens the store at `path`, creating it with an empty state if absent.
    pub fn open(path: impl Into<PathBuf>, store_id: Option<StoreId>) -> Result<Self, RecoveryError> {
        let path = path.into();
        if path.exists() {
            let file = File::open(&path)?;
            let state: TransactionIdState = serde_json::from_reader(BufReader::new(file))
                .map_err(|e| RecoveryError::IdStore(Box::new(e)))?;
            return Ok(Self { path, state });
        }

        let store = Self {
            path,
            state: TransactionIdState::empty(store_id),
        };
        store.save().map_err(RecoveryError::IdStore)?;
        Ok(store)
    }

    /// Opens `txid.json` in the given store directory.
    pub fn open_in(store_dir: &Path, store_id: Option<StoreId>) -> Result<Self, RecoveryError> {
        Self::open(store_dir.join(TX_ID_STORE_FILE), store_id)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> TransactionIdState {
        self.state
    }

    /// Writes the state to a temporary file, syncs it, then renames it over
    /// the real file and syncs the directory.
    fn save(&self) -> Result<(), BoxError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &self.state)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        gstore_log::files::sync_dir(dir)?;
        Ok(())
    }
}

impl TransactionIdStore for JsonTransactionIdStore {
    fn last_committed_tx_id(&self) -> TxId {
        self.state.last_committed_tx_id
    }

    fn last_closed_transaction(&self) -> Option<ClosedTransaction> {
        self.state.last_closed
    }

    fn store_id(&self) -> Option<StoreId> {
        self.state.store_id
    }

    fn set_last_closed_transaction(&mut self, tx: ClosedTransaction) -> Result<(), BoxError> {
        let previous = self.state;
        self.state.close(tx);
        if let Err(e) = self.save() {
            self.state = previous;
            return Err(e);
        }
        tracing::debug!("Transaction id store updated: last closed tx {}", tx.tx_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gstore_log::LogPosition;
    use tempfile::TempDir;

    fn closed(tx_id: TxId) -> ClosedTransaction {
        ClosedTransaction {
            tx_id,
            checksum: 0xABCD,
            commit_timestamp: 1_700_000_000_000,
            position: LogPosition::new(1, 128),
        }
    }

    #[test]
    fn test_in_memory_clones_share_state() {
        let store = InMemoryTransactionIdStore::new(Some(StoreId::new(1, 2)));
        let mut handle = store.clone();
        handle.set_last_closed_transaction(closed(7)).unwrap();

        assert_eq!(store.last_committed_tx_id(), 7);
        assert_eq!(store.last_closed_transaction(), Some(closed(7)));
        assert_eq!(store.expected_log_version(), Some(1));
    }

    #[test]
    fn test_empty_state() {
        let store = InMemoryTransactionIdStore::new(None);
        assert_eq!(store.last_committed_tx_id(), BASE_TX_ID);
        assert_eq!(store.expected_log_version(), None);
        assert_eq!(store.store_id(), None);
    }

    #[test]
    fn test_json_store_persists() {
        let dir = TempDir::new().unwrap();
        let store_id = StoreId::new(10, 20);
        {
            let mut store = JsonTransactionIdStore::open_in(dir.path(), Some(store_id)).unwrap();
            assert!(store.path().exists());
            store.set_last_closed_transaction(closed(42)).unwrap();
        }

        let store = JsonTransactionIdStore::open_in(dir.path(), None).unwrap();
        assert_eq!(store.store_id(), Some(store_id));
        assert_eq!(store.last_committed_tx_id(), 42);
        assert_eq!(store.last_closed_transaction(), Some(closed(42)));
        assert!(!dir.path().join("txid.json.tmp").exists());
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(TX_ID_STORE_FILE), b"{not json").unwrap();
        assert!(matches!(
            JsonTransactionIdStore::open_in(dir.path(), None),
            Err(RecoveryError::IdStore(_))
        ));
    }
}
