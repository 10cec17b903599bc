//! Append-only logs of CRDT updates, one per persistent room.
//!
//! The file format is a sequence of records, each a little-endian `u32`
//! length followed by that many bytes of encoded update.

use futures_util::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::models::{Document, DocumentError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no update history at {0}")]
    NotFound(String),
    #[error("corrupt update log at {location}: {reason}")]
    Corrupt { location: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

pub trait UpdateStore: Send + Sync {
    fn location(&self) -> &str;

    /// Replay the stored history into `document`. Fails with
    /// [`StoreError::NotFound`] when nothing has been stored yet.
    fn apply_updates<'a>(&'a self, document: &'a Document) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Replace the history with a snapshot of `document`'s current state.
    fn encode_state_as_update<'a>(&'a self, document: &'a Document) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Append one update.
    fn write<'a>(&'a self, update: &'a [u8]) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// Opens the update store bound to a log location.
pub trait UpdateStoreProvider: Send + Sync {
    fn open(&self, location: &str) -> Arc<dyn UpdateStore>;
}

fn encode_record(out: &mut Vec<u8>, update: &[u8]) {
    out.extend_from_slice(&(update.len() as u32).to_le_bytes());
    out.extend_from_slice(update);
}

fn decode_records<'b>(location: &str, mut bytes: &'b [u8]) -> Result<Vec<&'b [u8]>, StoreError> {
    let corrupt = |reason: &str| StoreError::Corrupt {
        location: location.to_string(),
        reason: reason.to_string(),
    };
    let mut records = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 4 {
            return Err(corrupt("truncated record header"));
        }
        let (header, rest) = bytes.split_at(4);
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if rest.len() < len {
            return Err(corrupt("truncated record body"));
        }
        let (record, rest) = rest.split_at(len);
        records.push(record);
        bytes = rest;
    }
    Ok(records)
}

/// Update log kept in a file next to the document it belongs to.
pub struct FileUpdateStore {
    location: String,
    path: PathBuf,
    // Appends and snapshot rewrites must not interleave.
    lock: tokio::sync::Mutex<()>,
}

impl FileUpdateStore {
    pub fn new(location: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn replay(&self, document: &Document) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.location.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let records = decode_records(&self.location, &bytes)?;
        if records.is_empty() {
            return Err(StoreError::NotFound(self.location.clone()));
        }
        for record in &records {
            document.import_history(record)?;
        }
        debug!("Replayed {} updates from {}", records.len(), self.location);
        Ok(())
    }

    async fn snapshot(&self, document: &Document) -> Result<(), StoreError> {
        let snapshot = document.encode_state_as_update()?;
        let mut body = Vec::with_capacity(snapshot.len() + 4);
        encode_record(&mut body, &snapshot);

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("y.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        info!("Wrote update log baseline {} ({} bytes)", self.location, snapshot.len());
        Ok(())
    }

    async fn append(&self, update: &[u8]) -> Result<(), StoreError> {
        let mut record = Vec::with_capacity(update.len() + 4);
        encode_record(&mut record, update);

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&record).await?;
        file.flush().await?;
        Ok(())
    }
}

impl UpdateStore for FileUpdateStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn apply_updates<'a>(&'a self, document: &'a Document) -> BoxFuture<'a, Result<(), StoreError>> {
        self.replay(document).boxed()
    }

    fn encode_state_as_update<'a>(&'a self, document: &'a Document) -> BoxFuture<'a, Result<(), StoreError>> {
        self.snapshot(document).boxed()
    }

    fn write<'a>(&'a self, update: &'a [u8]) -> BoxFuture<'a, Result<(), StoreError>> {
        self.append(update).boxed()
    }
}

/// Places update logs under the content root, mirroring the document paths.
pub struct FileUpdateStoreProvider {
    root: PathBuf,
}

impl FileUpdateStoreProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl UpdateStoreProvider for FileUpdateStoreProvider {
    fn open(&self, location: &str) -> Arc<dyn UpdateStore> {
        let path = self.root.join(location.trim_start_matches('/'));
        Arc::new(FileUpdateStore::new(location, path))
    }
}

type SharedLogs = Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>;

/// In-process update logs. Stores opened for the same location share history.
#[derive(Default, Clone)]
pub struct MemoryUpdateStoreProvider {
    logs: SharedLogs,
}

impl MemoryUpdateStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the history at `location`.
    pub fn seed(&self, location: &str, updates: Vec<Vec<u8>>) {
        lock_logs(&self.logs).insert(location.to_string(), updates);
    }

    pub fn history(&self, location: &str) -> Option<Vec<Vec<u8>>> {
        lock_logs(&self.logs).get(location).cloned()
    }
}

impl UpdateStoreProvider for MemoryUpdateStoreProvider {
    fn open(&self, location: &str) -> Arc<dyn UpdateStore> {
        Arc::new(MemoryUpdateStore {
            location: location.to_string(),
            logs: self.logs.clone(),
        })
    }
}

fn lock_logs(logs: &SharedLogs) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Vec<u8>>>> {
    logs.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct MemoryUpdateStore {
    location: String,
    logs: SharedLogs,
}

impl MemoryUpdateStore {
    fn replay(&self, document: &Document) -> Result<(), StoreError> {
        let records = lock_logs(&self.logs)
            .get(&self.location)
            .filter(|records| !records.is_empty())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(self.location.clone()))?;
        for record in &records {
            document.import_history(record)?;
        }
        Ok(())
    }

    fn snapshot(&self, document: &Document) -> Result<(), StoreError> {
        let snapshot = document.encode_state_as_update()?;
        lock_logs(&self.logs).insert(self.location.clone(), vec![snapshot]);
        Ok(())
    }
}

impl UpdateStore for MemoryUpdateStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn apply_updates<'a>(&'a self, document: &'a Document) -> BoxFuture<'a, Result<(), StoreError>> {
        futures_util::future::ready(self.replay(document)).boxed()
    }

    fn encode_state_as_update<'a>(&'a self, document: &'a Document) -> BoxFuture<'a, Result<(), StoreError>> {
        futures_util::future::ready(self.snapshot(document)).boxed()
    }

    fn write<'a>(&'a self, update: &'a [u8]) -> BoxFuture<'a, Result<(), StoreError>> {
        lock_logs(&self.logs)
            .entry(self.location.clone())
            .or_default()
            .push(update.to_vec());
        futures_util::future::ready(Ok(())).boxed()
    }
}
