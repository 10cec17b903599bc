use loro::{
    ExportMode, LoroDoc, LoroMap, LoroText, LoroValue, ToJson, ValueOrContainer, VersionVector,
};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

use super::source::Source;

// Root containers
const SOURCE: &str = "source";
const STATE: &str = "state";
const CELLS: &str = "cells";
const META: &str = "meta";
const DIRTY: &str = "dirty";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("CRDT operation failed: {0}")]
    Crdt(String),
    #[error("failed to export document state: {0}")]
    Export(String),
    #[error("invalid version vector: {0}")]
    Version(String),
    #[error("document content is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn crdt_err(e: impl std::fmt::Display) -> DocumentError {
    DocumentError::Crdt(e.to_string())
}

pub type SubscriptionId = u64;

/// Notification raised after the document has been mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentChange {
    /// Value of the shared `dirty` flag after the mutation.
    pub dirty: bool,
}

type Observer = Arc<dyn Fn(&DocumentChange) + Send + Sync>;

/// The document schemas a room can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// Plain text kept in a single text container.
    File,
    /// nbformat notebook with one map per cell.
    Notebook,
}

impl DocumentKind {
    /// Map a room's type tag to a schema. Unknown tags are treated as plain files.
    pub fn for_type(file_type: &str) -> Self {
        match file_type {
            "notebook" => DocumentKind::Notebook,
            "file" | "unicode" => DocumentKind::File,
            other => {
                debug!("Unknown document type '{}', using plain file", other);
                DocumentKind::File
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::File => "file",
            DocumentKind::Notebook => "notebook",
        }
    }
}

/// A shared document backed by a Loro CRDT.
///
/// Exposes the file-level `source`, a replicated `dirty` flag and an explicit
/// observer list notified after local or remote mutations.
pub struct Document {
    kind: DocumentKind,
    doc: LoroDoc,
    observers: Mutex<Vec<(SubscriptionId, Observer)>>,
    next_subscription: AtomicU64,
}

impl Document {
    pub fn new(kind: DocumentKind) -> Self {
        Self {
            kind,
            doc: LoroDoc::new(),
            observers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn for_type(file_type: &str) -> Self {
        Self::new(DocumentKind::for_type(file_type))
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn source(&self) -> Source {
        match self.kind {
            DocumentKind::File => Source::Text(self.doc.get_text(SOURCE).to_string()),
            DocumentKind::Notebook => Source::Json(notebook::read(&self.doc)),
        }
    }

    /// Replace the whole content. Returns the encoded update so it can be
    /// forwarded to peers and persisted.
    pub fn set_source(&self, source: &Source) -> Result<Vec<u8>, DocumentError> {
        let before = self.doc.oplog_vv();
        match (self.kind, source) {
            (DocumentKind::File, Source::Text(text)) => replace_text(&self.doc.get_text(SOURCE), text)?,
            (DocumentKind::File, Source::Json(value)) => {
                replace_text(&self.doc.get_text(SOURCE), &serde_json::to_string_pretty(value)?)?
            }
            (DocumentKind::Notebook, Source::Json(value)) => notebook::write(&self.doc, value)?,
            (DocumentKind::Notebook, Source::Text(text)) => {
                let value: Value = serde_json::from_str(text)?;
                notebook::write(&self.doc, &value)?
            }
        }
        self.doc.commit();
        let update = self.export_since(&before)?;
        self.notify();
        Ok(update)
    }

    pub fn dirty(&self) -> bool {
        matches!(
            self.doc.get_map(STATE).get(DIRTY),
            Some(ValueOrContainer::Value(LoroValue::Bool(true)))
        )
    }

    /// Set the shared dirty flag. Observers are not notified.
    pub fn set_dirty(&self, dirty: bool) -> Result<Vec<u8>, DocumentError> {
        let before = self.doc.oplog_vv();
        self.doc
            .get_map(STATE)
            .insert(DIRTY, dirty)
            .map_err(crdt_err)?;
        self.doc.commit();
        self.export_since(&before)
    }

    /// Encoded version vector, sent as the payload of a sync step 1.
    pub fn version(&self) -> Vec<u8> {
        self.doc.oplog_vv().encode()
    }

    /// Merge an update received from a peer.
    ///
    /// Marks the document dirty when the update changed its content, then
    /// notifies observers if anything new was imported. Returns the local
    /// update produced by marking it dirty, empty if there was none; peers
    /// need it before any later server change.
    pub fn apply_update(&self, update: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let before_version = self.doc.oplog_vv();
        let before_source = self.source();
        self.doc.import(update).map_err(crdt_err)?;
        if self.doc.oplog_vv() == before_version {
            return Ok(Vec::new());
        }
        let marked = if !self.dirty() && self.source() != before_source {
            self.set_dirty(true)?
        } else {
            Vec::new()
        };
        self.notify();
        Ok(marked)
    }

    /// Merge stored history without touching the dirty flag or observers.
    pub fn import_history(&self, update: &[u8]) -> Result<(), DocumentError> {
        self.doc.import(update).map_err(crdt_err)?;
        Ok(())
    }

    /// Full state snapshot, used as a new baseline for the update log.
    pub fn encode_state_as_update(&self) -> Result<Vec<u8>, DocumentError> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Export(e.to_string()))
    }

    /// Updates a peer at `remote_version` is missing. An empty version means
    /// the peer has nothing.
    pub fn encode_diff(&self, remote_version: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let remote = if remote_version.is_empty() {
            VersionVector::default()
        } else {
            VersionVector::decode(remote_version).map_err(|e| DocumentError::Version(e.to_string()))?
        };
        self.export_since(&remote)
    }

    fn export_since(&self, version: &VersionVector) -> Result<Vec<u8>, DocumentError> {
        self.doc
            .export(ExportMode::updates(version))
            .map_err(|e| DocumentError::Export(e.to_string()))
    }

    pub fn observe(&self, observer: impl Fn(&DocumentChange) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.lock_observers().push((id, Arc::new(observer)));
        id
    }

    pub fn unobserve(&self, id: SubscriptionId) -> bool {
        let mut observers = self.lock_observers();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.lock_observers().len()
    }

    fn notify(&self) {
        // Observers may spawn tasks or touch the document; call them outside the lock.
        let observers: Vec<Observer> = self.lock_observers().iter().map(|(_, o)| o.clone()).collect();
        if observers.is_empty() {
            return;
        }
        let change = DocumentChange { dirty: self.dirty() };
        for observer in observers {
            observer(&change);
        }
    }

    fn lock_observers(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Observer)>> {
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn replace_text(text: &LoroText, content: &str) -> Result<(), DocumentError> {
    let len = text.len_unicode();
    if len > 0 {
        text.delete(0, len).map_err(crdt_err)?;
    }
    if !content.is_empty() {
        text.insert(0, content).map_err(crdt_err)?;
    }
    Ok(())
}

mod notebook {
    //! Notebooks are stored as a `cells` list of maps plus a `meta` map.
    //! Cell sources are text containers so concurrent edits merge per character;
    //! metadata and outputs are opaque JSON strings.

    use super::*;

    const DEFAULT_NBFORMAT: i64 = 4;
    const DEFAULT_NBFORMAT_MINOR: i64 = 5;

    pub(super) fn write(doc: &LoroDoc, notebook: &Value) -> Result<(), DocumentError> {
        let cells = doc.get_list(CELLS);
        let len = cells.len();
        if len > 0 {
            cells.delete(0, len).map_err(crdt_err)?;
        }
        let new_cells = notebook
            .get("cells")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for (index, cell) in new_cells.iter().enumerate() {
            let map = cells.insert_container(index, LoroMap::new()).map_err(crdt_err)?;
            write_cell(&map, cell)?;
        }

        let meta = doc.get_map(META);
        let nbformat = notebook.get("nbformat").and_then(Value::as_i64).unwrap_or(DEFAULT_NBFORMAT);
        let nbformat_minor = notebook
            .get("nbformat_minor")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_NBFORMAT_MINOR);
        meta.insert("nbformat", nbformat).map_err(crdt_err)?;
        meta.insert("nbformat_minor", nbformat_minor).map_err(crdt_err)?;
        meta.insert("metadata", json_field(notebook.get("metadata"), json!({}))?)
            .map_err(crdt_err)?;
        Ok(())
    }

    fn write_cell(map: &LoroMap, cell: &Value) -> Result<(), DocumentError> {
        let cell_type = cell.get("cell_type").and_then(Value::as_str).unwrap_or("code");
        map.insert("cell_type", cell_type).map_err(crdt_err)?;
        if let Some(id) = cell.get("id").and_then(Value::as_str) {
            map.insert("id", id).map_err(crdt_err)?;
        }

        let text = map.insert_container("source", LoroText::new()).map_err(crdt_err)?;
        let source = join_source(cell.get("source"));
        if !source.is_empty() {
            text.insert(0, &source).map_err(crdt_err)?;
        }

        map.insert("metadata", json_field(cell.get("metadata"), json!({}))?)
            .map_err(crdt_err)?;
        if cell_type == "code" {
            map.insert("outputs", json_field(cell.get("outputs"), json!([]))?)
                .map_err(crdt_err)?;
            let count = match cell.get("execution_count").and_then(Value::as_i64) {
                Some(n) => LoroValue::from(n),
                None => LoroValue::Null,
            };
            map.insert("execution_count", count).map_err(crdt_err)?;
        }
        if let Some(attachments) = cell.get("attachments") {
            map.insert("attachments", serde_json::to_string(attachments)?)
                .map_err(crdt_err)?;
        }
        Ok(())
    }

    pub(super) fn read(doc: &LoroDoc) -> Value {
        let root = doc.get_deep_value().to_json_value();
        let cells: Vec<Value> = root
            .get(CELLS)
            .and_then(Value::as_array)
            .map(|cells| cells.iter().map(read_cell).collect())
            .unwrap_or_default();
        let meta = root.get(META);
        let field = |key: &str| meta.and_then(|m| m.get(key));

        json!({
            "cells": cells,
            "metadata": parse_json_field(field("metadata"), json!({})),
            "nbformat": field("nbformat").and_then(Value::as_i64).unwrap_or(DEFAULT_NBFORMAT),
            "nbformat_minor": field("nbformat_minor").and_then(Value::as_i64).unwrap_or(DEFAULT_NBFORMAT_MINOR),
        })
    }

    fn read_cell(stored: &Value) -> Value {
        let mut cell = Map::new();
        let cell_type = stored.get("cell_type").and_then(Value::as_str).unwrap_or("code");
        cell.insert("cell_type".into(), json!(cell_type));
        if let Some(id) = stored.get("id") {
            cell.insert("id".into(), id.clone());
        }
        let source = stored.get("source").and_then(Value::as_str).unwrap_or_default();
        cell.insert("source".into(), json!(source));
        cell.insert(
            "metadata".into(),
            parse_json_field(stored.get("metadata"), json!({})),
        );
        if cell_type == "code" {
            cell.insert("outputs".into(), parse_json_field(stored.get("outputs"), json!([])));
            let count = stored.get("execution_count").cloned().unwrap_or(Value::Null);
            cell.insert("execution_count".into(), count);
        }
        if let Some(attachments) = stored.get("attachments") {
            cell.insert("attachments".into(), parse_json_field(Some(attachments), json!({})));
        }
        Value::Object(cell)
    }

    /// nbformat allows a cell source to be a list of lines.
    pub(crate) fn join_source(source: Option<&Value>) -> String {
        match source {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(lines)) => lines.iter().filter_map(Value::as_str).collect(),
            _ => String::new(),
        }
    }

    fn json_field(value: Option<&Value>, default: Value) -> Result<String, DocumentError> {
        Ok(serde_json::to_string(value.unwrap_or(&default))?)
    }

    fn parse_json_field(value: Option<&Value>, default: Value) -> Value {
        value
            .and_then(Value::as_str)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(default)
    }
}

pub(crate) use notebook::join_source;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn sample_notebook() -> Value {
        json!({
            "cells": [
                {
                    "cell_type": "markdown",
                    "id": "intro",
                    "metadata": {},
                    "source": "# Title"
                },
                {
                    "cell_type": "code",
                    "id": "run",
                    "execution_count": 3,
                    "metadata": {"tags": ["x"]},
                    "outputs": [{"output_type": "stream", "name": "stdout", "text": "1\n"}],
                    "source": "print(1)"
                }
            ],
            "metadata": {"kernelspec": {"name": "python3"}},
            "nbformat": 4,
            "nbformat_minor": 5
        })
    }

    #[test]
    fn unknown_type_falls_back_to_file() {
        assert_eq!(DocumentKind::for_type("notebook"), DocumentKind::Notebook);
        assert_eq!(DocumentKind::for_type("unicode"), DocumentKind::File);
        assert_eq!(DocumentKind::for_type("blob"), DocumentKind::File);
    }

    #[test]
    fn file_source_replaces_text() {
        let doc = Document::for_type("file");
        doc.set_source(&Source::from("hello")).unwrap();
        doc.set_source(&Source::from("bye")).unwrap();
        assert_eq!(doc.source(), Source::from("bye"));
    }

    #[test]
    fn notebook_source_reads_back_equal() {
        let doc = Document::for_type("notebook");
        let nb = sample_notebook();
        doc.set_source(&Source::Json(nb.clone())).unwrap();
        assert_eq!(doc.source(), Source::Json(nb));
    }

    #[test]
    fn notebook_line_sources_are_joined() {
        let doc = Document::for_type("notebook");
        doc.set_source(&Source::Json(json!({
            "cells": [{"cell_type": "raw", "metadata": {}, "source": ["a\n", "b"]}],
            "metadata": {},
            "nbformat": 4,
            "nbformat_minor": 5
        })))
        .unwrap();
        let source = doc.source();
        assert_eq!(source.as_json().unwrap()["cells"][0]["source"], json!("a\nb"));
    }

    #[test]
    fn dirty_flag_round_trips() {
        let doc = Document::for_type("file");
        assert!(!doc.dirty());
        doc.set_dirty(true).unwrap();
        assert!(doc.dirty());
        doc.set_dirty(false).unwrap();
        assert!(!doc.dirty());
    }

    #[test]
    fn remote_edit_marks_dirty_and_notifies() {
        let server = Document::for_type("file");
        server.set_source(&Source::from("abc")).unwrap();

        let client = Document::for_type("file");
        client.apply_update(&server.encode_diff(&[]).unwrap()).unwrap();
        client.set_source(&Source::from("abcd")).unwrap();
        let update = client.encode_diff(&server.version()).unwrap();
        assert!(!update.is_empty());

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = server.observe(move |change| {
            assert!(change.dirty);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let marked = server.apply_update(&update).unwrap();
        assert!(!marked.is_empty());

        assert_eq!(server.source(), Source::from("abcd"));
        assert!(server.dirty());
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // Same update again imports nothing new.
        assert!(server.apply_update(&update).unwrap().is_empty());
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(server.unobserve(id));
        assert!(!server.unobserve(id));
        assert_eq!(server.observer_count(), 0);
    }

    #[test]
    fn diff_against_peer_version_brings_it_up_to_date() {
        let server = Document::for_type("notebook");
        server.set_source(&Source::Json(sample_notebook())).unwrap();

        let peer = Document::for_type("notebook");
        let diff = server.encode_diff(&peer.version()).unwrap();
        peer.apply_update(&diff).unwrap();
        assert_eq!(peer.source(), server.source());
    }

    #[test]
    fn snapshot_restores_into_fresh_document() {
        let doc = Document::for_type("file");
        doc.set_source(&Source::from("persisted")).unwrap();
        let snapshot = doc.encode_state_as_update().unwrap();

        let restored = Document::for_type("file");
        restored.import_history(&snapshot).unwrap();
        assert_eq!(restored.source(), Source::from("persisted"));
        assert!(!restored.dirty());
    }

    #[test]
    fn garbage_update_is_rejected() {
        let doc = Document::for_type("file");
        assert!(doc.apply_update(&[1, 2, 3, 4]).is_err());
        assert!(doc.encode_diff(&[0xff, 0xff, 0xff]).is_err());
    }
}
