use chrono::{DateTime, Duration, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::document::join_source;
use crate::models::Source;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("file '{0}' not found")]
    NotFound(String),
    #[error("path '{0}' escapes the content root")]
    InvalidPath(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON content: {0}")]
    Json(#[from] serde_json::Error),
}

/// A file as returned by the content store.
#[derive(Debug, Clone)]
pub struct ContentModel {
    /// `None` for metadata-only reads.
    pub content: Option<Source>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub content: Source,
    /// `json` or `text`
    pub format: String,
    pub path: String,
    pub file_type: String,
}

/// Read/write access to the files backing persistent rooms.
pub trait ContentStore: Send + Sync {
    /// Read `path`. With `full == false` only the timestamp is fetched, which
    /// must be cheap enough to call on every watch tick.
    fn read<'a>(
        &'a self,
        path: &'a str,
        full: bool,
        as_json: bool,
    ) -> BoxFuture<'a, Result<ContentModel, ContentError>>;

    fn write(&self, request: SaveRequest) -> BoxFuture<'_, Result<(), ContentError>>;

    /// On-disk location of `path`, when the store is backed by a local file system.
    fn local_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

/// Content store over a local directory.
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map an API path (`/a/b.ipynb`) below the root, rejecting `..` and absolute escapes.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ContentError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(ContentError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn read_file(&self, path: &str, full: bool, as_json: bool) -> Result<ContentModel, ContentError> {
        let fs_path = self.resolve(path)?;
        let metadata = match tokio::fs::metadata(&fs_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContentError::NotFound(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let last_modified: DateTime<Utc> = metadata.modified()?.into();

        let content = if full {
            let raw = tokio::fs::read_to_string(&fs_path).await?;
            Some(if as_json {
                let mut value: Value = serde_json::from_str(&raw)?;
                normalize_notebook(&mut value);
                Source::Json(value)
            } else {
                Source::Text(raw)
            })
        } else {
            None
        };

        Ok(ContentModel { content, last_modified })
    }

    async fn write_file(&self, request: SaveRequest) -> Result<(), ContentError> {
        let fs_path = self.resolve(&request.path)?;
        let body = request.content.to_file_string()?;
        if let Some(parent) = fs_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&fs_path, body).await?;
        info!("Saved {} ({}, {})", request.path, request.file_type, request.format);
        Ok(())
    }
}

impl ContentStore for FsContentStore {
    fn read<'a>(
        &'a self,
        path: &'a str,
        full: bool,
        as_json: bool,
    ) -> BoxFuture<'a, Result<ContentModel, ContentError>> {
        self.read_file(path, full, as_json).boxed()
    }

    fn write(&self, request: SaveRequest) -> BoxFuture<'_, Result<(), ContentError>> {
        self.write_file(request).boxed()
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        self.resolve(path).ok()
    }
}

/// Notebook cell sources may be stored as line lists; the shared document
/// always holds them as a single string.
pub fn normalize_notebook(notebook: &mut Value) {
    let Some(cells) = notebook.get_mut("cells").and_then(Value::as_array_mut) else {
        return;
    };
    for cell in cells {
        if let Some(source) = cell.get_mut("source") {
            if source.is_array() {
                let joined = join_source(Some(&*source));
                *source = Value::String(joined);
            }
        }
    }
}

/// In-process content store. Timestamps come from a clock that strictly
/// increases on every write.
#[derive(Default)]
pub struct MemoryContentStore {
    files: Mutex<HashMap<String, (Source, DateTime<Utc>)>>,
    clock: Mutex<Option<DateTime<Utc>>>,
    writes: AtomicUsize,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a file in place as an external writer would. Not counted as a save.
    pub fn insert(&self, path: &str, content: impl Into<Source>) -> DateTime<Utc> {
        let now = self.tick();
        self.lock_files().insert(path.to_string(), (content.into(), now));
        now
    }

    pub fn get(&self, path: &str) -> Option<Source> {
        self.lock_files().get(path).map(|(content, _)| content.clone())
    }

    /// Number of writes performed through [`ContentStore::write`].
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn tick(&self) -> DateTime<Utc> {
        let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let next = match *clock {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        *clock = Some(next);
        next
    }

    fn lock_files(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Source, DateTime<Utc>)>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ContentStore for MemoryContentStore {
    fn read<'a>(
        &'a self,
        path: &'a str,
        full: bool,
        as_json: bool,
    ) -> BoxFuture<'a, Result<ContentModel, ContentError>> {
        let result = match self.lock_files().get(path) {
            None => Err(ContentError::NotFound(path.to_string())),
            Some((content, last_modified)) => {
                let content = if full {
                    match (content, as_json) {
                        (Source::Text(raw), true) => serde_json::from_str::<Value>(raw)
                            .map(|mut v| {
                                normalize_notebook(&mut v);
                                Some(Source::Json(v))
                            })
                            .map_err(ContentError::from),
                        (content, _) => Ok(Some(content.clone())),
                    }
                } else {
                    Ok(None)
                };
                content.map(|content| ContentModel {
                    content,
                    last_modified: *last_modified,
                })
            }
        };
        futures_util::future::ready(result).boxed()
    }

    fn write(&self, request: SaveRequest) -> BoxFuture<'_, Result<(), ContentError>> {
        let now = self.tick();
        debug!("Memory store write to {}", request.path);
        self.lock_files().insert(request.path, (request.content, now));
        self.writes.fetch_add(1, Ordering::SeqCst);
        futures_util::future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fs_store_reads_and_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());
        store
            .write(SaveRequest {
                content: Source::from("hello"),
                format: "text".into(),
                path: "/sub/notes.txt".into(),
                file_type: "file".into(),
            })
            .await
            .unwrap();

        let model = store.read("/sub/notes.txt", true, false).await.unwrap();
        assert_eq!(model.content, Some(Source::from("hello")));

        let meta = store.read("/sub/notes.txt", false, false).await.unwrap();
        assert!(meta.content.is_none());
        assert_eq!(meta.last_modified, model.last_modified);
    }

    #[tokio::test]
    async fn fs_store_normalizes_notebook_line_sources() {
        let dir = tempfile::tempdir().unwrap();
        let nb = json!({
            "cells": [{"cell_type": "code", "source": ["x = 1\n", "x"], "metadata": {}, "outputs": [], "execution_count": null}],
            "metadata": {},
            "nbformat": 4,
            "nbformat_minor": 5
        });
        std::fs::write(dir.path().join("nb.ipynb"), nb.to_string()).unwrap();

        let store = FsContentStore::new(dir.path());
        let model = store.read("/nb.ipynb", true, true).await.unwrap();
        let content = model.content.unwrap();
        assert_eq!(content.as_json().unwrap()["cells"][0]["source"], json!("x = 1\nx"));
    }

    #[tokio::test]
    async fn fs_store_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());
        assert!(matches!(
            store.read("/../etc/passwd", false, false).await,
            Err(ContentError::InvalidPath(_))
        ));
        assert!(matches!(
            store.read("/missing.txt", false, false).await,
            Err(ContentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_timestamps_increase() {
        let store = MemoryContentStore::new();
        let first = store.insert("/a.txt", "one");
        store
            .write(SaveRequest {
                content: Source::from("two"),
                format: "text".into(),
                path: "/a.txt".into(),
                file_type: "file".into(),
            })
            .await
            .unwrap();
        let model = store.read("/a.txt", true, false).await.unwrap();
        assert!(model.last_modified > first);
        assert_eq!(model.content, Some(Source::from("two")));
        assert_eq!(store.write_count(), 1);
    }
}
