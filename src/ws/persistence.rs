//! Keeps a document room and its backing file in step: debounced saves of
//! local changes and adoption of changes made to the file by someone else.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

use super::error::SyncError;
use super::hub::SyncHub;
use super::relay;
use super::room::{DocumentRoom, Room};
use crate::db::SaveRequest;
use crate::models::messages::{sync_frame, SyncStep};
use crate::models::{DocumentChange, DocumentPath};
use crate::utils::task_slot::TaskSlot;

/// File reconciliation state created by the connection that loaded a room.
///
/// Shared with the room's watcher task and change observer, so it keeps
/// working after that connection leaves.
pub struct Persistence {
    hub: Weak<SyncHub>,
    room: Weak<Room>,
    /// Last on-disk modification time this service has seen or produced.
    last_modified: Mutex<DateTime<Utc>>,
    saving: TaskSlot,
    /// Saves and reloads never interleave with each other.
    file_lock: tokio::sync::Mutex<()>,
}

/// Everything needed to touch the file a room is currently named after.
struct Target {
    hub: Arc<SyncHub>,
    room: Arc<Room>,
    path: DocumentPath,
}

impl Persistence {
    pub fn new(hub: &Arc<SyncHub>, room: &Arc<Room>, last_modified: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            hub: Arc::downgrade(hub),
            room: Arc::downgrade(room),
            last_modified: Mutex::new(last_modified),
            saving: TaskSlot::new(),
            file_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        *self.last_modified.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_last_modified(&self, value: DateTime<Utc>) {
        *self.last_modified.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }

    pub fn save_pending(&self) -> bool {
        self.saving.is_active()
    }

    /// `None` once the room is gone from the registry or renamed to
    /// something that is not a file.
    fn target(&self) -> Option<Target> {
        let hub = self.hub.upgrade()?;
        let room = self.room.upgrade()?;
        let name = hub.registry.resolve_name(&room)?;
        let path = DocumentPath::parse(&name)?;
        Some(Target { hub, room, path })
    }

    /// Observer for document changes: (re)start the save timer.
    pub fn on_document_change(self: &Arc<Self>, change: &DocumentChange) {
        if !change.dirty {
            return;
        }
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let delay = hub.settings.save_delay;
        let this = self.clone();
        // Replacing the slot only cancels the delay. A save that has started
        // runs detached so its write and mtime refresh are never split.
        self.saving.replace(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let saver = this.clone();
            let _ = tokio::spawn(async move { saver.maybe_save().await }).await;
        }));
    }

    pub async fn maybe_save(&self) {
        if let Err(e) = self.save().await {
            error!("Failed to save document: {}", e);
        }
    }

    async fn save(&self) -> Result<(), SyncError> {
        let _serialized = self.file_lock.lock().await;
        let Some(Target { hub, room, path }) = self.target() else {
            debug!("Room no longer resolvable, abandoning save");
            return Ok(());
        };
        let Some(doc_room) = room.as_document() else {
            return Ok(());
        };
        let document = &doc_room.document;

        let model = hub.contents.read(&path.path, true, path.is_notebook()).await?;
        let on_disk = model
            .content
            .ok_or_else(|| SyncError::MissingContent(path.path.clone()))?;

        if model.last_modified > self.last_modified() {
            // Someone else wrote the file while our save was pending: disk wins.
            info!("{} changed on disk, reverting pending changes", path.path);
            let cleared = document.set_dirty(false)?;
            publish(&room, doc_room, cleared).await;
            let update = document.set_source(&on_disk)?;
            self.set_last_modified(model.last_modified);
            publish(&room, doc_room, update).await;
            return Ok(());
        }

        let source = document.source();
        if source != on_disk {
            hub.contents
                .write(SaveRequest {
                    content: source,
                    format: path.save_format().to_string(),
                    path: path.path.clone(),
                    file_type: path.file_type.clone(),
                })
                .await?;
            let written = hub.contents.read(&path.path, false, false).await?;
            self.set_last_modified(written.last_modified);
        } else {
            debug!("{} unchanged on disk, skipping write", path.path);
        }

        let cleared = document.set_dirty(false)?;
        publish(&room, doc_room, cleared).await;
        Ok(())
    }

    /// Adopt the file's content if it was modified after what we last saw.
    pub async fn maybe_load(&self) {
        if let Err(e) = self.load().await {
            warn!("Failed to check file for external changes: {}", e);
        }
    }

    async fn load(&self) -> Result<(), SyncError> {
        let _serialized = self.file_lock.lock().await;
        let Some(Target { hub, room, path }) = self.target() else {
            return Ok(());
        };
        let Some(doc_room) = room.as_document() else {
            return Ok(());
        };

        let metadata = hub.contents.read(&path.path, false, false).await?;
        if metadata.last_modified <= self.last_modified() {
            // Unchanged, or saved by us.
            return Ok(());
        }

        let model = hub.contents.read(&path.path, true, path.is_notebook()).await?;
        let content = model
            .content
            .ok_or_else(|| SyncError::MissingContent(path.path.clone()))?;
        self.set_last_modified(model.last_modified);
        if content == doc_room.document.source() {
            debug!("{} touched without content changes", path.path);
            return Ok(());
        }
        info!("{} changed on disk, reloading", path.path);
        let update = doc_room.document.set_source(&content)?;
        publish(&room, doc_room, update).await;
        Ok(())
    }

    /// Start the room's watcher: file-system events when possible, polling otherwise.
    pub fn start_watcher(self: &Arc<Self>, doc_room: &DocumentRoom) {
        let Some(Target { hub, path, .. }) = self.target() else {
            return;
        };
        let settings = &hub.settings;

        #[cfg(feature = "watch-notify")]
        if settings.file_watch {
            if let Some(local) = hub.contents.local_path(&path.path) {
                match watch::spawn(self.clone(), local) {
                    Ok(handle) => {
                        debug!("Watching {} for changes", path.path);
                        doc_room.watcher.replace(handle);
                        return;
                    }
                    Err(e) => warn!("Cannot watch {}, falling back to polling: {}", path.path, e),
                }
            }
        }

        if settings.poll_interval.is_zero() {
            debug!("Polling disabled, not watching {}", path.path);
            return;
        }
        let interval = settings.poll_interval;
        let this = self.clone();
        doc_room.watcher.replace(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                this.maybe_load().await;
            }
        }));
    }
}

/// Forward a server-side change to every client and append it to the update log.
pub(crate) async fn publish(room: &Room, doc_room: &DocumentRoom, update: Vec<u8>) {
    if update.is_empty() {
        return;
    }
    relay::deliver_all(room, &sync_frame(SyncStep::Update, &update));
    if let Err(e) = doc_room.update_store.write(&update).await {
        warn!("Failed to append to update log {}: {}", doc_room.update_store.location(), e);
    }
}

#[cfg(feature = "watch-notify")]
mod watch {
    use notify::{RecursiveMode, Watcher};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use super::Persistence;

    /// Watch the file's directory (so replace-by-rename saves are seen) and
    /// check the file whenever an event names it.
    pub(super) fn spawn(persistence: Arc<Persistence>, file: PathBuf) -> Result<JoinHandle<()>, notify::Error> {
        let dir = file
            .parent()
            .map(PathBuf::from)
            .ok_or_else(|| notify::Error::generic("file has no parent directory"))?;
        let file_name = file.file_name().map(|n| n.to_os_string());

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else { return };
            if event.kind.is_access() {
                return;
            }
            let ours = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if ours {
                let _ = tx.send(());
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        Ok(tokio::spawn(async move {
            // Dropping the watcher stops the events.
            let _watcher = watcher;
            while rx.recv().await.is_some() {
                while rx.try_recv().is_ok() {}
                persistence.maybe_load().await;
            }
        }))
    }
}
