use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::connctx::{ClientHandle, ConnId};
use crate::db::UpdateStore;
use crate::models::{Document, SubscriptionId};
use crate::utils::task_slot::TaskSlot;

/// One shared document's live state.
pub struct Room {
    name: Mutex<String>,
    kind: RoomKind,
    clients: Mutex<HashMap<ConnId, ClientHandle>>,
}

pub enum RoomKind {
    /// Ephemeral shared state such as presence. Nothing is stored.
    Transient,
    Document(DocumentRoom),
}

/// Parts of a room that only exist when it is backed by a file.
pub struct DocumentRoom {
    pub file_type: String,
    pub document: Arc<Document>,
    pub update_store: Arc<dyn UpdateStore>,
    ready: AtomicBool,
    sync_lock: tokio::sync::Mutex<()>,
    pub watcher: TaskSlot,
    pub cleaner: TaskSlot,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl Room {
    pub fn transient(name: &str) -> Self {
        Self::with_kind(name, RoomKind::Transient)
    }

    pub fn document(name: &str, file_type: &str, update_store: Arc<dyn UpdateStore>) -> Self {
        Self::with_kind(
            name,
            RoomKind::Document(DocumentRoom {
                file_type: file_type.to_string(),
                document: Arc::new(Document::for_type(file_type)),
                update_store,
                ready: AtomicBool::new(false),
                sync_lock: tokio::sync::Mutex::new(()),
                watcher: TaskSlot::new(),
                cleaner: TaskSlot::new(),
                subscription: Mutex::new(None),
            }),
        )
    }

    fn with_kind(name: &str, kind: RoomKind) -> Self {
        Self {
            name: Mutex::new(name.to_string()),
            kind,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Last name assigned by the registry.
    pub fn name(&self) -> String {
        lock(&self.name).clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *lock(&self.name) = name.to_string();
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind, RoomKind::Transient)
    }

    pub fn as_document(&self) -> Option<&DocumentRoom> {
        match &self.kind {
            RoomKind::Document(doc_room) => Some(doc_room),
            RoomKind::Transient => None,
        }
    }

    pub fn add_client(&self, client: ClientHandle) {
        lock(&self.clients).insert(client.id, client);
    }

    /// Returns how many clients remain attached.
    pub fn remove_client(&self, id: &ConnId) -> usize {
        let mut clients = lock(&self.clients);
        clients.remove(id);
        clients.len()
    }

    pub fn has_client(&self, id: &ConnId) -> bool {
        lock(&self.clients).contains_key(id)
    }

    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    pub(crate) fn clients(&self) -> MutexGuard<'_, HashMap<ConnId, ClientHandle>> {
        lock(&self.clients)
    }
}

impl DocumentRoom {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Never reverts for the lifetime of the room.
    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Serializes initial loading so only one connection performs it.
    pub(crate) async fn lock_sync(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.sync_lock.lock().await
    }

    pub(crate) fn set_subscription(&self, id: SubscriptionId) {
        if let Some(previous) = lock(&self.subscription).replace(id) {
            self.document.unobserve(previous);
        }
    }

    /// Stop saving on change and stop watching the file.
    pub(crate) fn shut_down(&self) {
        self.watcher.cancel();
        if let Some(id) = lock(&self.subscription).take() {
            self.document.unobserve(id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
