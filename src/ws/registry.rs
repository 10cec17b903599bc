use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use super::room::Room;
use crate::db::UpdateStoreProvider;
use crate::models::DocumentPath;

/// Authoritative map from room name to room.
///
/// Every mutation runs under one lock without suspending, so concurrent
/// first connections to the same name observe a single room.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    update_stores: Arc<dyn UpdateStoreProvider>,
}

impl RoomRegistry {
    pub fn new(update_stores: Arc<dyn UpdateStoreProvider>) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            update_stores,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<Room> {
        let mut rooms = self.lock();
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }

        let room = match DocumentPath::parse(name) {
            Some(target) => {
                let store = self.update_stores.open(&target.update_log_location());
                info!(
                    "Created document room {} (update log {})",
                    name,
                    store.location()
                );
                Room::document(name, &target.file_type, store)
            }
            None => {
                info!("Created transient room {}", name);
                Room::transient(name)
            }
        };
        let room = Arc::new(room);
        rooms.insert(name.to_string(), room.clone());
        room
    }

    pub fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.lock().get(name).cloned()
    }

    /// Move `room` to `new_name`. A different room already registered under
    /// `new_name` is replaced.
    pub fn rename(&self, new_name: &str, room: &Arc<Room>) {
        let mut rooms = self.lock();
        let old_name = room.name();
        match rooms.get(&old_name) {
            Some(existing) if Arc::ptr_eq(existing, room) => {
                rooms.remove(&old_name);
            }
            _ => warn!("Renaming room {} which is no longer registered", old_name),
        }
        if let Some(replaced) = rooms.insert(new_name.to_string(), room.clone()) {
            if !Arc::ptr_eq(&replaced, room) {
                warn!("Rename of {} replaced an existing room {}", old_name, new_name);
            }
        }
        room.set_name(new_name);
        info!("Renamed room {} to {}", old_name, new_name);
    }

    /// Remove `room`, but only if its current name still maps to it.
    pub fn delete(&self, room: &Arc<Room>) -> bool {
        let mut rooms = self.lock();
        let name = room.name();
        match rooms.get(&name) {
            Some(existing) if Arc::ptr_eq(existing, room) => {
                rooms.remove(&name);
                true
            }
            _ => false,
        }
    }

    /// Current name of `room` if it is still registered.
    pub fn resolve_name(&self, room: &Arc<Room>) -> Option<String> {
        let rooms = self.lock();
        let name = room.name();
        rooms
            .get(&name)
            .filter(|existing| Arc::ptr_eq(existing, room))
            .map(|_| name)
    }

    pub fn snapshot(&self) -> Vec<(String, Arc<Room>)> {
        self.lock()
            .iter()
            .map(|(name, room)| (name.clone(), room.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Room>>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryUpdateStoreProvider;
    use crate::models::DocumentKind;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(Arc::new(MemoryUpdateStoreProvider::new()))
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let registry = registry();
        let a = registry.get_or_create("json:notebook:/nb.ipynb");
        let b = registry.get_or_create("json:notebook:/nb.ipynb");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn classifies_rooms_by_name() {
        let registry = registry();
        let nb = registry.get_or_create("json:notebook:/a/b.ipynb");
        let doc_room = nb.as_document().unwrap();
        assert_eq!(doc_room.document.kind(), DocumentKind::Notebook);
        assert_eq!(doc_room.update_store.location(), "/a/.notebook:b.ipynb.y");
        assert!(!doc_room.is_ready());

        let unknown = registry.get_or_create("text:blob:/x.bin");
        assert_eq!(unknown.as_document().unwrap().document.kind(), DocumentKind::File);

        let presence = registry.get_or_create("9f1c2e");
        assert!(presence.is_transient());
        assert!(presence.as_document().is_none());
    }

    #[test]
    fn rename_moves_entry_and_keeps_identity() {
        let registry = registry();
        let room = registry.get_or_create("json:notebook:/nb.ipynb");
        registry.rename("json:notebook:/renamed.ipynb", &room);

        assert!(registry.get("json:notebook:/nb.ipynb").is_none());
        let renamed = registry.get("json:notebook:/renamed.ipynb").unwrap();
        assert!(Arc::ptr_eq(&room, &renamed));
        assert_eq!(
            registry.resolve_name(&room).as_deref(),
            Some("json:notebook:/renamed.ipynb")
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn delete_only_removes_matching_room() {
        let registry = registry();
        let first = registry.get_or_create("text:file:/a.txt");
        assert!(registry.delete(&first));
        assert!(registry.resolve_name(&first).is_none());
        assert!(!registry.delete(&first));

        let second = registry.get_or_create("text:file:/a.txt");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!registry.delete(&first));
        assert!(registry.get("text:file:/a.txt").is_some());
    }
}
