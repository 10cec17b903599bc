use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::persistence::Persistence;
use super::room::Room;
use crate::models::Permissions;

pub type ConnId = Uuid;

/// Outbound half of an attached connection, as stored in a room's client set.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    pub id: ConnId,
    outbox: UnboundedSender<Vec<u8>>,
}

impl ClientHandle {
    pub fn new(outbox: UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbox,
        }
    }

    /// Queue a frame for this client. Never blocks; returns false once the
    /// transport has gone away.
    pub fn send(&self, message: Vec<u8>) -> bool {
        self.outbox.send(message).is_ok()
    }
}

/// State owned by one connection for its whole lifetime.
pub struct ConnCtx {
    pub client: ClientHandle,
    /// Not owning in the registry sense: the room may be deleted from the
    /// registry while this handle is still alive.
    pub room: Arc<Room>,
    pub can_write: bool,
    /// Set on the connection that loaded the document.
    pub persistence: Option<Arc<Persistence>>,
}

impl ConnCtx {
    pub fn new(client: ClientHandle, room: Arc<Room>, permissions: &Permissions) -> Self {
        Self {
            client,
            room,
            can_write: permissions.can_write_rooms(),
            persistence: None,
        }
    }

    pub fn id(&self) -> ConnId {
        self.client.id
    }
}
