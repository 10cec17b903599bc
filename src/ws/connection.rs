//! Per-connection protocol handling: attach to a room, load it if this is the
//! first connection, then filter, apply and relay messages until the client
//! goes away.

use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use super::connctx::{ClientHandle, ConnCtx, ConnId};
use super::error::SyncError;
use super::hub::SyncHub;
use super::persistence::{self, Persistence};
use super::relay;
use super::room::{DocumentRoom, Room};
use crate::db::StoreError;
use crate::models::messages::{classify, sync_frame, InboundMessage, SyncStep, RENAME_ACK};
use crate::models::{DocumentPath, Permissions};
use crate::utils::scope_guard::ScopeGuard;

/// Serve one client until `inbound` ends.
///
/// `outbox` receives every frame destined for the client; the caller owns the
/// transport on both sides.
pub async fn serve<S>(
    hub: Arc<SyncHub>,
    name: String,
    permissions: Permissions,
    outbox: UnboundedSender<Vec<u8>>,
    mut inbound: S,
) where
    S: Stream<Item = Vec<u8>> + Unpin,
{
    let room = hub.registry.get_or_create(&name);
    let client = ClientHandle::new(outbox);
    let conn_id = client.id;
    room.add_client(client.clone());
    if let Some(doc_room) = room.as_document() {
        // A client is back before the idle room was dropped.
        doc_room.cleaner.cancel();
    }
    info!("Connection {} attached to room {}", conn_id, name);

    let _detach = ScopeGuard::new({
        let hub = hub.clone();
        let room = room.clone();
        move || detach(&hub, &room, &conn_id)
    });

    let mut ctx = ConnCtx::new(client, room.clone(), &permissions);

    if let Some(doc_room) = room.as_document() {
        match load_room(&hub, &room, doc_room).await {
            Ok(persistence) => ctx.persistence = persistence,
            Err(e) => {
                error!("Failed to load room {}: {}", name, e);
                return;
            }
        }
        ctx.client
            .send(sync_frame(SyncStep::Step1, &doc_room.document.version()));
    }

    while let Some(message) = inbound.next().await {
        handle_message(&hub, &ctx, &message).await;
    }
    if ctx.persistence.as_ref().is_some_and(|p| p.save_pending()) {
        debug!("Loader of room {} left with a save pending", room.name());
    }
}

/// Bring a document room to ready. Only the connection that finds the room
/// not ready does the work; it gets back the persistence state it created.
async fn load_room(
    hub: &Arc<SyncHub>,
    room: &Arc<Room>,
    doc_room: &DocumentRoom,
) -> Result<Option<Arc<Persistence>>, SyncError> {
    let _guard = doc_room.lock_sync().await;
    if doc_room.is_ready() {
        return Ok(None);
    }

    let name = room.name();
    let target = DocumentPath::parse(&name).ok_or_else(|| SyncError::NotADocument(name.clone()))?;
    let model = hub
        .contents
        .read(&target.path, true, target.is_notebook())
        .await?;
    let on_disk = model
        .content
        .ok_or_else(|| SyncError::MissingContent(target.path.clone()))?;
    let document = &doc_room.document;

    let read_from_source = match doc_room.update_store.apply_updates(document).await {
        Ok(()) if document.source() != on_disk => {
            warn!("Update history for {} is out of sync with the file, using the file", target.path);
            true
        }
        Ok(()) => false,
        Err(StoreError::NotFound(_)) => {
            debug!("No update history for {}, starting from the file", target.path);
            true
        }
        Err(e) => {
            warn!("Unreadable update history for {}, starting from the file: {}", target.path, e);
            true
        }
    };
    if read_from_source {
        document.set_source(&on_disk)?;
        doc_room.update_store.encode_state_as_update(document).await?;
    }
    let cleared = document.set_dirty(false)?;
    if let Err(e) = doc_room.update_store.write(&cleared).await {
        warn!("Failed to append to update log {}: {}", doc_room.update_store.location(), e);
    }

    let persistence = Persistence::new(hub, room, model.last_modified);
    doc_room.mark_ready();
    persistence.start_watcher(doc_room);
    let observer = persistence.clone();
    doc_room.set_subscription(document.observe(move |change| observer.on_document_change(change)));
    info!("Room {} is ready", name);
    Ok(Some(persistence))
}

async fn handle_message(hub: &SyncHub, ctx: &ConnCtx, message: &[u8]) {
    match classify(message) {
        InboundMessage::Rename(new_name) => {
            // Peers learn the new path through the shared document itself.
            hub.registry.rename(new_name, &ctx.room);
            ctx.client.send(RENAME_ACK.to_vec());
        }
        InboundMessage::Awareness(payload) => {
            if discard_awareness(ctx, payload) {
                return;
            }
            relay::deliver(&ctx.room, &ctx.id(), message);
        }
        InboundMessage::Sync(step, payload) => {
            if step.carries_content() && !ctx.can_write {
                debug!("Dropping content from read-only connection {}", ctx.id());
                return;
            }
            let follow_up = match ctx.room.as_document() {
                Some(doc_room) => match apply_sync(ctx, doc_room, step, payload).await {
                    Some(follow_up) => follow_up,
                    None => return,
                },
                None => Vec::new(),
            };
            relay::deliver(&ctx.room, &ctx.id(), message);
            if let Some(doc_room) = ctx.room.as_document() {
                persistence::publish(&ctx.room, doc_room, follow_up).await;
            }
        }
        InboundMessage::Invalid => {
            debug!("Dropping invalid message from {}", ctx.id());
        }
    }
}

/// Hook for selective presence delivery. Everything is relayed for now.
fn discard_awareness(_ctx: &ConnCtx, _payload: &[u8]) -> bool {
    false
}

/// Run a sync frame through the room's document. Returns `None` when the
/// frame must not be relayed, otherwise any server change it caused.
async fn apply_sync(
    ctx: &ConnCtx,
    doc_room: &DocumentRoom,
    step: SyncStep,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let document = &doc_room.document;
    match step {
        SyncStep::Step1 => match document.encode_diff(payload) {
            Ok(update) => {
                ctx.client.send(sync_frame(SyncStep::Step2, &update));
                Some(Vec::new())
            }
            Err(e) => {
                warn!("Bad sync step 1 from {}: {}", ctx.id(), e);
                None
            }
        },
        SyncStep::Step2 | SyncStep::Update => {
            if payload.is_empty() {
                return Some(Vec::new());
            }
            let follow_up = match document.apply_update(payload) {
                Ok(follow_up) => follow_up,
                Err(e) => {
                    warn!("Dropping update from {}: {}", ctx.id(), e);
                    return None;
                }
            };
            if let Err(e) = doc_room.update_store.write(payload).await {
                warn!("Failed to append to update log {}: {}", doc_room.update_store.location(), e);
            }
            Some(follow_up)
        }
    }
}

fn detach(hub: &Arc<SyncHub>, room: &Arc<Room>, conn_id: &ConnId) {
    let remaining = room.remove_client(conn_id);
    info!("Connection {} left room {} ({} remaining)", conn_id, room.name(), remaining);
    let Some(doc_room) = room.as_document() else {
        return;
    };
    if remaining > 0 {
        return;
    }
    // Keep the document around for a while in case someone reconnects.
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let hub = hub.clone();
    let room_ref = room.clone();
    doc_room
        .cleaner
        .replace(runtime.spawn(async move { clean_room(hub, room_ref).await }));
}

async fn clean_room(hub: Arc<SyncHub>, room: Arc<Room>) {
    tokio::time::sleep(hub.settings.cleanup_delay).await;
    if room.client_count() > 0 {
        return;
    }
    if let Some(doc_room) = room.as_document() {
        doc_room.shut_down();
    }
    if hub.registry.delete(&room) {
        info!("Dropped idle room {}", room.name());
    }
}
