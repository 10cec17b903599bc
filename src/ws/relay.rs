use super::connctx::ConnId;
use super::room::Room;

/// Forward `message` verbatim to every client of `room` except `sender`.
///
/// Delivery only queues the frame on each client's outbox, so a slow or dead
/// recipient never holds up the others. Returns how many clients accepted it.
pub fn deliver(room: &Room, sender: &ConnId, message: &[u8]) -> usize {
    room.clients()
        .values()
        .filter(|client| client.id != *sender)
        .filter(|client| client.send(message.to_vec()))
        .count()
}

/// Send a server-originated frame to every client of `room`.
pub fn deliver_all(room: &Room, message: &[u8]) -> usize {
    room.clients()
        .values()
        .filter(|client| client.send(message.to_vec()))
        .count()
}
