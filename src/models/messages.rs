//! Binary message framing shared by every room.
//!
//! Each frame starts with a one-byte tag. Sync frames carry a second byte
//! naming the sync step; the rest of the frame is the payload.

/// Sync protocol frame, handled by the CRDT layer.
pub const SYNC: u8 = 0;
/// Presence/awareness frame, relayed untouched.
pub const AWARENESS: u8 = 1;
/// Client moved the document; the payload is the new room name.
pub const RENAME_SESSION: u8 = 127;

pub const SYNC_STEP1: u8 = 0;
pub const SYNC_STEP2: u8 = 1;
pub const SYNC_UPDATE: u8 = 2;

/// Reply sent after a rename has been applied.
pub const RENAME_ACK: [u8; 2] = [RENAME_SESSION, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    /// Handshake request carrying the sender's encoded version vector.
    Step1,
    /// Handshake reply carrying the updates the requester lacks.
    Step2,
    /// Incremental document update.
    Update,
}

impl SyncStep {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SYNC_STEP1 => Some(SyncStep::Step1),
            SYNC_STEP2 => Some(SyncStep::Step2),
            SYNC_UPDATE => Some(SyncStep::Update),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            SyncStep::Step1 => SYNC_STEP1,
            SyncStep::Step2 => SYNC_STEP2,
            SyncStep::Update => SYNC_UPDATE,
        }
    }

    /// Whether frames of this step can mutate the document.
    pub fn carries_content(self) -> bool {
        !matches!(self, SyncStep::Step1)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum InboundMessage<'a> {
    Rename(&'a str),
    Awareness(&'a [u8]),
    Sync(SyncStep, &'a [u8]),
    /// Unknown tag, empty frame or undecodable payload. Dropped without reply.
    Invalid,
}

pub fn classify(message: &[u8]) -> InboundMessage<'_> {
    let Some((&tag, rest)) = message.split_first() else {
        return InboundMessage::Invalid;
    };
    match tag {
        RENAME_SESSION => match std::str::from_utf8(rest) {
            Ok(name) if !name.is_empty() => InboundMessage::Rename(name),
            _ => InboundMessage::Invalid,
        },
        AWARENESS => InboundMessage::Awareness(rest),
        SYNC => match rest.split_first() {
            Some((&step, payload)) => match SyncStep::from_byte(step) {
                Some(step) => InboundMessage::Sync(step, payload),
                None => InboundMessage::Invalid,
            },
            None => InboundMessage::Invalid,
        },
        _ => InboundMessage::Invalid,
    }
}

pub fn sync_frame(step: SyncStep, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(SYNC);
    frame.push(step.as_byte());
    frame.extend_from_slice(payload);
    frame
}
