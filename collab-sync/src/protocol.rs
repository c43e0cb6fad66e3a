//! Binary envelope for document synchronization.
//!
//! Wire format:
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ tag      │ payload                      │
//! │ 1 byte   │ variable (tag-specific)      │
//! └──────────┴──────────────────────────────┘
//! ```
//!
//! | Tag | Name          | Payload                                      |
//! |-----|---------------|----------------------------------------------|
//! | 0   | SYNC_REQUEST  | peer state digest (empty = "send me all")    |
//! | 1   | SYNC_FULL     | encoded update, merged wholesale             |
//! | 2   | UPDATE        | encoded incremental update                   |
//! | 3   | PRESENCE      | bincode awareness blob                       |
//! | 4   | ERROR         | u16 big-endian status + UTF-8 reason         |
//!
//! The header carries no document or peer identity: a connection is bound to
//! exactly one document when it connects, so the session supplies both.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message tags for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    /// Peer sends its state digest; responder returns only what is missing
    SyncRequest = 0,
    /// Update merged wholesale (also the reply to SyncRequest)
    SyncFull = 1,
    /// Incremental CRDT operation
    Update = 2,
    /// Ephemeral awareness blob
    Presence = 3,
    /// Server-originated rejection of a single frame
    Error = 4,
}

impl MessageTag {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MessageTag::SyncRequest),
            1 => Some(MessageTag::SyncFull),
            2 => Some(MessageTag::Update),
            3 => Some(MessageTag::Presence),
            4 => Some(MessageTag::Error),
            _ => None,
        }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    SyncRequest(Vec<u8>),
    SyncFull(Vec<u8>),
    Update(Vec<u8>),
    Presence(Vec<u8>),
    Error { status: u16, reason: String },
    /// Header decoded, but the tag is not one this build understands.
    Unknown { tag: u8, payload: Vec<u8> },
}

impl Envelope {
    /// Decode a frame from its wire bytes.
    ///
    /// Only a frame without a readable header is an error; unknown tags
    /// decode to [`Envelope::Unknown`] so the router can log and skip them.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, payload) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let envelope = match MessageTag::from_u8(tag) {
            Some(MessageTag::SyncRequest) => Envelope::SyncRequest(payload.to_vec()),
            Some(MessageTag::SyncFull) => Envelope::SyncFull(payload.to_vec()),
            Some(MessageTag::Update) => Envelope::Update(payload.to_vec()),
            Some(MessageTag::Presence) => Envelope::Presence(payload.to_vec()),
            Some(MessageTag::Error) => {
                if payload.len() < 2 {
                    return Err(ProtocolError::Truncated {
                        tag,
                        needed: 2,
                        got: payload.len(),
                    });
                }
                let status = u16::from_be_bytes([payload[0], payload[1]]);
                let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
                Envelope::Error { status, reason }
            }
            None => Envelope::Unknown {
                tag,
                payload: payload.to_vec(),
            },
        };
        Ok(envelope)
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let (tag, body): (u8, &[u8]) = match self {
            Envelope::SyncRequest(p) => (MessageTag::SyncRequest as u8, p),
            Envelope::SyncFull(p) => (MessageTag::SyncFull as u8, p),
            Envelope::Update(p) => (MessageTag::Update as u8, p),
            Envelope::Presence(p) => (MessageTag::Presence as u8, p),
            Envelope::Unknown { tag, payload } => (*tag, payload),
            Envelope::Error { status, reason } => {
                let mut out = Vec::with_capacity(3 + reason.len());
                out.push(MessageTag::Error as u8);
                out.extend_from_slice(&status.to_be_bytes());
                out.extend_from_slice(reason.as_bytes());
                return out;
            }
        };
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(tag);
        out.extend_from_slice(body);
        out
    }

    /// Known tag of this frame, `None` for [`Envelope::Unknown`].
    pub fn tag(&self) -> Option<MessageTag> {
        match self {
            Envelope::SyncRequest(_) => Some(MessageTag::SyncRequest),
            Envelope::SyncFull(_) => Some(MessageTag::SyncFull),
            Envelope::Update(_) => Some(MessageTag::Update),
            Envelope::Presence(_) => Some(MessageTag::Presence),
            Envelope::Error { .. } => Some(MessageTag::Error),
            Envelope::Unknown { .. } => None,
        }
    }

    /// Presence frame carrying a server-side awareness message.
    pub fn awareness(msg: &AwarenessMessage) -> Result<Self, ProtocolError> {
        Ok(Envelope::Presence(msg.encode()?))
    }

    pub fn error(status: u16, reason: impl Into<String>) -> Self {
        Envelope::Error {
            status,
            reason: reason.into(),
        }
    }
}

/// Text selection inside the shared document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub anchor: u32,
    pub head: u32,
}

impl Cursor {
    pub fn caret(at: u32) -> Self {
        Self { anchor: at, head: at }
    }
}

/// Awareness blob a client sends inside a PRESENCE frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    /// `None` clears the cursor (e.g. editor lost focus)
    pub cursor: Option<Cursor>,
}

impl AwarenessState {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (state, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(state)
    }
}

/// One peer as seen by the other editors of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPresence {
    pub connection_id: Uuid,
    pub principal_id: String,
    pub display_name: String,
    /// `#rrggbb`, stable per principal
    pub color: String,
    pub cursor: Option<Cursor>,
}

/// Awareness messages the server fans out inside PRESENCE frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// A connection opened the document (also used for the join snapshot).
    Joined(PeerPresence),
    /// Cursor moved.
    Updated(PeerPresence),
    /// A connection went away.
    Left {
        connection_id: Uuid,
        principal_id: String,
    },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn connection_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Joined(p) | AwarenessMessage::Updated(p) => p.connection_id,
            AwarenessMessage::Left { connection_id, .. } => *connection_id,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Empty frame: missing message tag")]
    EmptyFrame,
    #[error("Frame with tag {tag} truncated: need {needed} payload bytes, got {got}")]
    Truncated { tag: u8, needed: usize, got: usize },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_frame_layout() {
        let frame = Envelope::Update(vec![9, 8, 7]).encode();
        assert_eq!(frame, vec![2, 9, 8, 7]);
        assert_eq!(Envelope::decode(&frame).unwrap(), Envelope::Update(vec![9, 8, 7]));
    }

    #[test]
    fn test_empty_sync_request_is_valid() {
        let frame = Envelope::SyncRequest(Vec::new()).encode();
        assert_eq!(frame, vec![0]);
        assert_eq!(
            Envelope::decode(&frame).unwrap(),
            Envelope::SyncRequest(Vec::new())
        );
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert_eq!(Envelope::decode(&[]), Err(ProtocolError::EmptyFrame));
    }

    #[test]
    fn test_unknown_tag_decodes() {
        let decoded = Envelope::decode(&[0xEE, 1, 2]).unwrap();
        assert_eq!(
            decoded,
            Envelope::Unknown {
                tag: 0xEE,
                payload: vec![1, 2],
            }
        );
        assert!(decoded.tag().is_none());
    }

    #[test]
    fn test_error_frame() {
        let frame = Envelope::error(404, "no session").encode();
        assert_eq!(&frame[..3], &[4, 0x01, 0x94]);
        match Envelope::decode(&frame).unwrap() {
            Envelope::Error { status, reason } => {
                assert_eq!(status, 404);
                assert_eq!(reason, "no session");
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_error_frame() {
        let err = Envelope::decode(&[4, 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { tag: 4, needed: 2, got: 1 }));
    }

    #[test]
    fn test_awareness_state_blob() {
        let state = AwarenessState {
            cursor: Some(Cursor { anchor: 3, head: 10 }),
        };
        let bytes = state.encode().unwrap();
        assert_eq!(AwarenessState::decode(&bytes).unwrap(), state);
        assert!(AwarenessState::decode(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_awareness_message_connection_id() {
        let id = Uuid::new_v4();
        let left = AwarenessMessage::Left {
            connection_id: id,
            principal_id: "user-1".into(),
        };
        let envelope = Envelope::awareness(&left).unwrap();
        let Envelope::Presence(blob) = envelope else {
            panic!("expected presence frame");
        };
        let decoded = AwarenessMessage::decode(&blob).unwrap();
        assert_eq!(decoded.connection_id(), id);
    }

    #[test]
    fn test_tag_values() {
        assert_eq!(MessageTag::SyncRequest as u8, 0);
        assert_eq!(MessageTag::SyncFull as u8, 1);
        assert_eq!(MessageTag::Update as u8, 2);
        assert_eq!(MessageTag::Presence as u8, 3);
        assert_eq!(MessageTag::Error as u8, 4);
        assert_eq!(MessageTag::from_u8(5), None);
    }
}
