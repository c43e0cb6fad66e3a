//! Error taxonomy for the sync core.
//!
//! Every failure that can reach the transport boundary is a [`SyncError`].
//! Each variant maps onto exactly one [`EventStatus`], which is what the
//! gateway reports back for the connect / message event that caused it.

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::ProtocolError;
use crate::replica::MergeError;
use crate::storage::StoreError;

/// Status outcome reported to the transport gateway for a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EventStatus {
    Ok = 200,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    Internal = 500,
}

impl EventStatus {
    /// Numeric HTTP-style status code.
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn is_success(self) -> bool {
        self == EventStatus::Ok
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors surfaced by the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing, malformed, or expired credential.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Valid principal, but not allowed to open the requested document.
    #[error("Principal {principal_id} may not access document {document_id}")]
    Authorization {
        principal_id: String,
        document_id: String,
    },

    /// A message frame could not be decoded or merged.
    #[error("Malformed message: {0}")]
    ProtocolDecode(String),

    /// No live session for the connection (never registered, removed, or expired).
    #[error("No session registered for connection {0}")]
    SessionNotFound(Uuid),

    /// Durable storage failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Anything else: collaborator outages, task failures.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Status reported to the gateway for this error.
    pub fn status(&self) -> EventStatus {
        match self {
            SyncError::Authentication(_) => EventStatus::Unauthorized,
            SyncError::Authorization { .. } => EventStatus::Forbidden,
            SyncError::ProtocolDecode(_) => EventStatus::BadRequest,
            SyncError::SessionNotFound(_) => EventStatus::NotFound,
            SyncError::Persistence(_) | SyncError::Internal(_) => EventStatus::Internal,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::ProtocolDecode(e.to_string())
    }
}

impl From<MergeError> for SyncError {
    fn from(e: MergeError) -> Self {
        SyncError::ProtocolDecode(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Internal(format!("background task failed: {e}"))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            SyncError::Authentication("expired".into()).status(),
            EventStatus::Unauthorized
        );
        assert_eq!(
            SyncError::Authorization {
                principal_id: "p".into(),
                document_id: "d".into(),
            }
            .status(),
            EventStatus::Forbidden
        );
        assert_eq!(
            SyncError::ProtocolDecode("empty frame".into()).status(),
            EventStatus::BadRequest
        );
        assert_eq!(
            SyncError::SessionNotFound(Uuid::nil()).status(),
            EventStatus::NotFound
        );
        assert_eq!(
            SyncError::Persistence(StoreError::DatabaseError("io".into())).status(),
            EventStatus::Internal
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(EventStatus::Ok.code(), 200);
        assert_eq!(EventStatus::BadRequest.code(), 400);
        assert_eq!(EventStatus::Unauthorized.code(), 401);
        assert_eq!(EventStatus::Forbidden.code(), 403);
        assert_eq!(EventStatus::NotFound.code(), 404);
        assert_eq!(EventStatus::Internal.code(), 500);
        assert!(EventStatus::Ok.is_success());
        assert!(!EventStatus::NotFound.is_success());
    }

    #[test]
    fn test_protocol_error_is_decode_error() {
        let err: SyncError = ProtocolError::EmptyFrame.into();
        assert_eq!(err.status(), EventStatus::BadRequest);
    }
}
