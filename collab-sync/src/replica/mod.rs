//! Mergeable document replicas.
//!
//! The cache never looks inside a document. It only needs the four
//! operations of [`Replica`]; everything else about the content type belongs
//! to the merge engine. [`YrsReplica`] is the production engine (Yjs-compatible
//! CRDT via `yrs`), so browser editors using `y-protocols` can sync against it
//! directly.

mod v1;

use std::sync::Arc;

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, Update};

/// Merge-engine errors. Every one of them means "the bytes were not a valid
/// encoding", so callers can treat them as a client decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("Invalid update encoding: {0}")]
    InvalidUpdate(String),
    #[error("Invalid state digest: {0}")]
    InvalidDigest(String),
    #[error("Update could not be applied: {0}")]
    Rejected(String),
}

/// In-memory mergeable state of one shared document.
///
/// Implementations must make `merge` commutative and idempotent: applying
/// the same update twice, or a set of updates in any order, converges to the
/// same state.
pub trait Replica: Send + Sync {
    /// Encode the full state (loadable by `merge` into an empty replica).
    fn encode_state(&self) -> Vec<u8>;

    /// Merge an encoded update (full state or incremental) into this replica.
    fn merge(&mut self, update: &[u8]) -> Result<(), MergeError>;

    /// Encode only what a peer with `peer_digest` is missing.
    /// An empty digest means the peer has nothing.
    fn diff(&self, peer_digest: &[u8]) -> Result<Vec<u8>, MergeError>;

    /// Compact summary of what this replica has seen.
    fn digest(&self) -> Vec<u8>;
}

/// Builds empty replicas for newly hydrated documents.
pub type ReplicaFactory = Arc<dyn Fn() -> Box<dyn Replica> + Send + Sync>;

/// Yrs-backed replica.
pub struct YrsReplica {
    doc: Doc,
}

impl YrsReplica {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Fixed client id (deterministic tests).
    pub fn with_client_id(client_id: u64) -> Self {
        Self {
            doc: Doc::with_client_id(client_id),
        }
    }

    /// Factory producing fresh yrs replicas.
    pub fn factory() -> ReplicaFactory {
        Arc::new(|| Box::new(YrsReplica::new()) as Box<dyn Replica>)
    }

    /// Underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Contents of a root-level text type, empty if it does not exist.
    pub fn text(&self, name: &str) -> String {
        let txn = self.doc.transact();
        txn.get_text(name)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }
}

impl Default for YrsReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica for YrsReplica {
    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn merge(&mut self, update: &[u8]) -> Result<(), MergeError> {
        v1::check_update(update).map_err(MergeError::InvalidUpdate)?;
        let update =
            Update::decode_v1(update).map_err(|e| MergeError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| MergeError::Rejected(e.to_string()))
    }

    fn diff(&self, peer_digest: &[u8]) -> Result<Vec<u8>, MergeError> {
        let remote_sv = if peer_digest.is_empty() {
            StateVector::default()
        } else {
            v1::check_state_vector(peer_digest).map_err(MergeError::InvalidDigest)?;
            StateVector::decode_v1(peer_digest)
                .map_err(|e| MergeError::InvalidDigest(e.to_string()))?
        };
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }

    fn digest(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::append_text;
    use super::*;

    #[test]
    fn test_merge_applies_update() {
        let author = Doc::with_client_id(1);
        let update = append_text(&author, "Dear counsel,");

        let mut replica = YrsReplica::with_client_id(100);
        replica.merge(&update).unwrap();
        assert_eq!(replica.text("content"), "Dear counsel,");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let author = Doc::with_client_id(1);
        let update = append_text(&author, "hello");

        let mut once = YrsReplica::with_client_id(100);
        once.merge(&update).unwrap();

        let mut twice = YrsReplica::with_client_id(100);
        twice.merge(&update).unwrap();
        twice.merge(&update).unwrap();

        assert_eq!(once.encode_state(), twice.encode_state());
        assert_eq!(twice.text("content"), "hello");
    }

    #[test]
    fn test_merge_commutes() {
        let alice = Doc::with_client_id(1);
        let bob = Doc::with_client_id(2);
        let a = append_text(&alice, "alpha");
        let b = append_text(&bob, "beta");

        let mut ab = YrsReplica::with_client_id(100);
        ab.merge(&a).unwrap();
        ab.merge(&b).unwrap();

        let mut ba = YrsReplica::with_client_id(101);
        ba.merge(&b).unwrap();
        ba.merge(&a).unwrap();

        assert_eq!(ab.text("content"), ba.text("content"));
        assert_eq!(
            StateVector::decode_v1(&ab.digest()).unwrap(),
            StateVector::decode_v1(&ba.digest()).unwrap()
        );
    }

    #[test]
    fn test_diff_with_empty_digest_is_full_state() {
        let author = Doc::with_client_id(1);
        let update = append_text(&author, "everything");
        let mut server = YrsReplica::with_client_id(100);
        server.merge(&update).unwrap();

        let diff = server.diff(&[]).unwrap();
        let mut fresh = YrsReplica::with_client_id(200);
        fresh.merge(&diff).unwrap();
        assert_eq!(fresh.text("content"), "everything");
    }

    #[test]
    fn test_diff_only_sends_missing_portion() {
        let author = Doc::with_client_id(1);
        let first = append_text(&author, "one ");
        let second = append_text(&author, "two");

        let mut server = YrsReplica::with_client_id(100);
        server.merge(&first).unwrap();
        server.merge(&second).unwrap();

        let mut peer = YrsReplica::with_client_id(200);
        peer.merge(&first).unwrap();

        let diff = server.diff(&peer.digest()).unwrap();
        let full = server.diff(&[]).unwrap();
        assert!(diff.len() < full.len());

        peer.merge(&diff).unwrap();
        assert_eq!(peer.text("content"), "one two");
    }

    #[test]
    fn test_invalid_bytes_rejected() {
        let mut replica = YrsReplica::new();
        let before = replica.encode_state();
        assert!(matches!(
            replica.merge(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(MergeError::InvalidUpdate(_))
        ));
        assert_eq!(replica.encode_state(), before);
        assert!(replica.diff(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_hostile_length_prefixes_rejected() {
        let mut replica = YrsReplica::with_client_id(100);
        replica.merge(&append_text(&Doc::with_client_id(1), "kept")).unwrap();
        let before = replica.encode_state();

        assert!(matches!(
            replica.diff(&[0xff, 0xff, 0xff, 0xff, 0x0f]),
            Err(MergeError::InvalidDigest(_))
        ));

        let mut update = vec![128, 105, 117, 207, 218, 95, 175, 20];
        update.resize(31, 0);
        assert!(matches!(replica.merge(&update), Err(MergeError::InvalidUpdate(_))));

        // A one-client update whose string length claims 2 GiB.
        let huge_string = [1, 1, 9, 0, 4, 1, 0x80, 0x80, 0x80, 0x80, 0x08, b'x'];
        assert!(matches!(
            replica.merge(&huge_string),
            Err(MergeError::InvalidUpdate(_))
        ));

        assert_eq!(replica.encode_state(), before);
        assert_eq!(replica.text("content"), "kept");
    }

    #[test]
    fn test_encoded_state_loads_into_fresh_replica() {
        let author = Doc::with_client_id(7);
        let update = append_text(&author, "persisted");
        let mut original = YrsReplica::with_client_id(100);
        original.merge(&update).unwrap();

        let mut restored = YrsReplica::with_client_id(300);
        restored.merge(&original.encode_state()).unwrap();
        assert_eq!(restored.text("content"), "persisted");
    }
}
