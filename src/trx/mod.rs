//! Transaction log used for transaction replay
//!
//! Records the statements of an open transaction together with a running
//! SHA-1 checksum of the results the client saw. After a backend failure the
//! statements are executed again on a new connection and the checksum of the
//! new results must match before the session can continue.

use std::collections::VecDeque;

use sha1::{Digest, Sha1};

use crate::protocol::Packet;
use crate::router::EndpointId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrxError {
    #[error("Transaction target changed from {bound:?} to {requested:?}")]
    TargetChanged {
        bound: EndpointId,
        requested: EndpointId,
    },
}

/// An open transaction
#[derive(Debug, Clone)]
pub struct Trx {
    log: VecDeque<Packet>,
    size: usize,
    hasher: Sha1,
    checksum: Option<[u8; 20]>,
    target: Option<EndpointId>,
}

impl Default for Trx {
    fn default() -> Self {
        Self::new()
    }
}

impl Trx {
    pub fn new() -> Self {
        Self {
            log: VecDeque::new(),
            size: 0,
            hasher: Sha1::new(),
            checksum: None,
            target: None,
        }
    }

    /// Append a statement executed on `target`.
    ///
    /// The first statement binds the transaction to its target. A statement
    /// for any other endpoint is rejected.
    pub fn add_stmt(&mut self, target: EndpointId, stmt: Packet) -> Result<(), TrxError> {
        match self.target {
            Some(bound) if bound != target => {
                return Err(TrxError::TargetChanged {
                    bound,
                    requested: target,
                })
            }
            _ => self.target = Some(target),
        }
        self.size += stmt.payload.len();
        self.log.push_back(stmt);
        Ok(())
    }

    /// Feed a result packet into the checksum
    pub fn add_result(&mut self, packet: &Packet) {
        self.hasher.update(&packet.payload);
        self.checksum = None;
    }

    /// Remove the oldest statement
    pub fn pop_stmt(&mut self) -> Option<Packet> {
        self.log.pop_front()
    }

    /// Lock in the checksum of the results seen so far
    pub fn finalize(&mut self) -> [u8; 20] {
        let digest: [u8; 20] = self.hasher.clone().finalize().into();
        self.checksum = Some(digest);
        digest
    }

    /// Checksum computed by the last `finalize()`, if results arrived since
    /// then it is no longer valid
    pub fn checksum(&self) -> Option<[u8; 20]> {
        self.checksum
    }

    /// Reset to the empty state and release the target binding
    pub fn close(&mut self) {
        self.log.clear();
        self.size = 0;
        self.hasher = Sha1::new();
        self.checksum = None;
        self.target = None;
    }

    /// Total statement bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0 && self.log.is_empty()
    }

    pub fn have_stmts(&self) -> bool {
        !self.log.is_empty()
    }

    pub fn target(&self) -> Option<EndpointId> {
        self.target
    }

    /// Statements in execution order
    pub fn statements(&self) -> impl Iterator<Item = &Packet> {
        self.log.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(sql: &str) -> Packet {
        let mut payload = vec![0x03];
        payload.extend_from_slice(sql.as_bytes());
        Packet::new(0, payload)
    }

    #[test]
    fn test_empty_until_stmt_added() {
        let mut trx = Trx::new();
        assert!(trx.is_empty());
        assert_eq!(trx.size(), 0);
        assert!(!trx.have_stmts());

        trx.add_stmt(EndpointId(0), stmt("BEGIN")).unwrap();
        assert!(!trx.is_empty());
        assert_eq!(trx.size(), 6);
        assert_eq!(trx.target(), Some(EndpointId(0)));
    }

    #[test]
    fn test_target_change_rejected() {
        let mut trx = Trx::new();
        trx.add_stmt(EndpointId(1), stmt("BEGIN")).unwrap();
        let err = trx.add_stmt(EndpointId(2), stmt("INSERT INTO t VALUES (1)")).unwrap_err();
        assert_eq!(
            err,
            TrxError::TargetChanged {
                bound: EndpointId(1),
                requested: EndpointId(2)
            }
        );
        assert_eq!(trx.len(), 1);
    }

    #[test]
    fn test_pop_is_fifo() {
        let mut trx = Trx::new();
        trx.add_stmt(EndpointId(0), stmt("BEGIN")).unwrap();
        trx.add_stmt(EndpointId(0), stmt("UPDATE t SET a = 1")).unwrap();

        assert_eq!(trx.pop_stmt(), Some(stmt("BEGIN")));
        assert_eq!(trx.pop_stmt(), Some(stmt("UPDATE t SET a = 1")));
        assert_eq!(trx.pop_stmt(), None);
    }

    #[test]
    fn test_checksum_only_valid_after_finalize() {
        let mut original = Trx::new();
        let mut replayed = Trx::new();
        let ok = Packet::new(1, vec![0, 1, 0, 2, 0, 0, 0]);

        original.add_result(&ok);
        assert!(original.checksum().is_none());
        let first = original.finalize();
        assert_eq!(original.checksum(), Some(first));

        replayed.add_result(&ok);
        assert_eq!(replayed.finalize(), first);

        // A different result changes the checksum
        replayed.add_result(&Packet::new(1, vec![0, 0, 0, 2, 0, 0, 0]));
        assert!(replayed.checksum().is_none());
        assert_ne!(replayed.finalize(), first);
    }

    #[test]
    fn test_close_resets_everything() {
        let mut trx = Trx::new();
        trx.add_stmt(EndpointId(3), stmt("BEGIN")).unwrap();
        trx.add_result(&Packet::new(1, vec![0, 0, 0, 2, 0, 0, 0]));
        trx.finalize();

        trx.close();
        assert!(trx.is_empty());
        assert_eq!(trx.target(), None);
        assert_eq!(trx.checksum(), None);
        assert_eq!(trx.finalize(), Trx::new().finalize());

        // The binding is released
        trx.add_stmt(EndpointId(4), stmt("BEGIN")).unwrap();
    }
}
