//! Server-side transaction sessions. A session lives inside the leader role
//! and is bound to the term that created it, so a leader change drops every
//! open session and later operations surface `TransactionInvalidated`.

use std::collections::HashMap;

use journalkeeper_core::error::{KeeperError, Result};
use uuid::Uuid;

use crate::raft::{Term, UpdateRequest};

#[derive(Debug)]
pub struct Transaction {
    pub id: Uuid,
    pub term: Term,
    pub requests: Vec<UpdateRequest>,
}

#[derive(Debug, Default)]
pub struct Transactions {
    open: HashMap<Uuid, Transaction>,
}

impl Transactions {
    pub fn new() -> Transactions {
        Transactions::default()
    }

    pub fn create(&mut self, term: Term) -> Uuid {
        let id = Uuid::new_v4();
        self.open.insert(
            id,
            Transaction {
                id,
                term,
                requests: Vec::new(),
            },
        );
        id
    }

    /// Buffers entries into the session; they hit the journal only on
    /// commit.
    pub fn push(&mut self, id: Uuid, requests: Vec<UpdateRequest>) -> Result<()> {
        match self.open.get_mut(&id) {
            Some(transaction) => {
                transaction.requests.extend(requests);
                Ok(())
            }
            None => Err(KeeperError::TransactionInvalidated),
        }
    }

    /// Removes the session for an atomic commit append.
    pub fn take(&mut self, id: Uuid) -> Result<Transaction> {
        self.open
            .remove(&id)
            .ok_or(KeeperError::TransactionInvalidated)
    }

    pub fn rollback(&mut self, id: Uuid) -> Result<()> {
        self.open
            .remove(&id)
            .map(|_| ())
            .ok_or(KeeperError::TransactionInvalidated)
    }

    pub fn opening(&self) -> Vec<Uuid> {
        self.open.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_drains_the_buffered_batch() {
        let mut transactions = Transactions::new();
        let id = transactions.create(7);
        transactions
            .push(id, vec![UpdateRequest::new(b"a".to_vec())])
            .unwrap();
        transactions
            .push(id, vec![UpdateRequest::new(b"b".to_vec())])
            .unwrap();
        assert_eq!(transactions.opening(), vec![id]);

        let transaction = transactions.take(id).unwrap();
        assert_eq!(transaction.term, 7);
        assert_eq!(transaction.requests.len(), 2);
        assert!(transactions.opening().is_empty());
    }

    #[test]
    fn rollback_discards_the_session() {
        let mut transactions = Transactions::new();
        let id = transactions.create(7);
        transactions.rollback(id).unwrap();
        assert_eq!(
            transactions.push(id, vec![UpdateRequest::new(vec![])]),
            Err(KeeperError::TransactionInvalidated)
        );
    }

    #[test]
    fn unknown_session_surfaces_invalidated() {
        let mut transactions = Transactions::new();
        assert_eq!(
            transactions.take(Uuid::new_v4()).map(|_| ()),
            Err(KeeperError::TransactionInvalidated)
        );
    }
}
