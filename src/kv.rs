//! The key-value state machine the bundled binary replicates: a small
//! demonstration of the `Fsm` contract.

use std::collections::HashMap;

use journalkeeper_core::error::{KeeperError, Result};
use journalkeeper_raft::{Entry, Fsm};
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    Set { key: String, value: String },
    Delete { key: String },
}

impl Op {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| KeeperError::IoError(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Query {
    Get { key: String },
    Keys,
}

impl Query {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| KeeperError::IoError(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum QueryResult {
    Value(Option<String>),
    Keys(Vec<String>),
}

#[derive(Debug, Default)]
pub struct KvFsm {
    entries: HashMap<String, String>,
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| KeeperError::IoError(e.to_string()))
}

impl Fsm for KvFsm {
    fn transition(&mut self, entry: &Entry) -> Result<Vec<u8>> {
        let op: Op =
            bincode::deserialize(&entry.payload).map_err(|e| KeeperError::IoError(e.to_string()))?;
        match op {
            Op::Set { key, value } => {
                let previous = self.entries.insert(key, value);
                encode(&previous)
            }
            Op::Delete { key } => {
                let previous = self.entries.remove(&key);
                encode(&previous)
            }
        }
    }

    fn query(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let query: Query =
            bincode::deserialize(payload).map_err(|e| KeeperError::IoError(e.to_string()))?;
        match query {
            Query::Get { key } => encode(&QueryResult::Value(self.entries.get(&key).cloned())),
            Query::Keys => {
                let mut keys: Vec<String> = self.entries.keys().cloned().collect();
                keys.sort();
                encode(&QueryResult::Keys(keys))
            }
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        encode(&self.entries)
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        self.entries =
            bincode::deserialize(data).map_err(|e| KeeperError::IoError(e.to_string()))?;
        Ok(())
    }
}
