use std::net::SocketAddr;
use std::path::PathBuf;

use journalkeeper_core::error::{KeeperError, Result};
use serde_derive::{Deserialize, Serialize};

use crate::raft::{NodeId, Peer};

/// Whether this server participates in elections or only receives the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Roll {
    Voter,
    Observer,
}

impl Default for Roll {
    fn default() -> Self {
        Roll::Voter
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// The identifier for this node.
    pub id: NodeId,
    /// Listen address for peer and client connections.
    pub listen: SocketAddr,
    /// Directory holding the journal segments, voter record, metadata file
    /// and snapshots. Exclusively owned by this process.
    pub data_dir: PathBuf,
    pub roll: Roll,
    /// All voters of the initial configuration, this node included when it
    /// is a voter.
    pub peers: Vec<Peer>,
    pub observers: Vec<Peer>,
    pub tick_interval_ms: u64,
    /// Base election timeout T; each election waits a random interval in
    /// [T, 2T).
    pub election_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Completion deadline for a pending proposal, a multiple of the
    /// election timeout.
    pub proposal_timeout_ms: u64,
    pub max_batch_entries: usize,
    /// Journal length that triggers a snapshot.
    pub snapshot_entries: u64,
    /// Entries kept below the snapshot point so healthy laggards can catch
    /// up from the log instead of a snapshot.
    pub snapshot_margin: u64,
    pub snapshot_chunk_size: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            id: 1,
            listen: "127.0.0.1:8801".parse().unwrap(),
            data_dir: PathBuf::from("data"),
            roll: Roll::Voter,
            peers: Vec::new(),
            observers: Vec::new(),
            tick_interval_ms: 10,
            election_timeout_ms: 300,
            heartbeat_interval_ms: 100,
            proposal_timeout_ms: 3_000,
            max_batch_entries: 64,
            snapshot_entries: 10_000,
            snapshot_margin: 256,
            snapshot_chunk_size: 1024 * 1024,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.roll == Roll::Voter && !self.peers.iter().any(|p| p.id == self.id) {
            return Err(KeeperError::ConfigError(format!(
                "voter {} missing from its own peer list",
                self.id
            )));
        }
        if self.election_timeout_ms <= self.heartbeat_interval_ms {
            return Err(KeeperError::ConfigError(
                "election timeout must exceed the heartbeat interval".into(),
            ));
        }
        if self.snapshot_chunk_size == 0 || self.max_batch_entries == 0 {
            return Err(KeeperError::ConfigError(
                "batch and chunk sizes must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn self_peer(&self) -> Peer {
        Peer {
            id: self.id,
            addr: self.listen,
        }
    }
}
