use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::raft::{ClusterConfig, Conflict, LogIndex, NodeId};

/// Replication bookkeeping for one peer: `next_index` is optimistic,
/// `match_index` pessimistic.
#[derive(Debug, Clone)]
pub struct NodeProgress {
    pub id: NodeId,
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    pub last_contact: Option<Instant>,
    /// Offset of the next snapshot chunk while one is streaming.
    pub snapshotting: Option<u64>,
}

impl NodeProgress {
    fn new(id: NodeId, last_index: LogIndex) -> NodeProgress {
        NodeProgress {
            id,
            next_index: last_index + 1,
            match_index: 0,
            last_contact: None,
            snapshotting: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReplicationProgress {
    peers: HashMap<NodeId, NodeProgress>,
}

impl ReplicationProgress {
    pub fn new(peer_ids: Vec<NodeId>, last_index: LogIndex) -> ReplicationProgress {
        let mut peers = HashMap::new();
        for id in peer_ids {
            peers.insert(id, NodeProgress::new(id, last_index));
        }
        ReplicationProgress { peers }
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeProgress> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut NodeProgress> {
        self.peers.get_mut(&id)
    }

    /// Membership changes add peers mid-term.
    pub fn ensure(&mut self, id: NodeId, last_index: LogIndex) {
        self.peers
            .entry(id)
            .or_insert_with(|| NodeProgress::new(id, last_index));
    }

    pub fn retain(&mut self, keep: &[NodeId]) {
        self.peers.retain(|id, _| keep.contains(id));
    }

    pub fn record_success(&mut self, id: NodeId, match_index: LogIndex) {
        if let Some(progress) = self.peers.get_mut(&id) {
            progress.last_contact = Some(Instant::now());
            progress.match_index = progress.match_index.max(match_index);
            progress.next_index = progress.match_index + 1;
            progress.snapshotting = None;
        }
    }

    /// Applies the term-jump optimization on a rejected append.
    pub fn record_conflict(&mut self, id: NodeId, conflict: Option<Conflict>) {
        if let Some(progress) = self.peers.get_mut(&id) {
            progress.last_contact = Some(Instant::now());
            progress.next_index = match conflict {
                Some(conflict) => conflict.first_index.max(1),
                None => progress.next_index.saturating_sub(1).max(1),
            };
        }
    }

    fn quorum_match_in(&self, set: &[NodeId], self_id: NodeId, self_last: LogIndex) -> LogIndex {
        let mut matches: Vec<LogIndex> = set
            .iter()
            .map(|id| {
                if *id == self_id {
                    self_last
                } else {
                    self.peers.get(id).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let needed = set.len() / 2 + 1;
        matches.get(needed - 1).copied().unwrap_or(0)
    }

    /// The largest index a quorum has persisted; the minimum over both voter
    /// sets while a joint configuration is in force.
    pub fn quorum_match(
        &self,
        cluster: &ClusterConfig,
        self_id: NodeId,
        self_last: LogIndex,
    ) -> LogIndex {
        let new_ids: Vec<NodeId> = cluster.voters.iter().map(|p| p.id).collect();
        let new_match = self.quorum_match_in(&new_ids, self_id, self_last);
        match &cluster.voters_old {
            Some(old) => {
                let old_ids: Vec<NodeId> = old.iter().map(|p| p.id).collect();
                new_match.min(self.quorum_match_in(&old_ids, self_id, self_last))
            }
            None => new_match,
        }
    }

    /// True while a quorum of voters has been heard from within `window`.
    pub fn quorum_contacted(
        &self,
        cluster: &ClusterConfig,
        self_id: NodeId,
        window: Duration,
    ) -> bool {
        let now = Instant::now();
        cluster.quorum(|id| {
            if id == self_id {
                return true;
            }
            match self.peers.get(&id).and_then(|p| p.last_contact) {
                Some(contact) => now.duration_since(contact) <= window,
                None => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Peer;

    fn cluster(ids: &[NodeId]) -> ClusterConfig {
        ClusterConfig {
            voters: ids
                .iter()
                .map(|id| Peer {
                    id: *id,
                    addr: format!("127.0.0.1:{}", 8800 + id).parse().unwrap(),
                })
                .collect(),
            voters_old: None,
            observers: vec![],
        }
    }

    #[test]
    fn quorum_match_counts_the_leader() {
        let cluster = cluster(&[1, 2, 3]);
        let mut progress = ReplicationProgress::new(vec![2, 3], 5);
        assert_eq!(progress.quorum_match(&cluster, 1, 5), 0);

        progress.record_success(2, 5);
        assert_eq!(progress.quorum_match(&cluster, 1, 5), 5);

        progress.record_success(3, 3);
        assert_eq!(progress.quorum_match(&cluster, 1, 5), 5);
    }

    #[test]
    fn joint_quorum_takes_the_minimum() {
        let mut config = cluster(&[1, 2, 4]);
        config.voters_old = Some(cluster(&[1, 2, 3]).voters);
        let mut progress = ReplicationProgress::new(vec![2, 3, 4], 5);

        progress.record_success(2, 5);
        progress.record_success(3, 5);
        // New set {1,2,4}: only 1 and 2 hold index 5; 4 holds nothing, so
        // the joint quorum match stays at 5 via {1,2} in both sets.
        assert_eq!(progress.quorum_match(&config, 1, 5), 5);

        let mut lagging = ReplicationProgress::new(vec![2, 3, 4], 5);
        lagging.record_success(3, 5);
        // Old set is satisfied by {1,3} but the new one is not.
        assert_eq!(lagging.quorum_match(&config, 1, 5), 0);
    }

    #[test]
    fn conflict_jumps_past_the_term() {
        let mut progress = ReplicationProgress::new(vec![2], 10);
        progress.record_conflict(
            2,
            Some(Conflict {
                term: 3,
                first_index: 4,
            }),
        );
        assert_eq!(progress.get(2).unwrap().next_index, 4);

        progress.record_conflict(2, None);
        assert_eq!(progress.get(2).unwrap().next_index, 3);
    }
}
