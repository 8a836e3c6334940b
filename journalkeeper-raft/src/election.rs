use std::collections::HashMap;

use crate::raft::{ClusterConfig, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionStatus {
    Elected,
    Voting,
    Defeated,
}

/// Tallies one election. During a joint configuration a candidate must win a
/// majority in both voter sets.
#[derive(Debug)]
pub struct Election {
    voters: Vec<NodeId>,
    voters_old: Option<Vec<NodeId>>,
    votes: HashMap<NodeId, bool>,
}

fn majority(total: usize) -> usize {
    total / 2 + 1
}

impl Election {
    pub fn new(cluster: &ClusterConfig) -> Election {
        Election {
            voters: cluster.voters.iter().map(|p| p.id).collect(),
            voters_old: cluster
                .voters_old
                .as_ref()
                .map(|old| old.iter().map(|p| p.id).collect()),
            votes: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.votes.clear();
    }

    /// Records a ballot. Votes from servers outside both voter sets are
    /// counted by neither.
    pub fn vote(&mut self, id: NodeId, granted: bool) {
        self.votes.insert(id, granted);
    }

    fn status_in(&self, set: &[NodeId]) -> ElectionStatus {
        let granted = set
            .iter()
            .filter(|id| self.votes.get(id) == Some(&true))
            .count();
        let rejected = set
            .iter()
            .filter(|id| self.votes.get(id) == Some(&false))
            .count();
        let needed = majority(set.len());
        if granted >= needed {
            ElectionStatus::Elected
        } else if set.len() - rejected < needed {
            ElectionStatus::Defeated
        } else {
            ElectionStatus::Voting
        }
    }

    pub fn status(&self) -> ElectionStatus {
        let new = self.status_in(&self.voters);
        let old = match &self.voters_old {
            Some(set) => self.status_in(set),
            None => new,
        };
        match (new, old) {
            (ElectionStatus::Elected, ElectionStatus::Elected) => ElectionStatus::Elected,
            (ElectionStatus::Defeated, _) | (_, ElectionStatus::Defeated) => {
                ElectionStatus::Defeated
            }
            _ => ElectionStatus::Voting,
        }
    }
}
