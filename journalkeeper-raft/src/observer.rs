use slog::Logger;

use journalkeeper_core::error::Result;

use crate::follower::Follower;
use crate::raft::{Apply, Command, NodeId, Raft, RaftHandle, RaftRole, Role, Term};

/// A non-voting replica: receives the log and snapshots, never times out
/// into an election, never grants a ballot.
pub struct Observer {
    pub leader_id: Option<NodeId>,
    pub logger: Logger,
}

impl Role for Observer {
    fn term(&mut self, _term: Term) {
        self.leader_id = None;
    }

    fn role(&self) -> RaftRole {
        RaftRole::Observer
    }

    fn logger(&self) -> &Logger {
        &self.logger
    }
}

impl Raft<Observer> {
    /// A config entry may promote this server into the voter set.
    fn settle_roll(self) -> RaftHandle {
        if self.cluster.contains_voter(self.id) {
            info!(self.role.logger, "promoted to voter");
            RaftHandle::Follower(Raft::from(self))
        } else {
            RaftHandle::Observer(self)
        }
    }
}

impl Apply for Raft<Observer> {
    fn apply(mut self, cmd: Command) -> Result<RaftHandle> {
        match cmd {
            Command::Tick | Command::Timeout => Ok(RaftHandle::Observer(self)),
            Command::VoteRequest { candidate_id, .. } => {
                let response = Command::VoteResponse {
                    term: self.state.current_term,
                    from: self.id,
                    granted: false,
                };
                self.reply(candidate_id, response)?;
                Ok(RaftHandle::Observer(self))
            }
            Command::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries,
            } => {
                if term < self.state.current_term {
                    return Ok(RaftHandle::Observer(self));
                }
                self.role.leader_id = Some(leader_id);
                let response = self.handle_append(
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    leader_commit,
                    entries,
                )?;
                self.reply(leader_id, response)?;
                Ok(self.settle_roll())
            }
            Command::InstallSnapshot {
                term,
                leader_id,
                last_included_index,
                last_included_term,
                offset,
                done,
                data,
            } => {
                if term < self.state.current_term {
                    return Ok(RaftHandle::Observer(self));
                }
                self.role.leader_id = Some(leader_id);
                let response = self.handle_snapshot_chunk(
                    leader_id,
                    last_included_index,
                    last_included_term,
                    offset,
                    done,
                    data,
                )?;
                self.reply(leader_id, response)?;
                Ok(RaftHandle::Observer(self))
            }
            Command::VoteResponse { .. }
            | Command::AppendResponse { .. }
            | Command::InstallSnapshotResponse { .. } => Ok(RaftHandle::Observer(self)),
        }
    }
}

impl From<Raft<Observer>> for Raft<Follower> {
    fn from(val: Raft<Observer>) -> Raft<Follower> {
        let mut raft = Raft {
            id: val.id,
            role: Follower {
                leader_id: val.role.leader_id,
                logger: val.logger.new(o!("role" => "follower")),
            },
            logger: val.logger,
            config: val.config,
            cluster: val.cluster,
            state: val.state,
            journal: val.journal,
            voters: val.voters,
            meta: val.meta,
            snapshots: val.snapshots,
            rpc_tx: val.rpc_tx,
            fsm_tx: val.fsm_tx,
            events: val.events,
        };
        raft.reset_election_timer();
        raft
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Entry;
    use crate::raft::{now_millis, EntryKind};
    use crate::testing::{entry, observer, recv_command};

    #[test]
    fn observer_never_votes() {
        let (raft, mut node) = observer(4, &[1, 2, 3]);
        RaftHandle::Observer(raft)
            .apply(Command::VoteRequest {
                term: 5,
                candidate_id: 2,
                last_log_term: 5,
                last_log_index: 100,
            })
            .unwrap();
        assert!(matches!(
            recv_command(&mut node.rpc_rx),
            Some(Command::VoteResponse { granted: false, .. })
        ));
    }

    #[test]
    fn observer_ignores_election_timeouts() {
        let (raft, _node) = observer(4, &[1, 2, 3]);
        let raft = RaftHandle::Observer(raft).apply(Command::Timeout).unwrap();
        assert_eq!(raft.role(), RaftRole::Observer);
    }

    #[test]
    fn observer_receives_entries_and_applies_commits() {
        let (raft, mut node) = observer(4, &[1, 2, 3]);
        let raft = RaftHandle::Observer(raft)
            .apply(Command::AppendEntries {
                term: 2,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                leader_commit: 1,
                entries: vec![entry(2, 1, "a")],
            })
            .unwrap();
        assert!(matches!(
            recv_command(&mut node.rpc_rx),
            Some(Command::AppendResponse { success: true, match_index: 1, .. })
        ));
        assert_eq!(raft.state().commit_index, 1);
    }

    #[test]
    fn promotion_converts_to_follower() {
        let (raft, _node) = observer(4, &[1, 2, 3]);
        let mut promoted = raft.cluster.clone();
        promoted.observers.retain(|p| p.id != 4);
        promoted.voters.push(crate::raft::Peer {
            id: 4,
            addr: "127.0.0.1:8804".parse().unwrap(),
        });
        let config_entry = Entry {
            term: 2,
            index: 1,
            partition: 0,
            batch_size: 1,
            timestamp: now_millis(),
            kind: EntryKind::Config,
            header: None,
            payload: promoted.config_entry_payload(),
        };

        let raft = RaftHandle::Observer(raft)
            .apply(Command::AppendEntries {
                term: 2,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                leader_commit: 0,
                entries: vec![config_entry],
            })
            .unwrap();
        assert_eq!(raft.role(), RaftRole::Follower);
    }
}
