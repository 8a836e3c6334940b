use slog::Logger;

use journalkeeper_core::error::Result;

use crate::candidate::Candidate;
use crate::election::Election;
use crate::observer::Observer;
use crate::raft::{Apply, Command, NodeId, Raft, RaftHandle, RaftRole, Role, Term};

pub struct Follower {
    pub leader_id: Option<NodeId>,
    pub logger: Logger,
}

impl Follower {
    pub fn new(logger: &Logger) -> Follower {
        Follower {
            leader_id: None,
            logger: logger.new(o!("role" => "follower")),
        }
    }
}

impl Role for Follower {
    fn term(&mut self, _term: Term) {
        self.leader_id = None;
    }

    fn role(&self) -> RaftRole {
        RaftRole::Follower
    }

    fn logger(&self) -> &Logger {
        &self.logger
    }
}

impl Raft<Follower> {
    /// A config entry adopted from the leader may demote this server to a
    /// non-voting observer.
    fn settle_roll(self) -> RaftHandle {
        if !self.cluster.contains_voter(self.id) && self.cluster.contains_observer(self.id) {
            info!(self.role.logger, "no longer a voter, converting to observer");
            RaftHandle::Observer(Raft::from(self))
        } else {
            RaftHandle::Follower(self)
        }
    }
}

impl Apply for Raft<Follower> {
    fn apply(mut self, cmd: Command) -> Result<RaftHandle> {
        match cmd {
            Command::Tick => {
                if self.needs_election() {
                    let candidate: Raft<Candidate> = Raft::from(self);
                    return candidate.seek_election();
                }
                Ok(RaftHandle::Follower(self))
            }
            Command::Timeout => {
                let candidate: Raft<Candidate> = Raft::from(self);
                candidate.seek_election()
            }
            Command::VoteRequest {
                term,
                candidate_id,
                last_log_term,
                last_log_index,
            } => {
                let response = if term < self.state.current_term {
                    Command::VoteResponse {
                        term: self.state.current_term,
                        from: self.id,
                        granted: false,
                    }
                } else {
                    self.handle_vote_request(candidate_id, last_log_term, last_log_index, true)?
                };
                self.reply(candidate_id, response)?;
                Ok(RaftHandle::Follower(self))
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
                    let response = Command::AppendResponse {
                        term: self.state.current_term,
                        from: self.id,
                        success: false,
                        match_index: 0,
                        conflict: None,
                    };
                    self.reply(leader_id, response)?;
                    return Ok(RaftHandle::Follower(self));
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
                    let response = Command::InstallSnapshotResponse {
                        term: self.state.current_term,
                        from: self.id,
                        next_offset: 0,
                    };
                    self.reply(leader_id, response)?;
                    return Ok(RaftHandle::Follower(self));
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
                Ok(RaftHandle::Follower(self))
            }
            // Stale responses from an earlier life as candidate or leader.
            Command::VoteResponse { .. }
            | Command::AppendResponse { .. }
            | Command::InstallSnapshotResponse { .. } => Ok(RaftHandle::Follower(self)),
        }
    }
}

impl From<Raft<Follower>> for Raft<Candidate> {
    fn from(val: Raft<Follower>) -> Raft<Candidate> {
        let election = Election::new(&val.cluster);
        Raft {
            id: val.id,
            role: Candidate {
                election,
                logger: val.logger.new(o!("role" => "candidate")),
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
        }
    }
}

impl From<Raft<Follower>> for Raft<Observer> {
    fn from(val: Raft<Follower>) -> Raft<Observer> {
        Raft {
            id: val.id,
            role: Observer {
                leader_id: val.role.leader_id,
                logger: val.logger.new(o!("role" => "observer")),
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
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{EntryKind, LogIndex};
    use crate::testing::{entry, follower, recv_command};

    #[test]
    fn follower_to_candidate_on_timeout() {
        let (raft, mut node) = follower(1, &[1, 2, 3]);
        match raft.apply(Command::Timeout).unwrap() {
            RaftHandle::Candidate(candidate) => {
                assert_eq!(candidate.state.current_term, 1);
                assert_eq!(candidate.state.voted_for, Some(1));
            }
            _ => panic!("expected a candidate"),
        }
        // Both peers got a vote request.
        assert!(matches!(
            recv_command(&mut node.rpc_rx),
            Some(Command::VoteRequest { term: 1, .. })
        ));
        assert!(matches!(
            recv_command(&mut node.rpc_rx),
            Some(Command::VoteRequest { term: 1, .. })
        ));
    }

    #[test]
    fn grants_one_vote_per_term() {
        let (raft, mut node) = follower(1, &[1, 2, 3]);
        let vote = |candidate_id| Command::VoteRequest {
            term: 4,
            candidate_id,
            last_log_term: 0,
            last_log_index: 0,
        };

        let raft = RaftHandle::Follower(raft).apply(vote(2)).unwrap();
        assert!(matches!(
            recv_command(&mut node.rpc_rx),
            Some(Command::VoteResponse { granted: true, term: 4, .. })
        ));

        let raft = raft.apply(vote(3)).unwrap();
        assert!(matches!(
            recv_command(&mut node.rpc_rx),
            Some(Command::VoteResponse { granted: false, .. })
        ));

        // The same candidate retrying is granted again.
        raft.apply(vote(2)).unwrap();
        assert!(matches!(
            recv_command(&mut node.rpc_rx),
            Some(Command::VoteResponse { granted: true, .. })
        ));
    }

    #[test]
    fn rejects_votes_for_stale_logs() {
        let (mut raft, mut node) = follower(1, &[1, 2, 3]);
        raft.journal.append(entry(3, 1, "x")).unwrap();
        raft.state.current_term = 3;

        RaftHandle::Follower(raft)
            .apply(Command::VoteRequest {
                term: 4,
                candidate_id: 2,
                last_log_term: 2,
                last_log_index: 5,
            })
            .unwrap();
        assert!(matches!(
            recv_command(&mut node.rpc_rx),
            Some(Command::VoteResponse { granted: false, .. })
        ));
    }

    fn append(
        term: Term,
        prev: (Term, LogIndex),
        commit: LogIndex,
        entries: Vec<crate::raft::Entry>,
    ) -> Command {
        Command::AppendEntries {
            term,
            leader_id: 2,
            prev_log_index: prev.1,
            prev_log_term: prev.0,
            leader_commit: commit,
            entries,
        }
    }

    #[test]
    fn appends_and_advances_commit() {
        let (raft, mut node) = follower(1, &[1, 2, 3]);
        let raft = RaftHandle::Follower(raft)
            .apply(append(
                2,
                (0, 0),
                1,
                vec![entry(2, 1, "a"), entry(2, 2, "b")],
            ))
            .unwrap();

        assert!(matches!(
            recv_command(&mut node.rpc_rx),
            Some(Command::AppendResponse { success: true, match_index: 2, .. })
        ));
        assert_eq!(raft.state().commit_index, 1);
        // Exactly the committed prefix reached the state machine.
        assert!(matches!(
            node.fsm_rx.try_recv(),
            Ok(crate::fsm::Instruction::Apply { .. })
        ));
        assert!(node.fsm_rx.try_recv().is_err());
    }

    #[test]
    fn rejects_append_on_log_mismatch_with_conflict_hint() {
        let (mut raft, mut node) = follower(1, &[1, 2, 3]);
        raft.journal.append(entry(1, 1, "a")).unwrap();
        raft.journal.append(entry(1, 2, "b")).unwrap();
        raft.state.current_term = 2;

        RaftHandle::Follower(raft)
            .apply(append(2, (2, 2), 0, vec![entry(2, 3, "c")]))
            .unwrap();
        match recv_command(&mut node.rpc_rx) {
            Some(Command::AppendResponse {
                success: false,
                conflict: Some(conflict),
                ..
            }) => {
                assert_eq!(conflict.term, 1);
                assert_eq!(conflict.first_index, 1);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn truncates_uncommitted_suffix_but_keeps_committed_prefix() {
        let (mut raft, mut node) = follower(1, &[1, 2, 3]);
        raft.journal.append(entry(1, 1, "a")).unwrap();
        raft.journal.append(entry(1, 2, "b")).unwrap();
        raft.journal.append(entry(1, 3, "stale")).unwrap();
        raft.state.current_term = 2;
        raft.state.commit_index = 2;
        raft.state.fsm_dispatched = 2;

        let raft = RaftHandle::Follower(raft)
            .apply(append(2, (1, 2), 2, vec![entry(2, 3, "fresh")]))
            .unwrap();
        assert!(matches!(
            recv_command(&mut node.rpc_rx),
            Some(Command::AppendResponse { success: true, match_index: 3, .. })
        ));
        match raft {
            RaftHandle::Follower(raft) => {
                assert_eq!(raft.journal.read_at(2).unwrap().payload, b"b".to_vec());
                assert_eq!(raft.journal.read_at(3).unwrap().payload, b"fresh".to_vec());
                assert_eq!(raft.journal.read_at(3).unwrap().term, 2);
            }
            _ => panic!("expected follower"),
        }
    }

    #[test]
    fn adopts_configuration_on_append_and_converts_to_observer() {
        let (raft, mut node) = follower(1, &[1, 2, 3]);
        let mut demoted = raft.cluster.clone();
        demoted.voters.retain(|p| p.id != 1);
        demoted.observers.push(crate::raft::Peer {
            id: 1,
            addr: "127.0.0.1:8801".parse().unwrap(),
        });
        let config_entry = crate::raft::Entry {
            term: 2,
            index: 1,
            partition: 0,
            batch_size: 1,
            timestamp: crate::raft::now_millis(),
            kind: EntryKind::Config,
            header: None,
            payload: demoted.config_entry_payload(),
        };

        let raft = RaftHandle::Follower(raft)
            .apply(append(2, (0, 0), 0, vec![config_entry]))
            .unwrap();
        assert!(matches!(
            recv_command(&mut node.rpc_rx),
            Some(Command::AppendResponse { success: true, .. })
        ));
        assert_eq!(raft.role(), RaftRole::Observer);
    }

    #[test]
    fn higher_term_message_resets_vote() {
        let (mut raft, _node) = follower(1, &[1, 2, 3]);
        raft.state.current_term = 3;
        raft.state.voted_for = Some(3);

        let raft = RaftHandle::Follower(raft)
            .apply(append(5, (0, 0), 0, vec![]))
            .unwrap();
        assert_eq!(raft.state().current_term, 5);
        assert_eq!(raft.state().voted_for, None);
    }
}
