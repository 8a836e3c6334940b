use slog::Logger;

use journalkeeper_core::error::Result;

use crate::election::{Election, ElectionStatus};
use crate::follower::Follower;
use crate::leader::Leader;
use crate::raft::{Apply, Command, Raft, RaftHandle, RaftRole, Role, Term};
use crate::rpc::ClusterEvent;

pub struct Candidate {
    pub election: Election,
    pub logger: Logger,
}

impl Role for Candidate {
    fn term(&mut self, _term: Term) {
        self.election.reset();
    }

    fn role(&self) -> RaftRole {
        RaftRole::Candidate
    }

    fn logger(&self) -> &Logger {
        &self.logger
    }
}

impl Raft<Candidate> {
    /// Increments the term, votes for itself, persists the record, then asks
    /// every voter for a ballot.
    pub(crate) fn seek_election(mut self) -> Result<RaftHandle> {
        self.state.current_term += 1;
        self.state.voted_for = Some(self.id);
        self.persist_record()?;
        self.role.election.reset();
        self.reset_election_timer();
        info!(self.role.logger, "seeking election"; "term" => self.state.current_term);

        let term = self.state.current_term;
        let (last_log_term, last_log_index) = self.last_log_info();
        for id in self.cluster.voter_ids() {
            if id != self.id {
                self.reply(
                    id,
                    Command::VoteRequest {
                        term,
                        candidate_id: self.id,
                        last_log_term,
                        last_log_index,
                    },
                )?;
            }
        }

        // Vote for self.
        let from = self.id;
        self.apply(Command::VoteResponse {
            term,
            from,
            granted: true,
        })
    }

    fn become_leader(self) -> Result<RaftHandle> {
        info!(self.role.logger, "won the election"; "term" => self.state.current_term);
        let mut leader = Raft::<Leader>::from(self);
        leader.state.last_known_leader = Some(leader.id);
        leader.persist_record()?;
        leader.emit(ClusterEvent::LeaderChanged {
            term: leader.state.current_term,
            leader: Some(leader.id),
        });
        // An empty entry of the new term; prior-term entries commit
        // transitively through it.
        leader.append_noop()?;
        leader.broadcast_append()?;
        leader.advance_commit()?;
        Ok(RaftHandle::Leader(leader))
    }
}

impl Apply for Raft<Candidate> {
    fn apply(mut self, cmd: Command) -> Result<RaftHandle> {
        match cmd {
            Command::Tick => {
                if self.needs_election() {
                    info!(self.role.logger, "election timed out, starting another");
                    return self.seek_election();
                }
                Ok(RaftHandle::Candidate(self))
            }
            Command::Timeout => self.seek_election(),
            Command::VoteRequest { candidate_id, .. } => {
                // Already voted for self this term.
                let response = Command::VoteResponse {
                    term: self.state.current_term,
                    from: self.id,
                    granted: false,
                };
                self.reply(candidate_id, response)?;
                Ok(RaftHandle::Candidate(self))
            }
            Command::VoteResponse { term, from, granted } => {
                if term < self.state.current_term {
                    return Ok(RaftHandle::Candidate(self));
                }
                debug!(self.role.logger, "ballot received"; "from" => from, "granted" => granted);
                self.role.election.vote(from, granted);
                match self.role.election.status() {
                    ElectionStatus::Elected => self.become_leader(),
                    ElectionStatus::Voting => Ok(RaftHandle::Candidate(self)),
                    ElectionStatus::Defeated => {
                        info!(self.role.logger, "defeated in election");
                        Ok(RaftHandle::Follower(Raft::from(self)))
                    }
                }
            }
            Command::AppendEntries { term, .. } | Command::InstallSnapshot { term, .. } => {
                // A valid leader of this term has emerged; recognize it and
                // process the message as a follower.
                if term >= self.state.current_term {
                    let follower: Raft<Follower> = Raft::from(self);
                    return follower.apply(cmd);
                }
                Ok(RaftHandle::Candidate(self))
            }
            Command::AppendResponse { .. } | Command::InstallSnapshotResponse { .. } => {
                Ok(RaftHandle::Candidate(self))
            }
        }
    }
}

impl From<Raft<Candidate>> for Raft<Follower> {
    fn from(val: Raft<Candidate>) -> Raft<Follower> {
        let mut raft = Raft {
            id: val.id,
            role: Follower::new(&val.logger),
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
