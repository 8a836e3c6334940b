use std::collections::HashSet;
use std::time::{Duration, Instant};

use journalkeeper_core::error::{KeeperError, Result};
use slog::Logger;
use tokio::sync::oneshot;

use crate::candidate::Candidate;
use crate::config::Roll;
use crate::follower::Follower;
use crate::fsm::{Applied, Instruction};
use crate::pipeline::{Pipeline, ResponseSender};
use crate::raft::{
    now_millis, Apply, ClusterConfig, Command, Entry, EntryKind, LogIndex, NodeId, Peer, Raft,
    RaftHandle, RaftRole, ResponseLevel, Role, Term, UpdateRequest,
};
use crate::rpc::{ClientRequest, ClusterEvent};
use crate::transaction::Transactions;

pub struct Leader {
    pub logger: Logger,
    pub progress: crate::progress::ReplicationProgress,
    pub pipeline: Pipeline,
    pub transactions: Transactions,
    pub heartbeat_time: Instant,
    pub heartbeat_timeout: Duration,
    pub leader_since: Instant,
    /// Client writes fail fast until this instant during a maintenance
    /// window.
    pub writes_disabled_until: Option<Instant>,
    /// Index of an uncommitted configuration entry; no other configuration
    /// proposal may be in flight while it is set.
    pub config_in_flight: Option<LogIndex>,
    /// The final configuration to append once the joint stage commits.
    pub pending_final_config: Option<ClusterConfig>,
    pub config_cb: Option<oneshot::Sender<Result<()>>>,
}

impl Role for Leader {
    fn term(&mut self, _term: Term) {}

    fn role(&self) -> RaftRole {
        RaftRole::Leader
    }

    fn logger(&self) -> &Logger {
        &self.logger
    }
}

impl Raft<Leader> {
    /// The empty current-term entry appended on election.
    pub(crate) fn append_noop(&mut self) -> Result<()> {
        let entry = Entry {
            term: self.state.current_term,
            index: self.journal.last_index() + 1,
            partition: 0,
            batch_size: 1,
            timestamp: now_millis(),
            kind: EntryKind::Noop,
            header: None,
            payload: Vec::new(),
        };
        self.journal.append(entry)?;
        Ok(())
    }

    /// Ships the next batch to one peer, or the start of a snapshot when the
    /// peer has fallen behind the first retained index.
    fn replicate_to(&mut self, id: NodeId) -> Result<()> {
        let (next, streaming) = match self.role.progress.get(id) {
            Some(progress) => (progress.next_index, progress.snapshotting.is_some()),
            None => return Ok(()),
        };
        if streaming {
            return Ok(());
        }
        if next < self.journal.first_index() {
            return self.send_snapshot_chunk(id, 0);
        }
        let prev = next - 1;
        let prev_term = if prev == 0 {
            0
        } else {
            self.journal.term_at(prev).unwrap_or(0)
        };
        let last = self.journal.last_index();
        let to = last.min(next.saturating_add(self.config.max_batch_entries as u64 - 1));
        let entries = if next <= to {
            self.journal.read_range(next, to + 1)?
        } else {
            Vec::new()
        };
        self.reply(
            id,
            Command::AppendEntries {
                term: self.state.current_term,
                leader_id: self.id,
                prev_log_index: prev,
                prev_log_term: prev_term,
                leader_commit: self.state.commit_index,
                entries,
            },
        )
    }

    pub(crate) fn broadcast_append(&mut self) -> Result<()> {
        let last = self.journal.last_index();
        let peers = self.cluster.all_peers(self.id);
        for peer in &peers {
            self.role.progress.ensure(peer.id, last);
        }
        for peer in peers {
            self.replicate_to(peer.id)?;
        }
        self.role.heartbeat_time = Instant::now();
        Ok(())
    }

    fn send_snapshot_chunk(&mut self, id: NodeId, offset: u64) -> Result<()> {
        let meta = match self.snapshots.latest()? {
            Some(meta) => meta,
            None => {
                warn!(self.role.logger, "peer is behind the journal but no snapshot exists";
                      "peer" => id);
                return Ok(());
            }
        };
        let (data, done) =
            self.snapshots
                .read_chunk(meta, offset, self.config.snapshot_chunk_size)?;
        if let Some(progress) = self.role.progress.get_mut(id) {
            progress.snapshotting = Some(offset + data.len() as u64);
        }
        self.reply(
            id,
            Command::InstallSnapshot {
                term: self.state.current_term,
                leader_id: self.id,
                last_included_index: meta.last_included_index,
                last_included_term: meta.last_included_term,
                offset,
                done,
                data,
            },
        )
    }

    /// Advances `commit_index` to the largest quorum-held index whose entry
    /// carries the current term; prior-term entries commit only transitively.
    pub(crate) fn advance_commit(&mut self) -> Result<()> {
        let last = self.journal.last_index();
        let candidate = self.role.progress.quorum_match(&self.cluster, self.id, last);
        if candidate <= self.state.commit_index {
            return Ok(());
        }
        if self.journal.term_at(candidate) != Some(self.state.current_term) {
            return Ok(());
        }
        self.state.commit_index = candidate;
        self.dispatch_applies()?;
        self.role.pipeline.commit_advanced(candidate);
        self.emit(ClusterEvent::CommitAdvanced { index: candidate });
        self.after_commit()?;
        Ok(())
    }

    /// Configuration bookkeeping once the commit index moves.
    fn after_commit(&mut self) -> Result<()> {
        let index = match self.role.config_in_flight {
            Some(index) if self.state.commit_index >= index => index,
            _ => return Ok(()),
        };
        self.role.config_in_flight = None;
        self.meta.save(&self.cluster)?;
        if let Some(final_config) = self.role.pending_final_config.take() {
            info!(self.role.logger, "joint configuration committed, appending final";
                  "joint_index" => index);
            let final_index = self.append_config(final_config)?;
            self.role.config_in_flight = Some(final_index);
            self.advance_commit()?;
        } else {
            let keep: Vec<NodeId> = self
                .cluster
                .all_peers(self.id)
                .iter()
                .map(|p| p.id)
                .collect();
            self.role.progress.retain(&keep);
            if let Some(cb) = self.role.config_cb.take() {
                let _ = cb.send(Ok(()));
            }
        }
        Ok(())
    }

    /// Appends a configuration entry; the new configuration takes effect on
    /// append, not on commit.
    fn append_config(&mut self, config: ClusterConfig) -> Result<LogIndex> {
        let index = self.journal.last_index() + 1;
        let entry = Entry {
            term: self.state.current_term,
            index,
            partition: 0,
            batch_size: 1,
            timestamp: now_millis(),
            kind: EntryKind::Config,
            header: None,
            payload: config.config_entry_payload(),
        };
        self.journal.append(entry)?;
        self.cluster = config;
        self.emit(ClusterEvent::ConfigChanged { index });
        self.broadcast_append()?;
        Ok(index)
    }

    /// The framing header the journal records when the payload does not
    /// already carry one.
    fn standard_header(request: &UpdateRequest) -> Vec<u8> {
        let mut header = Vec::with_capacity(6);
        header.extend_from_slice(&request.partition.to_be_bytes());
        header.extend_from_slice(&request.batch_size.to_be_bytes());
        header
    }

    /// The proposal pipeline: assign a contiguous index range, persist,
    /// register the completion, dispatch replication.
    fn propose(
        &mut self,
        requests: Vec<UpdateRequest>,
        level: ResponseLevel,
        cb: ResponseSender,
    ) -> Result<()> {
        if requests.is_empty() {
            let _ = cb.send(Ok(match level {
                ResponseLevel::All => Some(Vec::new()),
                _ => None,
            }));
            return Ok(());
        }
        let term = self.state.current_term;
        let first = self.journal.last_index() + 1;
        let mut entries = Vec::with_capacity(requests.len());
        for (i, request) in requests.into_iter().enumerate() {
            let header = if request.include_header {
                None
            } else {
                Some(Self::standard_header(&request))
            };
            entries.push(Entry {
                term,
                index: first + i as u64,
                partition: request.partition,
                batch_size: request.batch_size,
                timestamp: now_millis(),
                kind: EntryKind::Entry,
                header,
                payload: request.payload,
            });
        }
        let last = self.journal.append_batch(entries)?;
        let deadline = Instant::now() + Duration::from_millis(self.config.proposal_timeout_ms);
        self.role.pipeline.register(first, last, level, deadline, cb);
        self.broadcast_append()?;
        self.advance_commit()?;
        Ok(())
    }

    fn handle_update_voters(
        &mut self,
        old: Vec<Peer>,
        new: Vec<Peer>,
        cb: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if self.role.config_in_flight.is_some() || self.cluster.is_joint() {
            let _ = cb.send(Err(KeeperError::ConfigurationConflict));
            return Ok(());
        }
        let current: HashSet<NodeId> = self.cluster.voters.iter().map(|p| p.id).collect();
        let old_ids: HashSet<NodeId> = old.iter().map(|p| p.id).collect();
        if current != old_ids {
            let _ = cb.send(Err(KeeperError::ConfigError(
                "old voter set does not match the committed configuration".into(),
            )));
            return Ok(());
        }
        let new_ids: HashSet<NodeId> = new.iter().map(|p| p.id).collect();
        let added = new_ids.difference(&current).count();
        let removed = current.difference(&new_ids).count();

        let observers: Vec<Peer> = self
            .cluster
            .observers
            .iter()
            .filter(|p| !new_ids.contains(&p.id))
            .copied()
            .collect();
        let target = ClusterConfig {
            voters: new,
            voters_old: None,
            observers,
        };

        let index = if added > 0 && removed > 0 {
            // Add and remove pending simultaneously: joint consensus.
            let joint = ClusterConfig {
                voters: target.voters.clone(),
                voters_old: Some(self.cluster.voters.clone()),
                observers: target.observers.clone(),
            };
            info!(self.role.logger, "starting joint consensus";
                  "old" => format!("{:?}", current), "new" => format!("{:?}", new_ids));
            self.role.pending_final_config = Some(target);
            self.append_config(joint)?
        } else {
            // Single add or remove; the in-flight barrier above is the
            // safety condition.
            self.append_config(target)?
        };
        self.role.config_in_flight = Some(index);
        self.role.config_cb = Some(cb);
        self.advance_commit()?;
        Ok(())
    }

    fn handle_convert_roll(
        &mut self,
        id: NodeId,
        roll: Roll,
        cb: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if self.role.config_in_flight.is_some() || self.cluster.is_joint() {
            let _ = cb.send(Err(KeeperError::ConfigurationConflict));
            return Ok(());
        }
        let mut target = self.cluster.clone();
        match roll {
            Roll::Observer => {
                let peer = match target.voters.iter().find(|p| p.id == id).copied() {
                    Some(peer) => peer,
                    None => {
                        let _ = cb.send(Err(KeeperError::ConfigError(format!(
                            "server {} is not a voter",
                            id
                        ))));
                        return Ok(());
                    }
                };
                target.voters.retain(|p| p.id != id);
                if !target.contains_observer(id) {
                    target.observers.push(peer);
                }
            }
            Roll::Voter => {
                let peer = match target.observers.iter().find(|p| p.id == id).copied() {
                    Some(peer) => peer,
                    None => {
                        let _ = cb.send(Err(KeeperError::ConfigError(format!(
                            "server {} is not an observer",
                            id
                        ))));
                        return Ok(());
                    }
                };
                target.observers.retain(|p| p.id != id);
                target.voters.push(peer);
            }
        }
        let index = self.append_config(target)?;
        self.role.config_in_flight = Some(index);
        self.role.config_cb = Some(cb);
        self.advance_commit()?;
        Ok(())
    }

    pub fn client(mut self, req: ClientRequest) -> Result<RaftHandle> {
        match req {
            ClientRequest::Update {
                requests,
                level,
                transaction,
                cb,
            } => {
                if let Some(until) = self.role.writes_disabled_until {
                    if Instant::now() < until {
                        let _ = cb.send(Err(KeeperError::LeaderWriteDisabled));
                        return Ok(RaftHandle::Leader(self));
                    }
                    self.role.writes_disabled_until = None;
                }
                match transaction {
                    Some(id) => {
                        let buffered = self.role.transactions.push(id, requests);
                        let _ = cb.send(buffered.map(|_| None));
                    }
                    None => self.propose(requests, level, cb)?,
                }
                Ok(RaftHandle::Leader(self))
            }
            ClientRequest::Query {
                payload,
                sequential,
                min_index,
                cb,
            } => {
                // Read-index: the apply stream is FIFO, so queueing behind
                // the commit point makes the read linearizable.
                let floor = if sequential {
                    min_index
                } else {
                    self.state.commit_index
                };
                let instruction = Instruction::Query {
                    payload,
                    min_index: floor,
                    cb,
                };
                if let Err(tokio::sync::mpsc::error::SendError(Instruction::Query {
                    cb, ..
                })) = self.fsm_tx.send(instruction)
                {
                    let _ = cb.send(Err(KeeperError::Stopped));
                }
                Ok(RaftHandle::Leader(self))
            }
            ClientRequest::BeginTransaction { cb } => {
                let term = self.state.current_term;
                let id = self.role.transactions.create(term);
                let _ = cb.send(Ok((id, term)));
                Ok(RaftHandle::Leader(self))
            }
            ClientRequest::CompleteTransaction { id, commit, cb } => {
                if commit {
                    match self.role.transactions.take(id) {
                        Ok(transaction) => {
                            // The buffered batch hits the journal in one
                            // contiguous range.
                            self.propose(transaction.requests, ResponseLevel::Replication, cb)?
                        }
                        Err(err) => {
                            let _ = cb.send(Err(err));
                        }
                    }
                } else {
                    let _ = cb.send(self.role.transactions.rollback(id).map(|_| None));
                }
                Ok(RaftHandle::Leader(self))
            }
            ClientRequest::OpeningTransactions { cb } => {
                let _ = cb.send(Ok(self.role.transactions.opening()));
                Ok(RaftHandle::Leader(self))
            }
            ClientRequest::DisableWrites {
                timeout_ms,
                term,
                cb,
            } => {
                if timeout_ms < 0 || term < 0 || term as u64 != self.state.current_term {
                    let _ = cb.send(Err(KeeperError::ConfigError(format!(
                        "disable-write term {} does not match {}",
                        term, self.state.current_term
                    ))));
                    return Ok(RaftHandle::Leader(self));
                }
                info!(self.role.logger, "writes disabled"; "timeout_ms" => timeout_ms);
                self.role.writes_disabled_until =
                    Some(Instant::now() + Duration::from_millis(timeout_ms as u64));
                let _ = cb.send(Ok(self.state.current_term));
                Ok(RaftHandle::Leader(self))
            }
            ClientRequest::UpdateVoters { old, new, cb } => {
                self.handle_update_voters(old, new, cb)?;
                Ok(RaftHandle::Leader(self))
            }
            ClientRequest::ConvertRoll { id, roll, cb } => {
                self.handle_convert_roll(id, roll, cb)?;
                Ok(RaftHandle::Leader(self))
            }
            ClientRequest::GetServers { cb } => {
                let _ = cb.send(Ok(self.servers_info()));
                Ok(RaftHandle::Leader(self))
            }
        }
    }

    pub(crate) fn on_applied(&mut self, applied: Applied) {
        self.role.pipeline.entry_applied(applied.index, &applied.result);
    }

    /// Committing a configuration that removed this server means stepping
    /// down.
    fn settle_roll(self) -> RaftHandle {
        if self.role.config_in_flight.is_none() && !self.cluster.contains_voter(self.id) {
            info!(self.role.logger, "removed from the voter set, stepping down");
            let follower: Raft<Follower> = Raft::from(self);
            if follower.cluster.contains_observer(follower.id) {
                return RaftHandle::Observer(Raft::from(follower));
            }
            return RaftHandle::Follower(follower);
        }
        RaftHandle::Leader(self)
    }

    fn tick(mut self) -> Result<RaftHandle> {
        let now = Instant::now();
        if let Some(until) = self.role.writes_disabled_until {
            if now >= until {
                info!(self.role.logger, "write window reopened");
                self.role.writes_disabled_until = None;
            }
        }
        self.role.pipeline.expire(now);
        if self.role.heartbeat_time.elapsed() >= self.role.heartbeat_timeout {
            self.broadcast_append()?;
        }

        let window = Duration::from_millis(self.config.election_timeout_ms * 2);
        if self.cluster.voters.len() > 1
            && self.role.leader_since.elapsed() > window
            && !self
                .role
                .progress
                .quorum_contacted(&self.cluster, self.id, window)
        {
            warn!(self.role.logger, "lost contact with a quorum, stepping down");
            return Ok(RaftHandle::Follower(Raft::from(self)));
        }
        Ok(RaftHandle::Leader(self))
    }
}

impl Apply for Raft<Leader> {
    fn apply(mut self, cmd: Command) -> Result<RaftHandle> {
        match cmd {
            Command::Tick => self.tick(),
            Command::Timeout => Ok(RaftHandle::Leader(self)),
            Command::VoteRequest { candidate_id, .. } => {
                let response = Command::VoteResponse {
                    term: self.state.current_term,
                    from: self.id,
                    granted: false,
                };
                self.reply(candidate_id, response)?;
                Ok(RaftHandle::Leader(self))
            }
            // Late ballots from the election that was already won.
            Command::VoteResponse { .. } => Ok(RaftHandle::Leader(self)),
            Command::AppendEntries { leader_id, .. } => {
                // Election safety: two leaders cannot share a term.
                warn!(self.role.logger, "append from another leader of this term";
                      "from" => leader_id);
                Ok(RaftHandle::Leader(self))
            }
            Command::AppendResponse {
                term,
                from,
                success,
                match_index,
                conflict,
            } => {
                if term < self.state.current_term {
                    return Ok(RaftHandle::Leader(self));
                }
                if success {
                    self.role.progress.record_success(from, match_index);
                    self.advance_commit()?;
                    let behind = self
                        .role
                        .progress
                        .get(from)
                        .map(|p| p.next_index <= self.journal.last_index())
                        .unwrap_or(false);
                    if behind {
                        self.replicate_to(from)?;
                    }
                    Ok(self.settle_roll())
                } else {
                    self.role.progress.record_conflict(from, conflict);
                    self.replicate_to(from)?;
                    Ok(RaftHandle::Leader(self))
                }
            }
            Command::InstallSnapshot { .. } => Ok(RaftHandle::Leader(self)),
            Command::InstallSnapshotResponse {
                term,
                from,
                next_offset,
            } => {
                if term < self.state.current_term {
                    return Ok(RaftHandle::Leader(self));
                }
                if let Some(progress) = self.role.progress.get_mut(from) {
                    progress.last_contact = Some(Instant::now());
                }
                let meta = match self.snapshots.latest()? {
                    Some(meta) => meta,
                    None => return Ok(RaftHandle::Leader(self)),
                };
                let size = self.snapshots.read(meta)?.len() as u64;
                if next_offset >= size {
                    if let Some(progress) = self.role.progress.get_mut(from) {
                        progress.snapshotting = None;
                        progress.next_index = meta.last_included_index + 1;
                        progress.match_index =
                            progress.match_index.max(meta.last_included_index);
                    }
                    self.advance_commit()?;
                    self.replicate_to(from)?;
                } else {
                    self.send_snapshot_chunk(from, next_offset)?;
                }
                Ok(RaftHandle::Leader(self))
            }
        }
    }
}

impl From<Raft<Candidate>> for Raft<Leader> {
    fn from(val: Raft<Candidate>) -> Raft<Leader> {
        let last_index = val.journal.last_index();
        let peer_ids: Vec<NodeId> = val
            .cluster
            .all_peers(val.id)
            .iter()
            .map(|p| p.id)
            .collect();
        let heartbeat_timeout = Duration::from_millis(val.config.heartbeat_interval_ms);
        Raft {
            id: val.id,
            role: Leader {
                logger: val.logger.new(o!("role" => "leader")),
                progress: crate::progress::ReplicationProgress::new(peer_ids, last_index),
                pipeline: Pipeline::new(),
                transactions: Transactions::new(),
                heartbeat_time: Instant::now(),
                heartbeat_timeout,
                leader_since: Instant::now(),
                writes_disabled_until: None,
                config_in_flight: None,
                pending_final_config: None,
                config_cb: None,
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

impl From<Raft<Leader>> for Raft<Follower> {
    fn from(mut val: Raft<Leader>) -> Raft<Follower> {
        info!(val.role.logger, "stepping down");
        // Every pending client completion fails before the role is gone;
        // open transaction sessions die with the role.
        val.role
            .pipeline
            .fail_all(KeeperError::NotLeader { leader_hint: None });
        if let Some(cb) = val.role.config_cb.take() {
            let _ = cb.send(Err(KeeperError::NotLeader { leader_hint: None }));
        }
        val.state.last_known_leader = None;
        let _ = val.events.send(ClusterEvent::LeaderChanged {
            term: val.state.current_term,
            leader: None,
        });
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::UpdateResult;
    use crate::testing::{leader, peer, recv_command};
    use tokio::sync::oneshot::error::TryRecvError;

    fn update(
        payloads: &[&str],
        level: ResponseLevel,
    ) -> (
        ClientRequest,
        oneshot::Receiver<Result<UpdateResult>>,
    ) {
        let (cb, rx) = oneshot::channel();
        let requests = payloads
            .iter()
            .map(|p| UpdateRequest::new(p.as_bytes().to_vec()))
            .collect();
        (
            ClientRequest::Update {
                requests,
                level,
                transaction: None,
                cb,
            },
            rx,
        )
    }

    fn success(from: NodeId, match_index: LogIndex) -> Command {
        Command::AppendResponse {
            term: 1,
            from,
            success: true,
            match_index,
            conflict: None,
        }
    }

    #[tokio::test]
    async fn replication_level_resolves_null_after_quorum() {
        let (raft, _node) = leader(1, &[1, 2, 3]);
        // Journal: noop@1. The update lands at index 2.
        let (req, mut rx) = update(&["x"], ResponseLevel::Replication);
        let handle = raft.client(req).unwrap();

        let handle = handle.apply(success(2, 1)).unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let handle = handle.apply(success(2, 2)).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), None);
        assert!(handle.state().commit_index >= 2);
    }

    #[tokio::test]
    async fn all_level_resolves_applied_results_in_submission_order() {
        let (raft, _node) = leader(1, &[1, 2, 3]);
        let (req, mut rx) = update(&["r1", "r2", "r3"], ResponseLevel::All);
        let handle = raft.client(req).unwrap();
        // Entries 2..=4. Quorum persists everything.
        let mut handle = handle.apply(success(2, 4)).unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        for (index, result) in [(2u64, "a1"), (3, "a2"), (4, "a3")].iter() {
            handle = handle
                .applied(Applied {
                    index: *index,
                    term: 1,
                    result: result.as_bytes().to_vec(),
                    state_hash: 0,
                })
                .unwrap();
        }
        let results = rx.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(
            results,
            vec![b"a1".to_vec(), b"a2".to_vec(), b"a3".to_vec()]
        );
    }

    #[tokio::test]
    async fn receive_and_persistence_resolve_immediately() {
        let (raft, _node) = leader(1, &[1, 2, 3]);
        let (req, mut rx) = update(&["x"], ResponseLevel::Receive);
        let raft = raft.client(req).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), None);

        let (req, mut rx) = update(&["y"], ResponseLevel::Persistence);
        raft.client(req).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn stepdown_fails_outstanding_proposals_with_not_leader() {
        let (raft, _node) = leader(1, &[1, 2, 3]);
        let (req, mut rx) = update(&["x"], ResponseLevel::Replication);
        let handle = raft.client(req).unwrap();

        // A higher-term message arrives before the entry replicates.
        let handle = handle
            .apply(Command::AppendEntries {
                term: 2,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                leader_commit: 0,
                entries: vec![],
            })
            .unwrap();
        assert_eq!(handle.role(), RaftRole::Follower);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(KeeperError::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn prior_term_entries_commit_only_transitively() {
        let (mut raft, _node) = leader(1, &[1, 2, 3]);
        // Rebuild the journal as: entry of an older term, then our noop.
        raft.journal.reset(0, 0).unwrap();
        raft.state.commit_index = 0;
        raft.state.fsm_dispatched = 0;
        raft.state.current_term = 3;
        raft.journal
            .append(crate::testing::entry(1, 1, "old"))
            .unwrap();
        raft.append_noop().unwrap();

        // A quorum holds the prior-term entry but not the noop: no commit.
        raft.role.progress.record_success(2, 1);
        raft.advance_commit().unwrap();
        assert_eq!(raft.state.commit_index, 0);

        // Once the quorum holds the current-term noop, both commit.
        raft.role.progress.record_success(2, 2);
        raft.advance_commit().unwrap();
        assert_eq!(raft.state.commit_index, 2);
    }

    #[tokio::test]
    async fn disable_leader_write_window() {
        let (raft, _node) = leader(1, &[1, 2, 3]);
        let (cb, mut disable_rx) = oneshot::channel();
        let handle = raft
            .client(ClientRequest::DisableWrites {
                timeout_ms: 5_000,
                term: 1,
                cb,
            })
            .unwrap();
        assert_eq!(disable_rx.try_recv().unwrap().unwrap(), 1);

        let (req, mut rx) = update(&["x"], ResponseLevel::Replication);
        let handle = handle.client(req).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(KeeperError::LeaderWriteDisabled)
        );

        // Force the window into the past; the next tick reopens writes.
        let mut raft = match handle {
            RaftHandle::Leader(raft) => raft,
            _ => panic!("expected leader"),
        };
        raft.role.writes_disabled_until = Some(Instant::now() - Duration::from_millis(1));
        let handle = RaftHandle::Leader(raft).apply(Command::Tick).unwrap();

        let (req, mut rx) = update(&["y"], ResponseLevel::Receive);
        handle.client(req).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn disable_leader_write_rejects_term_mismatch() {
        let (raft, _node) = leader(1, &[1, 2, 3]);
        let (cb, mut rx) = oneshot::channel();
        raft.client(ClientRequest::DisableWrites {
            timeout_ms: 5_000,
            term: 9,
            cb,
        })
        .unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(KeeperError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn joint_consensus_commits_only_with_both_majorities() {
        let (raft, mut node) = leader(1, &[1, 2, 3]);
        let (cb, mut config_rx) = oneshot::channel();
        // {1,2,3} -> {1,2,4}: an add and a remove, so joint consensus.
        let handle = raft
            .client(ClientRequest::UpdateVoters {
                old: vec![peer(1), peer(2), peer(3)],
                new: vec![peer(1), peer(2), peer(4)],
                cb,
            })
            .unwrap();
        // Journal: noop@1, joint-config@2; the joint config is in force.
        let (req, mut rx) = update(&["x"], ResponseLevel::Replication);
        let handle = handle.client(req).unwrap();

        // Only the removed server 3 acknowledges: old majority {1,3} but no
        // new majority, so nothing commits.
        let handle = handle.apply(success(3, 3)).unwrap();
        assert_eq!(handle.state().commit_index, 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        // Server 2 acknowledges: majorities in both sets.
        let handle = handle.apply(success(2, 3)).unwrap();
        assert!(handle.state().commit_index >= 3);
        assert_eq!(rx.try_recv().unwrap().unwrap(), None);

        // The joint stage committed, so the leader appended the final
        // config at index 4; once it commits the change completes.
        let handle = handle.apply(success(2, 4)).unwrap();
        assert_eq!(config_rx.try_recv().unwrap(), Ok(()));
        match handle {
            RaftHandle::Leader(raft) => {
                assert!(!raft.cluster.is_joint());
                let mut ids: Vec<NodeId> =
                    raft.cluster.voters.iter().map(|p| p.id).collect();
                ids.sort_unstable();
                assert_eq!(ids, vec![1, 2, 4]);
            }
            _ => panic!("expected leader"),
        }
        while recv_command(&mut node.rpc_rx).is_some() {}
    }

    #[tokio::test]
    async fn concurrent_configuration_change_is_rejected() {
        let (raft, _node) = leader(1, &[1, 2, 3]);
        let (cb, _config_rx) = oneshot::channel();
        let handle = raft
            .client(ClientRequest::UpdateVoters {
                old: vec![peer(1), peer(2), peer(3)],
                new: vec![peer(1), peer(2)],
                cb,
            })
            .unwrap();

        let (cb, mut rx) = oneshot::channel();
        handle
            .client(ClientRequest::ConvertRoll {
                id: 2,
                roll: Roll::Observer,
                cb,
            })
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(KeeperError::ConfigurationConflict)
        );
    }

    #[tokio::test]
    async fn transactions_buffer_until_commit() {
        let (raft, _node) = leader(1, &[1, 2, 3]);
        let (cb, mut begin_rx) = oneshot::channel();
        let handle = raft.client(ClientRequest::BeginTransaction { cb }).unwrap();
        let (id, term) = begin_rx.try_recv().unwrap().unwrap();
        assert_eq!(term, 1);

        let (cb, mut rx) = oneshot::channel();
        let handle = handle
            .client(ClientRequest::Update {
                requests: vec![
                    UpdateRequest::new(b"t1".to_vec()),
                    UpdateRequest::new(b"t2".to_vec()),
                ],
                level: ResponseLevel::Replication,
                transaction: Some(id),
                cb,
            })
            .unwrap();
        // Buffered, not yet in the journal.
        assert_eq!(rx.try_recv().unwrap().unwrap(), None);
        assert_eq!(handle.state().commit_index, 0);

        let (cb, mut commit_rx) = oneshot::channel();
        let handle = handle
            .client(ClientRequest::CompleteTransaction {
                id,
                commit: true,
                cb,
            })
            .unwrap();
        // Both buffered entries landed as one contiguous range 2..=3.
        let handle = handle.apply(success(2, 3)).unwrap();
        assert!(handle.state().commit_index >= 3);
        assert_eq!(commit_rx.try_recv().unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn rolled_back_transaction_is_gone() {
        let (raft, _node) = leader(1, &[1, 2, 3]);
        let (cb, mut begin_rx) = oneshot::channel();
        let handle = raft.client(ClientRequest::BeginTransaction { cb }).unwrap();
        let (id, _) = begin_rx.try_recv().unwrap().unwrap();

        let (cb, mut rx) = oneshot::channel();
        let handle = handle
            .client(ClientRequest::CompleteTransaction {
                id,
                commit: false,
                cb,
            })
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), None);

        let (cb, mut rx) = oneshot::channel();
        handle
            .client(ClientRequest::CompleteTransaction {
                id,
                commit: true,
                cb,
            })
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(KeeperError::TransactionInvalidated)
        );
    }
}
