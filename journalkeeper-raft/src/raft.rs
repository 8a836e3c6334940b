use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use journalkeeper_core::error::{KeeperError, Result};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use slog::Logger;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::candidate::Candidate;
use crate::config::{RaftConfig, Roll};
use crate::follower::Follower;
use crate::fsm::{Applied, Instruction};
use crate::journal::Journal;
use crate::leader::Leader;
use crate::observer::Observer;
use crate::rpc::{Address, ClientRequest, ClusterEvent, Message, ServersInfo};
use crate::snapshot::{IncomingSnapshot, SnapshotMeta, Snapshotter};
use crate::store::{MetaStore, VoterRecord, VoterStore};

/// An id that uniquely identifies one server of the cluster.
pub type NodeId = u32;
/// Monotonic cluster epoch, incremented at each election attempt.
pub type Term = u64;
/// Dense 1-based position of an entry in the journal.
pub type LogIndex = u64;

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A client payload routed to the state machine.
    Entry,
    /// A cluster configuration, adopted on append rather than commit.
    Config,
    /// The empty entry a new leader appends to commit its term.
    Noop,
}

impl EntryKind {
    pub fn code(self) -> u8 {
        match self {
            EntryKind::Entry => journalkeeper_wire::messages::WireEntry::KIND_ENTRY,
            EntryKind::Config => journalkeeper_wire::messages::WireEntry::KIND_CONFIG,
            EntryKind::Noop => journalkeeper_wire::messages::WireEntry::KIND_NOOP,
        }
    }

    pub fn from_code(code: u8) -> Result<EntryKind> {
        match code {
            0 => Ok(EntryKind::Entry),
            1 => Ok(EntryKind::Config),
            2 => Ok(EntryKind::Noop),
            other => Err(KeeperError::MalformedFrame(format!(
                "unknown entry kind {}",
                other
            ))),
        }
    }
}

/// An entry in the replicated journal. Once written at `(term, index)` it is
/// never mutated; a follower may only drop it as part of a truncated suffix.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub term: Term,
    pub index: LogIndex,
    pub partition: u16,
    pub batch_size: u32,
    pub timestamp: u64,
    pub kind: EntryKind,
    pub header: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn to_wire(&self) -> journalkeeper_wire::messages::WireEntry {
        journalkeeper_wire::messages::WireEntry {
            term: self.term,
            index: self.index,
            partition: self.partition,
            batch_size: self.batch_size,
            timestamp: self.timestamp,
            kind: self.kind.code(),
            header: self.header.clone(),
            payload: self.payload.clone(),
        }
    }

    pub fn from_wire(wire: journalkeeper_wire::messages::WireEntry) -> Result<Entry> {
        Ok(Entry {
            term: wire.term,
            index: wire.index,
            partition: wire.partition,
            batch_size: wire.batch_size,
            timestamp: wire.timestamp,
            kind: EntryKind::from_code(wire.kind)?,
            header: wire.header,
            payload: wire.payload,
        })
    }
}

/// One client update proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub payload: Vec<u8>,
    pub partition: u16,
    pub batch_size: u32,
    /// The payload already carries its framing header; the journal must not
    /// prepend another.
    pub include_header: bool,
}

impl UpdateRequest {
    pub fn new(payload: Vec<u8>) -> UpdateRequest {
        UpdateRequest {
            payload,
            partition: 0,
            batch_size: 1,
            include_header: false,
        }
    }
}

/// The stage of progress at which a client's future resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLevel {
    /// Acknowledged by the leader; resolves to null.
    Receive,
    /// Persisted locally; resolves to null.
    Persistence,
    /// Replicated to a quorum; resolves to null.
    Replication,
    /// Applied by the state machine; resolves to one result per entry.
    All,
}

impl ResponseLevel {
    pub fn code(self) -> u8 {
        match self {
            ResponseLevel::Receive => 0,
            ResponseLevel::Persistence => 1,
            ResponseLevel::Replication => 2,
            ResponseLevel::All => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<ResponseLevel> {
        match code {
            0 => Ok(ResponseLevel::Receive),
            1 => Ok(ResponseLevel::Persistence),
            2 => Ok(ResponseLevel::Replication),
            3 => Ok(ResponseLevel::All),
            other => Err(KeeperError::MalformedFrame(format!(
                "unknown response level {}",
                other
            ))),
        }
    }
}

/// A single null for every level below ALL; one applied result per entry for
/// ALL.
pub type UpdateResult = Option<Vec<Vec<u8>>>;

/// Contains information about one server of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub addr: SocketAddr,
}

fn majority(total: usize) -> usize {
    total / 2 + 1
}

/// The voter and observer sets. `voters_old` is populated only while a joint
/// configuration is in force; a quorum then requires a majority in both sets.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClusterConfig {
    pub voters: Vec<Peer>,
    pub voters_old: Option<Vec<Peer>>,
    pub observers: Vec<Peer>,
}

impl ClusterConfig {
    pub fn is_joint(&self) -> bool {
        self.voters_old.is_some()
    }

    pub fn contains_voter(&self, id: NodeId) -> bool {
        self.voters.iter().any(|p| p.id == id)
            || self
                .voters_old
                .as_ref()
                .map(|old| old.iter().any(|p| p.id == id))
                .unwrap_or(false)
    }

    pub fn contains_observer(&self, id: NodeId) -> bool {
        self.observers.iter().any(|p| p.id == id)
    }

    /// Every distinct peer except `exclude`, voters first.
    pub fn all_peers(&self, exclude: NodeId) -> Vec<Peer> {
        let mut peers: Vec<Peer> = Vec::new();
        let mut push = |p: &Peer| {
            if p.id != exclude && !peers.iter().any(|q| q.id == p.id) {
                peers.push(*p);
            }
        };
        self.voters.iter().for_each(&mut push);
        if let Some(old) = &self.voters_old {
            old.iter().for_each(&mut push);
        }
        self.observers.iter().for_each(&mut push);
        peers
    }

    /// Ids of every server allowed to vote in the current configuration.
    pub fn voter_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.voters.iter().map(|p| p.id).collect();
        if let Some(old) = &self.voters_old {
            for p in old {
                if !ids.contains(&p.id) {
                    ids.push(p.id);
                }
            }
        }
        ids
    }

    /// True when `has` holds for a majority of voters, in both
    /// configurations while a joint configuration is in force.
    pub fn quorum<F: Fn(NodeId) -> bool>(&self, has: F) -> bool {
        let satisfied = |set: &[Peer]| {
            let granted = set.iter().filter(|p| has(p.id)).count();
            granted >= majority(set.len())
        };
        if !satisfied(&self.voters) {
            return false;
        }
        match &self.voters_old {
            Some(old) => satisfied(old),
            None => true,
        }
    }

    pub fn addr_of(&self, id: NodeId) -> Option<SocketAddr> {
        self.all_peers(u32::MAX)
            .into_iter()
            .find(|p| p.id == id)
            .map(|p| p.addr)
    }

    pub fn to_wire(&self) -> journalkeeper_wire::messages::WireClusterConfig {
        let server = |p: &Peer| journalkeeper_wire::messages::WireServer {
            id: p.id,
            addr: p.addr.to_string(),
        };
        journalkeeper_wire::messages::WireClusterConfig {
            voters: self.voters.iter().map(server).collect(),
            voters_old: self
                .voters_old
                .as_ref()
                .map(|old| old.iter().map(server).collect()),
            observers: self.observers.iter().map(server).collect(),
        }
    }

    pub fn from_wire(wire: journalkeeper_wire::messages::WireClusterConfig) -> Result<ClusterConfig> {
        let peer = |s: &journalkeeper_wire::messages::WireServer| -> Result<Peer> {
            Ok(Peer {
                id: s.id,
                addr: s
                    .addr
                    .parse()
                    .map_err(|_| KeeperError::MalformedFrame(format!("bad address {}", s.addr)))?,
            })
        };
        let peers = |list: &[journalkeeper_wire::messages::WireServer]| -> Result<Vec<Peer>> {
            list.iter().map(peer).collect()
        };
        Ok(ClusterConfig {
            voters: peers(&wire.voters)?,
            voters_old: match &wire.voters_old {
                Some(old) => Some(peers(old)?),
                None => None,
            },
            observers: peers(&wire.observers)?,
        })
    }

    pub fn config_entry_payload(&self) -> Vec<u8> {
        self.to_wire().to_payload()
    }

    pub fn from_entry(entry: &Entry) -> Result<ClusterConfig> {
        let wire =
            journalkeeper_wire::messages::WireClusterConfig::from_payload(&entry.payload)?;
        ClusterConfig::from_wire(wire)
    }
}

/// Conflict hint in a failed AppendEntries response, letting the leader jump
/// `next_index` past the whole conflicting term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conflict {
    pub term: Term,
    pub first_index: LogIndex,
}

/// Commands that move the role state machine forward.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Move the state machine forward in time.
    Tick,
    /// Force an immediate election.
    Timeout,
    VoteRequest {
        term: Term,
        candidate_id: NodeId,
        last_log_term: Term,
        last_log_index: LogIndex,
    },
    VoteResponse {
        term: Term,
        from: NodeId,
        granted: bool,
    },
    AppendEntries {
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        leader_commit: LogIndex,
        entries: Vec<Entry>,
    },
    AppendResponse {
        term: Term,
        from: NodeId,
        success: bool,
        match_index: LogIndex,
        conflict: Option<Conflict>,
    },
    InstallSnapshot {
        term: Term,
        leader_id: NodeId,
        last_included_index: LogIndex,
        last_included_term: Term,
        offset: u64,
        done: bool,
        data: Vec<u8>,
    },
    InstallSnapshotResponse {
        term: Term,
        from: NodeId,
        next_offset: u64,
    },
}

impl Command {
    /// The term carried by the message, used for higher-term discovery.
    pub fn term(&self) -> Option<Term> {
        match self {
            Command::Tick | Command::Timeout => None,
            Command::VoteRequest { term, .. }
            | Command::VoteResponse { term, .. }
            | Command::AppendEntries { term, .. }
            | Command::AppendResponse { term, .. }
            | Command::InstallSnapshot { term, .. }
            | Command::InstallSnapshotResponse { term, .. } => Some(*term),
        }
    }
}

/// Volatile and persistent state common to every role.
pub struct State {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub last_known_leader: Option<NodeId>,

    /// Advanced only by quorum commit; never moves backwards.
    pub commit_index: LogIndex,
    /// Highest index handed to the state machine host.
    pub fsm_dispatched: LogIndex,
    /// Highest index the state machine host has applied.
    pub last_applied: LogIndex,
    pub last_snapshot_index: LogIndex,

    /// A snapshot transfer in progress from the leader, if any.
    pub installing: Option<IncomingSnapshot>,

    pub election_time: Option<Instant>,
    pub election_timeout: Option<Duration>,
}

impl Default for State {
    fn default() -> Self {
        State {
            current_term: 0,
            voted_for: None,
            last_known_leader: None,
            commit_index: 0,
            fsm_dispatched: 0,
            last_applied: 0,
            last_snapshot_index: 0,
            installing: None,
            election_time: None,
            election_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
    Observer,
}

/// Shared behavior every role of the state machine implements.
pub trait Role {
    /// A new term was adopted; reset any role state bound to the old one.
    fn term(&mut self, term: Term);
    fn role(&self) -> RaftRole;
    fn logger(&self) -> &Logger;
}

/// The primary struct representing one server. Role-specific state and
/// behavior live in `role`; everything else is common to all roles.
pub struct Raft<T: Role> {
    pub id: NodeId,
    pub logger: Logger,
    pub config: RaftConfig,
    pub cluster: ClusterConfig,
    pub state: State,
    pub journal: Box<dyn Journal>,
    pub voters: VoterStore,
    pub meta: MetaStore,
    pub snapshots: Snapshotter,
    pub role: T,
    pub rpc_tx: mpsc::UnboundedSender<Message>,
    pub fsm_tx: mpsc::UnboundedSender<Instruction>,
    pub events: broadcast::Sender<ClusterEvent>,
}

impl<T: Role> Raft<T> {
    pub fn reset_election_timer(&mut self) {
        let base = self.config.election_timeout_ms;
        let timeout = rand::thread_rng().gen_range(base..base * 2);
        self.state.election_time = Some(Instant::now());
        self.state.election_timeout = Some(Duration::from_millis(timeout));
    }

    pub fn needs_election(&self) -> bool {
        match (self.state.election_time, self.state.election_timeout) {
            (Some(time), Some(timeout)) => time.elapsed() > timeout,
            _ => false,
        }
    }

    /// The voter record is durable before any reply that depends on it.
    pub fn persist_record(&self) -> Result<()> {
        self.voters.save(&VoterRecord {
            current_term: self.state.current_term,
            voted_for: self.state.voted_for,
            last_known_leader: self.state.last_known_leader,
        })
    }

    /// Advances the term and clears the vote, atomically with persistence.
    pub fn adopt_term(&mut self, term: Term) -> Result<()> {
        self.state.current_term = term;
        self.state.voted_for = None;
        self.persist_record()?;
        self.role.term(term);
        Ok(())
    }

    pub fn send(&self, to: Peer, command: Command) -> Result<()> {
        self.rpc_tx
            .send(Message {
                from: self.id,
                to: Address::Peer(to),
                command,
            })
            .map_err(|_| KeeperError::Stopped)
    }

    pub fn send_all(&self, command: Command) -> Result<()> {
        for peer in self.cluster.all_peers(self.id) {
            self.send(peer, command.clone())?;
        }
        Ok(())
    }

    /// Replies to a server by id; a sender outside the known configuration
    /// is dropped.
    pub fn reply(&self, to: NodeId, command: Command) -> Result<()> {
        match self.cluster.addr_of(to) {
            Some(addr) => self.send(Peer { id: to, addr }, command),
            None => {
                debug!(self.logger, "dropping reply to unknown server"; "to" => to);
                Ok(())
            }
        }
    }

    pub fn emit(&self, event: ClusterEvent) {
        // Nobody watching is fine.
        let _ = self.events.send(event);
    }

    pub fn last_log_info(&self) -> (Term, LogIndex) {
        (self.journal.last_term(), self.journal.last_index())
    }

    /// The up-to-date comparison of the election rule: last term, then last
    /// index, lexicographically.
    pub fn log_up_to_date(&self, last_term: Term, last_index: LogIndex) -> bool {
        (last_term, last_index) >= self.last_log_info()
    }

    pub fn servers_info(&self) -> ServersInfo {
        ServersInfo {
            leader: self.state.last_known_leader,
            voters: self.cluster.voters.clone(),
            observers: self.cluster.observers.clone(),
        }
    }

    /// Hands every newly committed entry to the state machine host, in index
    /// order, exactly once.
    pub fn dispatch_applies(&mut self) -> Result<()> {
        while self.state.fsm_dispatched < self.state.commit_index {
            let next = self.state.fsm_dispatched + 1;
            let entry = self.journal.read_at(next)?;
            self.fsm_tx
                .send(Instruction::Apply { entry })
                .map_err(|_| KeeperError::Stopped)?;
            self.state.fsm_dispatched = next;
        }
        Ok(())
    }

    /// Vote handling shared by follower and observer; an observer never
    /// grants.
    pub fn handle_vote_request(
        &mut self,
        candidate_id: NodeId,
        last_log_term: Term,
        last_log_index: LogIndex,
        can_vote: bool,
    ) -> Result<Command> {
        let granted = can_vote
            && self.log_up_to_date(last_log_term, last_log_index)
            && match self.state.voted_for {
                None => true,
                Some(voted) => voted == candidate_id,
            };
        if granted {
            self.state.voted_for = Some(candidate_id);
            self.persist_record()?;
            self.reset_election_timer();
        }
        Ok(Command::VoteResponse {
            term: self.state.current_term,
            from: self.id,
            granted,
        })
    }

    /// Replication receive path shared by follower and observer. The caller
    /// has already matched terms.
    pub fn handle_append(
        &mut self,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        leader_commit: LogIndex,
        entries: Vec<Entry>,
    ) -> Result<Command> {
        self.state.last_known_leader = Some(leader_id);
        self.reset_election_timer();

        let matches = prev_log_index == 0
            || self.journal.term_at(prev_log_index) == Some(prev_log_term);
        if !matches {
            let conflict = match self.journal.term_at(prev_log_index) {
                Some(term) => {
                    let mut first = prev_log_index;
                    while first > self.journal.first_index()
                        && self.journal.term_at(first - 1) == Some(term)
                    {
                        first -= 1;
                    }
                    Conflict {
                        term,
                        first_index: first,
                    }
                }
                None => Conflict {
                    term: 0,
                    first_index: self.journal.last_index() + 1,
                },
            };
            debug!(self.logger, "append mismatch";
                   "prev_log_index" => prev_log_index,
                   "conflict_term" => conflict.term,
                   "conflict_first" => conflict.first_index);
            return Ok(Command::AppendResponse {
                term: self.state.current_term,
                from: self.id,
                success: false,
                match_index: 0,
                conflict: Some(conflict),
            });
        }

        let match_index = prev_log_index + entries.len() as u64;
        let mut to_append: Vec<Entry> = Vec::new();
        for entry in entries {
            if !to_append.is_empty() {
                to_append.push(entry);
                continue;
            }
            match self.journal.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    if entry.index <= self.state.commit_index {
                        return Err(KeeperError::StorageFault(format!(
                            "leader conflicts with committed entry {}",
                            entry.index
                        )));
                    }
                    // Durable before the success reply for the overwrite.
                    self.journal.truncate_after(entry.index - 1)?;
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }

        let mut new_config = None;
        for entry in &to_append {
            if entry.kind == EntryKind::Config {
                new_config = Some(ClusterConfig::from_entry(entry)?);
            }
        }
        if !to_append.is_empty() {
            self.journal.append_batch(to_append)?;
        }
        if let Some(cluster) = new_config {
            info!(self.logger, "adopting configuration from log";
                  "voters" => format!("{:?}", cluster.voter_ids()));
            self.cluster = cluster;
            self.emit(ClusterEvent::ConfigChanged {
                index: self.journal.last_index(),
            });
        }

        let new_commit = leader_commit
            .min(match_index)
            .min(self.journal.last_index());
        if new_commit > self.state.commit_index {
            self.state.commit_index = new_commit;
            self.dispatch_applies()?;
            self.emit(ClusterEvent::CommitAdvanced { index: new_commit });
        }

        Ok(Command::AppendResponse {
            term: self.state.current_term,
            from: self.id,
            success: true,
            match_index,
            conflict: None,
        })
    }

    /// Receives one snapshot chunk, shared by follower and observer.
    pub fn handle_snapshot_chunk(
        &mut self,
        leader_id: NodeId,
        last_included_index: LogIndex,
        last_included_term: Term,
        offset: u64,
        done: bool,
        data: Vec<u8>,
    ) -> Result<Command> {
        self.state.last_known_leader = Some(leader_id);
        self.reset_election_timer();
        let meta = SnapshotMeta {
            last_included_index,
            last_included_term,
        };

        let restart = match &self.state.installing {
            Some(installing) => installing.meta != meta,
            None => true,
        };
        if restart {
            self.state.installing = Some(IncomingSnapshot::new(meta));
        }
        let installing = self.state.installing.as_mut().unwrap();
        let accepted = offset == installing.next_offset();
        if accepted {
            installing.accept(data);
        }
        let next_offset = installing.next_offset();

        if done && accepted {
            let installing = self.state.installing.take().unwrap();
            self.finish_snapshot_install(meta, installing.into_data())?;
        }

        Ok(Command::InstallSnapshotResponse {
            term: self.state.current_term,
            from: self.id,
            next_offset,
        })
    }

    fn finish_snapshot_install(&mut self, meta: SnapshotMeta, data: Vec<u8>) -> Result<()> {
        info!(self.logger, "installing snapshot";
              "index" => meta.last_included_index, "term" => meta.last_included_term);
        self.snapshots.write(meta, &data)?;
        self.journal
            .reset(meta.last_included_index, meta.last_included_term)?;
        self.fsm_tx
            .send(Instruction::Restore {
                index: meta.last_included_index,
                data,
            })
            .map_err(|_| KeeperError::Stopped)?;
        self.state.commit_index = meta.last_included_index;
        self.state.fsm_dispatched = meta.last_included_index;
        self.state.last_applied = meta.last_included_index;
        self.state.last_snapshot_index = meta.last_included_index;
        self.emit(ClusterEvent::SnapshotTaken {
            index: meta.last_included_index,
            term: meta.last_included_term,
        });
        Ok(())
    }

    /// Non-leader handling of client traffic: redirect writes, serve
    /// sequential reads and server listings locally.
    pub fn redirect_client(&mut self, req: ClientRequest) {
        let hint = self.state.last_known_leader;
        let not_leader = KeeperError::NotLeader { leader_hint: hint };
        match req {
            ClientRequest::Query {
                payload,
                sequential: true,
                min_index,
                cb,
            } => {
                let instruction = Instruction::Query {
                    payload,
                    min_index,
                    cb,
                };
                if let Err(mpsc::error::SendError(Instruction::Query { cb, .. })) =
                    self.fsm_tx.send(instruction)
                {
                    let _ = cb.send(Err(KeeperError::Stopped));
                }
            }
            ClientRequest::Query { cb, .. } => {
                let _ = cb.send(Err(not_leader));
            }
            ClientRequest::GetServers { cb } => {
                let _ = cb.send(Ok(self.servers_info()));
            }
            ClientRequest::Update { cb, .. } => {
                let _ = cb.send(Err(not_leader));
            }
            ClientRequest::BeginTransaction { cb } => {
                let _ = cb.send(Err(not_leader));
            }
            ClientRequest::CompleteTransaction { cb, .. } => {
                let _ = cb.send(Err(not_leader));
            }
            ClientRequest::OpeningTransactions { cb } => {
                let _ = cb.send(Err(not_leader));
            }
            ClientRequest::DisableWrites { cb, .. } => {
                let _ = cb.send(Err(not_leader));
            }
            ClientRequest::UpdateVoters { cb, .. } => {
                let _ = cb.send(Err(not_leader));
            }
            ClientRequest::ConvertRoll { cb, .. } => {
                let _ = cb.send(Err(not_leader));
            }
        }
    }

    /// Initiates a snapshot when the journal has outgrown the configured
    /// length. Returns the receiver the run loop awaits.
    pub fn start_snapshot(
        &mut self,
    ) -> Result<Option<oneshot::Receiver<Result<(LogIndex, Vec<u8>)>>>> {
        let span = self
            .journal
            .last_index()
            .saturating_sub(self.journal.first_index().saturating_sub(1));
        if span < self.config.snapshot_entries
            || self.state.last_applied <= self.state.last_snapshot_index
        {
            return Ok(None);
        }
        let (cb, rx) = oneshot::channel();
        self.fsm_tx
            .send(Instruction::Snapshot { cb })
            .map_err(|_| KeeperError::Stopped)?;
        Ok(Some(rx))
    }

    /// Persists a completed state machine snapshot and compacts the journal
    /// behind it.
    pub fn store_snapshot(&mut self, index: LogIndex, data: Vec<u8>) -> Result<()> {
        let term = match self.journal.term_at(index) {
            Some(term) => term,
            None => return Ok(()),
        };
        let meta = SnapshotMeta {
            last_included_index: index,
            last_included_term: term,
        };
        self.snapshots.write(meta, &data)?;
        self.state.last_snapshot_index = index;

        let boundary = index.saturating_sub(self.config.snapshot_margin);
        if boundary >= self.journal.first_index() {
            if let Some(boundary_term) = self.journal.term_at(boundary) {
                self.journal.compact_to(boundary, boundary_term)?;
            }
        }
        info!(self.logger, "snapshot stored"; "index" => index, "term" => term);
        self.emit(ClusterEvent::SnapshotTaken { index, term });
        Ok(())
    }
}

/// Since applying a command can result in any role transition, the result is
/// generalized over the possible role states.
pub enum RaftHandle {
    Follower(Raft<Follower>),
    Candidate(Raft<Candidate>),
    Leader(Raft<Leader>),
    Observer(Raft<Observer>),
}

macro_rules! with_raft {
    ($handle:expr, $r:ident => $body:expr) => {
        match $handle {
            RaftHandle::Follower($r) => $body,
            RaftHandle::Candidate($r) => $body,
            RaftHandle::Leader($r) => $body,
            RaftHandle::Observer($r) => $body,
        }
    };
}

/// Applying a command is the basic way the state machine moves forward. Each
/// role implements this to decide how it responds to particular commands.
pub trait Apply {
    fn apply(self, cmd: Command) -> Result<RaftHandle>;
}

impl RaftHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RaftConfig,
        cluster: ClusterConfig,
        record: VoterRecord,
        journal: Box<dyn Journal>,
        voters: VoterStore,
        meta: MetaStore,
        snapshots: Snapshotter,
        logger: Logger,
        rpc_tx: mpsc::UnboundedSender<Message>,
        fsm_tx: mpsc::UnboundedSender<Instruction>,
        events: broadcast::Sender<ClusterEvent>,
    ) -> Result<RaftHandle> {
        config.validate()?;
        let mut state = State::default();
        state.current_term = record.current_term;
        state.voted_for = record.voted_for;
        state.last_known_leader = record.last_known_leader;

        let roll = config.roll;
        let id = config.id;
        let mut raft = Raft {
            id,
            logger: logger.new(o!("id" => id)),
            config,
            cluster,
            state,
            journal,
            voters,
            meta,
            snapshots,
            role: Follower::new(&logger),
            rpc_tx,
            fsm_tx,
            events,
        };
        raft.reset_election_timer();
        match roll {
            Roll::Voter => Ok(RaftHandle::Follower(raft)),
            Roll::Observer => Ok(RaftHandle::Observer(Raft::from(raft))),
        }
    }

    pub fn role(&self) -> RaftRole {
        with_raft!(self, r => r.role.role())
    }

    /// Positions the volatile indices at an installed snapshot boundary
    /// during bootstrap, after the state machine was restored from it.
    pub fn restore_boundary(&mut self, meta: SnapshotMeta) {
        with_raft!(self, r => {
            r.state.commit_index = meta.last_included_index;
            r.state.fsm_dispatched = meta.last_included_index;
            r.state.last_applied = meta.last_included_index;
            r.state.last_snapshot_index = meta.last_included_index;
        })
    }

    pub fn state(&self) -> &State {
        with_raft!(self, r => &r.state)
    }

    pub fn current_term(&self) -> Term {
        self.state().current_term
    }

    /// Adopting a higher observed term forces a transition out of candidate
    /// and leader; observers stay observers.
    fn observe_term(self, term: Term) -> Result<RaftHandle> {
        if term <= self.state().current_term {
            return Ok(self);
        }
        match self {
            RaftHandle::Follower(mut raft) => {
                raft.adopt_term(term)?;
                Ok(RaftHandle::Follower(raft))
            }
            RaftHandle::Observer(mut raft) => {
                raft.adopt_term(term)?;
                Ok(RaftHandle::Observer(raft))
            }
            RaftHandle::Candidate(raft) => {
                let mut follower: Raft<Follower> = Raft::from(raft);
                follower.adopt_term(term)?;
                Ok(RaftHandle::Follower(follower))
            }
            RaftHandle::Leader(raft) => {
                let mut follower: Raft<Follower> = Raft::from(raft);
                follower.adopt_term(term)?;
                Ok(RaftHandle::Follower(follower))
            }
        }
    }

    pub fn step(self, msg: Message) -> Result<RaftHandle> {
        self.apply(msg.command)
    }

    /// Routes one client request to the current role.
    pub fn client(self, req: ClientRequest) -> Result<RaftHandle> {
        match self {
            RaftHandle::Leader(raft) => raft.client(req),
            mut other => {
                with_raft!(&mut other, r => r.redirect_client(req));
                Ok(other)
            }
        }
    }

    /// A state machine host notification that one entry finished applying.
    pub fn applied(self, applied: Applied) -> Result<RaftHandle> {
        match self {
            RaftHandle::Leader(mut raft) => {
                raft.state.last_applied = applied.index;
                raft.on_applied(applied);
                Ok(RaftHandle::Leader(raft))
            }
            mut other => {
                with_raft!(&mut other, r => r.state.last_applied = applied.index);
                Ok(other)
            }
        }
    }

    async fn maybe_snapshot(&mut self) -> Result<()> {
        let rx = with_raft!(self, r => r.start_snapshot())?;
        if let Some(rx) = rx {
            match rx.await {
                Ok(Ok((index, data))) => {
                    with_raft!(self, r => r.store_snapshot(index, data))?;
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(KeeperError::Stopped),
            }
        }
        Ok(())
    }

    fn stop(self) -> Result<RaftHandle> {
        if let RaftHandle::Leader(mut raft) = self {
            raft.role.pipeline.fail_all(KeeperError::Stopped);
            Ok(RaftHandle::Leader(raft))
        } else {
            Ok(self)
        }
    }

    /// The single logical execution context of the server: every role, term
    /// and log-pointer mutation happens inside this loop.
    pub async fn run(
        mut self,
        mut rpc_rx: mpsc::UnboundedReceiver<Message>,
        mut client_rx: mpsc::UnboundedReceiver<ClientRequest>,
        mut applied_rx: mpsc::UnboundedReceiver<Applied>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<RaftHandle> {
        let tick = Duration::from_millis(with_raft!(&self, r => r.config.tick_interval_ms).max(1));
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,

                _ = ticker.tick() => {
                    self = self.apply(Command::Tick)?;
                    self.maybe_snapshot().await?;
                }

                Some(msg) = rpc_rx.recv() => {
                    self = self.step(msg)?;
                }

                Some(req) = client_rx.recv() => {
                    self = self.client(req)?;
                }

                Some(applied) = applied_rx.recv() => {
                    self = self.applied(applied)?;
                }
            }
        }
        self.stop()
    }
}

impl Apply for RaftHandle {
    fn apply(self, cmd: Command) -> Result<RaftHandle> {
        let handle = match cmd.term() {
            Some(term) => self.observe_term(term)?,
            None => self,
        };
        match handle {
            RaftHandle::Follower(raft) => raft.apply(cmd),
            RaftHandle::Candidate(raft) => raft.apply(cmd),
            RaftHandle::Leader(raft) => raft.apply(cmd),
            RaftHandle::Observer(raft) => raft.apply(cmd),
        }
    }
}
