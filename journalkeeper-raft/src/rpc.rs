use journalkeeper_core::error::{KeeperError, Result};
use journalkeeper_wire::messages as wire;
use journalkeeper_wire::Body;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::Roll;
use crate::raft::{
    Command, Conflict, Entry, LogIndex, NodeId, Peer, ResponseLevel, Term, UpdateRequest,
    UpdateResult,
};

/// Where an outbound message is headed.
#[derive(Debug, Clone, PartialEq)]
pub enum Address {
    Peer(Peer),
    /// Delivered in-process, used by tests driving the loop directly.
    Local,
}

/// One protocol message between servers.
#[derive(Debug, Clone)]
pub struct Message {
    pub from: NodeId,
    pub to: Address,
    pub command: Command,
}

/// Everything a client can ask of a server, with the completion the caller
/// is waiting on.
#[derive(Debug)]
pub enum ClientRequest {
    Update {
        requests: Vec<UpdateRequest>,
        level: ResponseLevel,
        transaction: Option<Uuid>,
        cb: oneshot::Sender<Result<UpdateResult>>,
    },
    Query {
        payload: Vec<u8>,
        sequential: bool,
        min_index: LogIndex,
        cb: oneshot::Sender<Result<(Vec<u8>, LogIndex)>>,
    },
    BeginTransaction {
        cb: oneshot::Sender<Result<(Uuid, Term)>>,
    },
    CompleteTransaction {
        id: Uuid,
        commit: bool,
        cb: oneshot::Sender<Result<UpdateResult>>,
    },
    OpeningTransactions {
        cb: oneshot::Sender<Result<Vec<Uuid>>>,
    },
    DisableWrites {
        timeout_ms: i64,
        term: i32,
        cb: oneshot::Sender<Result<Term>>,
    },
    UpdateVoters {
        old: Vec<Peer>,
        new: Vec<Peer>,
        cb: oneshot::Sender<Result<()>>,
    },
    ConvertRoll {
        id: NodeId,
        roll: Roll,
        cb: oneshot::Sender<Result<()>>,
    },
    GetServers {
        cb: oneshot::Sender<Result<ServersInfo>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServersInfo {
    pub leader: Option<NodeId>,
    pub voters: Vec<Peer>,
    pub observers: Vec<Peer>,
}

/// Cluster events pushed to watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    LeaderChanged { term: Term, leader: Option<NodeId> },
    CommitAdvanced { index: LogIndex },
    ConfigChanged { index: LogIndex },
    SnapshotTaken { index: LogIndex, term: Term },
}

impl ClusterEvent {
    pub fn to_wire(&self) -> wire::ClusterEventPush {
        match self {
            ClusterEvent::LeaderChanged { term, leader } => wire::ClusterEventPush {
                kind: 1,
                term: *term,
                leader: *leader,
                index: 0,
            },
            ClusterEvent::CommitAdvanced { index } => wire::ClusterEventPush {
                kind: 2,
                term: 0,
                leader: None,
                index: *index,
            },
            ClusterEvent::ConfigChanged { index } => wire::ClusterEventPush {
                kind: 3,
                term: 0,
                leader: None,
                index: *index,
            },
            ClusterEvent::SnapshotTaken { index, term } => wire::ClusterEventPush {
                kind: 4,
                term: *term,
                leader: None,
                index: *index,
            },
        }
    }
}

pub fn peer_to_wire(peer: &Peer) -> wire::WireServer {
    wire::WireServer {
        id: peer.id,
        addr: peer.addr.to_string(),
    }
}

pub fn peer_from_wire(server: &wire::WireServer) -> Result<Peer> {
    Ok(Peer {
        id: server.id,
        addr: server
            .addr
            .parse()
            .map_err(|_| KeeperError::MalformedFrame(format!("bad address {}", server.addr)))?,
    })
}

/// Maps a decoded peer frame body onto a protocol command. Client bodies
/// return `None`; they are dispatched as `ClientRequest`s instead.
pub fn body_to_command(body: Body) -> Result<Option<Command>> {
    let command = match body {
        Body::RequestVote(m) => Command::VoteRequest {
            term: m.term,
            candidate_id: m.candidate_id,
            last_log_term: m.last_log_term,
            last_log_index: m.last_log_index,
        },
        Body::RequestVoteResponse(m) => Command::VoteResponse {
            term: m.term,
            from: m.from,
            granted: m.granted,
        },
        Body::AppendEntries(m) => {
            let mut entries = Vec::with_capacity(m.entries.len());
            for wire_entry in m.entries {
                entries.push(Entry::from_wire(wire_entry)?);
            }
            Command::AppendEntries {
                term: m.term,
                leader_id: m.leader_id,
                prev_log_index: m.prev_log_index,
                prev_log_term: m.prev_log_term,
                leader_commit: m.leader_commit,
                entries,
            }
        }
        Body::AppendEntriesResponse(m) => Command::AppendResponse {
            term: m.term,
            from: m.from,
            success: m.success,
            match_index: m.match_index,
            conflict: m.conflict.map(|c| Conflict {
                term: c.term,
                first_index: c.first_index,
            }),
        },
        Body::InstallSnapshot(m) => Command::InstallSnapshot {
            term: m.term,
            leader_id: m.leader_id,
            last_included_index: m.last_included_index,
            last_included_term: m.last_included_term,
            offset: m.offset,
            done: m.done,
            data: m.data,
        },
        Body::InstallSnapshotResponse(m) => Command::InstallSnapshotResponse {
            term: m.term,
            from: m.from,
            next_offset: m.next_offset,
        },
        _ => return Ok(None),
    };
    Ok(Some(command))
}

/// The inverse mapping for outbound peer traffic. Local commands have no
/// wire form.
pub fn command_to_body(command: &Command) -> Option<Body> {
    let body = match command {
        Command::Tick | Command::Timeout => return None,
        Command::VoteRequest {
            term,
            candidate_id,
            last_log_term,
            last_log_index,
        } => Body::RequestVote(wire::RequestVoteRequest {
            term: *term,
            candidate_id: *candidate_id,
            last_log_term: *last_log_term,
            last_log_index: *last_log_index,
        }),
        Command::VoteResponse {
            term,
            from,
            granted,
        } => Body::RequestVoteResponse(wire::RequestVoteResponse {
            term: *term,
            from: *from,
            granted: *granted,
        }),
        Command::AppendEntries {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            leader_commit,
            entries,
        } => Body::AppendEntries(wire::AppendEntriesRequest {
            term: *term,
            leader_id: *leader_id,
            prev_log_index: *prev_log_index,
            prev_log_term: *prev_log_term,
            leader_commit: *leader_commit,
            entries: entries.iter().map(|e| e.to_wire()).collect(),
        }),
        Command::AppendResponse {
            term,
            from,
            success,
            match_index,
            conflict,
        } => Body::AppendEntriesResponse(wire::AppendEntriesResponse {
            term: *term,
            from: *from,
            success: *success,
            match_index: *match_index,
            conflict: conflict.map(|c| wire::WireConflict {
                term: c.term,
                first_index: c.first_index,
            }),
        }),
        Command::InstallSnapshot {
            term,
            leader_id,
            last_included_index,
            last_included_term,
            offset,
            done,
            data,
        } => Body::InstallSnapshot(wire::InstallSnapshotRequest {
            term: *term,
            leader_id: *leader_id,
            last_included_index: *last_included_index,
            last_included_term: *last_included_term,
            offset: *offset,
            done: *done,
            data: data.clone(),
        }),
        Command::InstallSnapshotResponse {
            term,
            from,
            next_offset,
        } => Body::InstallSnapshotResponse(wire::InstallSnapshotResponse {
            term: *term,
            from: *from,
            next_offset: *next_offset,
        }),
    };
    Some(body)
}
