use bytes::{Buf, BufMut, Bytes, BytesMut};
use journalkeeper_core::error::{KeeperError, Result};
use uuid::Uuid;

use crate::frame::MessageKind;

fn short(what: &str) -> KeeperError {
    KeeperError::MalformedFrame(format!("short read in {}", what))
}

fn need(src: &Bytes, n: usize, what: &str) -> Result<()> {
    if src.remaining() < n {
        return Err(short(what));
    }
    Ok(())
}

fn put_bytes(dst: &mut BytesMut, b: &[u8]) {
    dst.put_u32(b.len() as u32);
    dst.put_slice(b);
}

fn get_byte_vec(src: &mut Bytes, what: &str) -> Result<Vec<u8>> {
    need(src, 4, what)?;
    let len = src.get_u32() as usize;
    need(src, len, what)?;
    Ok(src.copy_to_bytes(len).to_vec())
}

fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_u16(s.len() as u16);
    dst.put_slice(s.as_bytes());
}

fn get_string(src: &mut Bytes, what: &str) -> Result<String> {
    need(src, 2, what)?;
    let len = src.get_u16() as usize;
    need(src, len, what)?;
    let raw = src.copy_to_bytes(len).to_vec();
    String::from_utf8(raw)
        .map_err(|_| KeeperError::MalformedFrame(format!("invalid utf-8 in {}", what)))
}

fn put_bool(dst: &mut BytesMut, b: bool) {
    dst.put_u8(if b { 1 } else { 0 });
}

fn get_bool(src: &mut Bytes, what: &str) -> Result<bool> {
    need(src, 1, what)?;
    match src.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(KeeperError::MalformedFrame(format!(
            "invalid bool {} in {}",
            other, what
        ))),
    }
}

fn put_presence(dst: &mut BytesMut, present: bool) {
    put_bool(dst, present);
}

fn put_uuid(dst: &mut BytesMut, id: &Uuid) {
    dst.put_slice(id.as_bytes());
}

fn get_uuid(src: &mut Bytes, what: &str) -> Result<Uuid> {
    need(src, 16, what)?;
    let raw = src.copy_to_bytes(16);
    Uuid::from_slice(&raw).map_err(|_| short(what))
}

fn get_opt_u32(src: &mut Bytes, what: &str) -> Result<Option<u32>> {
    if get_bool(src, what)? {
        need(src, 4, what)?;
        Ok(Some(src.get_u32()))
    } else {
        Ok(None)
    }
}

fn put_opt_u32(dst: &mut BytesMut, v: Option<u32>) {
    match v {
        Some(v) => {
            put_presence(dst, true);
            dst.put_u32(v);
        }
        None => put_presence(dst, false),
    }
}

/// A journal entry as carried by AppendEntries.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEntry {
    pub term: u64,
    pub index: u64,
    pub partition: u16,
    pub batch_size: u32,
    pub timestamp: u64,
    pub kind: u8,
    pub header: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl WireEntry {
    pub const KIND_ENTRY: u8 = 0;
    pub const KIND_CONFIG: u8 = 1;
    pub const KIND_NOOP: u8 = 2;

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64(self.term);
        dst.put_u64(self.index);
        dst.put_u16(self.partition);
        dst.put_u32(self.batch_size);
        dst.put_u64(self.timestamp);
        dst.put_u8(self.kind);
        match &self.header {
            Some(h) => {
                put_presence(dst, true);
                put_bytes(dst, h);
            }
            None => put_presence(dst, false),
        }
        put_bytes(dst, &self.payload);
    }

    pub fn decode(src: &mut Bytes) -> Result<WireEntry> {
        need(src, 31, "entry")?;
        let term = src.get_u64();
        let index = src.get_u64();
        let partition = src.get_u16();
        let batch_size = src.get_u32();
        let timestamp = src.get_u64();
        let kind = src.get_u8();
        if kind > Self::KIND_NOOP {
            return Err(KeeperError::MalformedFrame(format!(
                "unknown entry kind {}",
                kind
            )));
        }
        let header = if get_bool(src, "entry")? {
            Some(get_byte_vec(src, "entry header")?)
        } else {
            None
        };
        let payload = get_byte_vec(src, "entry payload")?;
        Ok(WireEntry {
            term,
            index,
            partition,
            batch_size,
            timestamp,
            kind,
            header,
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireServer {
    pub id: u32,
    pub addr: String,
}

impl WireServer {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.id);
        put_string(dst, &self.addr);
    }

    pub fn decode(src: &mut Bytes) -> Result<WireServer> {
        need(src, 4, "server")?;
        let id = src.get_u32();
        let addr = get_string(src, "server addr")?;
        Ok(WireServer { id, addr })
    }
}

fn put_servers(dst: &mut BytesMut, servers: &[WireServer]) {
    dst.put_u16(servers.len() as u16);
    for s in servers {
        s.encode(dst);
    }
}

fn get_servers(src: &mut Bytes, what: &str) -> Result<Vec<WireServer>> {
    need(src, 2, what)?;
    let count = src.get_u16() as usize;
    let mut servers = Vec::with_capacity(count);
    for _ in 0..count {
        servers.push(WireServer::decode(src)?);
    }
    Ok(servers)
}

/// Cluster configuration as stored in config entries and the metadata file.
/// `voters_old` is present only while a joint configuration is active.
#[derive(Debug, Clone, PartialEq)]
pub struct WireClusterConfig {
    pub voters: Vec<WireServer>,
    pub voters_old: Option<Vec<WireServer>>,
    pub observers: Vec<WireServer>,
}

impl WireClusterConfig {
    pub fn encode(&self, dst: &mut BytesMut) {
        put_servers(dst, &self.voters);
        match &self.voters_old {
            Some(old) => {
                put_presence(dst, true);
                put_servers(dst, old);
            }
            None => put_presence(dst, false),
        }
        put_servers(dst, &self.observers);
    }

    pub fn decode(src: &mut Bytes) -> Result<WireClusterConfig> {
        let voters = get_servers(src, "config voters")?;
        let voters_old = if get_bool(src, "config")? {
            Some(get_servers(src, "config old voters")?)
        } else {
            None
        };
        let observers = get_servers(src, "config observers")?;
        Ok(WireClusterConfig {
            voters,
            voters_old,
            observers,
        })
    }

    /// Strict standalone decode for config entry payloads.
    pub fn from_payload(payload: &[u8]) -> Result<WireClusterConfig> {
        let mut src = Bytes::copy_from_slice(payload);
        let config = Self::decode(&mut src)?;
        if src.has_remaining() {
            return Err(KeeperError::MalformedFrame(
                "trailing bytes after cluster config".into(),
            ));
        }
        Ok(config)
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut dst = BytesMut::new();
        self.encode(&mut dst);
        dst.to_vec()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: u32,
    pub last_log_term: u64,
    pub last_log_index: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub from: u32,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: u32,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub leader_commit: u64,
    pub entries: Vec<WireEntry>,
}

/// Conflict hint for the term-jump optimization: the term of the follower's
/// conflicting entry and the first index that term occupies.
#[derive(Debug, Clone, PartialEq)]
pub struct WireConflict {
    pub term: u64,
    pub first_index: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub from: u32,
    pub success: bool,
    pub match_index: u64,
    pub conflict: Option<WireConflict>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: u32,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub offset: u64,
    pub done: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub from: u32,
    pub next_offset: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireUpdateRequest {
    pub payload: Vec<u8>,
    pub partition: u16,
    pub batch_size: u32,
    pub include_header: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateClusterStateRequest {
    pub requests: Vec<WireUpdateRequest>,
    pub response_level: u8,
    pub transaction_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateClusterStateResponse {
    /// One applied result per logical entry for the ALL level, absent for
    /// every other level.
    pub results: Option<Vec<Vec<u8>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryClusterStateRequest {
    pub payload: Vec<u8>,
    /// 0 = strong (leader routed), 1 = sequential (any server).
    pub consistency: u8,
    /// Freshness token: the highest applied index the caller has observed.
    pub min_index: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryClusterStateResponse {
    pub payload: Vec<u8>,
    /// The applied index the query was served at.
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisableLeaderWriteRequest {
    pub timeout_ms: i64,
    pub term: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisableLeaderWriteResponse {
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTransactionRequest;

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTransactionResponse {
    pub transaction_id: Uuid,
    pub leader_term: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompleteTransactionRequest {
    pub transaction_id: Uuid,
    pub commit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompleteTransactionResponse;

#[derive(Debug, Clone, PartialEq)]
pub struct GetOpeningTransactionsRequest;

#[derive(Debug, Clone, PartialEq)]
pub struct GetOpeningTransactionsResponse {
    pub transaction_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetServersRequest;

#[derive(Debug, Clone, PartialEq)]
pub struct GetServersResponse {
    pub leader: Option<u32>,
    pub voters: Vec<WireServer>,
    pub observers: Vec<WireServer>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateVotersRequest {
    pub old_voters: Vec<WireServer>,
    pub new_voters: Vec<WireServer>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateVotersResponse;

#[derive(Debug, Clone, PartialEq)]
pub struct ConvertRollRequest {
    pub server_id: u32,
    /// 0 = voter, 1 = observer.
    pub roll: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvertRollResponse;

#[derive(Debug, Clone, PartialEq)]
pub struct WatchRequest;

#[derive(Debug, Clone, PartialEq)]
pub struct WatchResponse;

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterEventPush {
    /// 1 = leader changed, 2 = commit advanced, 3 = config changed,
    /// 4 = snapshot taken.
    pub kind: u8,
    pub term: u64,
    pub leader: Option<u32>,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
    pub leader_hint: Option<u32>,
}

impl ErrorResponse {
    pub fn from_error(err: &KeeperError) -> ErrorResponse {
        let (code, leader_hint) = match err {
            KeeperError::NotLeader { leader_hint } => (1, *leader_hint),
            KeeperError::LeaderWriteDisabled => (2, None),
            KeeperError::Timeout => (3, None),
            KeeperError::TransactionInvalidated => (4, None),
            KeeperError::MalformedFrame(_) => (5, None),
            KeeperError::UnknownType(_) => (6, None),
            KeeperError::Stopped => (7, None),
            KeeperError::StorageFault(_) => (8, None),
            KeeperError::ConfigurationConflict => (9, None),
            KeeperError::ConfigError(_) => (10, None),
            KeeperError::IoError(_) => (11, None),
        };
        ErrorResponse {
            code,
            message: err.to_string(),
            leader_hint,
        }
    }

    pub fn into_error(self) -> KeeperError {
        match self.code {
            1 => KeeperError::NotLeader {
                leader_hint: self.leader_hint,
            },
            2 => KeeperError::LeaderWriteDisabled,
            3 => KeeperError::Timeout,
            4 => KeeperError::TransactionInvalidated,
            5 => KeeperError::MalformedFrame(self.message),
            6 => KeeperError::UnknownType(0),
            7 => KeeperError::Stopped,
            8 => KeeperError::StorageFault(self.message),
            9 => KeeperError::ConfigurationConflict,
            10 => KeeperError::ConfigError(self.message),
            _ => KeeperError::IoError(self.message),
        }
    }
}

/// Every typed payload that can ride in a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
    UpdateClusterState(UpdateClusterStateRequest),
    UpdateClusterStateResponse(UpdateClusterStateResponse),
    QueryClusterState(QueryClusterStateRequest),
    QueryClusterStateResponse(QueryClusterStateResponse),
    DisableLeaderWrite(DisableLeaderWriteRequest),
    DisableLeaderWriteResponse(DisableLeaderWriteResponse),
    CreateTransaction(CreateTransactionRequest),
    CreateTransactionResponse(CreateTransactionResponse),
    CompleteTransaction(CompleteTransactionRequest),
    CompleteTransactionResponse(CompleteTransactionResponse),
    GetOpeningTransactions(GetOpeningTransactionsRequest),
    GetOpeningTransactionsResponse(GetOpeningTransactionsResponse),
    GetServers(GetServersRequest),
    GetServersResponse(GetServersResponse),
    UpdateVoters(UpdateVotersRequest),
    UpdateVotersResponse(UpdateVotersResponse),
    ConvertRoll(ConvertRollRequest),
    ConvertRollResponse(ConvertRollResponse),
    Watch(WatchRequest),
    WatchResponse(WatchResponse),
    ClusterEvent(ClusterEventPush),
    Error(ErrorResponse),
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        match self {
            Body::RequestVote(_) => MessageKind::RequestVote,
            Body::RequestVoteResponse(_) => MessageKind::RequestVoteResponse,
            Body::AppendEntries(_) => MessageKind::AppendEntries,
            Body::AppendEntriesResponse(_) => MessageKind::AppendEntriesResponse,
            Body::InstallSnapshot(_) => MessageKind::InstallSnapshot,
            Body::InstallSnapshotResponse(_) => MessageKind::InstallSnapshotResponse,
            Body::UpdateClusterState(_) => MessageKind::UpdateClusterState,
            Body::UpdateClusterStateResponse(_) => MessageKind::UpdateClusterStateResponse,
            Body::QueryClusterState(_) => MessageKind::QueryClusterState,
            Body::QueryClusterStateResponse(_) => MessageKind::QueryClusterStateResponse,
            Body::DisableLeaderWrite(_) => MessageKind::DisableLeaderWrite,
            Body::DisableLeaderWriteResponse(_) => MessageKind::DisableLeaderWriteResponse,
            Body::CreateTransaction(_) => MessageKind::CreateTransaction,
            Body::CreateTransactionResponse(_) => MessageKind::CreateTransactionResponse,
            Body::CompleteTransaction(_) => MessageKind::CompleteTransaction,
            Body::CompleteTransactionResponse(_) => MessageKind::CompleteTransactionResponse,
            Body::GetOpeningTransactions(_) => MessageKind::GetOpeningTransactions,
            Body::GetOpeningTransactionsResponse(_) => {
                MessageKind::GetOpeningTransactionsResponse
            }
            Body::GetServers(_) => MessageKind::GetServers,
            Body::GetServersResponse(_) => MessageKind::GetServersResponse,
            Body::UpdateVoters(_) => MessageKind::UpdateVoters,
            Body::UpdateVotersResponse(_) => MessageKind::UpdateVotersResponse,
            Body::ConvertRoll(_) => MessageKind::ConvertRoll,
            Body::ConvertRollResponse(_) => MessageKind::ConvertRollResponse,
            Body::Watch(_) => MessageKind::Watch,
            Body::WatchResponse(_) => MessageKind::WatchResponse,
            Body::ClusterEvent(_) => MessageKind::ClusterEvent,
            Body::Error(_) => MessageKind::Error,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Body::RequestVote(m) => {
                dst.put_u64(m.term);
                dst.put_u32(m.candidate_id);
                dst.put_u64(m.last_log_term);
                dst.put_u64(m.last_log_index);
            }
            Body::RequestVoteResponse(m) => {
                dst.put_u64(m.term);
                dst.put_u32(m.from);
                put_bool(dst, m.granted);
            }
            Body::AppendEntries(m) => {
                dst.put_u64(m.term);
                dst.put_u32(m.leader_id);
                dst.put_u64(m.prev_log_index);
                dst.put_u64(m.prev_log_term);
                dst.put_u64(m.leader_commit);
                dst.put_u32(m.entries.len() as u32);
                for e in &m.entries {
                    e.encode(dst);
                }
            }
            Body::AppendEntriesResponse(m) => {
                dst.put_u64(m.term);
                dst.put_u32(m.from);
                put_bool(dst, m.success);
                dst.put_u64(m.match_index);
                match &m.conflict {
                    Some(c) => {
                        put_presence(dst, true);
                        dst.put_u64(c.term);
                        dst.put_u64(c.first_index);
                    }
                    None => put_presence(dst, false),
                }
            }
            Body::InstallSnapshot(m) => {
                dst.put_u64(m.term);
                dst.put_u32(m.leader_id);
                dst.put_u64(m.last_included_index);
                dst.put_u64(m.last_included_term);
                dst.put_u64(m.offset);
                put_bool(dst, m.done);
                put_bytes(dst, &m.data);
            }
            Body::InstallSnapshotResponse(m) => {
                dst.put_u64(m.term);
                dst.put_u32(m.from);
                dst.put_u64(m.next_offset);
            }
            Body::UpdateClusterState(m) => {
                dst.put_u16(m.requests.len() as u16);
                for r in &m.requests {
                    put_bytes(dst, &r.payload);
                    dst.put_u16(r.partition);
                    dst.put_u32(r.batch_size);
                    put_bool(dst, r.include_header);
                }
                dst.put_u8(m.response_level);
                match &m.transaction_id {
                    Some(id) => {
                        put_presence(dst, true);
                        put_uuid(dst, id);
                    }
                    None => put_presence(dst, false),
                }
            }
            Body::UpdateClusterStateResponse(m) => match &m.results {
                Some(results) => {
                    put_presence(dst, true);
                    dst.put_u16(results.len() as u16);
                    for r in results {
                        put_bytes(dst, r);
                    }
                }
                None => put_presence(dst, false),
            },
            Body::QueryClusterState(m) => {
                put_bytes(dst, &m.payload);
                dst.put_u8(m.consistency);
                dst.put_u64(m.min_index);
            }
            Body::QueryClusterStateResponse(m) => {
                put_bytes(dst, &m.payload);
                dst.put_u64(m.index);
            }
            Body::DisableLeaderWrite(m) => {
                dst.put_i64(m.timeout_ms);
                dst.put_i32(m.term);
            }
            Body::DisableLeaderWriteResponse(m) => {
                dst.put_u64(m.term);
            }
            Body::CreateTransaction(_) => {}
            Body::CreateTransactionResponse(m) => {
                put_uuid(dst, &m.transaction_id);
                dst.put_u64(m.leader_term);
            }
            Body::CompleteTransaction(m) => {
                put_uuid(dst, &m.transaction_id);
                put_bool(dst, m.commit);
            }
            Body::CompleteTransactionResponse(_) => {}
            Body::GetOpeningTransactions(_) => {}
            Body::GetOpeningTransactionsResponse(m) => {
                dst.put_u16(m.transaction_ids.len() as u16);
                for id in &m.transaction_ids {
                    put_uuid(dst, id);
                }
            }
            Body::GetServers(_) => {}
            Body::GetServersResponse(m) => {
                put_opt_u32(dst, m.leader);
                put_servers(dst, &m.voters);
                put_servers(dst, &m.observers);
            }
            Body::UpdateVoters(m) => {
                put_servers(dst, &m.old_voters);
                put_servers(dst, &m.new_voters);
            }
            Body::UpdateVotersResponse(_) => {}
            Body::ConvertRoll(m) => {
                dst.put_u32(m.server_id);
                dst.put_u8(m.roll);
            }
            Body::ConvertRollResponse(_) => {}
            Body::Watch(_) => {}
            Body::WatchResponse(_) => {}
            Body::ClusterEvent(m) => {
                dst.put_u8(m.kind);
                dst.put_u64(m.term);
                put_opt_u32(dst, m.leader);
                dst.put_u64(m.index);
            }
            Body::Error(m) => {
                dst.put_u16(m.code);
                put_string(dst, &m.message);
                put_opt_u32(dst, m.leader_hint);
            }
        }
    }

    pub fn decode(kind: MessageKind, src: &mut Bytes) -> Result<Body> {
        let body = match kind {
            MessageKind::RequestVote => {
                need(src, 28, "request vote")?;
                Body::RequestVote(RequestVoteRequest {
                    term: src.get_u64(),
                    candidate_id: src.get_u32(),
                    last_log_term: src.get_u64(),
                    last_log_index: src.get_u64(),
                })
            }
            MessageKind::RequestVoteResponse => {
                need(src, 12, "vote response")?;
                let term = src.get_u64();
                let from = src.get_u32();
                let granted = get_bool(src, "vote response")?;
                Body::RequestVoteResponse(RequestVoteResponse {
                    term,
                    from,
                    granted,
                })
            }
            MessageKind::AppendEntries => {
                need(src, 40, "append entries")?;
                let term = src.get_u64();
                let leader_id = src.get_u32();
                let prev_log_index = src.get_u64();
                let prev_log_term = src.get_u64();
                let leader_commit = src.get_u64();
                let count = src.get_u32() as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(WireEntry::decode(src)?);
                }
                Body::AppendEntries(AppendEntriesRequest {
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    leader_commit,
                    entries,
                })
            }
            MessageKind::AppendEntriesResponse => {
                need(src, 12, "append response")?;
                let term = src.get_u64();
                let from = src.get_u32();
                let success = get_bool(src, "append response")?;
                need(src, 8, "append response")?;
                let match_index = src.get_u64();
                let conflict = if get_bool(src, "append response")? {
                    need(src, 16, "append response conflict")?;
                    Some(WireConflict {
                        term: src.get_u64(),
                        first_index: src.get_u64(),
                    })
                } else {
                    None
                };
                Body::AppendEntriesResponse(AppendEntriesResponse {
                    term,
                    from,
                    success,
                    match_index,
                    conflict,
                })
            }
            MessageKind::InstallSnapshot => {
                need(src, 36, "install snapshot")?;
                let term = src.get_u64();
                let leader_id = src.get_u32();
                let last_included_index = src.get_u64();
                let last_included_term = src.get_u64();
                let offset = src.get_u64();
                let done = get_bool(src, "install snapshot")?;
                let data = get_byte_vec(src, "snapshot chunk")?;
                Body::InstallSnapshot(InstallSnapshotRequest {
                    term,
                    leader_id,
                    last_included_index,
                    last_included_term,
                    offset,
                    done,
                    data,
                })
            }
            MessageKind::InstallSnapshotResponse => {
                need(src, 20, "snapshot response")?;
                Body::InstallSnapshotResponse(InstallSnapshotResponse {
                    term: src.get_u64(),
                    from: src.get_u32(),
                    next_offset: src.get_u64(),
                })
            }
            MessageKind::UpdateClusterState => {
                need(src, 2, "update")?;
                let count = src.get_u16() as usize;
                let mut requests = Vec::with_capacity(count);
                for _ in 0..count {
                    let payload = get_byte_vec(src, "update payload")?;
                    need(src, 6, "update")?;
                    let partition = src.get_u16();
                    let batch_size = src.get_u32();
                    let include_header = get_bool(src, "update")?;
                    requests.push(WireUpdateRequest {
                        payload,
                        partition,
                        batch_size,
                        include_header,
                    });
                }
                need(src, 1, "update")?;
                let response_level = src.get_u8();
                let transaction_id = if get_bool(src, "update")? {
                    Some(get_uuid(src, "update txid")?)
                } else {
                    None
                };
                Body::UpdateClusterState(UpdateClusterStateRequest {
                    requests,
                    response_level,
                    transaction_id,
                })
            }
            MessageKind::UpdateClusterStateResponse => {
                let results = if get_bool(src, "update response")? {
                    need(src, 2, "update response")?;
                    let count = src.get_u16() as usize;
                    let mut results = Vec::with_capacity(count);
                    for _ in 0..count {
                        results.push(get_byte_vec(src, "update result")?);
                    }
                    Some(results)
                } else {
                    None
                };
                Body::UpdateClusterStateResponse(UpdateClusterStateResponse { results })
            }
            MessageKind::QueryClusterState => {
                let payload = get_byte_vec(src, "query")?;
                need(src, 9, "query")?;
                let consistency = src.get_u8();
                let min_index = src.get_u64();
                Body::QueryClusterState(QueryClusterStateRequest {
                    payload,
                    consistency,
                    min_index,
                })
            }
            MessageKind::QueryClusterStateResponse => {
                let payload = get_byte_vec(src, "query response")?;
                need(src, 8, "query response")?;
                let index = src.get_u64();
                Body::QueryClusterStateResponse(QueryClusterStateResponse { payload, index })
            }
            MessageKind::DisableLeaderWrite => {
                need(src, 12, "disable leader write")?;
                Body::DisableLeaderWrite(DisableLeaderWriteRequest {
                    timeout_ms: src.get_i64(),
                    term: src.get_i32(),
                })
            }
            MessageKind::DisableLeaderWriteResponse => {
                need(src, 8, "disable write response")?;
                Body::DisableLeaderWriteResponse(DisableLeaderWriteResponse {
                    term: src.get_u64(),
                })
            }
            MessageKind::CreateTransaction => Body::CreateTransaction(CreateTransactionRequest),
            MessageKind::CreateTransactionResponse => {
                let transaction_id = get_uuid(src, "create txn response")?;
                need(src, 8, "create txn response")?;
                Body::CreateTransactionResponse(CreateTransactionResponse {
                    transaction_id,
                    leader_term: src.get_u64(),
                })
            }
            MessageKind::CompleteTransaction => {
                let transaction_id = get_uuid(src, "complete txn")?;
                let commit = get_bool(src, "complete txn")?;
                Body::CompleteTransaction(CompleteTransactionRequest {
                    transaction_id,
                    commit,
                })
            }
            MessageKind::CompleteTransactionResponse => {
                Body::CompleteTransactionResponse(CompleteTransactionResponse)
            }
            MessageKind::GetOpeningTransactions => {
                Body::GetOpeningTransactions(GetOpeningTransactionsRequest)
            }
            MessageKind::GetOpeningTransactionsResponse => {
                need(src, 2, "opening txns")?;
                let count = src.get_u16() as usize;
                let mut transaction_ids = Vec::with_capacity(count);
                for _ in 0..count {
                    transaction_ids.push(get_uuid(src, "opening txns")?);
                }
                Body::GetOpeningTransactionsResponse(GetOpeningTransactionsResponse {
                    transaction_ids,
                })
            }
            MessageKind::GetServers => Body::GetServers(GetServersRequest),
            MessageKind::GetServersResponse => {
                let leader = get_opt_u32(src, "get servers")?;
                let voters = get_servers(src, "get servers voters")?;
                let observers = get_servers(src, "get servers observers")?;
                Body::GetServersResponse(GetServersResponse {
                    leader,
                    voters,
                    observers,
                })
            }
            MessageKind::UpdateVoters => {
                let old_voters = get_servers(src, "update voters old")?;
                let new_voters = get_servers(src, "update voters new")?;
                Body::UpdateVoters(UpdateVotersRequest {
                    old_voters,
                    new_voters,
                })
            }
            MessageKind::UpdateVotersResponse => Body::UpdateVotersResponse(UpdateVotersResponse),
            MessageKind::ConvertRoll => {
                need(src, 5, "convert roll")?;
                Body::ConvertRoll(ConvertRollRequest {
                    server_id: src.get_u32(),
                    roll: src.get_u8(),
                })
            }
            MessageKind::ConvertRollResponse => Body::ConvertRollResponse(ConvertRollResponse),
            MessageKind::Watch => Body::Watch(WatchRequest),
            MessageKind::WatchResponse => Body::WatchResponse(WatchResponse),
            MessageKind::ClusterEvent => {
                need(src, 9, "cluster event")?;
                let kind = src.get_u8();
                let term = src.get_u64();
                let leader = get_opt_u32(src, "cluster event")?;
                need(src, 8, "cluster event")?;
                let index = src.get_u64();
                Body::ClusterEvent(ClusterEventPush {
                    kind,
                    term,
                    leader,
                    index,
                })
            }
            MessageKind::Error => {
                need(src, 2, "error response")?;
                let code = src.get_u16();
                let message = get_string(src, "error response")?;
                let leader_hint = get_opt_u32(src, "error response")?;
                Body::Error(ErrorResponse {
                    code,
                    message,
                    leader_hint,
                })
            }
        };
        Ok(body)
    }
}
