use bytes::{Buf, BufMut, Bytes, BytesMut};
use journalkeeper_core::error::{KeeperError, Result};

use crate::messages::Body;

pub const VERSION: u8 = 1;

/// version + kind + correlation id + sender + receiver.
pub const HEADER_LEN: usize = 1 + 2 + 4 + 4 + 4;

/// Stable numeric type identifiers. Codes are part of the wire contract and
/// must never be reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    RequestVote,
    RequestVoteResponse,
    AppendEntries,
    AppendEntriesResponse,
    InstallSnapshot,
    InstallSnapshotResponse,
    UpdateClusterState,
    UpdateClusterStateResponse,
    QueryClusterState,
    QueryClusterStateResponse,
    DisableLeaderWrite,
    DisableLeaderWriteResponse,
    CreateTransaction,
    CreateTransactionResponse,
    CompleteTransaction,
    CompleteTransactionResponse,
    GetOpeningTransactions,
    GetOpeningTransactionsResponse,
    GetServers,
    GetServersResponse,
    UpdateVoters,
    UpdateVotersResponse,
    ConvertRoll,
    ConvertRollResponse,
    Watch,
    WatchResponse,
    ClusterEvent,
    Error,
}

impl MessageKind {
    pub fn code(self) -> u16 {
        match self {
            MessageKind::RequestVote => 1,
            MessageKind::RequestVoteResponse => 2,
            MessageKind::AppendEntries => 3,
            MessageKind::AppendEntriesResponse => 4,
            MessageKind::InstallSnapshot => 5,
            MessageKind::InstallSnapshotResponse => 6,
            MessageKind::UpdateClusterState => 7,
            MessageKind::UpdateClusterStateResponse => 8,
            MessageKind::QueryClusterState => 9,
            MessageKind::QueryClusterStateResponse => 10,
            MessageKind::DisableLeaderWrite => 11,
            MessageKind::DisableLeaderWriteResponse => 12,
            MessageKind::CreateTransaction => 13,
            MessageKind::CreateTransactionResponse => 14,
            MessageKind::CompleteTransaction => 15,
            MessageKind::CompleteTransactionResponse => 16,
            MessageKind::GetOpeningTransactions => 17,
            MessageKind::GetOpeningTransactionsResponse => 18,
            MessageKind::GetServers => 19,
            MessageKind::GetServersResponse => 20,
            MessageKind::UpdateVoters => 21,
            MessageKind::UpdateVotersResponse => 22,
            MessageKind::ConvertRoll => 23,
            MessageKind::ConvertRollResponse => 24,
            MessageKind::Watch => 25,
            MessageKind::WatchResponse => 26,
            MessageKind::ClusterEvent => 27,
            MessageKind::Error => 28,
        }
    }

    pub fn from_code(code: u16) -> Result<MessageKind> {
        let kind = match code {
            1 => MessageKind::RequestVote,
            2 => MessageKind::RequestVoteResponse,
            3 => MessageKind::AppendEntries,
            4 => MessageKind::AppendEntriesResponse,
            5 => MessageKind::InstallSnapshot,
            6 => MessageKind::InstallSnapshotResponse,
            7 => MessageKind::UpdateClusterState,
            8 => MessageKind::UpdateClusterStateResponse,
            9 => MessageKind::QueryClusterState,
            10 => MessageKind::QueryClusterStateResponse,
            11 => MessageKind::DisableLeaderWrite,
            12 => MessageKind::DisableLeaderWriteResponse,
            13 => MessageKind::CreateTransaction,
            14 => MessageKind::CreateTransactionResponse,
            15 => MessageKind::CompleteTransaction,
            16 => MessageKind::CompleteTransactionResponse,
            17 => MessageKind::GetOpeningTransactions,
            18 => MessageKind::GetOpeningTransactionsResponse,
            19 => MessageKind::GetServers,
            20 => MessageKind::GetServersResponse,
            21 => MessageKind::UpdateVoters,
            22 => MessageKind::UpdateVotersResponse,
            23 => MessageKind::ConvertRoll,
            24 => MessageKind::ConvertRollResponse,
            25 => MessageKind::Watch,
            26 => MessageKind::WatchResponse,
            27 => MessageKind::ClusterEvent,
            28 => MessageKind::Error,
            other => return Err(KeeperError::UnknownType(other)),
        };
        Ok(kind)
    }
}

/// One framed message: typed header plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub version: u8,
    pub correlation_id: u32,
    pub sender: u32,
    pub receiver: u32,
    pub body: Body,
}

impl Frame {
    pub fn new(correlation_id: u32, sender: u32, receiver: u32, body: Body) -> Frame {
        Frame {
            version: VERSION,
            correlation_id,
            sender,
            receiver,
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Writes header + payload, without the outer length prefix.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.version);
        dst.put_u16(self.kind().code());
        dst.put_u32(self.correlation_id);
        dst.put_u32(self.sender);
        dst.put_u32(self.receiver);
        self.body.encode(dst);
    }

    /// Decodes one complete frame body. Trailing bytes are a protocol error,
    /// never slack to be ignored.
    pub fn decode(src: &mut Bytes) -> Result<Frame> {
        if src.remaining() < HEADER_LEN {
            return Err(KeeperError::MalformedFrame("short frame header".into()));
        }
        let version = src.get_u8();
        if version != VERSION {
            return Err(KeeperError::MalformedFrame(format!(
                "unsupported version {}",
                version
            )));
        }
        let kind = MessageKind::from_code(src.get_u16())?;
        let correlation_id = src.get_u32();
        let sender = src.get_u32();
        let receiver = src.get_u32();
        let body = Body::decode(kind, src)?;
        if src.has_remaining() {
            return Err(KeeperError::MalformedFrame(format!(
                "{} trailing bytes after {:?}",
                src.remaining(),
                kind
            )));
        }
        Ok(Frame {
            version,
            correlation_id,
            sender,
            receiver,
            body,
        })
    }
}
