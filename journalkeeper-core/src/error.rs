use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeeperError>;

/// Every failure surfaced through client futures or RPC replies. Protocol
/// decisions are made on these variants, never on unwinding.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KeeperError {
    /// A write or strong query reached a server that is not the leader. The
    /// hint, when present, is the id of the last known leader.
    #[error("not leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u32> },

    /// The leader is inside a maintenance window and refuses new proposals.
    #[error("leader writes disabled")]
    LeaderWriteDisabled,

    /// The response-level deadline passed before the requested stage was
    /// reached. The entry may still commit; cancellation never rolls back
    /// the journal.
    #[error("response deadline exceeded")]
    Timeout,

    /// A leader change dropped the transaction session.
    #[error("transaction invalidated by leader change")]
    TransactionInvalidated,

    /// Short read, trailing bytes, or otherwise undecodable frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A frame carried a type code this server does not know.
    #[error("unknown message type code {0}")]
    UnknownType(u16),

    /// The server is shutting down; in-flight futures resolve with this.
    #[error("server stopped")]
    Stopped,

    /// Unrecoverable storage corruption. The process must halt rather than
    /// violate durability.
    #[error("storage fault: {0}")]
    StorageFault(String),

    /// A membership change was attempted while another was in flight.
    #[error("concurrent configuration change in flight")]
    ConfigurationConflict,

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for KeeperError {
    fn from(err: std::io::Error) -> Self {
        KeeperError::IoError(err.to_string())
    }
}

impl From<std::net::AddrParseError> for KeeperError {
    fn from(err: std::net::AddrParseError) -> Self {
        KeeperError::ConfigError(err.to_string())
    }
}
