//! Client router for JournalKeeper clusters: discovers the leader, retries
//! with backoff on redirects and connection failures, pins transactions to
//! the leader that created them, and exposes the cluster event stream.

#[macro_use]
extern crate slog;

pub mod conn;
pub mod router;

pub use router::{
    ClientConfig, ClusterEvent, Consistency, KeeperClient, ResponseLevel, Roll, ServerInfo,
    ServersView, UpdateRequest, Watch,
};
