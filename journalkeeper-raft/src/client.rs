//! The in-process client handle the embedding server uses to reach its own
//! raft loop: an unbounded request channel with a oneshot per call.

use journalkeeper_core::error::{KeeperError, Result};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::Roll;
use crate::raft::{LogIndex, NodeId, Peer, ResponseLevel, Term, UpdateRequest, UpdateResult};
use crate::rpc::{ClientRequest, ServersInfo};

#[derive(Clone)]
pub struct RaftClient {
    tx: mpsc::UnboundedSender<ClientRequest>,
}

impl RaftClient {
    pub fn new(tx: mpsc::UnboundedSender<ClientRequest>) -> RaftClient {
        RaftClient { tx }
    }

    fn send(&self, req: ClientRequest) -> Result<()> {
        self.tx.send(req).map_err(|_| KeeperError::Stopped)
    }

    async fn wait<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        rx.await.map_err(|_| KeeperError::Stopped)?
    }

    pub async fn update(
        &self,
        requests: Vec<UpdateRequest>,
        level: ResponseLevel,
    ) -> Result<UpdateResult> {
        let (cb, rx) = oneshot::channel();
        self.send(ClientRequest::Update {
            requests,
            level,
            transaction: None,
            cb,
        })?;
        Self::wait(rx).await
    }

    /// Single-entry form: the first element of the batch result, or null.
    pub async fn update_one(
        &self,
        request: UpdateRequest,
        level: ResponseLevel,
    ) -> Result<Option<Vec<u8>>> {
        let results = self.update(vec![request], level).await?;
        Ok(results.and_then(|mut r| {
            if r.is_empty() {
                None
            } else {
                Some(r.remove(0))
            }
        }))
    }

    /// Strongly consistent read.
    pub async fn query(&self, payload: Vec<u8>) -> Result<(Vec<u8>, LogIndex)> {
        let (cb, rx) = oneshot::channel();
        self.send(ClientRequest::Query {
            payload,
            sequential: false,
            min_index: 0,
            cb,
        })?;
        Self::wait(rx).await
    }

    pub async fn begin_transaction(&self) -> Result<(Uuid, Term)> {
        let (cb, rx) = oneshot::channel();
        self.send(ClientRequest::BeginTransaction { cb })?;
        Self::wait(rx).await
    }

    pub async fn transaction_update(
        &self,
        id: Uuid,
        requests: Vec<UpdateRequest>,
    ) -> Result<UpdateResult> {
        let (cb, rx) = oneshot::channel();
        self.send(ClientRequest::Update {
            requests,
            level: ResponseLevel::Replication,
            transaction: Some(id),
            cb,
        })?;
        Self::wait(rx).await
    }

    pub async fn commit_transaction(&self, id: Uuid) -> Result<UpdateResult> {
        let (cb, rx) = oneshot::channel();
        self.send(ClientRequest::CompleteTransaction {
            id,
            commit: true,
            cb,
        })?;
        Self::wait(rx).await
    }

    pub async fn rollback_transaction(&self, id: Uuid) -> Result<UpdateResult> {
        let (cb, rx) = oneshot::channel();
        self.send(ClientRequest::CompleteTransaction {
            id,
            commit: false,
            cb,
        })?;
        Self::wait(rx).await
    }

    pub async fn opening_transactions(&self) -> Result<Vec<Uuid>> {
        let (cb, rx) = oneshot::channel();
        self.send(ClientRequest::OpeningTransactions { cb })?;
        Self::wait(rx).await
    }

    pub async fn disable_leader_write(&self, timeout_ms: i64, term: i32) -> Result<Term> {
        let (cb, rx) = oneshot::channel();
        self.send(ClientRequest::DisableWrites {
            timeout_ms,
            term,
            cb,
        })?;
        Self::wait(rx).await
    }

    pub async fn update_voters(&self, old: Vec<Peer>, new: Vec<Peer>) -> Result<()> {
        let (cb, rx) = oneshot::channel();
        self.send(ClientRequest::UpdateVoters { old, new, cb })?;
        Self::wait(rx).await
    }

    pub async fn convert_roll(&self, id: NodeId, roll: Roll) -> Result<()> {
        let (cb, rx) = oneshot::channel();
        self.send(ClientRequest::ConvertRoll { id, roll, cb })?;
        Self::wait(rx).await
    }

    pub async fn get_servers(&self) -> Result<ServersInfo> {
        let (cb, rx) = oneshot::channel();
        self.send(ClientRequest::GetServers { cb })?;
        Self::wait(rx).await
    }
}
