use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::SinkExt;
use journalkeeper_core::error::{KeeperError, Result};
use journalkeeper_wire::messages as wire;
use journalkeeper_wire::{Body, Frame, FrameCodec};
use slog::Logger;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use uuid::Uuid;

use crate::conn::Connection;

/// The stage of progress at which an update future resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLevel {
    Receive,
    Persistence,
    Replication,
    All,
}

impl ResponseLevel {
    fn code(self) -> u8 {
        match self {
            ResponseLevel::Receive => 0,
            ResponseLevel::Persistence => 1,
            ResponseLevel::Replication => 2,
            ResponseLevel::All => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Leader-routed, linearizable. The default.
    Strong,
    /// Served by any server at or past the caller's freshness token.
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Roll {
    Voter,
    Observer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub payload: Vec<u8>,
    pub partition: u16,
    pub batch_size: u32,
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

#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    pub id: u32,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServersView {
    pub leader: Option<u32>,
    pub voters: Vec<ServerInfo>,
    pub observers: Vec<ServerInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    LeaderChanged { term: u64, leader: Option<u32> },
    CommitAdvanced { index: u64 },
    ConfigChanged { index: u64 },
    SnapshotTaken { index: u64, term: u64 },
}

impl ClusterEvent {
    fn from_wire(push: wire::ClusterEventPush) -> Option<ClusterEvent> {
        match push.kind {
            1 => Some(ClusterEvent::LeaderChanged {
                term: push.term,
                leader: push.leader,
            }),
            2 => Some(ClusterEvent::CommitAdvanced { index: push.index }),
            3 => Some(ClusterEvent::ConfigChanged { index: push.index }),
            4 => Some(ClusterEvent::SnapshotTaken {
                index: push.index,
                term: push.term,
            }),
            _ => None,
        }
    }
}

/// A live watch subscription; dropping it (or calling `stop`) is the
/// unwatch.
pub struct Watch {
    pub events: mpsc::UnboundedReceiver<ClusterEvent>,
    stop: Option<oneshot::Sender<()>>,
}

impl Watch {
    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub servers: Vec<SocketAddr>,
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            servers: Vec::new(),
            max_attempts: 5,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

struct Inner {
    logger: Logger,
    config: ClientConfig,
    /// The current leader guess, updated from redirects and listings.
    leader: Mutex<Option<SocketAddr>>,
    /// id -> address, learned from server listings, used to resolve
    /// redirect hints.
    known: Mutex<HashMap<u32, SocketAddr>>,
    conns: tokio::sync::Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    /// Transaction sessions pinned to the leader that created them.
    pinned: Mutex<HashMap<Uuid, SocketAddr>>,
    correlations: AtomicU32,
    stopped: AtomicBool,
}

#[derive(Clone)]
pub struct KeeperClient {
    inner: Arc<Inner>,
}

impl KeeperClient {
    pub fn new(logger: Logger, config: ClientConfig) -> KeeperClient {
        KeeperClient {
            inner: Arc::new(Inner {
                logger,
                config,
                leader: Mutex::new(None),
                known: Mutex::new(HashMap::new()),
                conns: tokio::sync::Mutex::new(HashMap::new()),
                pinned: Mutex::new(HashMap::new()),
                correlations: AtomicU32::new(1),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(KeeperError::Stopped);
        }
        Ok(())
    }

    fn next_correlation(&self) -> u32 {
        // Correlation 0 is reserved for event pushes.
        let id = self.inner.correlations.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.inner.correlations.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff::default();
        backoff.initial_interval = self.inner.config.base_backoff;
        backoff.max_interval = self.inner.config.max_backoff;
        backoff.max_elapsed_time = None;
        backoff
    }

    /// The leader guess if there is one, otherwise endpoint rotation.
    fn pick_target(&self, attempt: usize) -> Result<SocketAddr> {
        if let Some(leader) = *self.inner.leader.lock().unwrap() {
            return Ok(leader);
        }
        let servers = &self.inner.config.servers;
        if servers.is_empty() {
            return Err(KeeperError::ConfigError("no servers configured".into()));
        }
        Ok(servers[attempt % servers.len()])
    }

    fn note_leader_hint(&self, hint: Option<u32>) {
        let addr = hint.and_then(|id| self.inner.known.lock().unwrap().get(&id).copied());
        *self.inner.leader.lock().unwrap() = addr;
    }

    fn learn_servers(&self, response: &wire::GetServersResponse) {
        let mut known = self.inner.known.lock().unwrap();
        for server in response.voters.iter().chain(response.observers.iter()) {
            if let Ok(addr) = server.addr.parse() {
                known.insert(server.id, addr);
            }
        }
        if let Some(leader) = response.leader {
            if let Some(addr) = known.get(&leader).copied() {
                *self.inner.leader.lock().unwrap() = Some(addr);
            }
        }
    }

    async fn connection(&self, addr: SocketAddr) -> Result<Arc<Connection>> {
        let mut conns = self.inner.conns.lock().await;
        if let Some(conn) = conns.get(&addr) {
            return Ok(conn.clone());
        }
        let conn = Arc::new(Connection::open(addr).await?);
        conns.insert(addr, conn.clone());
        Ok(conn)
    }

    async fn drop_connection(&self, addr: SocketAddr) {
        self.inner.conns.lock().await.remove(&addr);
    }

    async fn call_at(&self, addr: SocketAddr, body: Body) -> Result<Body> {
        let conn = self.connection(addr).await?;
        let frame = Frame::new(self.next_correlation(), 0, 0, body);
        match conn.call(frame).await {
            Ok(frame) => Ok(frame.body),
            Err(err) => {
                self.drop_connection(addr).await;
                Err(err)
            }
        }
    }

    /// Routes one request: send to the leader guess, follow redirect hints,
    /// rotate endpoints on connection failure, back off between attempts.
    async fn call(&self, body: Body) -> Result<Body> {
        self.check_running()?;
        let mut backoff = self.backoff();
        let mut last_err = KeeperError::IoError("no attempt made".into());
        for attempt in 0..self.inner.config.max_attempts {
            if attempt > 0 {
                if let Some(delay) = backoff.next_backoff() {
                    tokio::time::sleep(delay).await;
                }
            }
            let target = self.pick_target(attempt)?;
            match self.call_at(target, body.clone()).await {
                Ok(Body::Error(e)) => {
                    let err = e.into_error();
                    match &err {
                        KeeperError::NotLeader { leader_hint } => {
                            debug!(self.inner.logger, "redirected";
                                   "from" => target.to_string(),
                                   "hint" => format!("{:?}", leader_hint));
                            self.note_leader_hint(*leader_hint);
                            last_err = err;
                        }
                        KeeperError::LeaderWriteDisabled | KeeperError::Timeout => {
                            last_err = err;
                        }
                        _ => return Err(err),
                    }
                }
                Ok(body) => return Ok(body),
                Err(err) => {
                    debug!(self.inner.logger, "server unreachable";
                           "addr" => target.to_string(), "error" => err.to_string());
                    *self.inner.leader.lock().unwrap() = None;
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// A call pinned to one server; transaction traffic never reroutes.
    async fn call_pinned(&self, addr: SocketAddr, body: Body) -> Result<Body> {
        self.check_running()?;
        match self.call_at(addr, body).await? {
            Body::Error(e) => {
                let err = e.into_error();
                match err {
                    KeeperError::NotLeader { .. } => Err(KeeperError::TransactionInvalidated),
                    other => Err(other),
                }
            }
            body => Ok(body),
        }
    }

    fn update_body(
        requests: &[UpdateRequest],
        level: ResponseLevel,
        transaction: Option<Uuid>,
    ) -> Body {
        Body::UpdateClusterState(wire::UpdateClusterStateRequest {
            requests: requests
                .iter()
                .map(|r| wire::WireUpdateRequest {
                    payload: r.payload.clone(),
                    partition: r.partition,
                    batch_size: r.batch_size,
                    include_header: r.include_header,
                })
                .collect(),
            response_level: level.code(),
            transaction_id: transaction,
        })
    }

    /// Batch update at the requested level. Levels below ALL resolve to
    /// `None`; ALL resolves to one applied result per request, in order.
    pub async fn update(
        &self,
        requests: Vec<UpdateRequest>,
        level: ResponseLevel,
    ) -> Result<Option<Vec<Vec<u8>>>> {
        match self.call(Self::update_body(&requests, level, None)).await? {
            Body::UpdateClusterStateResponse(m) => Ok(m.results),
            other => Err(KeeperError::UnknownType(other.kind().code())),
        }
    }

    /// Single-entry form: the first element of the batch result, or null.
    pub async fn update_one(&self, request: UpdateRequest) -> Result<Option<Vec<u8>>> {
        let results = self
            .update(vec![request], ResponseLevel::Replication)
            .await?;
        Ok(results.and_then(|mut r| {
            if r.is_empty() {
                None
            } else {
                Some(r.remove(0))
            }
        }))
    }

    /// Strongly consistent query; returns the answer and the applied index
    /// it was served at, usable as a freshness token for sequential reads.
    pub async fn query(&self, payload: Vec<u8>) -> Result<(Vec<u8>, u64)> {
        self.query_with(payload, Consistency::Strong, 0).await
    }

    pub async fn query_with(
        &self,
        payload: Vec<u8>,
        consistency: Consistency,
        min_index: u64,
    ) -> Result<(Vec<u8>, u64)> {
        let body = Body::QueryClusterState(wire::QueryClusterStateRequest {
            payload,
            consistency: match consistency {
                Consistency::Strong => 0,
                Consistency::Sequential => 1,
            },
            min_index,
        });
        match self.call(body).await? {
            Body::QueryClusterStateResponse(m) => Ok((m.payload, m.index)),
            other => Err(KeeperError::UnknownType(other.kind().code())),
        }
    }

    /// Opens a transaction session on the current leader and pins later
    /// operations of this session to it.
    pub async fn begin_transaction(&self) -> Result<Uuid> {
        // Route normally first so the leader guess settles.
        let body = Body::CreateTransaction(wire::CreateTransactionRequest);
        match self.call(body).await? {
            Body::CreateTransactionResponse(m) => {
                let guess = *self.inner.leader.lock().unwrap();
                let leader = match guess {
                    Some(leader) => leader,
                    // The call succeeded, so the last target was the leader
                    // even if no hint was recorded.
                    None => self.pick_target(0)?,
                };
                self.inner
                    .pinned
                    .lock()
                    .unwrap()
                    .insert(m.transaction_id, leader);
                Ok(m.transaction_id)
            }
            other => Err(KeeperError::UnknownType(other.kind().code())),
        }
    }

    fn pinned_addr(&self, id: Uuid) -> Result<SocketAddr> {
        self.inner
            .pinned
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .ok_or(KeeperError::TransactionInvalidated)
    }

    pub async fn update_transaction(
        &self,
        id: Uuid,
        requests: Vec<UpdateRequest>,
    ) -> Result<()> {
        let addr = self.pinned_addr(id)?;
        let body = Self::update_body(&requests, ResponseLevel::Replication, Some(id));
        match self.call_pinned(addr, body).await? {
            Body::UpdateClusterStateResponse(_) => Ok(()),
            other => Err(KeeperError::UnknownType(other.kind().code())),
        }
    }

    pub async fn commit_transaction(&self, id: Uuid) -> Result<()> {
        self.complete_transaction(id, true).await
    }

    pub async fn rollback_transaction(&self, id: Uuid) -> Result<()> {
        self.complete_transaction(id, false).await
    }

    async fn complete_transaction(&self, id: Uuid, commit: bool) -> Result<()> {
        let addr = self.pinned_addr(id)?;
        let body = Body::CompleteTransaction(wire::CompleteTransactionRequest {
            transaction_id: id,
            commit,
        });
        let result = self.call_pinned(addr, body).await;
        self.inner.pinned.lock().unwrap().remove(&id);
        match result? {
            Body::CompleteTransactionResponse(_) => Ok(()),
            other => Err(KeeperError::UnknownType(other.kind().code())),
        }
    }

    pub async fn get_opening_transactions(&self) -> Result<Vec<Uuid>> {
        let body = Body::GetOpeningTransactions(wire::GetOpeningTransactionsRequest);
        match self.call(body).await? {
            Body::GetOpeningTransactionsResponse(m) => Ok(m.transaction_ids),
            other => Err(KeeperError::UnknownType(other.kind().code())),
        }
    }

    pub async fn get_servers(&self) -> Result<ServersView> {
        let body = Body::GetServers(wire::GetServersRequest);
        match self.call(body).await? {
            Body::GetServersResponse(m) => {
                self.learn_servers(&m);
                let convert = |s: &wire::WireServer| -> Result<ServerInfo> {
                    Ok(ServerInfo {
                        id: s.id,
                        addr: s.addr.parse().map_err(|_| {
                            KeeperError::MalformedFrame(format!("bad address {}", s.addr))
                        })?,
                    })
                };
                Ok(ServersView {
                    leader: m.leader,
                    voters: m.voters.iter().map(convert).collect::<Result<_>>()?,
                    observers: m.observers.iter().map(convert).collect::<Result<_>>()?,
                })
            }
            other => Err(KeeperError::UnknownType(other.kind().code())),
        }
    }

    /// Polls until the cluster reports a leader or the timeout passes.
    pub async fn wait_for_cluster_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut backoff = self.backoff();
        loop {
            if let Ok(view) = self.get_servers().await {
                if view.leader.is_some() {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(KeeperError::Timeout);
            }
            if let Some(delay) = backoff.next_backoff() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    pub async fn update_voters(
        &self,
        old: Vec<ServerInfo>,
        new: Vec<ServerInfo>,
    ) -> Result<()> {
        let convert = |s: &ServerInfo| wire::WireServer {
            id: s.id,
            addr: s.addr.to_string(),
        };
        let body = Body::UpdateVoters(wire::UpdateVotersRequest {
            old_voters: old.iter().map(convert).collect(),
            new_voters: new.iter().map(convert).collect(),
        });
        match self.call(body).await? {
            Body::UpdateVotersResponse(_) => Ok(()),
            other => Err(KeeperError::UnknownType(other.kind().code())),
        }
    }

    pub async fn convert_roll(&self, id: u32, roll: Roll) -> Result<()> {
        let body = Body::ConvertRoll(wire::ConvertRollRequest {
            server_id: id,
            roll: match roll {
                Roll::Voter => 0,
                Roll::Observer => 1,
            },
        });
        match self.call(body).await? {
            Body::ConvertRollResponse(_) => Ok(()),
            other => Err(KeeperError::UnknownType(other.kind().code())),
        }
    }

    pub async fn disable_leader_write(&self, timeout_ms: i64, term: i32) -> Result<u64> {
        let body = Body::DisableLeaderWrite(wire::DisableLeaderWriteRequest { timeout_ms, term });
        match self.call(body).await? {
            Body::DisableLeaderWriteResponse(m) => Ok(m.term),
            other => Err(KeeperError::UnknownType(other.kind().code())),
        }
    }

    /// Opens a dedicated connection that streams cluster events until the
    /// watch is dropped.
    pub async fn watch(&self) -> Result<Watch> {
        self.check_running()?;
        let addr = self.pick_target(0)?;
        let stream = TcpStream::connect(addr).await?;
        let (r, w) = stream.into_split();
        let mut stream_in = FramedRead::new(r, FrameCodec::new());
        let mut stream_out = FramedWrite::new(w, FrameCodec::new());
        stream_out
            .send(Frame::new(
                self.next_correlation(),
                0,
                0,
                Body::Watch(wire::WatchRequest),
            ))
            .await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let logger = self.inner.logger.new(o!("task" => "watch"));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    frame = stream_in.try_next() => {
                        match frame {
                            Ok(Some(Frame { body: Body::ClusterEvent(push), .. })) => {
                                if let Some(event) = ClusterEvent::from_wire(push) {
                                    if events_tx.send(event).is_err() {
                                        break;
                                    }
                                }
                            }
                            Ok(Some(_)) => continue,
                            Ok(None) => break,
                            Err(err) => {
                                debug!(logger, "watch stream failed"; "error" => err.to_string());
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Watch {
            events: events_rx,
            stop: Some(stop_tx),
        })
    }

    /// Graceful shutdown: new calls and in-flight futures fail with
    /// `Stopped`.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.conns.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_guess_prefers_hint_over_rotation() {
        let client = KeeperClient::new(
            journalkeeper_core::logger::get_root_logger(),
            ClientConfig {
                servers: vec![
                    "127.0.0.1:8801".parse().unwrap(),
                    "127.0.0.1:8802".parse().unwrap(),
                ],
                ..Default::default()
            },
        );
        assert_eq!(
            client.pick_target(0).unwrap(),
            "127.0.0.1:8801".parse().unwrap()
        );
        assert_eq!(
            client.pick_target(1).unwrap(),
            "127.0.0.1:8802".parse().unwrap()
        );

        client
            .inner
            .known
            .lock()
            .unwrap()
            .insert(2, "127.0.0.1:8802".parse().unwrap());
        client.note_leader_hint(Some(2));
        assert_eq!(
            client.pick_target(0).unwrap(),
            "127.0.0.1:8802".parse().unwrap()
        );
        assert_eq!(
            client.pick_target(1).unwrap(),
            "127.0.0.1:8802".parse().unwrap()
        );
    }

    #[test]
    fn unknown_hint_clears_the_guess() {
        let client = KeeperClient::new(
            journalkeeper_core::logger::get_root_logger(),
            ClientConfig {
                servers: vec!["127.0.0.1:8801".parse().unwrap()],
                ..Default::default()
            },
        );
        client
            .inner
            .known
            .lock()
            .unwrap()
            .insert(1, "127.0.0.1:8801".parse().unwrap());
        client.note_leader_hint(Some(1));
        assert!(client.inner.leader.lock().unwrap().is_some());

        client.note_leader_hint(Some(99));
        assert!(client.inner.leader.lock().unwrap().is_none());
    }

    #[test]
    fn servers_listing_updates_the_address_book() {
        let client = KeeperClient::new(
            journalkeeper_core::logger::get_root_logger(),
            ClientConfig::default(),
        );
        client.learn_servers(&wire::GetServersResponse {
            leader: Some(2),
            voters: vec![
                wire::WireServer {
                    id: 1,
                    addr: "127.0.0.1:8801".into(),
                },
                wire::WireServer {
                    id: 2,
                    addr: "127.0.0.1:8802".into(),
                },
            ],
            observers: vec![],
        });
        assert_eq!(
            *client.inner.leader.lock().unwrap(),
            Some("127.0.0.1:8802".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn stopped_client_fails_fast() {
        let client = KeeperClient::new(
            journalkeeper_core::logger::get_root_logger(),
            ClientConfig {
                servers: vec!["127.0.0.1:1".parse().unwrap()],
                ..Default::default()
            },
        );
        client.stop().await;
        assert_eq!(
            client
                .update_one(UpdateRequest::new(b"x".to_vec()))
                .await
                .unwrap_err(),
            KeeperError::Stopped
        );
    }
}
