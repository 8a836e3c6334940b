//! Peer and client transport. Inbound frames arrive on one listener: peer
//! messages are forwarded into the raft loop's inbox, client requests are
//! bridged onto oneshot completions, and a Watch request turns the
//! connection into a push stream of cluster events. Outbound peer traffic
//! runs over one writer task per peer with reconnect backoff.

use std::collections::HashMap;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::SinkExt;
use journalkeeper_core::error::{KeeperError, Result};
use journalkeeper_wire::messages as wire;
use journalkeeper_wire::{Body, Frame, FrameCodec};
use slog::Logger;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::Roll;
use crate::raft::{Command, NodeId, Peer, ResponseLevel, UpdateRequest};
use crate::rpc::{self, Address, ClientRequest, ClusterEvent, Message};

fn is_peer_kind(body: &Body) -> bool {
    matches!(
        body,
        Body::RequestVote(_)
            | Body::RequestVoteResponse(_)
            | Body::AppendEntries(_)
            | Body::AppendEntriesResponse(_)
            | Body::InstallSnapshot(_)
            | Body::InstallSnapshotResponse(_)
    )
}

pub async fn receive_task(
    logger: Logger,
    listener: TcpListener,
    rpc_tx: mpsc::UnboundedSender<Message>,
    client_tx: mpsc::UnboundedSender<ClientRequest>,
    events: broadcast::Sender<ClusterEvent>,
    self_id: NodeId,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(logger, "accept failed"; "error" => err.to_string());
                        continue;
                    }
                };
                let logger = logger.new(o!("remote" => addr.to_string()));
                let rpc_tx = rpc_tx.clone();
                let client_tx = client_tx.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        stream_messages(stream, rpc_tx, client_tx, events, self_id).await
                    {
                        debug!(logger, "connection closed"; "error" => err.to_string());
                    }
                });
            }
        }
    }
    Ok(())
}

async fn stream_messages(
    stream: TcpStream,
    rpc_tx: mpsc::UnboundedSender<Message>,
    client_tx: mpsc::UnboundedSender<ClientRequest>,
    events: broadcast::Sender<ClusterEvent>,
    self_id: NodeId,
) -> Result<()> {
    let (r, w) = stream.into_split();
    let mut stream_in = FramedRead::new(r, FrameCodec::new());
    let mut stream_out = FramedWrite::new(w, FrameCodec::new());
    while let Some(frame) = stream_in.try_next().await? {
        let Frame {
            correlation_id,
            sender,
            body,
            ..
        } = frame;

        if is_peer_kind(&body) {
            if let Some(command) = rpc::body_to_command(body)? {
                rpc_tx
                    .send(Message {
                        from: sender,
                        to: Address::Local,
                        command,
                    })
                    .map_err(|_| KeeperError::Stopped)?;
            }
            continue;
        }

        if let Body::Watch(_) = body {
            let ack = Frame::new(
                correlation_id,
                self_id,
                sender,
                Body::WatchResponse(wire::WatchResponse),
            );
            stream_out.send(ack).await?;
            // The connection is now a dedicated event stream; dropping it is
            // the unwatch.
            let mut events_rx = events.subscribe();
            loop {
                match events_rx.recv().await {
                    Ok(event) => {
                        let push =
                            Frame::new(0, self_id, sender, Body::ClusterEvent(event.to_wire()));
                        stream_out.send(push).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }

        let response = match handle_client_body(&client_tx, body).await {
            Ok(body) => body,
            Err(err) => Body::Error(wire::ErrorResponse::from_error(&err)),
        };
        stream_out
            .send(Frame::new(correlation_id, self_id, sender, response))
            .await?;
    }
    Ok(())
}

fn stopped<E>(_: E) -> KeeperError {
    KeeperError::Stopped
}

async fn handle_client_body(
    client_tx: &mpsc::UnboundedSender<ClientRequest>,
    body: Body,
) -> Result<Body> {
    match body {
        Body::UpdateClusterState(m) => {
            let level = ResponseLevel::from_code(m.response_level)?;
            let requests = m
                .requests
                .into_iter()
                .map(|r| UpdateRequest {
                    payload: r.payload,
                    partition: r.partition,
                    batch_size: r.batch_size,
                    include_header: r.include_header,
                })
                .collect();
            let (cb, rx) = oneshot::channel();
            client_tx
                .send(ClientRequest::Update {
                    requests,
                    level,
                    transaction: m.transaction_id,
                    cb,
                })
                .map_err(stopped)?;
            let results = rx.await.map_err(stopped)??;
            Ok(Body::UpdateClusterStateResponse(
                wire::UpdateClusterStateResponse { results },
            ))
        }
        Body::QueryClusterState(m) => {
            let (cb, rx) = oneshot::channel();
            client_tx
                .send(ClientRequest::Query {
                    payload: m.payload,
                    sequential: m.consistency == 1,
                    min_index: m.min_index,
                    cb,
                })
                .map_err(stopped)?;
            let (payload, index) = rx.await.map_err(stopped)??;
            Ok(Body::QueryClusterStateResponse(
                wire::QueryClusterStateResponse { payload, index },
            ))
        }
        Body::DisableLeaderWrite(m) => {
            let (cb, rx) = oneshot::channel();
            client_tx
                .send(ClientRequest::DisableWrites {
                    timeout_ms: m.timeout_ms,
                    term: m.term,
                    cb,
                })
                .map_err(stopped)?;
            let term = rx.await.map_err(stopped)??;
            Ok(Body::DisableLeaderWriteResponse(
                wire::DisableLeaderWriteResponse { term },
            ))
        }
        Body::CreateTransaction(_) => {
            let (cb, rx) = oneshot::channel();
            client_tx
                .send(ClientRequest::BeginTransaction { cb })
                .map_err(stopped)?;
            let (transaction_id, leader_term) = rx.await.map_err(stopped)??;
            Ok(Body::CreateTransactionResponse(
                wire::CreateTransactionResponse {
                    transaction_id,
                    leader_term,
                },
            ))
        }
        Body::CompleteTransaction(m) => {
            let (cb, rx) = oneshot::channel();
            client_tx
                .send(ClientRequest::CompleteTransaction {
                    id: m.transaction_id,
                    commit: m.commit,
                    cb,
                })
                .map_err(stopped)?;
            rx.await.map_err(stopped)??;
            Ok(Body::CompleteTransactionResponse(
                wire::CompleteTransactionResponse,
            ))
        }
        Body::GetOpeningTransactions(_) => {
            let (cb, rx) = oneshot::channel();
            client_tx
                .send(ClientRequest::OpeningTransactions { cb })
                .map_err(stopped)?;
            let transaction_ids = rx.await.map_err(stopped)??;
            Ok(Body::GetOpeningTransactionsResponse(
                wire::GetOpeningTransactionsResponse { transaction_ids },
            ))
        }
        Body::GetServers(_) => {
            let (cb, rx) = oneshot::channel();
            client_tx
                .send(ClientRequest::GetServers { cb })
                .map_err(stopped)?;
            let info = rx.await.map_err(stopped)??;
            Ok(Body::GetServersResponse(wire::GetServersResponse {
                leader: info.leader,
                voters: info.voters.iter().map(rpc::peer_to_wire).collect(),
                observers: info.observers.iter().map(rpc::peer_to_wire).collect(),
            }))
        }
        Body::UpdateVoters(m) => {
            let old = m
                .old_voters
                .iter()
                .map(rpc::peer_from_wire)
                .collect::<Result<Vec<Peer>>>()?;
            let new = m
                .new_voters
                .iter()
                .map(rpc::peer_from_wire)
                .collect::<Result<Vec<Peer>>>()?;
            let (cb, rx) = oneshot::channel();
            client_tx
                .send(ClientRequest::UpdateVoters { old, new, cb })
                .map_err(stopped)?;
            rx.await.map_err(stopped)??;
            Ok(Body::UpdateVotersResponse(wire::UpdateVotersResponse))
        }
        Body::ConvertRoll(m) => {
            let roll = match m.roll {
                0 => Roll::Voter,
                1 => Roll::Observer,
                other => {
                    return Err(KeeperError::MalformedFrame(format!(
                        "unknown roll {}",
                        other
                    )))
                }
            };
            let (cb, rx) = oneshot::channel();
            client_tx
                .send(ClientRequest::ConvertRoll {
                    id: m.server_id,
                    roll,
                    cb,
                })
                .map_err(stopped)?;
            rx.await.map_err(stopped)??;
            Ok(Body::ConvertRollResponse(wire::ConvertRollResponse))
        }
        other => Err(KeeperError::UnknownType(other.kind().code())),
    }
}

/// Demultiplexes the raft loop's outbound messages onto one writer task per
/// peer.
pub async fn outbound_task(
    logger: Logger,
    self_id: NodeId,
    mut rpc_rx: mpsc::UnboundedReceiver<Message>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut writers: HashMap<NodeId, (std::net::SocketAddr, mpsc::UnboundedSender<Command>)> =
        HashMap::new();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            message = rpc_rx.recv() => {
                let message = match message {
                    Some(message) => message,
                    None => break,
                };
                let peer = match message.to {
                    Address::Peer(peer) => peer,
                    Address::Local => continue,
                };
                let stale = writers
                    .get(&peer.id)
                    .map(|(addr, tx)| *addr != peer.addr || tx.is_closed())
                    .unwrap_or(true);
                if stale {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let logger = logger.new(o!("peer" => peer.id));
                    tokio::spawn(peer_writer(logger, self_id, peer, rx));
                    writers.insert(peer.id, (peer.addr, tx));
                }
                let _ = writers.get(&peer.id).unwrap().1.send(message.command);
            }
        }
    }
    Ok(())
}

/// Owns one outbound connection. Responses travel back over the remote
/// side's own outbound connection, so this half only writes.
async fn peer_writer(
    logger: Logger,
    self_id: NodeId,
    peer: Peer,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut backoff = ExponentialBackoff::default();
    backoff.max_elapsed_time = None;
    let mut writer: Option<FramedWrite<TcpStream, FrameCodec>> = None;
    while let Some(command) = rx.recv().await {
        let body = match rpc::command_to_body(&command) {
            Some(body) => body,
            None => continue,
        };
        if writer.is_none() {
            match TcpStream::connect(peer.addr).await {
                Ok(stream) => {
                    debug!(logger, "connected");
                    writer = Some(FramedWrite::new(stream, FrameCodec::new()));
                    backoff.reset();
                }
                Err(err) => {
                    debug!(logger, "could not connect"; "error" => err.to_string());
                    if let Some(delay) = backoff.next_backoff() {
                        tokio::time::sleep(delay).await;
                    }
                    // The message is dropped; the protocol regenerates it on
                    // the next heartbeat or retry.
                    continue;
                }
            }
        }
        if let Some(w) = writer.as_mut() {
            let frame = Frame::new(0, self_id, peer.id, body);
            if let Err(err) = w.send(frame).await {
                debug!(logger, "write failed"; "error" => err.to_string());
                writer = None;
            }
        }
    }
}
