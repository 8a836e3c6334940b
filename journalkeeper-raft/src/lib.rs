//! The replicated state machine server: Raft roles, the partitioned
//! journal, the deterministic applier, and the client-facing proposal
//! pipeline, all serialized through one logical raft loop with network I/O
//! fanned out to tasks.

#[macro_use]
extern crate slog;

pub mod candidate;
pub mod client;
pub mod config;
pub mod election;
pub mod follower;
pub mod fsm;
pub mod journal;
pub mod leader;
pub mod observer;
pub mod pipeline;
pub mod progress;
pub mod raft;
pub mod rpc;
pub mod snapshot;
pub mod store;
pub mod tcp;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testing;

use futures::FutureExt;
use journalkeeper_core::error::{KeeperError, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

pub use crate::client::RaftClient;
pub use crate::config::{RaftConfig, Roll};
pub use crate::fsm::Fsm;
pub use crate::raft::{
    Entry, EntryKind, LogIndex, NodeId, Peer, ResponseLevel, Term, UpdateRequest, UpdateResult,
};
pub use crate::rpc::{ClientRequest, ClusterEvent, ServersInfo};

use crate::fsm::{Driver, Instruction};
use crate::journal::FileJournal;
use crate::raft::{ClusterConfig, RaftHandle};
use crate::snapshot::Snapshotter;
use crate::store::{MetaStore, VoterStore};

/// One JournalKeeper server. Wires the journal, the state machine driver,
/// the transport tasks, and the raft loop together and runs them until
/// shutdown.
pub struct JournalKeeperRaft {
    config: RaftConfig,
}

impl JournalKeeperRaft {
    pub fn new(config: RaftConfig) -> JournalKeeperRaft {
        JournalKeeperRaft { config }
    }

    pub async fn run<T: Fsm>(
        self,
        fsm: T,
        client_rx: mpsc::UnboundedReceiver<ClientRequest>,
        shutdown: (broadcast::Sender<()>, broadcast::Receiver<()>),
    ) -> Result<()> {
        let config = self.config;
        config.validate()?;
        let logger = journalkeeper_core::logger::get_root_logger();

        std::fs::create_dir_all(&config.data_dir)?;
        let snapshots = Snapshotter::open(config.data_dir.join("snapshots"))?;
        let restored = snapshots.latest()?;
        let (compacted_index, compacted_term) = restored
            .map(|m| (m.last_included_index, m.last_included_term))
            .unwrap_or((0, 0));
        let journal = FileJournal::open(
            config.data_dir.join("journal"),
            compacted_index,
            compacted_term,
        )?;
        let (voters, record) = VoterStore::open(config.data_dir.join("voter_record"))?;
        let (meta, committed_config) = MetaStore::open(config.data_dir.join("metadata"))?;
        let cluster = committed_config.unwrap_or_else(|| ClusterConfig {
            voters: config.peers.clone(),
            voters_old: None,
            observers: config.observers.clone(),
        });

        let (rpc_in_tx, rpc_in_rx) = mpsc::unbounded_channel();
        let (rpc_out_tx, rpc_out_rx) = mpsc::unbounded_channel();
        let (fsm_tx, fsm_rx) = mpsc::unbounded_channel();
        let (applied_tx, applied_rx) = mpsc::unbounded_channel();
        let (merged_client_tx, merged_client_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(256);

        // Restore the state machine from the newest snapshot before the
        // loops start; the journal replays only what came after it.
        if let Some(meta_snapshot) = restored {
            let data = snapshots.read(meta_snapshot)?;
            fsm_tx
                .send(Instruction::Restore {
                    index: meta_snapshot.last_included_index,
                    data,
                })
                .map_err(|_| KeeperError::Stopped)?;
        }

        let mut handle = RaftHandle::new(
            config.clone(),
            cluster,
            record,
            Box::new(journal),
            voters,
            meta,
            snapshots,
            logger.clone(),
            rpc_out_tx,
            fsm_tx,
            events_tx.clone(),
        )?;
        if let Some(meta_snapshot) = restored {
            handle.restore_boundary(meta_snapshot);
        }

        let listener = TcpListener::bind(config.listen).await?;
        info!(logger, "listening"; "addr" => config.listen.to_string(), "id" => config.id);

        let (task, receiver) = tcp::receive_task(
            logger.new(o!("task" => "tcp-in")),
            listener,
            rpc_in_tx,
            merged_client_tx.clone(),
            events_tx,
            config.id,
            shutdown.0.subscribe(),
        )
        .remote_handle();
        tokio::spawn(task);

        let (task, sender) = tcp::outbound_task(
            logger.new(o!("task" => "tcp-out")),
            config.id,
            rpc_out_rx,
            shutdown.0.subscribe(),
        )
        .remote_handle();
        tokio::spawn(task);

        // Requests from the embedding process merge with network clients.
        let (task, forwarder) = forward_clients(client_rx, merged_client_tx).remote_handle();
        tokio::spawn(task);

        let driver = Driver::new(logger.new(o!("task" => "fsm")), fsm_rx, applied_tx, fsm);
        let (task, driver) = driver.run(shutdown.0.subscribe()).remote_handle();
        tokio::spawn(task);

        let (task, raft) = handle
            .run(rpc_in_rx, merged_client_rx, applied_rx, shutdown.1)
            .remote_handle();
        tokio::spawn(task);

        let (_, _, _, _, _) = tokio::try_join!(
            receiver,
            sender,
            forwarder,
            driver,
            raft.map(|r| r.map(|_| ()))
        )?;
        Ok(())
    }
}

async fn forward_clients(
    mut client_rx: mpsc::UnboundedReceiver<ClientRequest>,
    merged_tx: mpsc::UnboundedSender<ClientRequest>,
) -> Result<()> {
    while let Some(req) = client_rx.recv().await {
        if merged_tx.send(req).is_err() {
            break;
        }
    }
    Ok(())
}
