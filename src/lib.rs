pub mod config;
pub mod kv;

use std::future::Future;

use futures::FutureExt;
use journalkeeper_core::error::Result;
use journalkeeper_raft::JournalKeeperRaft;

pub use crate::config::KeeperConfig;
pub use journalkeeper_client::{ClientConfig, KeeperClient};
pub use journalkeeper_raft::{Fsm, RaftClient};

pub async fn journalkeeper<P: AsRef<std::path::Path>>(
    config_path: P,
    shutdown: (
        tokio::sync::broadcast::Sender<()>,
        tokio::sync::broadcast::Receiver<()>,
    ),
) -> Result<()> {
    let config = config::config(config_path);
    run(config, shutdown).await
}

/// Wires one server around the given state machine and hands back the
/// in-process client handle an embedding program drives it with, alongside
/// the future that runs the server until shutdown.
pub fn server<T: Fsm>(
    config: KeeperConfig,
    fsm: T,
    shutdown: (
        tokio::sync::broadcast::Sender<()>,
        tokio::sync::broadcast::Receiver<()>,
    ),
) -> (RaftClient, impl Future<Output = Result<()>>) {
    let (client_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();
    let client = RaftClient::new(client_tx);
    let raft = JournalKeeperRaft::new(config.raft);
    (client, raft.run(fsm, client_rx, shutdown))
}

pub async fn run(
    config: KeeperConfig,
    shutdown: (
        tokio::sync::broadcast::Sender<()>,
        tokio::sync::broadcast::Receiver<()>,
    ),
) -> Result<()> {
    // The bundled binary serves network clients over the listener only, so
    // the in-process request channel is left closed; embedding programs use
    // `server` to keep the sending half.
    let (client_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();
    drop(client_tx);

    let raft = JournalKeeperRaft::new(config.raft);
    let (task, raft) = raft
        .run(
            kv::KvFsm::default(),
            client_rx,
            (shutdown.0.clone(), shutdown.0.subscribe()),
        )
        .remote_handle();
    tokio::spawn(task);

    let (task, shutdown_notifier) = {
        let shutdown_tx = shutdown.0.clone();
        async move {
            let mut rx = shutdown_tx.subscribe();
            let _ = rx.recv().await;
            Result::Ok(())
        }
        .remote_handle()
    };
    tokio::spawn(task);

    let (_, _) = tokio::try_join!(raft, shutdown_notifier)?;
    Ok(())
}
