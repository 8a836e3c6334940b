//! Shared fixtures for the role state machine tests: an in-memory journal,
//! ephemeral stores, and captured channel ends.

use tokio::sync::{broadcast, mpsc};

use crate::config::{RaftConfig, Roll};
use crate::follower::Follower;
use crate::fsm::Instruction;
use crate::journal::MemoryJournal;
use crate::leader::Leader;
use crate::observer::Observer;
use crate::raft::{
    now_millis, Apply, ClusterConfig, Command, Entry, EntryKind, LogIndex, NodeId, Peer, Raft,
    RaftHandle, Term,
};
use crate::rpc::{ClientRequest, ClusterEvent, Message};
use crate::snapshot::Snapshotter;
use crate::store::{MetaStore, VoterRecord, VoterStore};

pub struct Node {
    pub rpc_rx: mpsc::UnboundedReceiver<Message>,
    pub fsm_rx: mpsc::UnboundedReceiver<Instruction>,
    pub events_rx: broadcast::Receiver<ClusterEvent>,
    pub client_tx: mpsc::UnboundedSender<ClientRequest>,
    pub client_rx: mpsc::UnboundedReceiver<ClientRequest>,
    pub dir: tempfile::TempDir,
}

pub fn peer(id: NodeId) -> Peer {
    Peer {
        id,
        addr: format!("127.0.0.1:{}", 8800 + id as u16).parse().unwrap(),
    }
}

pub fn entry(term: Term, index: LogIndex, payload: &str) -> Entry {
    Entry {
        term,
        index,
        partition: 0,
        batch_size: 1,
        timestamp: now_millis(),
        kind: EntryKind::Entry,
        header: None,
        payload: payload.as_bytes().to_vec(),
    }
}

fn build(id: NodeId, voters: &[NodeId], roll: Roll) -> (RaftHandle, Node) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RaftConfig::default();
    config.id = id;
    config.listen = peer(id).addr;
    config.data_dir = dir.path().to_path_buf();
    config.roll = roll;
    config.peers = voters.iter().map(|v| peer(*v)).collect();

    let observers = if roll == Roll::Observer {
        vec![peer(id)]
    } else {
        Vec::new()
    };
    config.observers = observers.clone();
    let cluster = ClusterConfig {
        voters: voters.iter().map(|v| peer(*v)).collect(),
        voters_old: None,
        observers,
    };

    let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
    let (fsm_tx, fsm_rx) = mpsc::unbounded_channel();
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (events, events_rx) = broadcast::channel(64);
    let snapshots = Snapshotter::open(dir.path().join("snapshots")).unwrap();

    let handle = RaftHandle::new(
        config,
        cluster,
        VoterRecord::default(),
        Box::new(MemoryJournal::new()),
        VoterStore::ephemeral(),
        MetaStore::ephemeral(),
        snapshots,
        journalkeeper_core::logger::get_root_logger(),
        rpc_tx,
        fsm_tx,
        events,
    )
    .unwrap();

    (
        handle,
        Node {
            rpc_rx,
            fsm_rx,
            events_rx,
            client_tx,
            client_rx,
            dir,
        },
    )
}

pub fn follower(id: NodeId, voters: &[NodeId]) -> (Raft<Follower>, Node) {
    match build(id, voters, Roll::Voter) {
        (RaftHandle::Follower(raft), node) => (raft, node),
        _ => panic!("expected a follower"),
    }
}

pub fn observer(id: NodeId, voters: &[NodeId]) -> (Raft<Observer>, Node) {
    match build(id, voters, Roll::Observer) {
        (RaftHandle::Observer(raft), node) => (raft, node),
        _ => panic!("expected an observer"),
    }
}

/// Elects `id` leader of a fresh cluster at term 1.
pub fn leader(id: NodeId, voters: &[NodeId]) -> (Raft<Leader>, Node) {
    let (raft, mut node) = follower(id, voters);
    let mut handle = raft.apply(Command::Timeout).unwrap();
    if voters.len() > 1 {
        let granter = voters.iter().copied().find(|v| *v != id).unwrap();
        handle = handle
            .apply(Command::VoteResponse {
                term: 1,
                from: granter,
                granted: true,
            })
            .unwrap();
    }
    while recv_command(&mut node.rpc_rx).is_some() {}
    match handle {
        RaftHandle::Leader(leader) => (leader, node),
        other => panic!("expected a leader, got {:?}", other.role()),
    }
}

pub fn recv_command(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<Command> {
    rx.try_recv().ok().map(|message| message.command)
}

#[cfg(test)]
mod cluster {
    //! Three servers driven deterministically: messages are shuttled by
    //! hand, with no timers and no sockets.

    use std::collections::HashMap;
    use std::collections::HashSet;

    use tokio::sync::oneshot;

    use super::*;
    use crate::raft::{RaftRole, ResponseLevel, UpdateRequest, UpdateResult};
    use crate::rpc::Address;
    use journalkeeper_core::error::{KeeperError, Result};

    struct Cluster {
        nodes: HashMap<NodeId, RaftHandle>,
        channels: HashMap<NodeId, Node>,
        partitioned: HashSet<NodeId>,
    }

    impl Cluster {
        fn new(ids: &[NodeId]) -> Cluster {
            let mut nodes = HashMap::new();
            let mut channels = HashMap::new();
            for id in ids {
                let (raft, node) = follower(*id, ids);
                nodes.insert(*id, RaftHandle::Follower(raft));
                channels.insert(*id, node);
            }
            Cluster {
                nodes,
                channels,
                partitioned: HashSet::new(),
            }
        }

        /// Shuttles messages until the cluster goes quiet.
        fn settle(&mut self) {
            loop {
                let mut delivered = false;
                let ids: Vec<NodeId> = self.channels.keys().copied().collect();
                for from in ids {
                    while let Ok(message) = self.channels.get_mut(&from).unwrap().rpc_rx.try_recv()
                    {
                        let to = match &message.to {
                            Address::Peer(peer) => peer.id,
                            Address::Local => continue,
                        };
                        if self.partitioned.contains(&from) || self.partitioned.contains(&to) {
                            continue;
                        }
                        let target = match self.nodes.remove(&to) {
                            Some(target) => target,
                            None => continue,
                        };
                        let target = target.step(message).unwrap();
                        self.nodes.insert(to, target);
                        delivered = true;
                    }
                }
                if !delivered {
                    break;
                }
            }
        }

        fn elect(&mut self, id: NodeId) {
            let node = self.nodes.remove(&id).unwrap();
            self.nodes.insert(id, node.apply(Command::Timeout).unwrap());
            self.settle();
        }

        /// Makes the next tick at `id` send an immediate heartbeat round.
        fn heartbeat(&mut self, id: NodeId) {
            if let Some(RaftHandle::Leader(raft)) = self.nodes.get_mut(&id) {
                raft.role.heartbeat_time =
                    std::time::Instant::now() - raft.role.heartbeat_timeout;
            }
            let node = self.nodes.remove(&id).unwrap();
            self.nodes.insert(id, node.apply(Command::Tick).unwrap());
            self.settle();
        }

        fn role(&self, id: NodeId) -> RaftRole {
            self.nodes.get(&id).unwrap().role()
        }

        fn update(
            &mut self,
            id: NodeId,
            payload: &str,
            level: ResponseLevel,
        ) -> oneshot::Receiver<Result<UpdateResult>> {
            let (cb, rx) = oneshot::channel();
            let node = self.nodes.remove(&id).unwrap();
            let node = node
                .client(ClientRequest::Update {
                    requests: vec![UpdateRequest::new(payload.as_bytes().to_vec())],
                    level,
                    transaction: None,
                    cb,
                })
                .unwrap();
            self.nodes.insert(id, node);
            self.settle();
            rx
        }
    }

    #[tokio::test]
    async fn quorum_replication_resolves_and_commits_everywhere() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);
        assert_eq!(cluster.role(1), RaftRole::Leader);
        assert_eq!(cluster.role(2), RaftRole::Follower);

        let mut rx = cluster.update(1, "x", ResponseLevel::Replication);
        // REPLICATION resolves to null once a quorum persisted the entry.
        assert_eq!(rx.try_recv().unwrap().unwrap(), None);

        // The entry (index 2, after the term-opening noop) is committed on
        // the leader; the next heartbeat spreads the commit index.
        assert!(cluster.nodes.get(&1).unwrap().state().commit_index >= 2);
        cluster.heartbeat(1);
        for id in [1u32, 2, 3].iter() {
            let fsm_rx = &mut cluster.channels.get_mut(id).unwrap().fsm_rx;
            let mut saw_update = false;
            while let Ok(instruction) = fsm_rx.try_recv() {
                if let crate::fsm::Instruction::Apply { entry } = instruction {
                    if entry.payload == b"x".to_vec() {
                        saw_update = true;
                    }
                }
            }
            assert!(saw_update, "server {} never applied the update", id);
        }
    }

    #[tokio::test]
    async fn batch_at_all_level_returns_results_in_order() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);

        let (cb, mut rx) = oneshot::channel();
        let node = cluster.nodes.remove(&1).unwrap();
        let node = node
            .client(ClientRequest::Update {
                requests: vec![
                    UpdateRequest::new(b"r1".to_vec()),
                    UpdateRequest::new(b"r2".to_vec()),
                    UpdateRequest::new(b"r3".to_vec()),
                ],
                level: ResponseLevel::All,
                transaction: None,
                cb,
            })
            .unwrap();
        cluster.nodes.insert(1, node);
        cluster.settle();

        // Quorum reached but nothing applied yet.
        assert!(rx.try_recv().is_err());

        // Feed the applied notifications the way the driver would, in index
        // order (entries 2..=4 behind the noop).
        let mut node = cluster.nodes.remove(&1).unwrap();
        for (index, result) in [(2u64, b"a1"), (3, b"a2"), (4, b"a3")].iter() {
            node = node
                .applied(crate::fsm::Applied {
                    index: *index,
                    term: 1,
                    result: result.to_vec(),
                    state_hash: 0,
                })
                .unwrap();
        }
        cluster.nodes.insert(1, node);

        let results = rx.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(
            results,
            vec![b"a1".to_vec(), b"a2".to_vec(), b"a3".to_vec()]
        );
    }

    #[tokio::test]
    async fn partitioned_leader_steps_down_and_redirects() {
        let mut cluster = Cluster::new(&[1, 2, 3]);
        cluster.elect(1);

        // 1 is cut off; 2 times out and wins term 2 with 3's ballot.
        cluster.partitioned.insert(1);
        cluster.elect(2);
        assert_eq!(cluster.role(2), RaftRole::Leader);

        // The partition heals; 1 hears term 2 on the next heartbeat and
        // steps down.
        cluster.partitioned.clear();
        cluster.heartbeat(2);
        assert_eq!(cluster.role(1), RaftRole::Follower);

        // A client still talking to 1 is redirected to 2...
        let mut rx = cluster.update(1, "y", ResponseLevel::Replication);
        match rx.try_recv().unwrap() {
            Err(KeeperError::NotLeader { leader_hint }) => {
                assert_eq!(leader_hint, Some(2));
            }
            other => panic!("expected a redirect, got {:?}", other),
        }

        // ...and the retry at 2 succeeds.
        let mut rx = cluster.update(2, "y", ResponseLevel::Replication);
        assert_eq!(rx.try_recv().unwrap().unwrap(), None);
    }
}
