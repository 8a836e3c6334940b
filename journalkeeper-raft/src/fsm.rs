use std::collections::BTreeMap;

use journalkeeper_core::error::{KeeperError, Result};
use slog::Logger;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::raft::{Entry, EntryKind, LogIndex};

/// How many applied results stay cached for ALL-level response fan-out.
const RESULT_CACHE: usize = 1024;

/// The user-supplied deterministic state machine. `transition` runs on a
/// single logical execution stream, one entry at a time, in index order.
pub trait Fsm: Send + 'static {
    fn transition(&mut self, entry: &Entry) -> Result<Vec<u8>>;

    /// Serves a read against the current state.
    fn query(&self, payload: &[u8]) -> Result<Vec<u8>>;

    /// A stable, self-contained image of the current state.
    fn snapshot(&self) -> Result<Vec<u8>>;

    fn restore(&mut self, data: &[u8]) -> Result<()>;
}

#[derive(Debug)]
pub enum Instruction {
    /// Apply one committed entry.
    Apply { entry: Entry },
    /// Answer once the apply stream has passed `min_index`.
    Query {
        payload: Vec<u8>,
        min_index: LogIndex,
        cb: oneshot::Sender<Result<(Vec<u8>, LogIndex)>>,
    },
    /// Capture a stable snapshot of the state.
    Snapshot {
        cb: oneshot::Sender<Result<(LogIndex, Vec<u8>)>>,
    },
    /// Replace the state with an installed snapshot.
    Restore { index: LogIndex, data: Vec<u8> },
}

/// Sent back to the raft loop after each entry finishes applying.
#[derive(Debug, Clone)]
pub struct Applied {
    pub index: LogIndex,
    pub term: u64,
    pub result: Vec<u8>,
    /// Running checksum over the applied result stream.
    pub state_hash: u32,
}

struct WaitingQuery {
    payload: Vec<u8>,
    min_index: LogIndex,
    cb: oneshot::Sender<Result<(Vec<u8>, LogIndex)>>,
}

/// Drives committed entries through the state machine.
pub struct Driver<T: Fsm> {
    logger: Logger,
    fsm_rx: mpsc::UnboundedReceiver<Instruction>,
    applied_tx: mpsc::UnboundedSender<Applied>,
    applied_idx: LogIndex,
    hasher: crc32fast::Hasher,
    results: BTreeMap<LogIndex, Vec<u8>>,
    waiting: Vec<WaitingQuery>,
    fsm: T,
}

impl<T: Fsm> Driver<T> {
    pub fn new(
        logger: Logger,
        fsm_rx: mpsc::UnboundedReceiver<Instruction>,
        applied_tx: mpsc::UnboundedSender<Applied>,
        fsm: T,
    ) -> Self {
        Self {
            logger,
            fsm_rx,
            applied_tx,
            applied_idx: 0,
            hasher: crc32fast::Hasher::new(),
            results: BTreeMap::new(),
            waiting: Vec::new(),
            fsm,
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        debug!(self.logger, "starting state machine driver");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,

                Some(instruction) = self.fsm_rx.recv() => {
                    self.exec(instruction)?;
                }
            }
        }
        Ok(())
    }

    pub fn exec(&mut self, instruction: Instruction) -> Result<()> {
        match instruction {
            Instruction::Apply { entry } => self.apply(entry)?,
            Instruction::Query {
                payload,
                min_index,
                cb,
            } => {
                if min_index <= self.applied_idx {
                    let result = self
                        .fsm
                        .query(&payload)
                        .map(|value| (value, self.applied_idx));
                    let _ = cb.send(result);
                } else {
                    self.waiting.push(WaitingQuery {
                        payload,
                        min_index,
                        cb,
                    });
                }
            }
            Instruction::Snapshot { cb } => {
                let result = self
                    .fsm
                    .snapshot()
                    .map(|data| (self.applied_idx, data));
                let _ = cb.send(result);
            }
            Instruction::Restore { index, data } => {
                self.fsm.restore(&data)?;
                self.applied_idx = index;
                self.results.clear();
                self.drain_waiting();
            }
        }
        Ok(())
    }

    /// No two applies overlap: this entry completes before the next
    /// instruction is read.
    fn apply(&mut self, entry: Entry) -> Result<()> {
        if entry.index != self.applied_idx + 1 {
            return Err(KeeperError::StorageFault(format!(
                "apply stream skipped from {} to {}",
                self.applied_idx, entry.index
            )));
        }
        let result = match entry.kind {
            EntryKind::Entry => self.fsm.transition(&entry)?,
            EntryKind::Config | EntryKind::Noop => Vec::new(),
        };
        self.applied_idx = entry.index;
        self.hasher.update(&entry.index.to_be_bytes());
        self.hasher.update(&result);
        let state_hash = self.hasher.clone().finalize();

        self.results.insert(entry.index, result.clone());
        while self.results.len() > RESULT_CACHE {
            let oldest = *self.results.keys().next().unwrap();
            self.results.remove(&oldest);
        }

        self.applied_tx
            .send(Applied {
                index: entry.index,
                term: entry.term,
                result,
                state_hash,
            })
            .map_err(|_| KeeperError::Stopped)?;

        self.drain_waiting();
        Ok(())
    }

    fn drain_waiting(&mut self) {
        let applied_idx = self.applied_idx;
        let mut still_waiting = Vec::new();
        for waiting in self.waiting.drain(..) {
            if waiting.min_index <= applied_idx {
                let result = self
                    .fsm
                    .query(&waiting.payload)
                    .map(|value| (value, applied_idx));
                let _ = waiting.cb.send(result);
            } else {
                still_waiting.push(waiting);
            }
        }
        self.waiting = still_waiting;
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::raft::now_millis;
    use tokio::sync::mpsc::unbounded_channel;

    /// A tiny key-value machine: `set k v` transitions, `get k` queries.
    pub struct KvFsm {
        entries: std::collections::HashMap<String, String>,
    }

    impl KvFsm {
        pub fn new() -> Self {
            Self {
                entries: std::collections::HashMap::new(),
            }
        }
    }

    impl Fsm for KvFsm {
        fn transition(&mut self, entry: &Entry) -> Result<Vec<u8>> {
            let text = String::from_utf8(entry.payload.clone())
                .map_err(|e| KeeperError::IoError(e.to_string()))?;
            let mut parts = text.splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("set"), Some(key), Some(value)) => {
                    self.entries.insert(key.to_string(), value.to_string());
                    Ok(value.as_bytes().to_vec())
                }
                _ => Err(KeeperError::IoError(format!("bad transition: {}", text))),
            }
        }

        fn query(&self, payload: &[u8]) -> Result<Vec<u8>> {
            let text = String::from_utf8(payload.to_vec())
                .map_err(|e| KeeperError::IoError(e.to_string()))?;
            let mut parts = text.splitn(2, ' ');
            match (parts.next(), parts.next()) {
                (Some("get"), Some(key)) => Ok(self
                    .entries
                    .get(key)
                    .map(|v| v.as_bytes().to_vec())
                    .unwrap_or_default()),
                _ => Err(KeeperError::IoError(format!("bad query: {}", text))),
            }
        }

        fn snapshot(&self) -> Result<Vec<u8>> {
            let mut pairs: Vec<(&String, &String)> = self.entries.iter().collect();
            pairs.sort();
            let lines: Vec<String> = pairs
                .into_iter()
                .map(|(k, v)| format!("{} {}", k, v))
                .collect();
            Ok(lines.join("\n").into_bytes())
        }

        fn restore(&mut self, data: &[u8]) -> Result<()> {
            self.entries.clear();
            let text =
                String::from_utf8(data.to_vec()).map_err(|e| KeeperError::IoError(e.to_string()))?;
            for line in text.lines() {
                let mut parts = line.splitn(2, ' ');
                if let (Some(k), Some(v)) = (parts.next(), parts.next()) {
                    self.entries.insert(k.to_string(), v.to_string());
                }
            }
            Ok(())
        }
    }

    pub fn entry(index: LogIndex, payload: &str) -> Entry {
        Entry {
            term: 1,
            index,
            partition: 0,
            batch_size: 1,
            timestamp: now_millis(),
            kind: EntryKind::Entry,
            header: None,
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn driver(fsm: KvFsm) -> (Driver<KvFsm>, mpsc::UnboundedReceiver<Applied>) {
        let (_tx, rx) = unbounded_channel();
        let (applied_tx, applied_rx) = unbounded_channel();
        (
            Driver::new(
                journalkeeper_core::logger::get_root_logger().new(o!()),
                rx,
                applied_tx,
                fsm,
            ),
            applied_rx,
        )
    }

    #[tokio::test]
    async fn applies_in_order_and_reports_results() {
        let (mut driver, mut applied_rx) = driver(KvFsm::new());
        driver
            .exec(Instruction::Apply {
                entry: entry(1, "set k one"),
            })
            .unwrap();
        driver
            .exec(Instruction::Apply {
                entry: entry(2, "set k two"),
            })
            .unwrap();

        let first = applied_rx.recv().await.unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(first.result, b"one".to_vec());
        let second = applied_rx.recv().await.unwrap();
        assert_eq!(second.index, 2);
        assert_eq!(second.result, b"two".to_vec());
        assert_ne!(first.state_hash, second.state_hash);
    }

    #[tokio::test]
    async fn out_of_order_apply_is_fatal() {
        let (mut driver, _applied_rx) = driver(KvFsm::new());
        driver
            .exec(Instruction::Apply {
                entry: entry(1, "set k one"),
            })
            .unwrap();
        let err = driver
            .exec(Instruction::Apply {
                entry: entry(3, "set k three"),
            })
            .unwrap_err();
        assert!(matches!(err, KeeperError::StorageFault(_)));
    }

    #[tokio::test]
    async fn query_waits_for_the_read_index() {
        let (mut driver, _applied_rx) = driver(KvFsm::new());
        let (cb, rx) = oneshot::channel();
        driver
            .exec(Instruction::Query {
                payload: b"get k".to_vec(),
                min_index: 2,
                cb,
            })
            .unwrap();

        driver
            .exec(Instruction::Apply {
                entry: entry(1, "set k one"),
            })
            .unwrap();
        driver
            .exec(Instruction::Apply {
                entry: entry(2, "set k two"),
            })
            .unwrap();

        let (value, index) = rx.await.unwrap().unwrap();
        assert_eq!(value, b"two".to_vec());
        assert_eq!(index, 2);
    }

    #[tokio::test]
    async fn snapshot_and_restore_round_trip() {
        let (mut snapshot_driver, _applied_rx) = driver(KvFsm::new());
        snapshot_driver
            .exec(Instruction::Apply {
                entry: entry(1, "set a 1"),
            })
            .unwrap();
        snapshot_driver
            .exec(Instruction::Apply {
                entry: entry(2, "set b 2"),
            })
            .unwrap();

        let (cb, rx) = oneshot::channel();
        snapshot_driver.exec(Instruction::Snapshot { cb }).unwrap();
        let (index, data) = rx.await.unwrap().unwrap();
        assert_eq!(index, 2);

        let (mut restored, _applied_rx) = driver(KvFsm::new());
        restored
            .exec(Instruction::Restore { index, data })
            .unwrap();
        let (cb, rx) = oneshot::channel();
        restored
            .exec(Instruction::Query {
                payload: b"get b".to_vec(),
                min_index: 2,
                cb,
            })
            .unwrap();
        let (value, _) = rx.await.unwrap().unwrap();
        assert_eq!(value, b"2".to_vec());
    }
}
