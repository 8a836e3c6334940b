//! The leader's proposal pipeline: pending client completions keyed by the
//! index range they were assigned, resolved as each stage is reached.

use std::time::Instant;

use journalkeeper_core::error::{KeeperError, Result};
use tokio::sync::oneshot;

use crate::raft::{LogIndex, ResponseLevel, UpdateResult};

pub type ResponseSender = oneshot::Sender<Result<UpdateResult>>;

struct Pending {
    first: LogIndex,
    last: LogIndex,
    level: ResponseLevel,
    deadline: Instant,
    results: Vec<Option<Vec<u8>>>,
    cb: Option<ResponseSender>,
}

impl Pending {
    fn complete(&mut self, value: Result<UpdateResult>) {
        if let Some(cb) = self.cb.take() {
            // A cancelled caller just discards the late result.
            let _ = cb.send(value);
        }
    }

    fn done(&self) -> bool {
        self.cb.is_none()
    }
}

#[derive(Default)]
pub struct Pipeline {
    pending: Vec<Pending>,
}

impl Pipeline {
    pub fn new() -> Pipeline {
        Pipeline::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Registers a proposal that was just assigned `[first, last]` and
    /// persisted locally. RECEIVE and PERSISTENCE are therefore already
    /// satisfied and resolve to a single null immediately.
    pub fn register(
        &mut self,
        first: LogIndex,
        last: LogIndex,
        level: ResponseLevel,
        deadline: Instant,
        cb: ResponseSender,
    ) {
        let mut pending = Pending {
            first,
            last,
            level,
            deadline,
            results: vec![None; (last - first + 1) as usize],
            cb: Some(cb),
        };
        match level {
            ResponseLevel::Receive | ResponseLevel::Persistence => {
                pending.complete(Ok(None));
            }
            ResponseLevel::Replication | ResponseLevel::All => {
                self.pending.push(pending);
            }
        }
    }

    /// The commit index reached `commit`; REPLICATION waiters under it
    /// resolve to null.
    pub fn commit_advanced(&mut self, commit: LogIndex) {
        for pending in &mut self.pending {
            if pending.level == ResponseLevel::Replication && pending.last <= commit {
                pending.complete(Ok(None));
            }
        }
        self.pending.retain(|p| !p.done());
    }

    /// One entry finished applying; ALL waiters resolve once every slot of
    /// their range is filled, one result per entry in submission order.
    pub fn entry_applied(&mut self, index: LogIndex, result: &[u8]) {
        for pending in &mut self.pending {
            if pending.level != ResponseLevel::All
                || index < pending.first
                || index > pending.last
            {
                continue;
            }
            let slot = (index - pending.first) as usize;
            pending.results[slot] = Some(result.to_vec());
            if pending.results.iter().all(|r| r.is_some()) {
                let results = pending.results.drain(..).map(|r| r.unwrap()).collect();
                pending.complete(Ok(Some(results)));
            }
        }
        self.pending.retain(|p| !p.done());
    }

    /// Fails every waiter whose deadline has passed. The entries themselves
    /// may still commit; expiry only abandons the response.
    pub fn expire(&mut self, now: Instant) {
        for pending in &mut self.pending {
            if now >= pending.deadline {
                pending.complete(Err(KeeperError::Timeout));
            }
        }
        self.pending.retain(|p| !p.done());
    }

    /// Leadership was lost or the server is stopping; every pending
    /// completion fails with `err`.
    pub fn fail_all(&mut self, err: KeeperError) {
        for pending in &mut self.pending {
            pending.complete(Err(err.clone()));
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn receive_and_persistence_resolve_to_a_single_null() {
        let mut pipeline = Pipeline::new();
        for level in [ResponseLevel::Receive, ResponseLevel::Persistence].iter() {
            let (cb, rx) = oneshot::channel();
            pipeline.register(1, 3, *level, far_deadline(), cb);
            assert_eq!(rx.await.unwrap().unwrap(), None);
        }
        assert!(pipeline.is_empty());
    }

    #[tokio::test]
    async fn replication_resolves_on_quorum_commit() {
        let mut pipeline = Pipeline::new();
        let (cb, mut rx) = oneshot::channel();
        pipeline.register(4, 4, ResponseLevel::Replication, far_deadline(), cb);

        pipeline.commit_advanced(3);
        assert!(rx.try_recv().is_err());

        pipeline.commit_advanced(4);
        assert_eq!(rx.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn all_resolves_with_one_result_per_entry_in_order() {
        let mut pipeline = Pipeline::new();
        let (cb, mut rx) = oneshot::channel();
        pipeline.register(5, 7, ResponseLevel::All, far_deadline(), cb);

        pipeline.entry_applied(6, b"r2");
        pipeline.entry_applied(5, b"r1");
        assert!(rx.try_recv().is_err());
        pipeline.entry_applied(7, b"r3");

        let results = rx.await.unwrap().unwrap().unwrap();
        assert_eq!(
            results,
            vec![b"r1".to_vec(), b"r2".to_vec(), b"r3".to_vec()]
        );
    }

    #[tokio::test]
    async fn deadline_expiry_fails_with_timeout() {
        let mut pipeline = Pipeline::new();
        let (cb, rx) = oneshot::channel();
        pipeline.register(1, 1, ResponseLevel::Replication, Instant::now(), cb);
        pipeline.expire(Instant::now() + Duration::from_millis(1));
        assert_eq!(rx.await.unwrap(), Err(KeeperError::Timeout));
    }

    #[tokio::test]
    async fn stepdown_fails_everything_with_not_leader() {
        let mut pipeline = Pipeline::new();
        let (cb1, rx1) = oneshot::channel();
        let (cb2, rx2) = oneshot::channel();
        pipeline.register(1, 1, ResponseLevel::Replication, far_deadline(), cb1);
        pipeline.register(2, 2, ResponseLevel::All, far_deadline(), cb2);

        pipeline.fail_all(KeeperError::NotLeader {
            leader_hint: Some(2),
        });
        let expected = Err(KeeperError::NotLeader {
            leader_hint: Some(2),
        });
        assert_eq!(rx1.await.unwrap(), expected);
        assert_eq!(rx2.await.unwrap(), expected);
        assert!(pipeline.is_empty());
    }
}
