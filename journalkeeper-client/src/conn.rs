//! One multiplexed connection: requests carry a correlation id, a callback
//! map pairs responses with their waiters across the split read and write
//! tasks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::SinkExt;
use journalkeeper_core::error::{KeeperError, Result};
use journalkeeper_wire::{Frame, FrameCodec};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

pub struct Connection {
    tx: mpsc::UnboundedSender<(Frame, oneshot::Sender<Frame>)>,
}

impl Connection {
    pub async fn open(addr: SocketAddr) -> Result<Connection> {
        let stream = TcpStream::connect(addr).await?;
        let (r, w) = stream.into_split();
        let mut stream_in = FramedRead::new(r, FrameCodec::new());
        let mut stream_out = FramedWrite::new(w, FrameCodec::new());

        let cbs: Arc<Mutex<HashMap<u32, oneshot::Sender<Frame>>>> = Default::default();
        let (tx, mut rx) = mpsc::unbounded_channel::<(Frame, oneshot::Sender<Frame>)>();

        let write_cbs = cbs.clone();
        tokio::spawn(async move {
            while let Some((frame, cb)) = rx.recv().await {
                let correlation_id = frame.correlation_id;
                write_cbs.lock().unwrap().insert(correlation_id, cb);
                if stream_out.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let read_cbs = cbs.clone();
        tokio::spawn(async move {
            while let Ok(Some(frame)) = stream_in.try_next().await {
                let cb = read_cbs.lock().unwrap().remove(&frame.correlation_id);
                if let Some(cb) = cb {
                    let _ = cb.send(frame);
                }
            }
            // Connection gone; dropping the map fails every waiter.
            read_cbs.lock().unwrap().clear();
        });

        Ok(Connection { tx })
    }

    pub async fn call(&self, frame: Frame) -> Result<Frame> {
        let (cb, rx) = oneshot::channel();
        self.tx
            .send((frame, cb))
            .map_err(|_| KeeperError::IoError("connection closed".into()))?;
        rx.await
            .map_err(|_| KeeperError::IoError("connection dropped".into()))
    }
}
