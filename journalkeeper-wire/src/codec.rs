use bytes::{Buf, BufMut, BytesMut};
use journalkeeper_core::error::KeeperError;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Frame, HEADER_LEN};

/// Hard ceiling for one frame; anything larger is a protocol violation, not
/// a message.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Length-delimited frame codec shared by peer and client connections.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> FrameCodec {
        FrameCodec
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = KeeperError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        frame.encode(&mut body);
        if body.len() > MAX_FRAME_LEN {
            return Err(KeeperError::MalformedFrame(format!(
                "frame of {} bytes exceeds limit",
                body.len()
            )));
        }
        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = KeeperError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len < HEADER_LEN || len > MAX_FRAME_LEN {
            return Err(KeeperError::MalformedFrame(format!(
                "implausible frame length {}",
                len
            )));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut body = src.split_to(len).freeze();
        Frame::decode(&mut body).map(Some)
    }
}
