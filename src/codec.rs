use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::frame::{self, Decoded, Frame};

/// Replies larger than this are treated as a corrupted stream.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Frames RESP values over a byte stream. The read buffer handed to `decode` is the connection's
/// decode buffer: complete frames are split off its front, a trailing partial frame stays put.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = crate::ClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match frame::decode(&src[..])? {
            Decoded::Complete { frame, consumed } => {
                // Remove the parsed frame from the buffer.
                src.advance(consumed);
                trace!(consumed, "decoded frame: {}", frame);
                Ok(Some(frame))
            }
            Decoded::Incomplete => {
                // A partial frame this large will never be accepted, so stop buffering it.
                if src.len() > self.max_frame_size {
                    return Err(frame::Error::FrameTooLarge(self.max_frame_size).into());
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = crate::ClientError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst);
        Ok(())
    }
}
