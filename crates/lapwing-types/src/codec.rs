//! Frame codec contract
//!
//! The client core never touches AMQP byte encoding directly: it hands
//! frames to a [`FrameCodec`] and ingests raw transport bytes through it.
//! [`BincodeFrameCodec`] is the codec the in-repo test peer speaks — a
//! four-byte length prefix followed by a bincode-serialized [`Frame`]. A
//! standards-conforming wire codec implements the same trait.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::performatives::Frame;

/// Frames larger than this are treated as malformed rather than buffered.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Failures raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {reason}")]
    Malformed { reason: String },

    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl CodecError {
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        CodecError::Malformed {
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Codec Contract
// ----------------------------------------------------------------------------

/// Incremental frame codec.
///
/// `ingest` accepts transport bytes unconditionally; the codec owns the
/// partial-frame buffer, so callers never need to retain unread input.
/// `next_frame` yields decoded frames until the buffer runs dry.
pub trait FrameCodec: Send {
    fn encode(&mut self, frame: &Frame) -> Result<Bytes, CodecError>;

    fn ingest(&mut self, bytes: Bytes);

    fn next_frame(&mut self) -> Result<Option<Frame>, CodecError>;
}

// ----------------------------------------------------------------------------
// Bincode Codec
// ----------------------------------------------------------------------------

/// Length-prefixed bincode framing.
#[derive(Debug, Default)]
pub struct BincodeFrameCodec {
    buffer: BytesMut,
}

impl BincodeFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameCodec for BincodeFrameCodec {
    fn encode(&mut self, frame: &Frame) -> Result<Bytes, CodecError> {
        let body = bincode::serialize(frame)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_LEN,
            });
        }
        let mut out = BytesMut::with_capacity(4 + body.len());
        out.put_u32(body.len() as u32);
        out.put_slice(&body);
        Ok(out.freeze())
    }

    fn ingest(&mut self, bytes: Bytes) {
        self.buffer.extend_from_slice(&bytes);
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_LEN,
            });
        }
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }
        self.buffer.advance(4);
        let body = self.buffer.split_to(len);
        let frame = bincode::deserialize(&body)
            .map_err(|e| CodecError::malformed(format!("undecodable frame body: {e}")))?;
        Ok(Some(frame))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performatives::{Open, Performative};

    fn open_frame(container_id: &str) -> Frame {
        Frame::amqp(
            0,
            Performative::Open(Open {
                container_id: container_id.to_string(),
                ..Open::default()
            }),
        )
    }

    #[test]
    fn test_encode_decode_single_frame() {
        let mut codec = BincodeFrameCodec::new();
        let frame = open_frame("client-1");

        let wire = codec.encode(&frame).unwrap();
        codec.ingest(wire);

        assert_eq!(codec.next_frame().unwrap(), Some(frame));
        assert_eq!(codec.next_frame().unwrap(), None);
    }

    #[test]
    fn test_partial_ingestion_buffers_until_complete() {
        let mut codec = BincodeFrameCodec::new();
        let frame = open_frame("client-2");
        let wire = codec.encode(&frame).unwrap();

        let (head, tail) = wire.split_at(wire.len() / 2);
        codec.ingest(Bytes::copy_from_slice(head));
        assert_eq!(codec.next_frame().unwrap(), None);

        codec.ingest(Bytes::copy_from_slice(tail));
        assert_eq!(codec.next_frame().unwrap(), Some(frame));
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut codec = BincodeFrameCodec::new();
        let first = open_frame("a");
        let second = Frame::Empty;

        let mut chunk = BytesMut::new();
        chunk.extend_from_slice(&codec.encode(&first).unwrap());
        chunk.extend_from_slice(&codec.encode(&second).unwrap());
        codec.ingest(chunk.freeze());

        assert_eq!(codec.next_frame().unwrap(), Some(first));
        assert_eq!(codec.next_frame().unwrap(), Some(second));
        assert_eq!(codec.next_frame().unwrap(), None);
    }

    #[test]
    fn test_oversized_length_prefix_is_rejected() {
        let mut codec = BincodeFrameCodec::new();
        let mut bogus = BytesMut::new();
        bogus.put_u32(u32::MAX);
        codec.ingest(bogus.freeze());

        assert!(matches!(
            codec.next_frame(),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }
}
