//! Length-prefixed message framing.
//!
//! Every message on a stream is preceded by a five byte prefix: a one byte
//! compressed-flag followed by a big-endian u32 length. This core registers
//! no compression codecs, so the flag is carried but a set flag on receipt is
//! a protocol error.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Code, Status};

pub(crate) const HEADER_SIZE: usize = 1 + 4;

const BUFFER_SIZE: usize = 8 * 1024;

/// Prefixes `message` with the five byte frame header.
pub(crate) fn encode_frame(message: Bytes) -> Bytes {
    debug_assert!(message.len() <= u32::MAX as usize);
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + message.len());
    buf.put_u8(0);
    buf.put_u32(message.len() as u32);
    buf.put(message);
    buf.freeze()
}

#[derive(Debug)]
enum State {
    ReadHeader,
    ReadBody { len: usize },
}

/// Incremental frame decoder: feed it wire chunks, pull whole messages.
pub(crate) struct FrameDecoder {
    buf: BytesMut,
    state: State,
    max_message_size: usize,
}

impl FrameDecoder {
    pub(crate) fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(BUFFER_SIZE),
            state: State::ReadHeader,
            max_message_size,
        }
    }

    pub(crate) fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Returns the next complete message, or `None` if more input is needed.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Bytes>, Status> {
        if let State::ReadHeader = self.state {
            if self.buf.remaining() < HEADER_SIZE {
                return Ok(None);
            }
            match self.buf.get_u8() {
                0 => {}
                1 => {
                    return Err(Status::new(
                        Code::Internal,
                        "protocol error: received message with compressed-flag set \
                         but no message encoding was negotiated",
                    ));
                }
                f => {
                    return Err(Status::new(
                        Code::Internal,
                        format!(
                            "protocol error: invalid compression flag: {f} \
                             (valid flags are 0 and 1)"
                        ),
                    ));
                }
            }
            let len = self.buf.get_u32() as usize;
            if len > self.max_message_size {
                return Err(Status::new(
                    Code::ResourceExhausted,
                    format!(
                        "received message larger than max ({len} vs. {})",
                        self.max_message_size
                    ),
                ));
            }
            self.buf.reserve(len);
            self.state = State::ReadBody { len };
        }

        if let State::ReadBody { len } = self.state {
            if self.buf.remaining() < len {
                return Ok(None);
            }
            let message = self.buf.split_to(len).freeze();
            self.state = State::ReadHeader;
            return Ok(Some(message));
        }

        Ok(None)
    }

    /// True when no partial frame is buffered.
    pub(crate) fn is_empty(&self) -> bool {
        matches!(self.state, State::ReadHeader) && !self.buf.has_remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let frame = encode_frame(Bytes::from_static(b"hello"));
        assert_eq!(frame.len(), HEADER_SIZE + 5);
        assert_eq!(&frame[..5], &[0, 0, 0, 0, 5]);

        let mut decoder = FrameDecoder::new(usize::MAX);
        decoder.extend(&frame);
        assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), b"hello");
        assert!(decoder.next_frame().unwrap().is_none());
        assert!(decoder.is_empty());
    }

    #[test]
    fn split_delivery() {
        let frame = encode_frame(Bytes::from_static(b"split me"));
        let mut decoder = FrameDecoder::new(usize::MAX);
        decoder.extend(&frame[..3]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&frame[3..7]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&frame[7..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), b"split me");
    }

    #[test]
    fn two_frames_one_chunk() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(Bytes::from_static(b"one")));
        wire.extend_from_slice(&encode_frame(Bytes::from_static(b"two")));
        let mut decoder = FrameDecoder::new(usize::MAX);
        decoder.extend(&wire);
        assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), b"one");
        assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), b"two");
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn compressed_flag_rejected() {
        let mut decoder = FrameDecoder::new(usize::MAX);
        decoder.extend(&[1, 0, 0, 0, 0]);
        let err = decoder.next_frame().unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn oversized_message_rejected() {
        let mut decoder = FrameDecoder::new(4);
        decoder.extend(&encode_frame(Bytes::from_static(b"toolarge")));
        let err = decoder.next_frame().unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
    }
}
