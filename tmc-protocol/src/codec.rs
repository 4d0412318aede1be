//! [`tokio_util::codec::Decoder`] for definite-length arbitrary blocks,
//! for SCPI transports that are read as an async byte stream (e.g. raw sockets).
use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::block::{BLOCK_TERMINATOR, BinaryBlock, HEADER_LEN, parse_header, parse_length};
use crate::error::{Anomaly, BlockError, BlockPhase};

/// Largest buffer growth requested ahead of payload bytes that have not arrived.
const MAX_RESERVE: usize = 64 * 1024;

/// Frames a stream of consecutive binary blocks.
///
/// A block is only emitted once the byte following its payload is available,
/// so that the terminator can be checked. A byte other than `\n` is left in
/// the buffer as the start of the next frame and reported as an anomaly.
#[derive(Clone, Debug)]
pub struct BlockCodec {
    max_payload_len: usize,
}

impl Default for BlockCodec {
    fn default() -> Self {
        BlockCodec {
            max_payload_len: 1 << 30,
        }
    }
}

/// Where the next frame stands within the buffer.
enum Frame {
    Incomplete { phase: BlockPhase, expected: usize },
    Complete { payload_start: usize, payload_end: usize },
}

impl BlockCodec {
    pub fn new(max_payload_len: usize) -> BlockCodec {
        BlockCodec { max_payload_len }
    }

    fn inspect(&self, src: &BytesMut) -> Result<Frame, BlockError> {
        if src.len() < 2 {
            return Ok(Frame::Incomplete {
                phase: BlockPhase::Header,
                expected: 2,
            });
        }
        let num_digits = parse_header([src[0], src[1]])?;
        let payload_start = 2 + num_digits;
        if src.len() < payload_start {
            return Ok(Frame::Incomplete {
                phase: BlockPhase::Length,
                expected: num_digits,
            });
        }
        let length = parse_length(&src[2..payload_start])?;
        if length > self.max_payload_len {
            return Err(BlockError::TooManyBytes {
                max: self.max_payload_len,
                got: length,
            });
        }
        let payload_end = payload_start + length;
        if src.len() < payload_end {
            return Ok(Frame::Incomplete {
                phase: BlockPhase::Payload,
                expected: length,
            });
        }
        Ok(Frame::Complete {
            payload_start,
            payload_end,
        })
    }

    fn split_block(
        src: &mut BytesMut,
        payload_start: usize,
        payload_end: usize,
        anomaly: Option<Anomaly>,
    ) -> BinaryBlock {
        src.advance(payload_start);
        let payload = src.split_to(payload_end - payload_start);
        if anomaly.is_none() {
            src.advance(1);
        }
        BinaryBlock::with_anomaly(payload.to_vec().into_boxed_slice(), anomaly)
    }
}

impl Decoder for BlockCodec {
    type Item = BinaryBlock;
    type Error = BlockError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BinaryBlock>, BlockError> {
        match self.inspect(src)? {
            Frame::Incomplete { phase, expected } => {
                if phase == BlockPhase::Payload {
                    // Grows with the data; the header alone never decides the allocation.
                    let received = src.len() - HEADER_LEN - (src[1] - b'0') as usize;
                    src.reserve((expected - received).min(MAX_RESERVE));
                }
                Ok(None)
            }
            Frame::Complete {
                payload_start,
                payload_end,
            } => {
                let Some(&next) = src.get(payload_end) else {
                    return Ok(None);
                };
                let anomaly = (next != BLOCK_TERMINATOR)
                    .then_some(Anomaly::MissingTerminator { found: Some(next) });
                if let Some(anomaly) = &anomaly {
                    log::warn!("Framed block: {}", anomaly);
                }
                Ok(Some(Self::split_block(
                    src,
                    payload_start,
                    payload_end,
                    anomaly,
                )))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BinaryBlock>, BlockError> {
        if src.is_empty() {
            return Ok(None);
        }
        if let Some(block) = self.decode(src)? {
            return Ok(Some(block));
        }
        match self.inspect(src)? {
            Frame::Complete {
                payload_start,
                payload_end,
            } => {
                let anomaly = Anomaly::MissingTerminator { found: None };
                log::warn!("Framed block at end of stream: {}", anomaly);
                Ok(Some(Self::split_block(
                    src,
                    payload_start,
                    payload_end,
                    Some(anomaly),
                )))
            }
            Frame::Incomplete { phase, expected } => {
                let got = match phase {
                    BlockPhase::Header => src.len(),
                    BlockPhase::Length => src.len() - 2,
                    _ => src.len() - 2 - (src[1] - b'0') as usize,
                };
                Err(BlockError::ShortRead {
                    phase,
                    expected,
                    got,
                })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn waits_for_terminator() {
        let mut codec = BlockCodec::default();
        let mut buf = BytesMut::from(&b"#15hello"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\n#12ok\n");
        let block = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(block.payload(), b"hello");
        assert!(block.is_terminated());
        let block = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(block.payload(), b"ok");
        assert!(buf.is_empty());
    }

    #[test]
    fn huge_declared_length_does_not_preallocate() {
        let mut codec = BlockCodec::default();
        let mut buf = BytesMut::from(&b"#9999999999"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.capacity() <= 2 * (buf.len() + MAX_RESERVE), "{}", buf.capacity());

        buf.extend_from_slice(&[0u8; 1000]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.capacity() < 1 << 20, "{}", buf.capacity());
    }

    #[test]
    fn foreign_byte_starts_next_frame() {
        let mut codec = BlockCodec::default();
        let mut buf = BytesMut::from(&b"#13abc#13def\n"[..]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload(), b"abc");
        assert_eq!(
            first.anomaly(),
            Some(&Anomaly::MissingTerminator { found: Some(b'#') })
        );
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.payload(), b"def");
        assert!(second.is_terminated());
    }

    #[test]
    fn eof_without_terminator() {
        let mut codec = BlockCodec::default();
        let mut buf = BytesMut::from(&b"#13abc"[..]);
        let block = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(block.payload(), b"abc");
        assert!(!block.is_terminated());
        assert!(buf.is_empty());
    }

    #[test]
    fn eof_inside_payload() {
        let mut codec = BlockCodec::default();
        let mut buf = BytesMut::from(&b"#210abc"[..]);
        match codec.decode_eof(&mut buf) {
            Err(BlockError::ShortRead {
                phase: BlockPhase::Payload,
                expected: 10,
                got: 3,
            }) => {}
            other => panic!("expected ShortRead, got {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_header() {
        let mut codec = BlockCodec::default();
        let mut buf = BytesMut::from(&b"@15hello\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(BlockError::BadHeader(_))
        ));
    }
}
