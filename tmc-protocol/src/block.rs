/// Reading and writing of IEEE-488.2 definite-length arbitrary blocks
use std::io::{self, ErrorKind, Read, Write};

use crate::error::{Anomaly, BlockError, BlockPhase};

/// First byte of every arbitrary block.
pub const BLOCK_MARKER: u8 = b'#';
/// Byte expected right after the payload.
pub const BLOCK_TERMINATOR: u8 = b'\n';

pub(crate) const HEADER_LEN: usize = 2;
const MAX_LENGTH_DIGITS: usize = 9;

/// A fully retrieved definite-length arbitrary block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BinaryBlock {
    payload: Box<[u8]>,
    anomaly: Option<Anomaly>,
}

impl BinaryBlock {
    pub(crate) fn with_anomaly(payload: Box<[u8]>, anomaly: Option<Anomaly>) -> BinaryBlock {
        BinaryBlock { payload, anomaly }
    }

    /// The payload; its length always equals the declared length.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Box<[u8]> {
        self.payload
    }

    /// The anomaly noticed while reading the block, if any.
    pub fn anomaly(&self) -> Option<&Anomaly> {
        self.anomaly.as_ref()
    }

    /// Whether the payload was followed by the line feed terminator.
    pub fn is_terminated(&self) -> bool {
        self.anomaly.is_none()
    }

    /// Reads a block with the default [`BlockReader`] settings.
    pub fn from_reader(reader: &mut impl Read) -> Result<BinaryBlock, BlockError> {
        BlockReader::default().read_block(reader)
    }
}

/// Writes `payload` framed as a definite-length arbitrary block including the terminator.
pub fn write_block(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let length = payload.len().to_string();
    if length.len() > MAX_LENGTH_DIGITS {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("payload of {} bytes does not fit a block header", payload.len()),
        ));
    }
    write!(writer, "#{}{}", length.len(), length)?;
    writer.write_all(payload)?;
    writer.write_all(&[BLOCK_TERMINATOR])
}

/// Validates the two header bytes and returns the number of length digits.
pub(crate) fn parse_header(header: [u8; HEADER_LEN]) -> Result<usize, BlockError> {
    if header[0] != BLOCK_MARKER {
        return Err(BlockError::BadHeader(format!(
            "expected '#', got 0x{:02x}",
            header[0]
        )));
    }
    match header[1] {
        b'1'..=b'9' => Ok((header[1] - b'0') as usize),
        b'0' => Err(BlockError::BadHeader(
            "indefinite-length blocks are not supported".to_string(),
        )),
        other => Err(BlockError::BadHeader(format!(
            "expected length digit, got 0x{:02x}",
            other
        ))),
    }
}

/// Parses the decimal length field. No sign is allowed.
pub(crate) fn parse_length(digits: &[u8]) -> Result<usize, BlockError> {
    digits.iter().try_fold(0usize, |length, digit| {
        if !digit.is_ascii_digit() {
            return Err(BlockError::BadLength(format!(
                "non-digit 0x{:02x} in length field",
                digit
            )));
        }
        length
            .checked_mul(10)
            .and_then(|l| l.checked_add((digit - b'0') as usize))
            .ok_or_else(|| BlockError::BadLength("length overflows usize".to_string()))
    })
}

/// Reads definite-length arbitrary blocks from a byte stream.
///
/// The declared length is the only trusted boundary: a read returning no data
/// before the payload is complete is an error, never the end of the block.
///
/// ```
/// use tmc_protocol::BlockReader;
/// use std::io::Cursor;
///
/// let mut reader = Cursor::new(b"#15hello\n".to_vec());
/// let block = BlockReader::new().read_block(&mut reader).expect("block should decode");
/// assert_eq!(block.payload(), b"hello");
/// assert!(block.is_terminated());
/// ```
#[derive(Clone, Debug)]
pub struct BlockReader {
    max_payload_len: usize,
    chunk_size: usize,
}

impl Default for BlockReader {
    fn default() -> Self {
        BlockReader {
            max_payload_len: 1 << 30, // 1 GiB
            chunk_size: 4096,
        }
    }
}

impl BlockReader {
    pub fn new() -> BlockReader {
        BlockReader::default()
    }

    /// Set the largest payload that will be accepted.
    pub fn max_payload_len(mut self, max: usize) -> Self {
        self.max_payload_len = max;
        self
    }

    /// Set the largest single read requested from the underlying stream.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn read_block(&self, reader: &mut impl Read) -> Result<BinaryBlock, BlockError> {
        let mut header = [0u8; HEADER_LEN];
        read_full(reader, &mut header, BlockPhase::Header)?;
        let num_digits = parse_header(header)?;

        let mut digits = [0u8; MAX_LENGTH_DIGITS];
        read_full(reader, &mut digits[..num_digits], BlockPhase::Length)?;
        let length = parse_length(&digits[..num_digits])?;
        if length > self.max_payload_len {
            return Err(BlockError::TooManyBytes {
                max: self.max_payload_len,
                got: length,
            });
        }
        log::debug!("Reading block payload of {} bytes", length);

        let payload = self.read_payload(reader, length)?;
        let anomaly = read_terminator(reader)?;
        if let Some(anomaly) = &anomaly {
            log::warn!("Block of {} bytes: {}", length, anomaly);
        }
        Ok(BinaryBlock::with_anomaly(payload, anomaly))
    }

    fn read_payload(&self, reader: &mut impl Read, length: usize) -> Result<Box<[u8]>, BlockError> {
        // Grow with the data instead of trusting the header for the allocation.
        let mut payload = Vec::with_capacity(length.min(self.chunk_size.saturating_mul(16)));
        while payload.len() < length {
            let filled = payload.len();
            let want = (length - filled).min(self.chunk_size);
            payload.resize(filled + want, 0);
            match reader.read(&mut payload[filled..]) {
                Ok(0) => {
                    return Err(BlockError::ShortRead {
                        phase: BlockPhase::Payload,
                        expected: length,
                        got: filled,
                    });
                }
                Ok(n) => {
                    log::trace!("Block payload chunk of {} bytes", n);
                    payload.truncate(filled + n);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => payload.truncate(filled),
                Err(source) => {
                    return Err(BlockError::Io {
                        phase: BlockPhase::Payload,
                        source,
                    });
                }
            }
        }
        Ok(payload.into_boxed_slice())
    }
}

/// Fills `buf` completely, one underlying read at a time.
fn read_full(reader: &mut impl Read, buf: &mut [u8], phase: BlockPhase) -> Result<(), BlockError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(BlockError::ShortRead {
                    phase,
                    expected: buf.len(),
                    got: filled,
                });
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(source) => return Err(BlockError::Io { phase, source }),
        }
    }
    Ok(())
}

/// Some instruments omit the line feed. A missing terminator, including one the
/// transport gave up waiting for, is an anomaly rather than an error.
fn read_terminator(reader: &mut impl Read) -> Result<Option<Anomaly>, BlockError> {
    let mut byte = [0u8; 1];
    let result = loop {
        match reader.read(&mut byte) {
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            result => break result,
        }
    };
    match result {
        Ok(0) => Ok(Some(Anomaly::MissingTerminator { found: None })),
        Ok(_) if byte[0] == BLOCK_TERMINATOR => Ok(None),
        Ok(_) => Ok(Some(Anomaly::MissingTerminator {
            found: Some(byte[0]),
        })),
        Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
            Ok(Some(Anomaly::MissingTerminator { found: None }))
        }
        Err(source) => Err(BlockError::Io {
            phase: BlockPhase::Terminator,
            source,
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    /// Hands out at most `chunk` bytes per read, like a transport returning short transfers.
    struct ChunkedReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl ChunkedReader {
        fn new(data: Vec<u8>, chunk: usize) -> ChunkedReader {
            ChunkedReader {
                data,
                pos: 0,
                chunk,
            }
        }
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_block(&mut out, payload).unwrap();
        out
    }

    fn payload_of(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn write_small_block() {
        assert_eq!(framed(b"hello"), b"#15hello\n");
        assert_eq!(framed(b""), b"#10\n");
        assert_eq!(framed(&[0u8; 255])[..5], *b"#3255");
    }

    #[test]
    fn decode_representative_lengths() {
        for len in [0, 1, 255, 4096, 999_999] {
            let payload = payload_of(len);
            let mut cursor = Cursor::new(framed(&payload));
            let block = BinaryBlock::from_reader(&mut cursor).unwrap();
            assert_eq!(block.payload(), &payload[..], "length {}", len);
            assert!(block.is_terminated());
            assert_eq!(cursor.position() as usize, cursor.get_ref().len());
        }
    }

    #[test]
    fn decode_is_independent_of_chunking() {
        let payload = payload_of(5000);
        for chunk in [1, 7, 1024] {
            let mut reader = ChunkedReader::new(framed(&payload), chunk);
            let block = BlockReader::new().read_block(&mut reader).unwrap();
            assert_eq!(block.payload(), &payload[..], "chunk size {}", chunk);
            assert!(block.is_terminated());
        }
    }

    #[test]
    fn truncated_payload_is_short_read() {
        let mut data = framed(&payload_of(100));
        data.truncate(2 + 3 + 60);
        let mut reader = ChunkedReader::new(data, 7);
        match BlockReader::new().read_block(&mut reader) {
            Err(BlockError::ShortRead {
                phase: BlockPhase::Payload,
                expected: 100,
                got: 60,
            }) => {}
            other => panic!("expected ShortRead, got {:?}", other),
        }
    }

    #[test]
    fn truncated_length_is_short_read() {
        let mut cursor = Cursor::new(b"#41".to_vec());
        let err = BinaryBlock::from_reader(&mut cursor).unwrap_err();
        assert_eq!(err.phase(), Some(BlockPhase::Length));
        assert!(matches!(err, BlockError::ShortRead { got: 1, .. }));
    }

    #[test]
    fn missing_terminator_is_anomaly() {
        let mut cursor = Cursor::new(b"#15hello".to_vec());
        let block = BinaryBlock::from_reader(&mut cursor).unwrap();
        assert_eq!(block.payload(), b"hello");
        assert_eq!(
            block.anomaly(),
            Some(&Anomaly::MissingTerminator { found: None })
        );
    }

    #[test]
    fn wrong_terminator_is_anomaly() {
        let mut cursor = Cursor::new(b"#15hello;".to_vec());
        let block = BinaryBlock::from_reader(&mut cursor).unwrap();
        assert_eq!(block.payload(), b"hello");
        assert_eq!(
            block.anomaly(),
            Some(&Anomaly::MissingTerminator { found: Some(b';') })
        );
    }

    #[test]
    fn timed_out_terminator_is_anomaly() {
        struct TimesOut(Cursor<Vec<u8>>);
        impl Read for TimesOut {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                match self.0.read(buf)? {
                    0 => Err(io::Error::new(ErrorKind::TimedOut, "no data")),
                    n => Ok(n),
                }
            }
        }
        let mut reader = TimesOut(Cursor::new(b"#13abc".to_vec()));
        let block = BlockReader::new().read_block(&mut reader).unwrap();
        assert_eq!(block.payload(), b"abc");
        assert!(!block.is_terminated());
    }

    #[test]
    fn bad_marker() {
        let mut cursor = Cursor::new(b"X15hello\n".to_vec());
        match BinaryBlock::from_reader(&mut cursor) {
            Err(BlockError::BadHeader(_)) => {}
            other => panic!("expected BadHeader, got {:?}", other),
        }
    }

    #[test]
    fn bad_length_digit_count() {
        for data in [&b"#05hello\n"[..], b"#a5hello\n"] {
            let mut cursor = Cursor::new(data.to_vec());
            let err = BinaryBlock::from_reader(&mut cursor).unwrap_err();
            assert!(matches!(err, BlockError::BadHeader(_)), "{:?}", err);
        }
    }

    #[test]
    fn bad_length_field() {
        for data in [&b"#2+5hello\n"[..], b"#2 5hello\n", b"#3-10\n"] {
            let mut cursor = Cursor::new(data.to_vec());
            let err = BinaryBlock::from_reader(&mut cursor).unwrap_err();
            assert!(matches!(err, BlockError::BadLength(_)), "{:?}", err);
        }
    }

    #[test]
    fn length_overflow() {
        assert!(matches!(
            parse_length(b"99999999999999999999999"),
            Err(BlockError::BadLength(_))
        ));
        assert_eq!(parse_length(b"000000042").unwrap(), 42);
    }

    #[test]
    fn too_many_bytes() {
        let mut cursor = Cursor::new(framed(&payload_of(2048)));
        match BlockReader::new().max_payload_len(1024).read_block(&mut cursor) {
            Err(BlockError::TooManyBytes { max, got }) => {
                assert_eq!(max, 1024);
                assert_eq!(got, 2048);
            }
            other => panic!("expected TooManyBytes, got {:?}", other),
        }
    }

    #[test]
    fn unbounded_chunk_size() {
        let mut cursor = Cursor::new(b"#15hello\n".to_vec());
        let block = BlockReader::new()
            .chunk_size(usize::MAX)
            .read_block(&mut cursor)
            .unwrap();
        assert_eq!(block.payload(), b"hello");
        assert!(block.is_terminated());
    }

    #[test]
    fn io_error_names_phase() {
        struct Fails;
        impl Read for Fails {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(ErrorKind::BrokenPipe, "unplugged"))
            }
        }
        match BinaryBlock::from_reader(&mut Fails) {
            Err(BlockError::Io {
                phase: BlockPhase::Header,
                source,
            }) => assert_eq!(source.kind(), ErrorKind::BrokenPipe),
            other => panic!("expected Io, got {:?}", other),
        }
    }

    #[test]
    fn consecutive_blocks_share_stream() {
        let mut data = framed(b"first");
        data.extend(framed(b"second"));
        let mut reader = ChunkedReader::new(data, 3);
        let reader_cfg = BlockReader::new();
        assert_eq!(reader_cfg.read_block(&mut reader).unwrap().payload(), b"first");
        assert_eq!(reader_cfg.read_block(&mut reader).unwrap().payload(), b"second");
    }
}
