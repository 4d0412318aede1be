use std::{fmt::Display, io, num::ParseIntError, str::Utf8Error};

use crate::registers::StatusByte;

/// The part of a definite-length arbitrary block being read when an error occurred.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BlockPhase {
    /// `#` followed by the length-of-length digit
    Header,
    /// The decimal payload length
    Length,
    /// The payload itself
    Payload,
    /// The trailing line feed
    Terminator,
}

impl Display for BlockPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BlockPhase::Header => "header",
            BlockPhase::Length => "length",
            BlockPhase::Payload => "payload",
            BlockPhase::Terminator => "terminator",
        };
        f.write_str(name)
    }
}

/// Errors that may occur when reading a binary block from a stream.
///
/// All of them are fatal to the current block. The connection should be
/// cleared before it is used again, since the remaining bytes of the block are
/// still in flight.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("bad header: {0}")]
    BadHeader(String),
    #[error("bad length: {0}")]
    BadLength(String),
    #[error("short read in {phase}: got {got} of {expected} bytes")]
    ShortRead {
        phase: BlockPhase,
        expected: usize,
        got: usize,
    },
    #[error("block too large! Maximum is {max}, but got {got}")]
    TooManyBytes { max: usize, got: usize },
    #[error("I/O error while reading block {phase}: {source}")]
    Io {
        phase: BlockPhase,
        #[source]
        source: io::Error,
    },
    /// Error of an underlying framed stream, outside of any block.
    #[error("stream error: {0}")]
    Stream(#[from] io::Error),
}

impl BlockError {
    /// The phase in which decoding failed, if the error belongs to one.
    pub fn phase(&self) -> Option<BlockPhase> {
        match self {
            BlockError::BadHeader(_) => Some(BlockPhase::Header),
            BlockError::BadLength(_) | BlockError::TooManyBytes { .. } => {
                Some(BlockPhase::Length)
            }
            BlockError::ShortRead { phase, .. } | BlockError::Io { phase, .. } => Some(*phase),
            BlockError::Stream(_) => None,
        }
    }
}

/// Errors that may occur when parsing the response to a register query.
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("empty response")]
    Empty,
    #[error("invalid UTF8: {0}")]
    InvalidUtf8(#[from] Utf8Error),
    #[error("invalid integer: {0}")]
    InvalidInteger(#[from] ParseIntError),
    #[error("register value {0} out of range")]
    OutOfRange(u16),
}

/// A condition worth reporting that does not abort the operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Anomaly {
    /// The byte after a block payload was not `\n`.
    /// `found` is the byte read instead, if any.
    MissingTerminator { found: Option<u8> },
    /// The out-of-band status byte and the `*STB?` answer differ.
    /// The two reads are not atomic, so MAV in particular may legitimately differ.
    StatusMismatch {
        out_of_band: StatusByte,
        queried: StatusByte,
    },
    /// The two out-of-band status byte requests differ: the one that also
    /// reports latched service requests (`polled`) and the plain control request.
    StatusRequestMismatch {
        polled: StatusByte,
        control: StatusByte,
    },
}

impl Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::MissingTerminator { found: None } => {
                write!(f, "missing trailing terminator")
            }
            Anomaly::MissingTerminator { found: Some(byte) } => {
                write!(f, "missing trailing terminator, found 0x{:02x}", byte)
            }
            Anomaly::StatusMismatch {
                out_of_band,
                queried,
            } => write!(
                f,
                "status byte mismatch: out-of-band 0x{:02x} [{}], *STB? 0x{:02x} [{}]",
                out_of_band.bits(),
                out_of_band,
                queried.bits(),
                queried
            ),
            Anomaly::StatusRequestMismatch { polled, control } => write!(
                f,
                "status byte requests differ: polled 0x{:02x} [{}], control 0x{:02x} [{}]",
                polled.bits(),
                polled,
                control.bits(),
                control
            ),
        }
    }
}
