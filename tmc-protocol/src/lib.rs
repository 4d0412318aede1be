//! # TMC Protocol Library
//!
//! This crate implements the parts of IEEE-488.2 that a controller needs to
//! synchronize with a SCPI instrument and to retrieve binary data from it,
//! independent of the transport (USBTMC, GPIB, raw sockets).
//!
//! ## Overview
//!
//! - The four status registers (STB, SRE, ESR, ESE) as bit sets with named bits
//! - The common commands used for status handling (`*CLS`, `*ESE`, `*SRE`, `*STB?`, ...)
//! - Decoding of definite-length arbitrary blocks, the framing instruments use
//!   to embed binary payloads (screen dumps, waveforms) in the text protocol
//!
//! ## Basic Usage
//!
//! ### Decoding Status Registers
//!
//! ```
//! use tmc_protocol::{Register, StatusByte, decode_status_byte};
//!
//! let stb = decode_status_byte(0x30);
//! assert!(stb.contains(StatusByte::MAV | StatusByte::ESB));
//! assert_eq!(Register::Stb.format(0x30), "STB = 0x30 [MAV ESB]");
//! ```
//!
//! ### Writing Common Commands
//!
//! ```
//! use tmc_protocol::{CommonCommand, Register};
//!
//! let mut buffer = Vec::new();
//! CommonCommand::SetRegister { register: Register::Ese, value: 1 }
//!     .write_to(&mut buffer)
//!     .expect("Writing to vector shouldn't fail");
//! assert_eq!(buffer, b"*ESE 1\n");
//! ```
//!
//! ### Reading a Binary Block
//!
//! ```
//! use tmc_protocol::BinaryBlock;
//! use std::io::Cursor;
//!
//! let mut reader = Cursor::new(b"#212Hello World!\n".to_vec());
//! let block = BinaryBlock::from_reader(&mut reader).expect("Block should parse");
//! assert_eq!(block.payload(), b"Hello World!");
//! ```
//!
//! ## Block Format
//!
//! `#` + one digit `n` in `1..=9` + `n` decimal digits giving the payload
//! length `L` + exactly `L` payload bytes + `\n`.
//!
//! The declared length is the only trusted boundary. A short read inside a
//! block is a [`error::BlockError`]; a missing trailing line feed is only an
//! [`error::Anomaly`], since some instruments omit it.
//!
//! ## Features
//!
//! - `tokio`: adds [`codec::BlockCodec`], a `tokio_util` decoder for block streams
pub mod block;
pub use block::{BinaryBlock, BlockReader, write_block};
pub mod commands;
pub use commands::CommonCommand;
pub mod error;
pub use error::Anomaly;
pub mod registers;
pub use registers::*;
#[cfg(feature = "tokio")]
pub mod codec;
