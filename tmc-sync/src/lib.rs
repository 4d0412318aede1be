//! # TMC Synchronization Library
//!
//! This crate detects "operation complete" on IEEE-488.2 instruments and
//! retrieves their binary block responses over a USBTMC-like transport.
//!
//! ## Overview
//!
//! A controller that sends a command to an instrument cannot simply read the
//! result: the instrument signals completion through its status registers,
//! which can be observed in several ways. This crate wraps all of them behind
//! one [`engine::SyncEngine`]:
//!
//! - **Active polling** of the status byte
//! - **Blocking wait** for a service request (SRQ)
//! - **Timed wait** for a service request
//! - **Asynchronous notification**, where a notification source wakes the waiter
//!
//! ## Architecture
//!
//! - **[`Transport`] Trait**: the interface a device driver implements
//!   (byte stream plus the USB488 side channel: device clear, status byte,
//!   SRQ wait, termination character)
//! - **[`engine::SyncEngine`]**: arms the status registers, issues commands and
//!   waits for completion according to a [`strategy::Strategy`]
//! - **[`suite`]**: an ordered list of named self-test cases exercising the
//!   transport and every strategy against a real instrument
//!
//! ## Basic Usage
//!
//! ```ignore
//! use tmc_sync::engine::{Config, SyncEngine};
//! use tmc_sync::strategy::{Completion, Strategy};
//!
//! let mut engine = SyncEngine::new(device, Config::default());
//! let stb = engine.issue_and_wait_opc(":DIG CHAN1", Completion::Event, Strategy::BlockingWait)?;
//! let block = engine.query_block(":DISP:DATA? PNG", Strategy::default())?;
//! ```
//!
//! ## Error Handling
//!
//! Timeouts and transport errors are reported through [`error::Error`] and never
//! retried. Conditions that do not prevent the operation from succeeding, such
//! as a block without its trailing line feed, are logged as warnings and
//! returned as [`tmc_protocol::Anomaly`] values where the caller can see them.
//!
//! ## Logging
//!
//! This crate uses the `log` crate: issued commands at `debug`, status bytes
//! and raw responses at `trace`, anomalies at `warn`.
//!
//! ## Thread Model
//!
//! One engine owns one transport and handles one operation at a time. Only the
//! notification source of [`Strategy::AsyncNotify`](strategy::Strategy::AsyncNotify)
//! runs elsewhere, and it only touches a [`notify::NotifyCell`].
pub mod engine;
pub mod error;
pub mod notify;
pub mod strategy;
pub mod suite;

use std::{
    io::{self, ErrorKind, Read, Write},
    sync::Arc,
    time::Duration,
};

use tmc_protocol::{Capabilities, StatusByte};

use crate::notify::NotifyCell;

/// Termination character configuration of a transport.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TermChar {
    /// The byte that ends a read early
    pub byte: u8,
    /// Whether reads end at `byte`
    pub enabled: bool,
}

impl Default for TermChar {
    fn default() -> Self {
        TermChar {
            byte: b'\n',
            enabled: false,
        }
    }
}

pub(crate) fn unsupported(what: &str) -> io::Error {
    io::Error::new(
        ErrorKind::Unsupported,
        format!("{} is not supported by this transport", what),
    )
}

/// Trait that instrument connections must implement.
///
/// Program messages are sent with [`Write`] and responses received with
/// [`Read`]. A single read may return fewer bytes than requested; it never
/// spans two response messages.
///
/// Implementations are expected to issue a device clear when a read fails,
/// before returning the error, so that the instrument does not keep sending
/// the rest of an aborted response.
///
/// See the `tmc-usbtmc` crate for the Linux usbtmc driver implementation.
pub trait Transport: Read + Write {
    /// Aborts all pending input and output on the instrument (device clear).
    fn clear(&mut self) -> io::Result<()>;

    /// The I/O timeout of the connection.
    fn timeout(&self) -> io::Result<Duration>;

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Configures the termination character and returns the previous configuration.
    fn configure_terminator(&mut self, term_char: TermChar) -> io::Result<TermChar>;

    /// Reads the status byte out-of-band, without a SCPI query.
    ///
    /// Unlike `*STB?` this does not queue a response, so MAV is not affected.
    /// Reading it also acknowledges a latched service request.
    fn read_status_byte(&mut self) -> io::Result<StatusByte>;

    /// The status byte that accompanied the most recent service request.
    fn srq_status_byte(&mut self) -> io::Result<StatusByte> {
        self.read_status_byte()
    }

    /// Requests the status byte from the instrument on the control channel,
    /// bypassing any service request state the transport keeps.
    ///
    /// A second out-of-band source to cross-check [`Transport::read_status_byte`].
    fn control_status_byte(&mut self) -> io::Result<StatusByte> {
        Err(unsupported("control status byte request"))
    }

    /// Blocks until the instrument raises a service request.
    ///
    /// With `Some(timeout)`, fails with [`ErrorKind::TimedOut`] when no request
    /// arrives in time. The bound is enforced by the transport itself.
    fn wait_for_service_request(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Static interface capabilities of the instrument.
    fn capabilities(&self) -> io::Result<Capabilities>;

    /// Controls whether the next write ends the program message.
    fn set_end_of_message(&mut self, _enabled: bool) -> io::Result<()> {
        Err(unsupported("end-of-message control"))
    }

    /// Whether the last read completed a response message.
    fn end_of_message(&mut self) -> io::Result<bool> {
        Err(unsupported("end-of-message status"))
    }

    /// Sends a group execute trigger.
    fn trigger(&mut self) -> io::Result<()> {
        Err(unsupported("trigger"))
    }

    /// Registers `cell` to be fired whenever a service request is raised.
    ///
    /// The cell is fired from another context, which must not perform any I/O
    /// on this transport.
    fn subscribe(&mut self, _cell: Arc<NotifyCell>) -> io::Result<()> {
        Err(unsupported("asynchronous notification"))
    }
}
