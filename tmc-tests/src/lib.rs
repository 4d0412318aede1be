//! A simulated IEEE-488.2 instrument for testing the synchronization engine
//! without hardware.
//!
//! [`SimulatedInstrument`] implements [`Transport`] on top of a small model of
//! the IEEE-488.2 status reporting: ESR/ESE, SRE, the output queue that drives
//! MAV, `*OPC`, and a latched service request as the usbtmc driver reports it.
//! Program messages other than the status commands are answered from a table
//! of canned responses and can be made to take a configurable [`Latency`].
//!
//! # Example
//!
//! ```
//! use tmc_sync::engine::{Config, SyncEngine};
//! use tmc_sync::strategy::{Completion, Strategy};
//! use tmc_tests::{Latency, SimulatedInstrument};
//!
//! let instrument = SimulatedInstrument::new().latency(Latency::Polls(3));
//! let mut engine = SyncEngine::new(instrument, Config::default());
//! engine
//!     .issue_and_wait_opc("*IDN?", Completion::Event, Strategy::active_poll(3))
//!     .unwrap();
//! assert_eq!(engine.read_response().unwrap(), b"Simulated,TMC-1,0,1.0\n");
//! ```
use std::{
    collections::{HashMap, VecDeque},
    io::{self, ErrorKind, Read, Write},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use tmc_protocol::{Capabilities, EventStatus, StatusByte};
use tmc_sync::{TermChar, Transport, notify::NotifyCell};

/// How long the instrument takes to execute a program message that contains
/// anything other than status commands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Latency {
    /// Executed as soon as the message is complete.
    Immediate,
    /// Executed on the n-th out-of-band status byte read, or when the
    /// controller starts waiting for a service request or reads the response.
    Polls(u32),
    /// Executed once the duration has passed since the message was received.
    Delay(Duration),
    /// Never executed.
    Never,
}

#[derive(Debug)]
struct Pending {
    units: Vec<String>,
    polls_left: u32,
    ready_at: Option<Instant>,
    stalled: bool,
}

/// A scripted instrument implementing [`Transport`].
#[derive(Debug)]
pub struct SimulatedInstrument {
    esr: EventStatus,
    ese: u8,
    sre: u8,
    trg: bool,
    output: VecDeque<Vec<u8>>,
    current: Option<(Vec<u8>, usize)>,
    input: Vec<u8>,
    pending: Option<Pending>,
    latency: Latency,
    responses: HashMap<String, Vec<u8>>,
    requesting: bool,
    srq_latched: bool,
    srq_stb: Option<StatusByte>,
    subscribers: Vec<Arc<NotifyCell>>,
    spurious_requests: u32,
    status_skew: StatusByte,
    control_skew: StatusByte,
    read_chunk: usize,
    term_char: TermChar,
    eom: bool,
    last_read_eom: bool,
    failing_reads: u32,
    timeout: Duration,
    capabilities: Capabilities,
    writes: Vec<(Vec<u8>, bool)>,
    flushes: usize,
    messages: Vec<String>,
    clears: usize,
    status_reads: usize,
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInstrument {
    pub fn new() -> SimulatedInstrument {
        SimulatedInstrument {
            esr: EventStatus::empty(),
            ese: 0,
            sre: 0,
            trg: false,
            output: VecDeque::new(),
            current: None,
            input: Vec::new(),
            pending: None,
            latency: Latency::Immediate,
            responses: HashMap::new(),
            requesting: false,
            srq_latched: false,
            srq_stb: None,
            subscribers: Vec::new(),
            spurious_requests: 0,
            status_skew: StatusByte::empty(),
            control_skew: StatusByte::empty(),
            read_chunk: usize::MAX,
            term_char: TermChar::default(),
            eom: true,
            last_read_eom: false,
            failing_reads: 0,
            timeout: Duration::from_secs(5),
            capabilities: Capabilities::IEEE488_2
                | Capabilities::REN_CONTROL
                | Capabilities::TRIGGER
                | Capabilities::DT1
                | Capabilities::RL1
                | Capabilities::SR1,
            writes: Vec::new(),
            flushes: 0,
            messages: Vec::new(),
            clears: 0,
            status_reads: 0,
        }
        .respond("*IDN?", b"Simulated,TMC-1,0,1.0")
    }

    pub fn latency(mut self, latency: Latency) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_latency(&mut self, latency: Latency) {
        self.latency = latency;
    }

    /// Answer `query` with `response`. The line feed is added by the instrument.
    pub fn respond(mut self, query: &str, response: &[u8]) -> Self {
        self.responses
            .insert(query.trim().to_ascii_uppercase(), response.to_vec());
        self
    }

    /// Answer `query` with `payload` as a definite-length arbitrary block.
    pub fn respond_block(self, query: &str, payload: &[u8]) -> Self {
        let length = payload.len().to_string();
        let mut block = format!("#{}{}", length.len(), length).into_bytes();
        block.extend_from_slice(payload);
        self.respond(query, &block)
    }

    /// Limit the number of bytes a single read returns.
    pub fn read_chunk(mut self, size: usize) -> Self {
        self.read_chunk = size.max(1);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// The next `count` service request waits return without a request.
    pub fn spurious_requests(mut self, count: u32) -> Self {
        self.spurious_requests = count;
        self
    }

    /// Bits flipped in the answer to `*STB?` but not in the out-of-band status byte.
    pub fn status_skew(mut self, skew: StatusByte) -> Self {
        self.status_skew = skew;
        self
    }

    /// Bits flipped in the control channel status byte only.
    pub fn control_status_skew(mut self, skew: StatusByte) -> Self {
        self.control_skew = skew;
        self
    }

    /// The next `count` reads fail with a timeout, like a driver read that got no data.
    pub fn fail_next_reads(&mut self, count: u32) {
        self.failing_reads = count;
    }

    /// Every write with the end-of-message flag it was sent with.
    pub fn writes(&self) -> &[(Vec<u8>, bool)] {
        &self.writes
    }

    /// The complete program messages received, without terminator.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Number of flushes of the write side.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Number of device clears.
    pub fn clears(&self) -> usize {
        self.clears
    }

    /// Number of out-of-band status byte reads.
    pub fn status_reads(&self) -> usize {
        self.status_reads
    }

    pub fn service_request_enable(&self) -> u8 {
        self.sre
    }

    pub fn event_status_enable(&self) -> u8 {
        self.ese
    }

    pub fn status_byte(&self) -> StatusByte {
        let mut stb = StatusByte::empty();
        if self.trg {
            stb |= StatusByte::TRG;
        }
        if self.current.is_some() || !self.output.is_empty() {
            stb |= StatusByte::MAV;
        }
        if self.esr.bits() & self.ese != 0 {
            stb |= StatusByte::ESB;
        }
        if stb.bits() & self.sre & !StatusByte::MSS.bits() != 0 {
            stb |= StatusByte::MSS;
        }
        stb
    }

    /// Latches a service request on the rising edge of MSS.
    fn update_service_request(&mut self) {
        let stb = self.status_byte();
        let requesting = stb.contains(StatusByte::MSS);
        if requesting && !self.requesting {
            log::trace!("Simulated service request: {}", stb);
            self.srq_latched = true;
            self.srq_stb = Some(stb);
            for cell in &self.subscribers {
                cell.fire();
            }
        }
        self.requesting = requesting;
    }

    fn is_status_command(unit: &str) -> bool {
        matches!(
            unit,
            "*CLS" | "*OPC" | "*OPC?" | "*ESE?" | "*SRE?" | "*ESR?" | "*STB?"
        ) || unit.starts_with("*ESE ")
            || unit.starts_with("*SRE ")
    }

    /// A query header ends in `?`; parameters may follow it.
    fn is_query(unit: &str) -> bool {
        unit.split_whitespace()
            .next()
            .is_some_and(|header| header.ends_with('?'))
    }

    fn receive(&mut self, message: &[u8]) {
        let text = String::from_utf8_lossy(message).trim_end().to_string();
        log::trace!("Simulated instrument received {:?}", text);
        self.messages.push(text.clone());
        let units: Vec<String> = text
            .split(';')
            .map(|unit| unit.trim().to_ascii_uppercase())
            .filter(|unit| !unit.is_empty())
            .collect();

        if units.iter().all(|unit| Self::is_status_command(unit)) {
            self.execute(units);
            return;
        }
        match self.latency {
            Latency::Immediate => self.execute(units),
            Latency::Polls(polls) => {
                self.pending = Some(Pending {
                    units,
                    polls_left: polls,
                    ready_at: None,
                    stalled: false,
                })
            }
            Latency::Delay(delay) => {
                self.pending = Some(Pending {
                    units,
                    polls_left: u32::MAX,
                    ready_at: Some(Instant::now() + delay),
                    stalled: false,
                });
                // Stands in for the driver's SIGIO, delivered from another context.
                let cells = self.subscribers.clone();
                if !cells.is_empty() {
                    thread::spawn(move || {
                        thread::sleep(delay);
                        for cell in cells {
                            cell.fire();
                        }
                    });
                }
            }
            Latency::Never => {
                self.pending = Some(Pending {
                    units,
                    polls_left: u32::MAX,
                    ready_at: None,
                    stalled: true,
                })
            }
        }
    }

    fn execute(&mut self, units: Vec<String>) {
        let mut responses: Vec<Vec<u8>> = Vec::new();
        for unit in units {
            match unit.as_str() {
                "*CLS" => {
                    self.esr = EventStatus::empty();
                    self.trg = false;
                }
                "*OPC" => self.esr |= EventStatus::OPC,
                "*OPC?" => responses.push(b"1".to_vec()),
                "*ESE?" => responses.push(self.ese.to_string().into_bytes()),
                "*SRE?" => responses.push(self.sre.to_string().into_bytes()),
                "*ESR?" => {
                    responses.push(self.esr.bits().to_string().into_bytes());
                    self.esr = EventStatus::empty();
                }
                "*STB?" => {
                    let stb = self.status_byte() ^ self.status_skew;
                    responses.push(stb.bits().to_string().into_bytes());
                }
                _ => {
                    if let Some(value) = unit.strip_prefix("*ESE ") {
                        match value.trim().parse() {
                            Ok(value) => self.ese = value,
                            Err(_) => self.esr |= EventStatus::CME,
                        }
                    } else if let Some(value) = unit.strip_prefix("*SRE ") {
                        match value.trim().parse() {
                            Ok(value) => self.sre = value,
                            Err(_) => self.esr |= EventStatus::CME,
                        }
                    } else if Self::is_query(&unit) {
                        match self.responses.get(&unit) {
                            Some(response) => responses.push(response.clone()),
                            None => self.esr |= EventStatus::QYE,
                        }
                    }
                }
            }
        }
        if !responses.is_empty() {
            let mut message = responses.join(&b';');
            message.push(b'\n');
            self.output.push_back(message);
        }
        self.update_service_request();
    }

    fn complete_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.execute(pending.units);
        }
    }

    /// Executes the pending message if its time has come.
    fn advance(&mut self) {
        let ready = match &self.pending {
            Some(Pending {
                ready_at: Some(ready_at),
                ..
            }) => Instant::now() >= *ready_at,
            Some(Pending {
                polls_left: 0,
                stalled: false,
                ..
            }) => true,
            _ => false,
        };
        if ready {
            self.complete_pending();
        }
    }

    /// Runs the pending message to completion as if the controller waited for
    /// it. Returns false when it would never complete.
    fn finish_pending(&mut self, limit: Option<Duration>) -> bool {
        let Some(pending) = &self.pending else {
            return true;
        };
        if pending.stalled {
            return false;
        }
        if let Some(ready_at) = pending.ready_at {
            let wait = ready_at.saturating_duration_since(Instant::now());
            if limit.is_some_and(|limit| limit < wait) {
                return false;
            }
            thread::sleep(wait);
        }
        self.complete_pending();
        true
    }

    fn timed_out(&self, what: &str) -> io::Error {
        io::Error::new(ErrorKind::TimedOut, format!("{} timed out", what))
    }
}

impl Read for SimulatedInstrument {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.advance();
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            self.clear()?;
            return Err(self.timed_out("read"));
        }
        if self.current.is_none() && self.output.is_empty() {
            self.finish_pending(Some(self.timeout));
        }
        if self.current.is_none() {
            self.current = self.output.pop_front().map(|message| (message, 0));
        }
        if self.current.is_none() {
            // The driver clears the device when a read times out.
            self.clear()?;
            return Err(self.timed_out("read"));
        }

        let term_char = self.term_char;
        let chunk = self.read_chunk;
        let Some((message, position)) = self.current.as_mut() else {
            return Ok(0);
        };
        let remaining = &message[*position..];
        let mut n = remaining.len().min(buf.len()).min(chunk);
        if term_char.enabled {
            if let Some(index) = remaining[..n].iter().position(|b| *b == term_char.byte) {
                n = index + 1;
            }
        }
        buf[..n].copy_from_slice(&remaining[..n]);
        *position += n;
        self.last_read_eom = *position == message.len();
        if self.last_read_eom {
            self.current = None;
        }
        self.update_service_request();
        Ok(n)
    }
}

impl Write for SimulatedInstrument {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes.push((buf.to_vec(), self.eom));
        self.input.extend_from_slice(buf);
        if self.eom {
            while let Some(end) = self.input.iter().position(|b| *b == b'\n') {
                let message: Vec<u8> = self.input.drain(..=end).collect();
                self.receive(&message);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

impl Transport for SimulatedInstrument {
    fn clear(&mut self) -> io::Result<()> {
        self.clears += 1;
        self.output.clear();
        self.current = None;
        self.input.clear();
        self.pending = None;
        self.update_service_request();
        Ok(())
    }

    fn timeout(&self) -> io::Result<Duration> {
        Ok(self.timeout)
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn configure_terminator(&mut self, term_char: TermChar) -> io::Result<TermChar> {
        Ok(std::mem::replace(&mut self.term_char, term_char))
    }

    fn read_status_byte(&mut self) -> io::Result<StatusByte> {
        self.status_reads += 1;
        if let Some(pending) = &mut self.pending {
            pending.polls_left = pending.polls_left.saturating_sub(1);
        }
        self.advance();
        self.update_service_request();
        self.srq_latched = false;
        Ok(self.status_byte())
    }

    fn control_status_byte(&mut self) -> io::Result<StatusByte> {
        self.advance();
        Ok(self.status_byte() ^ self.control_skew)
    }

    fn srq_status_byte(&mut self) -> io::Result<StatusByte> {
        self.advance();
        self.srq_latched = false;
        Ok(self.srq_stb.take().unwrap_or_default())
    }

    fn wait_for_service_request(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.advance();
        if self.spurious_requests > 0 {
            self.spurious_requests -= 1;
            return Ok(());
        }
        if !self.srq_latched && self.finish_pending(timeout) {
            self.update_service_request();
        }
        if self.srq_latched {
            return Ok(());
        }
        match timeout {
            Some(timeout) => {
                thread::sleep(timeout);
                Err(self.timed_out("service request wait"))
            }
            None => Err(io::Error::other(
                "no service request pending, the wait would never return",
            )),
        }
    }

    fn capabilities(&self) -> io::Result<Capabilities> {
        Ok(self.capabilities)
    }

    fn set_end_of_message(&mut self, enabled: bool) -> io::Result<()> {
        self.eom = enabled;
        Ok(())
    }

    fn end_of_message(&mut self) -> io::Result<bool> {
        Ok(self.last_read_eom)
    }

    fn trigger(&mut self) -> io::Result<()> {
        if !self.capabilities.contains(Capabilities::TRIGGER) {
            return Err(io::Error::new(
                ErrorKind::Unsupported,
                "instrument does not accept triggers",
            ));
        }
        self.trg = true;
        self.update_service_request();
        Ok(())
    }

    fn subscribe(&mut self, cell: Arc<NotifyCell>) -> io::Result<()> {
        self.subscribers.push(cell);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(instrument: &mut SimulatedInstrument, message: &str) {
        instrument.write_all(message.as_bytes()).unwrap();
    }

    fn read_all(instrument: &mut SimulatedInstrument) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let n = instrument.read(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn combines_responses_of_one_message() {
        let mut instrument = SimulatedInstrument::new();
        send(&mut instrument, "*ESE 1;*ESE?;*SRE?\n");
        assert_eq!(read_all(&mut instrument), b"1;0\n");
    }

    #[test]
    fn esr_query_clears() {
        let mut instrument = SimulatedInstrument::new();
        send(&mut instrument, "*OPC\n*ESR?\n");
        assert_eq!(read_all(&mut instrument), b"1\n");
        send(&mut instrument, "*ESR?\n");
        assert_eq!(read_all(&mut instrument), b"0\n");
    }

    #[test]
    fn latency_in_polls() {
        let mut instrument = SimulatedInstrument::new().latency(Latency::Polls(2));
        send(&mut instrument, "*ESE 1\n*IDN?;*OPC\n");
        assert!(instrument.read_status_byte().unwrap().is_empty());
        let stb = instrument.read_status_byte().unwrap();
        assert!(stb.contains(StatusByte::MAV | StatusByte::ESB));
    }

    #[test]
    fn service_request_latches_until_status_read() {
        let mut instrument = SimulatedInstrument::new();
        send(&mut instrument, "*SRE 16\n*IDN?\n");
        instrument
            .wait_for_service_request(Some(Duration::ZERO))
            .unwrap();
        assert!(instrument.read_status_byte().unwrap().contains(StatusByte::MSS));
        let err = instrument
            .wait_for_service_request(Some(Duration::ZERO))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn query_with_parameters() {
        let mut instrument = SimulatedInstrument::new().respond(":DISP:DATA? PNG, COL", b"#11x");
        send(&mut instrument, ":disp:data? png, col\n");
        assert_eq!(read_all(&mut instrument), b"#11x\n");
    }

    #[test]
    fn unknown_query_sets_query_error() {
        let mut instrument = SimulatedInstrument::new();
        send(&mut instrument, ":NOPE?\n*ESR?\n");
        assert_eq!(read_all(&mut instrument), b"4\n");
    }

    #[test]
    fn read_without_response_clears_device() {
        let mut instrument = SimulatedInstrument::new();
        let mut buf = [0u8; 8];
        let err = instrument.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(instrument.clears(), 1);
    }
}
