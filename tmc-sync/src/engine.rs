use std::{
    io::ErrorKind,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use tmc_protocol::{
    Anomaly, BinaryBlock, BlockReader, CommonCommand, EventStatus, Register, StatusByte,
    commands::{parse_register_response, terminated, with_opc_suffix},
    decode_event_status, decode_status_byte, encode_enable_mask,
};

use crate::{
    Transport,
    error::{Error, Result, SyncPhase},
    notify::NotifyCell,
    strategy::{Completion, Strategy},
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Send `*CLS` before arming the status registers for a new operation.
    pub clear_status_before_issue: bool,
    /// Largest accepted text response, also the size of a single read request.
    pub max_response_len: usize,
    /// Largest accepted binary block payload.
    pub max_block_len: usize,
    /// Largest single read while transferring a block payload.
    pub block_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clear_status_before_issue: true,
            max_response_len: 2048,
            max_block_len: 1 << 30,
            block_chunk_size: 1024,
        }
    }
}

/// Builder to create a [SyncEngine] instance and modify configuration options
///
/// # Example
///
/// ```ignore
/// use tmc_sync::engine::Builder;
///
/// let engine = Builder::new()
///     .max_response_len(4096)
///     .block_chunk_size(64 * 1024)
///     .build(device);
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Whether to send `*CLS` before each issued command.
    pub fn clear_status_before_issue(mut self, clear: bool) -> Self {
        self.config.clear_status_before_issue = clear;
        self
    }

    /// Set the largest text response that will be accepted.
    pub fn max_response_len(mut self, len: usize) -> Self {
        self.config.max_response_len = len.max(1);
        self
    }

    /// Set the largest binary block payload that will be accepted.
    pub fn max_block_len(mut self, len: usize) -> Self {
        self.config.max_block_len = len;
        self
    }

    /// Set the read size used while transferring block payloads.
    pub fn block_chunk_size(mut self, size: usize) -> Self {
        self.config.block_chunk_size = size.max(1);
        self
    }

    /// Build and return the engine
    pub fn build<T: Transport>(self, transport: T) -> SyncEngine<T> {
        SyncEngine::new(transport, self.config)
    }
}

/// A command that has been sent and whose completion has not been observed yet.
///
/// Consumed by [`SyncEngine::wait`]. Dropping it abandons the operation; the
/// instrument may still be busy, so clear the device before the next command.
#[derive(Debug)]
#[must_use = "the operation is abandoned unless it is waited for"]
pub struct PendingOperation {
    command: String,
    strategy: Strategy,
    predicate: StatusByte,
    issued: Instant,
    deadline: Option<Instant>,
}

impl PendingOperation {
    fn new(command: &str, completion: Completion, strategy: Strategy) -> PendingOperation {
        let issued = Instant::now();
        PendingOperation {
            command: command.trim_end().to_string(),
            strategy,
            predicate: completion.predicate(),
            issued,
            deadline: strategy.deadline(issued),
        }
    }

    /// The command as sent, without the operation-complete suffix.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// The status byte bits that complete the operation.
    pub fn predicate(&self) -> StatusByte {
        self.predicate
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Issues commands to an instrument and waits for their completion.
#[derive(Debug)]
pub struct SyncEngine<T: Transport> {
    transport: T,
    config: Config,
    notifier: Option<Arc<NotifyCell>>,
}

impl<T: Transport> SyncEngine<T> {
    pub fn new(transport: T, config: Config) -> SyncEngine<T> {
        SyncEngine {
            transport,
            config,
            notifier: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Sends a raw program message.
    pub fn send(&mut self, message: &[u8]) -> Result<()> {
        log::trace!("Sending {:?}", String::from_utf8_lossy(message));
        self.transport
            .write_all(message)
            .and_then(|_| self.transport.flush())
            .map_err(|source| Error::io(SyncPhase::Send, source))
    }

    fn configure(&mut self, command: CommonCommand) -> Result<()> {
        command
            .write_to(&mut self.transport)
            .and_then(|_| self.transport.flush())
            .map_err(|source| Error::io(SyncPhase::Configure, source))
    }

    /// Reads one response message, up to and including its line feed.
    pub fn read_response(&mut self) -> Result<Vec<u8>> {
        let max = self.config.max_response_len;
        let mut buf = vec![0u8; max];
        let mut response = Vec::new();
        loop {
            let n = match self.transport.read(&mut buf) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(source) => return Err(Error::io(SyncPhase::Response, source)),
            };
            response.extend_from_slice(&buf[..n]);
            if n == 0 || response.ends_with(b"\n") {
                break;
            }
            if response.len() >= max {
                return Err(Error::ResponseTooLong { max });
            }
        }
        log::trace!("Response: {:?}", String::from_utf8_lossy(&response));
        Ok(response)
    }

    /// Sends a query and returns its response without the trailing line feed.
    pub fn query(&mut self, command: &str) -> Result<String> {
        self.send(&terminated(command))?;
        let response = self.read_response()?;
        Ok(String::from_utf8_lossy(&response).trim_end().to_string())
    }

    /// `*CLS`
    pub fn clear_status(&mut self) -> Result<()> {
        self.configure(CommonCommand::ClearStatus)
    }

    /// Writes `*SRE` or `*ESE`.
    pub fn set_register(&mut self, register: Register, value: u8) -> Result<()> {
        if !register.is_writable() {
            return Err(Error::ReadOnlyRegister(register));
        }
        log::debug!("Setting {}", register.format(value));
        self.configure(CommonCommand::SetRegister { register, value })
    }

    /// Queries a register through SCPI. Querying the ESR clears it.
    pub fn query_register(&mut self, register: Register) -> Result<u8> {
        self.send(&CommonCommand::QueryRegister(register).to_bytes())?;
        let response = self.read_response()?;
        parse_register_response(&response).map_err(|source| Error::Response { register, source })
    }

    /// Reads and thereby clears the standard event status register.
    ///
    /// The returned set is the only record of the events since the previous clear.
    pub fn read_event_status(&mut self) -> Result<EventStatus> {
        let value = self.query_register(Register::Esr)?;
        log::debug!("{}", Register::Esr.format(value));
        Ok(decode_event_status(value))
    }

    /// Reads the status byte out-of-band.
    pub fn read_status_byte(&mut self) -> Result<StatusByte> {
        let stb = self
            .transport
            .read_status_byte()
            .map_err(|source| Error::io(SyncPhase::Status, source))?;
        log::trace!("{}", Register::Stb.format(stb.bits()));
        Ok(stb)
    }

    /// The status byte delivered with the most recent service request.
    pub fn srq_status_byte(&mut self) -> Result<StatusByte> {
        let stb = self
            .transport
            .srq_status_byte()
            .map_err(|source| Error::io(SyncPhase::Status, source))?;
        log::trace!("SRQ {}", Register::Stb.format(stb.bits()));
        Ok(stb)
    }

    /// Compares the out-of-band status byte with the answer to `*STB?`.
    ///
    /// A mismatch is logged and returned, but is not an error: the two reads
    /// are not atomic and MAV in particular may change between them.
    pub fn check_status_consistency(&mut self) -> Result<Option<Anomaly>> {
        // Out-of-band first, the query itself queues a response and sets MAV.
        let out_of_band = self.read_status_byte()?;
        let queried = decode_status_byte(self.query_register(Register::Stb)?);
        if out_of_band == queried {
            return Ok(None);
        }
        let anomaly = Anomaly::StatusMismatch {
            out_of_band,
            queried,
        };
        log::warn!("{}", anomaly);
        Ok(Some(anomaly))
    }

    /// Compares the two out-of-band status byte requests of the transport.
    ///
    /// Returns `Ok(None)` if they agree or the transport only offers one of them.
    /// Like [`SyncEngine::check_status_consistency`], a mismatch is not an error.
    pub fn check_status_requests(&mut self) -> Result<Option<Anomaly>> {
        let polled = self.read_status_byte()?;
        let control = match self.transport.control_status_byte() {
            Ok(stb) => stb,
            Err(err) if err.kind() == ErrorKind::Unsupported => {
                log::debug!("Skipping control status byte comparison: {}", err);
                return Ok(None);
            }
            Err(source) => return Err(Error::io(SyncPhase::Status, source)),
        };
        if polled == control {
            return Ok(None);
        }
        let anomaly = Anomaly::StatusRequestMismatch { polled, control };
        log::warn!("{}", anomaly);
        Ok(Some(anomaly))
    }

    /// Device clear. Required before reuse after an abandoned or failed operation.
    pub fn clear_device(&mut self) -> Result<()> {
        log::info!("Clearing device");
        self.transport
            .clear()
            .map_err(|source| Error::io(SyncPhase::Clear, source))
    }

    /// Waits for any service request, bounded by `timeout` if given.
    pub fn wait_for_service_request(&mut self, timeout: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        self.transport
            .wait_for_service_request(timeout)
            .map_err(|source| Error::wait(source, start.elapsed()))
    }

    /// The notification cell fired by the transport on service requests.
    /// Subscribes on first use.
    pub fn notifier(&mut self) -> Result<Arc<NotifyCell>> {
        if let Some(cell) = &self.notifier {
            return Ok(Arc::clone(cell));
        }
        let cell = Arc::new(NotifyCell::new());
        self.transport
            .subscribe(Arc::clone(&cell))
            .map_err(|source| Error::io(SyncPhase::Notify, source))?;
        log::debug!("Subscribed to service request notifications");
        self.notifier = Some(Arc::clone(&cell));
        Ok(cell)
    }

    /// Enables the completion condition in ESE and SRE and acknowledges any
    /// pending service request. Must happen before the command is sent, or
    /// the condition may become true before it is enabled.
    pub fn arm(&mut self, completion: Completion, strategy: &Strategy) -> Result<()> {
        if completion.service_request_enable().is_empty() {
            return Err(Error::UnreachableCompletion(completion.predicate()));
        }
        if self.config.clear_status_before_issue {
            self.clear_status()?;
        }
        self.set_register(
            Register::Ese,
            encode_enable_mask(completion.event_status_enable()),
        )?;
        self.set_register(
            Register::Sre,
            encode_enable_mask(completion.service_request_enable()),
        )?;
        let stb = self.read_status_byte()?;
        if stb.intersects(completion.predicate()) {
            log::warn!(
                "Completion bits already set before issuing: {}",
                Register::Stb.format(stb.bits())
            );
        }
        if let Strategy::AsyncNotify { .. } = strategy {
            // An edge delivered before this reset is lost; the waiter re-checks the
            // status byte at its deadline to make such a miss visible.
            self.notifier()?.reset();
        }
        Ok(())
    }

    /// Arms the status registers and sends `command` with the `*OPC` suffix.
    pub fn issue(
        &mut self,
        command: &str,
        completion: Completion,
        strategy: Strategy,
    ) -> Result<PendingOperation> {
        self.arm(completion, &strategy)?;
        log::debug!("Issuing {:?} ({:?})", command.trim_end(), strategy);
        self.send(&with_opc_suffix(command))?;
        Ok(PendingOperation::new(command, completion, strategy))
    }

    /// Like [`SyncEngine::issue`], but sends the message in two writes, the first
    /// one without end-of-message. The instrument must treat both as one message.
    pub fn issue_in_parts(
        &mut self,
        command: &str,
        split_at: usize,
        completion: Completion,
        strategy: Strategy,
    ) -> Result<PendingOperation> {
        self.arm(completion, &strategy)?;
        let message = with_opc_suffix(command);
        let (head, tail) = message.split_at(split_at.min(message.len()));
        log::debug!(
            "Issuing {:?} in parts of {} and {} bytes",
            command.trim_end(),
            head.len(),
            tail.len()
        );
        self.transport
            .set_end_of_message(false)
            .map_err(|source| Error::io(SyncPhase::Settings, source))?;
        let sent = self.send(head);
        // Restored even if the first part failed.
        self.transport
            .set_end_of_message(true)
            .map_err(|source| Error::io(SyncPhase::Settings, source))?;
        sent?;
        self.send(tail)?;
        Ok(PendingOperation::new(command, completion, strategy))
    }

    /// Blocks until `operation` completes or its strategy gives up.
    ///
    /// Returns the status byte observed at completion. A timeout is reported as
    /// [`Error::Timeout`] and never retried.
    pub fn wait(&mut self, operation: PendingOperation) -> Result<StatusByte> {
        let predicate = operation.predicate();
        let result = match (operation.strategy(), operation.deadline()) {
            (
                Strategy::ActivePoll {
                    interval,
                    max_polls,
                },
                _,
            ) => self.poll(predicate, interval, max_polls, operation.issued),
            (Strategy::BlockingWait, _) => self.wait_blocking(predicate),
            (Strategy::TimedWait(_), Some(deadline)) => {
                self.wait_timed(predicate, deadline, operation.issued)
            }
            (Strategy::AsyncNotify { .. }, Some(deadline)) => {
                self.wait_notified(predicate, deadline, operation.issued)
            }
            (Strategy::TimedWait(_) | Strategy::AsyncNotify { .. }, None) => {
                self.wait_blocking(predicate)
            }
        };
        match &result {
            Ok(stb) => log::debug!(
                "{:?} completed after {:?}: {}",
                operation.command(),
                operation.issued.elapsed(),
                Register::Stb.format(stb.bits())
            ),
            Err(err) => log::debug!("{:?} did not complete: {}", operation.command(), err),
        }
        result
    }

    /// Issues `command` and waits for it to complete.
    pub fn issue_and_wait_opc(
        &mut self,
        command: &str,
        completion: Completion,
        strategy: Strategy,
    ) -> Result<StatusByte> {
        let operation = self.issue(command, completion, strategy)?;
        self.wait(operation)
    }

    /// Reads a definite-length arbitrary block from the transport.
    pub fn read_block(&mut self) -> Result<BinaryBlock> {
        let reader = BlockReader::new()
            .max_payload_len(self.config.max_block_len)
            .chunk_size(self.config.block_chunk_size);
        Ok(reader.read_block(&mut self.transport)?)
    }

    /// Sends a query whose response is a binary block, waits until the
    /// response is available and reads it.
    pub fn query_block(&mut self, command: &str, strategy: Strategy) -> Result<BinaryBlock> {
        let operation = self.issue(command, Completion::Message, strategy)?;
        self.wait(operation)?;
        self.read_block()
    }

    fn poll(
        &mut self,
        predicate: StatusByte,
        interval: Duration,
        max_polls: u32,
        issued: Instant,
    ) -> Result<StatusByte> {
        for poll in 1..=max_polls {
            let stb = self.read_status_byte()?;
            if stb.intersects(predicate) {
                log::debug!("Completion seen on poll {}", poll);
                return Ok(stb);
            }
            if poll < max_polls {
                thread::sleep(interval);
            }
        }
        Err(Error::Timeout {
            phase: SyncPhase::Wait,
            waited: issued.elapsed(),
        })
    }

    /// A service request only says that some enabled condition is true, so the
    /// status byte is checked after every wake.
    fn wait_blocking(&mut self, predicate: StatusByte) -> Result<StatusByte> {
        loop {
            self.wait_for_service_request(None)?;
            let stb = self.read_status_byte()?;
            if stb.intersects(predicate) {
                return Ok(stb);
            }
            log::debug!("Service request without completion ({}), waiting again", stb);
        }
    }

    fn wait_timed(
        &mut self,
        predicate: StatusByte,
        deadline: Instant,
        issued: Instant,
    ) -> Result<StatusByte> {
        let mut timeout = deadline.saturating_duration_since(Instant::now());
        loop {
            self.transport
                .wait_for_service_request(Some(timeout))
                .map_err(|source| Error::wait(source, issued.elapsed()))?;
            let stb = self.read_status_byte()?;
            if stb.intersects(predicate) {
                return Ok(stb);
            }
            timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                return Err(Error::Timeout {
                    phase: SyncPhase::Wait,
                    waited: issued.elapsed(),
                });
            }
            log::debug!("Service request without completion ({}), waiting again", stb);
        }
    }

    fn wait_notified(
        &mut self,
        predicate: StatusByte,
        deadline: Instant,
        issued: Instant,
    ) -> Result<StatusByte> {
        let cell = self.notifier()?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let notified = !remaining.is_zero() && cell.wait_timeout(remaining);
            let stb = self.read_status_byte()?;
            if stb.intersects(predicate) {
                if !notified {
                    log::warn!(
                        "Completion observed without a notification, the edge may have fired before arming"
                    );
                }
                return Ok(stb);
            }
            if !notified {
                return Err(Error::Timeout {
                    phase: SyncPhase::Wait,
                    waited: issued.elapsed(),
                });
            }
            log::debug!("Spurious notification ({}), waiting again", stb);
        }
    }
}
