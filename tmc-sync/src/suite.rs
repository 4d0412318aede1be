//! Self-test of a transport and instrument.
//!
//! The suite is an ordered list of named cases that share one connection.
//! Every case leaves the instrument in a usable state; after a case fails the
//! suite clears the device before running the next one.
use std::{
    fmt::{self, Display},
    io::{ErrorKind, Read},
    time::{Duration, Instant},
};

use tmc_protocol::{
    Capabilities, EventStatus, Register, ServiceRequestEnable, StatusByte, commands::terminated,
};

use crate::{
    TermChar, Transport,
    engine::SyncEngine,
    error::{Error, Result, SyncPhase},
    strategy::{Completion, DEFAULT_NOTIFY_TIMEOUT, Strategy},
};

/// Result of a single case.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    Passed,
    Failed,
    /// The transport or instrument lacks a feature the case needs.
    Skipped,
}

impl Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct CaseResult {
    pub case: TestCase,
    pub outcome: Outcome,
    pub detail: String,
    pub elapsed: Duration,
}

impl Display for CaseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<22} {:<8} {:>9.3}s  {}",
            self.case.name(),
            self.outcome,
            self.elapsed.as_secs_f64(),
            self.detail
        )
    }
}

/// The aggregated results of a suite run, in execution order.
#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub results: Vec<CaseResult>,
}

impl SuiteReport {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.results
            .iter()
            .filter(|result| result.outcome == outcome)
            .count()
    }

    /// Whether no case failed. Skipped cases do not count as failures.
    pub fn is_success(&self) -> bool {
        self.count(Outcome::Failed) == 0
    }

    pub fn get(&self, case: TestCase) -> Option<&CaseResult> {
        self.results.iter().find(|result| result.case == case)
    }
}

impl Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.results {
            writeln!(f, "{}", result)?;
        }
        write!(
            f,
            "{} passed, {} failed, {} skipped",
            self.count(Outcome::Passed),
            self.count(Outcome::Failed),
            self.count(Outcome::Skipped)
        )
    }
}

/// Instrument specific settings of the suite.
///
/// The SCPI strings default to `*IDN?`, which every IEEE-488.2 instrument
/// understands. Point them at slower operations to exercise the waits properly.
#[derive(Debug, Clone)]
pub struct SuiteConfig {
    /// A query answered quickly, used by the service request cases.
    pub query: String,
    /// A query whose completion the strategy cases wait for.
    pub operation: String,
    /// Number of round trips in the `srq-loop` case, per status byte source.
    pub srq_iterations: u32,
    /// Duration of the bounded service request wait that must time out.
    pub timeout_probe: Duration,
    /// I/O timeout set and read back by the `timeout` case.
    pub io_timeout: Duration,
    /// Termination character used by the `term-char` case.
    pub term_char: u8,
    /// Read size of the `end-of-message-input` case.
    pub input_chunk: usize,
    /// Deadline of the `async-notify` case.
    pub notify_timeout: Duration,
    /// Program message that makes the instrument wait for a bus trigger.
    /// The `trigger` case is skipped without it.
    pub trigger_setup: Option<String>,
    /// Program message sent after the `trigger` case.
    pub trigger_restore: Option<String>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            query: "*IDN?".to_string(),
            operation: "*IDN?".to_string(),
            srq_iterations: 100,
            timeout_probe: Duration::from_secs(1),
            io_timeout: Duration::from_secs(5),
            term_char: b';',
            input_chunk: 4,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            trigger_setup: None,
            trigger_restore: None,
        }
    }
}

/// The cases of the suite, in execution order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TestCase {
    Timeout,
    Capabilities,
    StatusByte,
    WaitForSrq,
    SrqLoop,
    EndOfMessage,
    EndOfMessageInput,
    TermChar,
    BlockingWait,
    AsyncNotify,
    Trigger,
}

impl TestCase {
    pub const ALL: [TestCase; 11] = [
        TestCase::Timeout,
        TestCase::Capabilities,
        TestCase::StatusByte,
        TestCase::WaitForSrq,
        TestCase::SrqLoop,
        TestCase::EndOfMessage,
        TestCase::EndOfMessageInput,
        TestCase::TermChar,
        TestCase::BlockingWait,
        TestCase::AsyncNotify,
        TestCase::Trigger,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TestCase::Timeout => "timeout",
            TestCase::Capabilities => "capabilities",
            TestCase::StatusByte => "status-byte",
            TestCase::WaitForSrq => "wait-for-srq",
            TestCase::SrqLoop => "srq-loop",
            TestCase::EndOfMessage => "end-of-message",
            TestCase::EndOfMessageInput => "end-of-message-input",
            TestCase::TermChar => "term-char",
            TestCase::BlockingWait => "blocking-wait",
            TestCase::AsyncNotify => "async-notify",
            TestCase::Trigger => "trigger",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            TestCase::Timeout => "set and read back the I/O timeout",
            TestCase::Capabilities => "read the USB488 capabilities",
            TestCase::StatusByte => "compare the three status byte sources, then poll for completion",
            TestCase::WaitForSrq => "bounded and unbounded service request waits",
            TestCase::SrqLoop => "repeated query round trips driven by service requests",
            TestCase::EndOfMessage => "send one message in two writes",
            TestCase::EndOfMessageInput => "read a response in small chunks until end of message",
            TestCase::TermChar => "split a response at a termination character",
            TestCase::BlockingWait => "wait for completion with a blocking service request wait",
            TestCase::AsyncNotify => "wait for completion with asynchronous notification",
            TestCase::Trigger => "group execute trigger raises a trigger service request",
        }
    }

    pub fn from_name(name: &str) -> Option<TestCase> {
        TestCase::ALL.into_iter().find(|case| case.name() == name)
    }

    fn run<T: Transport>(
        self,
        engine: &mut SyncEngine<T>,
        config: &SuiteConfig,
    ) -> Result<Verdict> {
        match self {
            TestCase::Timeout => timeout(engine, config),
            TestCase::Capabilities => capabilities(engine),
            TestCase::StatusByte => status_byte(engine, config),
            TestCase::WaitForSrq => wait_for_srq(engine, config),
            TestCase::SrqLoop => srq_loop(engine, config),
            TestCase::EndOfMessage => end_of_message(engine, config),
            TestCase::EndOfMessageInput => end_of_message_input(engine, config),
            TestCase::TermChar => term_char(engine, config),
            TestCase::BlockingWait => {
                complete_operation(engine, &config.operation, Strategy::BlockingWait)
            }
            TestCase::AsyncNotify => complete_operation(
                engine,
                &config.operation,
                Strategy::AsyncNotify {
                    timeout: config.notify_timeout,
                },
            ),
            TestCase::Trigger => trigger(engine, config),
        }
    }
}

impl Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct Verdict {
    outcome: Outcome,
    detail: String,
}

impl Verdict {
    fn passed(detail: impl Into<String>) -> Verdict {
        Verdict {
            outcome: Outcome::Passed,
            detail: detail.into(),
        }
    }

    fn failed(detail: impl Into<String>) -> Verdict {
        Verdict {
            outcome: Outcome::Failed,
            detail: detail.into(),
        }
    }

    fn skipped(detail: impl Into<String>) -> Verdict {
        Verdict {
            outcome: Outcome::Skipped,
            detail: detail.into(),
        }
    }
}

/// Runs the cases in `selection`, or all cases when it is empty, in suite order.
pub fn run<T: Transport>(
    engine: &mut SyncEngine<T>,
    config: &SuiteConfig,
    selection: &[TestCase],
) -> SuiteReport {
    let mut report = SuiteReport::default();
    for case in TestCase::ALL {
        if !selection.is_empty() && !selection.contains(&case) {
            continue;
        }
        log::info!("Running {}: {}", case, case.description());
        let start = Instant::now();
        let (verdict, interrupted) = match case.run(engine, config) {
            Ok(verdict) => (verdict, false),
            Err(err) if err.is_unsupported() => (Verdict::skipped(err.to_string()), true),
            Err(err) => (Verdict::failed(err.to_string()), true),
        };
        let result = CaseResult {
            case,
            outcome: verdict.outcome,
            detail: verdict.detail,
            elapsed: start.elapsed(),
        };
        match result.outcome {
            Outcome::Passed => log::info!("{}", result),
            Outcome::Skipped => log::warn!("{}", result),
            Outcome::Failed => log::error!("{}", result),
        }
        // A case that stopped half way may have left a response queued.
        if interrupted || result.outcome == Outcome::Failed {
            if let Err(err) = engine.clear_device() {
                log::error!("Device clear after {} failed: {}", case, err);
            }
        }
        report.results.push(result);
    }
    report
}

fn summary(response: &[u8]) -> String {
    String::from_utf8_lossy(response).trim_end().to_string()
}

fn timeout<T: Transport>(engine: &mut SyncEngine<T>, config: &SuiteConfig) -> Result<Verdict> {
    let settings = |source| Error::io(SyncPhase::Settings, source);
    let transport = engine.transport_mut();
    let previous = transport.timeout().map_err(settings)?;
    transport.set_timeout(config.io_timeout).map_err(settings)?;
    let current = transport.timeout().map_err(settings)?;
    if current != config.io_timeout {
        return Ok(Verdict::failed(format!(
            "set {:?}, read back {:?}",
            config.io_timeout, current
        )));
    }
    Ok(Verdict::passed(format!("{:?} -> {:?}", previous, current)))
}

fn capabilities<T: Transport>(engine: &mut SyncEngine<T>) -> Result<Verdict> {
    let caps: Capabilities = engine
        .transport()
        .capabilities()
        .map_err(|source| Error::io(SyncPhase::Settings, source))?;
    for (name, present) in caps.report() {
        log::info!("{:<14}: {}", name, if present { "yes" } else { "no" });
    }
    let present: Vec<&str> = caps
        .report()
        .filter(|(_, present)| *present)
        .map(|(name, _)| name)
        .collect();
    Ok(Verdict::passed(format!(
        "0x{:02x} [{}]",
        caps.bits(),
        present.join(" ")
    )))
}

fn status_byte<T: Transport>(
    engine: &mut SyncEngine<T>,
    config: &SuiteConfig,
) -> Result<Verdict> {
    engine.clear_status()?;
    engine.set_register(Register::Ese, EventStatus::OPC.bits())?;
    engine.set_register(Register::Sre, 0)?;
    let anomalies = [
        engine.check_status_consistency()?,
        engine.check_status_requests()?,
    ];
    let stb = engine.issue_and_wait_opc(&config.operation, Completion::Event, Strategy::default())?;
    let response = engine.read_response()?;
    let mut detail = format!("{} returned {:?} ({})", config.operation, summary(&response), stb);
    for anomaly in anomalies.into_iter().flatten() {
        detail.push_str(&format!(", {}", anomaly));
    }
    Ok(Verdict::passed(detail))
}

/// Sets up service requests on MAV and acknowledges any stale request.
fn arm_message_available<T: Transport>(engine: &mut SyncEngine<T>) -> Result<()> {
    engine.set_register(Register::Sre, ServiceRequestEnable::MAV.bits())?;
    engine.clear_status()?;
    engine.read_status_byte()?;
    Ok(())
}

fn wait_for_srq<T: Transport>(
    engine: &mut SyncEngine<T>,
    config: &SuiteConfig,
) -> Result<Verdict> {
    arm_message_available(engine)?;

    match engine.wait_for_service_request(Some(Duration::ZERO)) {
        Err(err) if err.is_timeout() => {}
        Err(err) => return Err(err),
        Ok(()) => return Ok(Verdict::failed("zero timeout wait did not time out")),
    }

    let start = Instant::now();
    match engine.wait_for_service_request(Some(config.timeout_probe)) {
        Err(err) if err.is_timeout() => {}
        Err(err) => return Err(err),
        Ok(()) => return Ok(Verdict::failed("wait without a pending request succeeded")),
    }
    let waited = start.elapsed();
    let tolerance = config.timeout_probe / 10;
    if waited + tolerance < config.timeout_probe || waited > config.timeout_probe + tolerance {
        return Ok(Verdict::failed(format!(
            "expected a timeout after {:?}, got {:?}",
            config.timeout_probe, waited
        )));
    }

    for bound in [Some(Duration::from_millis(500)), None] {
        engine.send(&terminated(&config.query))?;
        engine.wait_for_service_request(bound)?;
        let stb = engine.srq_status_byte()?;
        if !stb.contains(StatusByte::MAV) {
            return Ok(Verdict::failed(format!(
                "service request without MAV after {} ({:?} wait)",
                config.query, bound
            )));
        }
        engine.read_response()?;
    }
    Ok(Verdict::passed(format!("timed out after {:?}", waited)))
}

fn srq_loop<T: Transport>(engine: &mut SyncEngine<T>, config: &SuiteConfig) -> Result<Verdict> {
    arm_message_available(engine)?;
    let mut timings = Vec::new();
    for from_request in [false, true] {
        let start = Instant::now();
        for iteration in 1..=config.srq_iterations {
            engine.send(&terminated(&config.query))?;
            engine.wait_for_service_request(None)?;
            let stb = if from_request {
                engine.srq_status_byte()?
            } else {
                engine.read_status_byte()?
            };
            if !stb.contains(StatusByte::MAV) {
                return Ok(Verdict::failed(format!(
                    "iteration {}: service request without MAV ({})",
                    iteration, stb
                )));
            }
            engine.read_response()?;
        }
        timings.push(start.elapsed());
    }
    Ok(Verdict::passed(format!(
        "{} round trips: {:?} with status reads, {:?} with request status",
        config.srq_iterations, timings[0], timings[1]
    )))
}

fn end_of_message<T: Transport>(
    engine: &mut SyncEngine<T>,
    config: &SuiteConfig,
) -> Result<Verdict> {
    let split_at = config.operation.trim_end().len() / 2;
    let operation =
        engine.issue_in_parts(&config.operation, split_at, Completion::Event, Strategy::default())?;
    engine.wait(operation)?;
    let response = engine.read_response()?;
    Ok(Verdict::passed(format!(
        "split after {} bytes, response {:?}",
        split_at,
        summary(&response)
    )))
}

fn end_of_message_input<T: Transport>(
    engine: &mut SyncEngine<T>,
    config: &SuiteConfig,
) -> Result<Verdict> {
    engine.clear_status()?;
    engine.set_register(Register::Ese, 0)?;
    engine.set_register(Register::Sre, 0)?;
    engine.send(&terminated(&config.query))?;

    let max = engine.config().max_response_len;
    let mut buf = vec![0u8; config.input_chunk.max(1)];
    let mut response = Vec::new();
    let mut reads = 0;
    loop {
        let n = match engine.transport_mut().read(&mut buf) {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(source) => return Err(Error::io(SyncPhase::Response, source)),
        };
        reads += 1;
        response.extend_from_slice(&buf[..n]);
        let done = engine
            .transport_mut()
            .end_of_message()
            .map_err(|source| Error::io(SyncPhase::Settings, source))?;
        if done {
            break;
        }
        if n == 0 || response.len() > max {
            return Ok(Verdict::failed(format!(
                "no end of message after {} bytes",
                response.len()
            )));
        }
    }
    Ok(Verdict::passed(format!(
        "{} reads of at most {} bytes: {:?}",
        reads,
        buf.len(),
        summary(&response)
    )))
}

fn term_char<T: Transport>(engine: &mut SyncEngine<T>, config: &SuiteConfig) -> Result<Verdict> {
    let previous = engine
        .transport_mut()
        .configure_terminator(TermChar {
            byte: config.term_char,
            enabled: true,
        })
        .map_err(|source| Error::io(SyncPhase::Settings, source))?;
    let parts = read_terminated_parts(engine, config);
    // Restored whether or not the reads succeeded.
    engine
        .transport_mut()
        .configure_terminator(previous)
        .map_err(|source| Error::io(SyncPhase::Settings, source))?;
    let parts = parts?;
    for (index, part) in parts.iter().enumerate() {
        log::debug!("Part {}: {:?}", index + 1, summary(part));
    }
    if parts.len() <= 1 {
        log::warn!(
            "Response to {} was not split at {:?}",
            config.operation,
            config.term_char as char
        );
    }
    Ok(Verdict::passed(format!(
        "{} parts split at {:?}",
        parts.len(),
        config.term_char as char
    )))
}

fn read_terminated_parts<T: Transport>(
    engine: &mut SyncEngine<T>,
    config: &SuiteConfig,
) -> Result<Vec<Vec<u8>>> {
    engine.issue_and_wait_opc(&config.operation, Completion::Event, Strategy::default())?;
    let mut buf = vec![0u8; engine.config().max_response_len];
    let mut parts = Vec::new();
    while engine.read_status_byte()?.contains(StatusByte::MAV) {
        let n = engine
            .transport_mut()
            .read(&mut buf)
            .map_err(|source| Error::io(SyncPhase::Response, source))?;
        if n == 0 {
            break;
        }
        parts.push(buf[..n].to_vec());
    }
    Ok(parts)
}

fn complete_operation<T: Transport>(
    engine: &mut SyncEngine<T>,
    operation: &str,
    strategy: Strategy,
) -> Result<Verdict> {
    let start = Instant::now();
    let stb = engine.issue_and_wait_opc(operation, Completion::Event, strategy)?;
    let elapsed = start.elapsed();
    let response = engine.read_response()?;
    Ok(Verdict::passed(format!(
        "completed after {:?} ({}), response {:?}",
        elapsed,
        stb,
        summary(&response)
    )))
}

fn trigger<T: Transport>(engine: &mut SyncEngine<T>, config: &SuiteConfig) -> Result<Verdict> {
    let caps = engine
        .transport()
        .capabilities()
        .map_err(|source| Error::io(SyncPhase::Settings, source))?;
    if !caps.contains(Capabilities::TRIGGER) {
        return Ok(Verdict::skipped("instrument does not accept triggers"));
    }
    let Some(setup) = &config.trigger_setup else {
        return Ok(Verdict::skipped("no trigger setup configured"));
    };
    engine.clear_status()?;
    engine.set_register(Register::Sre, ServiceRequestEnable::TRG.bits())?;
    engine.send(&terminated(setup))?;
    engine.read_status_byte()?;
    engine
        .transport_mut()
        .trigger()
        .map_err(|source| Error::io(SyncPhase::Send, source))?;
    let waited = engine.wait_for_service_request(Some(config.io_timeout));
    let stb = match waited {
        Ok(()) => engine.srq_status_byte(),
        Err(err) => Err(err),
    };
    if let Some(restore) = &config.trigger_restore {
        engine.send(&terminated(restore))?;
    }
    let stb = stb?;
    if stb.contains(StatusByte::TRG) {
        Ok(Verdict::passed(format!("{}", stb)))
    } else {
        Ok(Verdict::failed(format!("service request without TRG ({})", stb)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for case in TestCase::ALL {
            assert_eq!(TestCase::from_name(case.name()), Some(case));
        }
        assert_eq!(TestCase::from_name("select"), None);
    }

    #[test]
    fn report_counts() {
        let result = |case, outcome| CaseResult {
            case,
            outcome,
            detail: String::new(),
            elapsed: Duration::ZERO,
        };
        let report = SuiteReport {
            results: vec![
                result(TestCase::Timeout, Outcome::Passed),
                result(TestCase::Capabilities, Outcome::Passed),
                result(TestCase::Trigger, Outcome::Skipped),
            ],
        };
        assert!(report.is_success());
        assert_eq!(report.count(Outcome::Passed), 2);
        assert_eq!(report.count(Outcome::Skipped), 1);
        assert!(report.to_string().ends_with("2 passed, 0 failed, 1 skipped"));
        assert_eq!(
            report.get(TestCase::Trigger).map(|result| result.outcome),
            Some(Outcome::Skipped)
        );
    }
}
