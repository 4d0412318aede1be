use std::time::Duration;

use tmc_protocol::{Capabilities, StatusByte};
use tmc_sync::{
    engine::{Builder, SyncEngine},
    suite::{self, Outcome, SuiteConfig, TestCase},
};
use tmc_tests::{Latency, SimulatedInstrument};

fn engine(instrument: SimulatedInstrument) -> SyncEngine<SimulatedInstrument> {
    let _ = env_logger::builder().is_test(true).try_init();
    Builder::new().build(instrument)
}

fn config() -> SuiteConfig {
    SuiteConfig {
        operation: ":MEAS:ALL?".to_string(),
        srq_iterations: 5,
        timeout_probe: Duration::from_millis(500),
        notify_timeout: Duration::from_secs(1),
        trigger_setup: Some("TRIG:SOUR BUS".to_string()),
        ..SuiteConfig::default()
    }
}

fn instrument() -> SimulatedInstrument {
    SimulatedInstrument::new().respond(":MEAS:ALL?", b"1.0;2.0;3.0")
}

#[test]
fn full_suite_passes() {
    let mut engine = engine(instrument());
    let report = suite::run(&mut engine, &config(), &[]);
    println!("{}", report);
    assert_eq!(report.results.len(), TestCase::ALL.len());
    assert_eq!(report.count(Outcome::Passed), TestCase::ALL.len(), "{}", report);
    assert_eq!(engine.transport().clears(), 0);

    let term_char = report.get(TestCase::TermChar).unwrap();
    assert!(term_char.detail.starts_with("3 parts"), "{}", term_char);
}

#[test]
fn selection_runs_in_suite_order() {
    let mut engine = engine(instrument());
    let report = suite::run(
        &mut engine,
        &config(),
        &[TestCase::Capabilities, TestCase::Timeout],
    );
    let cases: Vec<TestCase> = report.results.iter().map(|result| result.case).collect();
    assert_eq!(cases, [TestCase::Timeout, TestCase::Capabilities]);
    assert!(report.is_success());
}

#[test]
fn trigger_skipped_without_capability() {
    let mut engine = engine(instrument().with_capabilities(Capabilities::IEEE488_2));
    let report = suite::run(&mut engine, &config(), &[TestCase::Trigger]);
    assert_eq!(
        report.get(TestCase::Trigger).map(|result| result.outcome),
        Some(Outcome::Skipped)
    );
    assert!(report.is_success());
}

#[test]
fn trigger_skipped_without_setup() {
    let config = SuiteConfig {
        trigger_setup: None,
        ..config()
    };
    let mut engine = engine(instrument());
    let report = suite::run(&mut engine, &config, &[TestCase::Trigger]);
    assert_eq!(report.count(Outcome::Skipped), 1);
}

#[test]
fn failed_case_clears_device() {
    let mut engine = engine(instrument().latency(Latency::Never));
    let report = suite::run(&mut engine, &SuiteConfig::default(), &[TestCase::StatusByte]);
    assert_eq!(report.count(Outcome::Failed), 1);
    assert!(!report.is_success());
    assert!(engine.transport().clears() >= 1);
    assert!(report.to_string().ends_with("0 passed, 1 failed, 0 skipped"));
}

#[test]
fn status_byte_case_reports_disagreeing_sources() {
    let mut engine = engine(instrument().control_status_skew(StatusByte::USR));
    let report = suite::run(&mut engine, &config(), &[TestCase::StatusByte]);
    let result = report.get(TestCase::StatusByte).unwrap();
    assert_eq!(result.outcome, Outcome::Passed);
    assert!(
        result.detail.contains("status byte requests differ"),
        "{}",
        result.detail
    );
}
