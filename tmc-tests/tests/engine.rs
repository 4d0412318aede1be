use tmc_protocol::{Anomaly, EventStatus, Register, StatusByte};
use tmc_sync::{
    Transport,
    engine::{Builder, SyncEngine},
    error::{Error, SyncPhase},
    strategy::{Completion, Strategy},
};
use tmc_tests::SimulatedInstrument;

fn engine(instrument: SimulatedInstrument) -> SyncEngine<SimulatedInstrument> {
    let _ = env_logger::builder().is_test(true).try_init();
    Builder::new().build(instrument)
}

#[test]
fn status_registers_are_armed_before_the_command() {
    let mut engine = engine(SimulatedInstrument::new());
    engine
        .issue_and_wait_opc(":MEAS:FREQ?", Completion::Event, Strategy::default())
        .unwrap();
    assert_eq!(
        engine.transport().messages(),
        ["*CLS", "*ESE 1", "*SRE 32", ":MEAS:FREQ?;*OPC"]
    );
}

#[test]
fn clear_status_can_be_skipped() {
    let mut engine = Builder::new()
        .clear_status_before_issue(false)
        .build(SimulatedInstrument::new());
    engine
        .issue_and_wait_opc("*IDN?", Completion::Message, Strategy::default())
        .unwrap();
    assert_eq!(
        engine.transport().messages(),
        ["*ESE 1", "*SRE 16", "*IDN?;*OPC"]
    );
}

#[test]
fn query_strips_terminator() {
    let mut engine = engine(SimulatedInstrument::new());
    assert_eq!(engine.query("*IDN?").unwrap(), "Simulated,TMC-1,0,1.0");
}

#[test]
fn register_round_trip() {
    let mut engine = engine(SimulatedInstrument::new());
    engine.set_register(Register::Sre, 0x30).unwrap();
    engine.set_register(Register::Ese, 0x3d).unwrap();
    assert_eq!(engine.query_register(Register::Sre).unwrap(), 0x30);
    assert_eq!(engine.query_register(Register::Ese).unwrap(), 0x3d);
}

#[test]
fn status_byte_is_read_only() {
    let mut engine = engine(SimulatedInstrument::new());
    let err = engine.set_register(Register::Stb, 1).unwrap_err();
    assert!(matches!(err, Error::ReadOnlyRegister(Register::Stb)));
    assert!(engine.transport().messages().is_empty());
}

#[test]
fn event_status_read_is_destructive() {
    let mut engine = engine(SimulatedInstrument::new());
    engine.send(b"*OPC\n").unwrap();
    assert_eq!(engine.read_event_status().unwrap(), EventStatus::OPC);
    assert_eq!(engine.read_event_status().unwrap(), EventStatus::empty());
}

#[test]
fn consistent_status_sources() {
    let mut engine = engine(SimulatedInstrument::new());
    engine.set_register(Register::Ese, 1).unwrap();
    engine.send(b"*OPC\n").unwrap();
    assert_eq!(engine.check_status_consistency().unwrap(), None);
}

#[test]
fn status_mismatch_is_reported_not_fatal() {
    let mut engine = engine(SimulatedInstrument::new().status_skew(StatusByte::USR));
    let anomaly = engine.check_status_consistency().unwrap();
    assert_eq!(
        anomaly,
        Some(Anomaly::StatusMismatch {
            out_of_band: StatusByte::empty(),
            queried: StatusByte::USR,
        })
    );
    // The engine stays usable.
    assert_eq!(engine.query("*IDN?").unwrap(), "Simulated,TMC-1,0,1.0");
}

#[test]
fn failed_read_clears_device_and_engine_recovers() {
    let mut engine = engine(SimulatedInstrument::new());
    engine.transport_mut().fail_next_reads(1);
    let err = engine.query("*IDN?").unwrap_err();
    assert_eq!(err.phase(), SyncPhase::Response);
    assert_eq!(engine.transport().clears(), 1);
    assert_eq!(engine.query("*IDN?").unwrap(), "Simulated,TMC-1,0,1.0");
}

#[test]
fn response_longer_than_limit() {
    let long = vec![b'x'; 100];
    let mut engine = Builder::new()
        .max_response_len(16)
        .build(SimulatedInstrument::new().respond(":DATA?", &long));
    let err = engine.query(":DATA?").unwrap_err();
    assert!(matches!(err, Error::ResponseTooLong { max: 16 }));
}

#[test]
fn message_split_over_two_writes() {
    let mut engine = engine(SimulatedInstrument::new());
    let operation = engine
        .issue_in_parts("*IDN?", 3, Completion::Event, Strategy::default())
        .unwrap();
    engine.wait(operation).unwrap();
    assert_eq!(engine.read_response().unwrap(), b"Simulated,TMC-1,0,1.0\n");

    let writes = engine.transport().writes();
    let parts = &writes[writes.len() - 2..];
    assert_eq!(parts[0], (b"*ID".to_vec(), false));
    assert_eq!(parts[1], (b"N?;*OPC\n".to_vec(), true));
    assert_eq!(engine.transport().messages().last().unwrap(), "*IDN?;*OPC");
}

#[test]
fn abandoned_operation_needs_device_clear() {
    let mut engine = engine(SimulatedInstrument::new().latency(tmc_tests::Latency::Never));
    let operation = engine
        .issue("*IDN?", Completion::Message, Strategy::default())
        .unwrap();
    drop(operation);
    engine.clear_device().unwrap();
    engine.transport_mut().set_latency(tmc_tests::Latency::Immediate);
    assert_eq!(engine.query("*IDN?").unwrap(), "Simulated,TMC-1,0,1.0");
}

#[test]
fn service_request_status_byte() {
    let mut engine = engine(SimulatedInstrument::new());
    engine.set_register(Register::Sre, 16).unwrap();
    engine.send(b"*IDN?\n").unwrap();
    engine
        .wait_for_service_request(Some(std::time::Duration::from_millis(100)))
        .unwrap();
    let stb = engine.srq_status_byte().unwrap();
    assert!(stb.contains(StatusByte::MAV | StatusByte::MSS));
    // Consumed by the first read.
    assert_eq!(engine.srq_status_byte().unwrap(), StatusByte::empty());
}

#[test]
fn trigger_raises_trigger_request() {
    let mut engine = engine(SimulatedInstrument::new());
    engine.set_register(Register::Sre, 1).unwrap();
    engine.read_status_byte().unwrap();
    engine.transport_mut().trigger().unwrap();
    engine.wait_for_service_request(None).unwrap();
    assert!(engine.srq_status_byte().unwrap().contains(StatusByte::TRG));
}

#[test]
fn status_requests_agree() {
    let mut engine = engine(SimulatedInstrument::new());
    engine.send(b"*ESE 1;*OPC\n").unwrap();
    assert_eq!(engine.check_status_requests().unwrap(), None);
}

#[test]
fn status_request_mismatch_is_reported_not_fatal() {
    let mut engine = engine(SimulatedInstrument::new().control_status_skew(StatusByte::TRG));
    let anomaly = engine.check_status_requests().unwrap();
    assert_eq!(
        anomaly,
        Some(Anomaly::StatusRequestMismatch {
            polled: StatusByte::empty(),
            control: StatusByte::TRG,
        })
    );
    assert_eq!(engine.query("*IDN?").unwrap(), "Simulated,TMC-1,0,1.0");
}

#[test]
fn every_program_message_is_flushed() {
    let mut engine = engine(SimulatedInstrument::new());
    engine
        .issue_and_wait_opc("*IDN?", Completion::Message, Strategy::default())
        .unwrap();
    let instrument = engine.transport();
    assert_eq!(instrument.writes().len(), 4);
    assert_eq!(instrument.flushes(), instrument.writes().len());
}

#[test]
fn unreachable_completion_is_rejected_before_sending() {
    let mut engine = engine(SimulatedInstrument::new());
    for bits in [StatusByte::MSS, StatusByte::empty()] {
        let err = engine
            .issue("*IDN?", Completion::Status(bits), Strategy::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnreachableCompletion(_)), "{}", err);
        assert_eq!(err.phase(), SyncPhase::Configure);
    }
    assert!(engine.transport().writes().is_empty());

    let stb = engine
        .issue_and_wait_opc(
            "*IDN?",
            Completion::Status(StatusByte::MAV | StatusByte::MSS),
            Strategy::default(),
        )
        .unwrap();
    assert!(stb.contains(StatusByte::MAV));
}
