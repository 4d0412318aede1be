//! # USBTMC Instrument Tool
//!
//! Linux front end for IEEE-488.2 instruments attached through the `usbtmc`
//! kernel driver.
//!
//! ## Overview
//!
//! This crate provides a [`Transport`](tmc_sync::Transport) implementation for
//! `/dev/usbtmcN` devices and the `ttmc` binary, which runs the self-test suite
//! of [`tmc_sync::suite`], sends queries and retrieves screen dumps as binary
//! blocks.
pub mod backends;

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use tmc_sync::{
    Transport,
    engine::{Builder, SyncEngine},
    strategy::{Completion, DEFAULT_POLL_INTERVAL, Strategy},
    suite::{self, SuiteConfig, TestCase},
};

use crate::backends::usbtmc::UsbTmcDevice;

#[derive(ValueEnum, Copy, Clone, Debug, Default, Eq, PartialEq)]
enum WaitStrategy {
    /// Poll the status byte
    #[default]
    Poll,
    /// Block until a service request, without a timeout
    Blocking,
    /// Block until a service request or the wait time passes
    Timed,
    /// Sleep until SIGIO reports a service request
    Notify,
}

impl WaitStrategy {
    fn strategy(self, wait: Duration) -> Strategy {
        match self {
            WaitStrategy::Poll => Strategy::ActivePoll {
                interval: DEFAULT_POLL_INTERVAL,
                max_polls: u32::try_from(wait.as_millis() / DEFAULT_POLL_INTERVAL.as_millis())
                    .unwrap_or(u32::MAX)
                    .max(1),
            },
            WaitStrategy::Blocking => Strategy::BlockingWait,
            WaitStrategy::Timed => Strategy::TimedWait(wait),
            WaitStrategy::Notify => Strategy::AsyncNotify { timeout: wait },
        }
    }
}

#[derive(ValueEnum, Copy, Clone, Debug, Eq, PartialEq)]
enum RemoteAction {
    /// Assert remote enable
    Enable,
    /// Release remote enable
    Disable,
    /// Lock out the front panel
    Lockout,
    /// Return to local control
    Local,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Run the self-test suite
    Test {
        #[arg(short, long = "case", value_parser = parse_case, help = "Only run these cases (repeatable)")]
        cases: Vec<TestCase>,
        #[arg(long, help = "List the cases and exit")]
        list: bool,
        #[arg(long, default_value = "*IDN?", help = "Query used by the service request cases")]
        query: String,
        #[arg(long, default_value = "*IDN?", help = "Query whose completion the wait cases observe")]
        operation: String,
        #[arg(long, default_value = "100")]
        srq_iterations: u32,
        #[arg(long, help = "Program message that arms the instrument for a bus trigger")]
        trigger_setup: Option<String>,
        #[arg(long, help = "Program message sent after the trigger case")]
        trigger_restore: Option<String>,
    },
    /// Show the USB488 capabilities
    Caps,
    /// Send a query and print the response
    Query {
        command: String,
        #[arg(short, long, value_enum, default_value_t)]
        strategy: WaitStrategy,
    },
    /// Retrieve a binary block, such as a screen image, and save it
    Screendump {
        #[arg(short, long, default_value = ":DISP:DATA? PNG, COL")]
        command: String,
        #[arg(short, long, default_value = "screendump.png")]
        output: PathBuf,
        #[arg(short, long, value_enum, default_value_t)]
        strategy: WaitStrategy,
        #[arg(long, default_value = "1024", help = "Read size in bytes")]
        chunk_size: usize,
    },
    /// Remote/local control
    Remote {
        #[arg(value_enum)]
        action: RemoteAction,
    },
}

#[derive(Parser)]
#[command(about = "Test and control IEEE-488.2 instruments through the Linux usbtmc driver", long_about=None)]
struct Args {
    #[arg(short, long, help = "The usbtmc device, detected automatically if omitted")]
    device: Option<PathBuf>,

    #[arg(short, long, help = "I/O timeout in milliseconds")]
    timeout_ms: Option<u64>,

    #[arg(short, long, default_value = "10000", help = "Completion wait in milliseconds")]
    wait_ms: u64,

    #[clap(subcommand)]
    command: Command,
}

fn parse_case(name: &str) -> Result<TestCase, String> {
    TestCase::from_name(name).ok_or_else(|| {
        let names: Vec<&str> = TestCase::ALL.iter().map(|case| case.name()).collect();
        format!("unknown case '{}', expected one of: {}", name, names.join(", "))
    })
}

/// Attempts to automatically find a usbtmc device
fn usbtmc_device_path() -> Option<PathBuf> {
    let mut devices: Vec<PathBuf> = Path::new("/dev")
        .read_dir()
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("usbtmc"))
        })
        .collect();
    devices.sort();
    log::debug!("Found usbtmc devices {:?}", devices);
    devices.into_iter().next()
}

fn run_suite(
    engine: &mut SyncEngine<UsbTmcDevice>,
    config: &SuiteConfig,
    cases: &[TestCase],
) -> Result<(), Box<dyn Error>> {
    let report = suite::run(engine, config, cases);
    println!("{}", report);
    if report.is_success() {
        Ok(())
    } else {
        Err(format!("{} case(s) failed", report.count(suite::Outcome::Failed)).into())
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let wait = Duration::from_millis(args.wait_ms);

    if let Command::Test { list: true, .. } = args.command {
        for case in TestCase::ALL {
            println!("{:<22} {}", case.name(), case.description());
        }
        return Ok(());
    }

    let device_path = match args.device.or_else(usbtmc_device_path) {
        None => {
            println!(
                "No usbtmc device could be detected. Use ttmc --device <path> to specify one manually."
            );
            return Ok(());
        }
        Some(path) => path,
    };
    log::info!("Using {}", device_path.display());

    let mut device = UsbTmcDevice::new(&device_path)?;
    if let Some(timeout_ms) = args.timeout_ms {
        device.set_timeout(Duration::from_millis(timeout_ms))?;
    }

    match args.command {
        Command::Test {
            cases,
            list: _,
            query,
            operation,
            srq_iterations,
            trigger_setup,
            trigger_restore,
        } => {
            let config = SuiteConfig {
                query,
                operation,
                srq_iterations,
                notify_timeout: wait,
                trigger_setup,
                trigger_restore,
                ..SuiteConfig::default()
            };
            let mut engine = Builder::new().build(device);
            engine.clear_device()?;
            run_suite(&mut engine, &config, &cases)?;
        }
        Command::Caps => {
            let caps = device.capabilities()?;
            println!("USBTMC-488 capabilities (0x{:02x})", caps.bits());
            for (name, present) in caps.report() {
                println!("{:<14}: {}", name, if present { "yes" } else { "no" });
            }
        }
        Command::Query { command, strategy } => {
            let mut engine = Builder::new().build(device);
            let operation = engine.issue(&command, Completion::Message, strategy.strategy(wait))?;
            engine.wait(operation)?;
            let response = engine.read_response()?;
            println!("{}", String::from_utf8_lossy(&response).trim_end());
        }
        Command::Screendump {
            command,
            output,
            strategy,
            chunk_size,
        } => {
            let mut engine = Builder::new().block_chunk_size(chunk_size).build(device);
            engine.clear_device()?;
            let block = engine.query_block(&command, strategy.strategy(wait))?;
            if let Some(anomaly) = block.anomaly() {
                log::warn!("Screen dump received with anomaly: {}", anomaly);
            }
            log::info!("Read {} bytes of display data", block.payload().len());
            fs::write(&output, block.into_payload())?;
            println!("Screen dumped to {}", output.display());
        }
        Command::Remote { action } => match action {
            RemoteAction::Enable => device.remote_enable(true)?,
            RemoteAction::Disable => device.remote_enable(false)?,
            RemoteAction::Lockout => device.local_lockout()?,
            RemoteAction::Local => device.goto_local()?,
        },
    }
    Ok(())
}
