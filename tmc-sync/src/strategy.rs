use std::time::{Duration, Instant};

use tmc_protocol::{EventStatus, ServiceRequestEnable, StatusByte};

/// Default delay between two status byte polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Default poll cap, about one second at the default interval.
pub const DEFAULT_MAX_POLLS: u32 = 100;
/// Default time an [`Strategy::AsyncNotify`] waiter sleeps before giving up.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// How to detect that the instrument has finished an operation.
///
/// All strategies end in the same check: the status byte has one of the
/// completion bits set.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Strategy {
    /// Reads the status byte out-of-band every `interval`, at most `max_polls` times.
    /// Never uses `*STB?`, which would itself queue a response and disturb MAV.
    ActivePoll { interval: Duration, max_polls: u32 },
    /// Blocks in the transport until a service request is raised. No timeout.
    BlockingWait,
    /// Like [`Strategy::BlockingWait`], bounded by the given duration.
    TimedWait(Duration),
    /// Arms an asynchronous notification, then sleeps until it fires or `timeout` passes.
    AsyncNotify { timeout: Duration },
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::ActivePoll {
            interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
        }
    }
}

impl Strategy {
    pub fn active_poll(max_polls: u32) -> Strategy {
        Strategy::ActivePoll {
            interval: DEFAULT_POLL_INTERVAL,
            max_polls,
        }
    }

    pub fn async_notify() -> Strategy {
        Strategy::AsyncNotify {
            timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }

    /// The wall-clock deadline of an operation issued at `issued`, if the strategy has one.
    /// Active polling is only bounded by its poll cap.
    pub fn deadline(&self, issued: Instant) -> Option<Instant> {
        match self {
            Strategy::TimedWait(timeout) | Strategy::AsyncNotify { timeout } => {
                Some(issued + *timeout)
            }
            Strategy::ActivePoll { .. } | Strategy::BlockingWait => None,
        }
    }
}

/// What signals the end of an operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Completion {
    /// `*OPC` sets ESR.OPC, which is summarized in STB.ESB.
    Event,
    /// The response is queued, STB.MAV.
    Message,
    /// Any of the given status byte bits.
    Status(StatusByte),
}

impl Completion {
    /// The status byte bits that mark the operation as done.
    pub fn predicate(self) -> StatusByte {
        match self {
            Completion::Event => StatusByte::ESB,
            Completion::Message => StatusByte::MAV,
            Completion::Status(bits) => bits,
        }
    }

    /// The SRE mask that turns the completion condition into a service request.
    pub fn service_request_enable(self) -> ServiceRequestEnable {
        self.predicate().service_request_mask()
    }

    /// The ESE mask; operation complete is always enabled.
    pub fn event_status_enable(self) -> EventStatus {
        EventStatus::OPC
    }
}
