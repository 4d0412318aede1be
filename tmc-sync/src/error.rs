use std::{fmt::Display, io, time::Duration};

use tmc_protocol::{
    Register, StatusByte,
    error::{BlockError, ResponseError},
};

/// The step of an operation in which an error occurred.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SyncPhase {
    /// Writing `*CLS`, `*ESE` or `*SRE` before a command is issued
    Configure,
    /// Sending a program message
    Send,
    /// Waiting for completion
    Wait,
    /// Out-of-band status byte read
    Status,
    /// Reading a text response
    Response,
    /// Device clear
    Clear,
    /// Arming asynchronous notifications
    Notify,
    /// Transport settings such as timeout and termination character
    Settings,
}

impl Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncPhase::Configure => "configure",
            SyncPhase::Send => "send",
            SyncPhase::Wait => "wait",
            SyncPhase::Status => "status read",
            SyncPhase::Response => "response read",
            SyncPhase::Clear => "device clear",
            SyncPhase::Notify => "notification setup",
            SyncPhase::Settings => "transport settings",
        };
        f.write_str(name)
    }
}

/// Errors of the synchronization engine.
///
/// None of them are retried. After an [`Error::Io`] or [`Error::Protocol`] the
/// caller should clear the device before issuing the next command.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error during {phase}: {source}")]
    Io {
        phase: SyncPhase,
        #[source]
        source: io::Error,
    },
    #[error("timed out during {phase} after {waited:?}")]
    Timeout { phase: SyncPhase, waited: Duration },
    #[error("block transfer failed: {0}")]
    Protocol(#[from] BlockError),
    #[error("invalid response to *{register}?: {source}")]
    Response {
        register: Register,
        #[source]
        source: ResponseError,
    },
    #[error("response exceeds {max} bytes")]
    ResponseTooLong { max: usize },
    #[error("{0} is not writable")]
    ReadOnlyRegister(Register),
    /// The completion bits can never raise a service request, e.g. only MSS.
    #[error("completion on {0} can never be observed")]
    UnreachableCompletion(StatusByte),
}

impl Error {
    pub(crate) fn io(phase: SyncPhase, source: io::Error) -> Error {
        Error::Io { phase, source }
    }

    /// Maps a transport error of a wait primitive; `TimedOut` becomes [`Error::Timeout`].
    pub(crate) fn wait(source: io::Error, waited: Duration) -> Error {
        if source.kind() == io::ErrorKind::TimedOut {
            Error::Timeout {
                phase: SyncPhase::Wait,
                waited,
            }
        } else {
            Error::io(SyncPhase::Wait, source)
        }
    }

    /// The phase the error occurred in.
    pub fn phase(&self) -> SyncPhase {
        match self {
            Error::Io { phase, .. } | Error::Timeout { phase, .. } => *phase,
            Error::Protocol(_) | Error::ResponseTooLong { .. } | Error::Response { .. } => {
                SyncPhase::Response
            }
            Error::ReadOnlyRegister(_) | Error::UnreachableCompletion(_) => SyncPhase::Configure,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Whether the transport does not implement the requested operation.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Io { source, .. } if source.kind() == io::ErrorKind::Unsupported)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_out_wait_becomes_timeout() {
        let err = Error::wait(
            io::Error::new(io::ErrorKind::TimedOut, "no SRQ"),
            Duration::from_millis(100),
        );
        assert!(err.is_timeout());
        assert_eq!(err.phase(), SyncPhase::Wait);
    }

    #[test]
    fn other_wait_failure_stays_io() {
        let err = Error::wait(io::Error::other("pipe"), Duration::ZERO);
        assert!(matches!(
            err,
            Error::Io {
                phase: SyncPhase::Wait,
                ..
            }
        ));
    }

    #[test]
    fn unsupported_detection() {
        let err = Error::io(
            SyncPhase::Settings,
            io::Error::new(io::ErrorKind::Unsupported, "no EOM"),
        );
        assert!(err.is_unsupported());
        assert_eq!(
            err.to_string(),
            "I/O error during transport settings: no EOM"
        );
    }

    #[test]
    fn read_only_register_message() {
        assert_eq!(
            Error::ReadOnlyRegister(Register::Stb).to_string(),
            "STB is not writable"
        );
    }
}
