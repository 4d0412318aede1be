use std::io::{self, Write};

use crate::error::ResponseError;
use crate::registers::Register;

/// The IEEE-488.2 common commands used for status handling.
///
/// Every command is written as a single program message terminated by `\n`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommonCommand {
    /// `*CLS`: clears the event registers and the error queue
    ClearStatus,
    /// `*SRE <n>` or `*ESE <n>`
    SetRegister { register: Register, value: u8 },
    /// `*STB?`, `*SRE?`, `*ESR?` or `*ESE?`
    QueryRegister(Register),
}

impl CommonCommand {
    const PREFIX: u8 = b'*';
    const TERMINATOR: u8 = b'\n';

    /// Suffix appended to a program message so that completion raises ESR.OPC.
    pub const OPC_SUFFIX: &str = ";*OPC";

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    /// The exact bytes sent for this command, including the terminator.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![Self::PREFIX];
        match self {
            CommonCommand::ClearStatus => out.extend_from_slice(b"CLS"),
            CommonCommand::SetRegister { register, value } => {
                out.extend_from_slice(format!("{} {}", register.mnemonic(), value).as_bytes())
            }
            CommonCommand::QueryRegister(register) => {
                out.extend_from_slice(register.mnemonic().as_bytes());
                out.push(b'?');
            }
        }
        out.push(Self::TERMINATOR);
        out
    }
}

/// Appends the operation-complete request to a program message.
///
/// Trailing whitespace and terminators of `command` are dropped, the result is
/// terminated by a single `\n`.
pub fn with_opc_suffix(command: &str) -> Vec<u8> {
    let mut out = command.trim_end().as_bytes().to_vec();
    out.extend_from_slice(CommonCommand::OPC_SUFFIX.as_bytes());
    out.push(CommonCommand::TERMINATOR);
    out
}

/// Terminates a program message with `\n` unless it already is.
pub fn terminated(command: &str) -> Vec<u8> {
    let mut out = command.trim_end().as_bytes().to_vec();
    out.push(CommonCommand::TERMINATOR);
    out
}

/// Parses the `<NR1>` response to a register query such as `*ESR?`.
///
/// Instruments answer with a decimal integer, optionally surrounded by
/// whitespace. Values outside `0..=255` are rejected.
pub fn parse_register_response(response: &[u8]) -> Result<u8, ResponseError> {
    let text = str::from_utf8(response)?.trim();
    if text.is_empty() {
        return Err(ResponseError::Empty);
    }
    let text = text.strip_prefix('+').unwrap_or(text);
    let value = text.parse::<u16>()?;
    u8::try_from(value).map_err(|_| ResponseError::OutOfRange(value))
}
