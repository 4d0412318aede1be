use std::fmt::{self, Display};

use bitflags::{Flags, bitflags};

bitflags! {
    /// The IEEE-488.2 status byte (STB).
    ///
    /// A snapshot only. Any command sent to the instrument may change it, so a
    /// value must never be reused across an operation boundary.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct StatusByte: u8 {
        /// Trigger occurred
        const TRG = 1;
        /// User defined event
        const USR = 2;
        /// Message available in the error/event queue
        const MSG = 4;
        /// Message available: response data is queued in the output buffer
        const MAV = 16;
        /// Event status bit: an ESE-enabled bit is set in the ESR
        const ESB = 32;
        /// Master summary status: an SRE-enabled bit is set
        const MSS = 64;
        /// Operation status register summary
        const OSR = 128;
    }
}

bitflags! {
    /// The service request enable register (SRE).
    ///
    /// Uses the bit positions of [`StatusByte`] except `MSS`, which cannot raise a
    /// service request itself.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct ServiceRequestEnable: u8 {
        const TRG = 1;
        const USR = 2;
        const MSG = 4;
        const MAV = 16;
        const ESB = 32;
        const OSR = 128;
    }
}

bitflags! {
    /// Bits of the standard event status register (ESR) and its enable mask (ESE).
    ///
    /// Reading the ESR through `*ESR?` clears it on the instrument.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct EventStatus: u8 {
        /// Operation complete
        const OPC = 1;
        /// Request control
        const RQL = 2;
        /// Query error
        const QYE = 4;
        /// Device dependent error
        const DDE = 8;
        /// Execution error
        const EXE = 16;
        /// Command error
        const CME = 32;
        /// User request
        const URQ = 64;
        /// Power on
        const PON = 128;
    }
}

bitflags! {
    /// USB488 interface capabilities as reported by the usbtmc driver.
    ///
    /// The remote/local capabilities share a single bit in the USB488
    /// capability descriptor.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct Capabilities: u8 {
        const TRIGGER = 1;
        const REN_CONTROL = 2;
        const GOTO_LOCAL = 2;
        const LOCAL_LOCKOUT = 2;
        const IEEE488_2 = 4;
        const DT1 = 16;
        const RL1 = 32;
        const SR1 = 64;
        const FULL_SCPI = 128;
    }
}

impl StatusByte {
    /// The SRE bits that let this condition raise a service request.
    pub fn service_request_mask(self) -> ServiceRequestEnable {
        ServiceRequestEnable::from_bits_truncate(self.bits())
    }
}

impl Capabilities {
    /// Lists every capability together with whether it is present.
    /// Aliased capabilities are listed individually.
    pub fn report(self) -> impl Iterator<Item = (&'static str, bool)> {
        Self::FLAGS
            .iter()
            .map(move |flag| (flag.name(), self.contains(*flag.value())))
    }
}

/// Decodes a raw status byte. Undefined bits are retained.
pub fn decode_status_byte(byte: u8) -> StatusByte {
    StatusByte::from_bits_retain(byte)
}

/// Decodes a raw ESR or ESE value.
pub fn decode_event_status(byte: u8) -> EventStatus {
    EventStatus::from_bits_retain(byte)
}

/// Encodes a set of named bits as the value written with `*SRE` or `*ESE`.
pub fn encode_enable_mask<F: Flags<Bits = u8>>(bits: F) -> u8 {
    bits.bits()
}

/// The four IEEE-488.2 status registers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Register {
    /// Status byte
    Stb,
    /// Service request enable
    Sre,
    /// Standard event status register
    Esr,
    /// Standard event status enable
    Ese,
}

impl Register {
    /// The mnemonic used in the common commands, e.g. `SRE` for `*SRE`.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Register::Stb => "STB",
            Register::Sre => "SRE",
            Register::Esr => "ESR",
            Register::Ese => "ESE",
        }
    }

    /// Whether the register can be written with `*<mnemonic> <value>`.
    pub fn is_writable(self) -> bool {
        matches!(self, Register::Sre | Register::Ese)
    }

    /// Renders a register value for diagnostics, e.g. `STB = 0x30 [MAV ESB]`.
    pub fn format(self, value: u8) -> String {
        let names = match self {
            Register::Stb | Register::Sre => bit_names(decode_status_byte(value)),
            Register::Esr | Register::Ese => bit_names(decode_event_status(value)),
        };
        format!("{} = 0x{:02x} [{}]", self.mnemonic(), value, names)
    }
}

impl Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Space separated names of the set bits, undefined bits rendered as `bitN`.
fn bit_names<F: Flags<Bits = u8>>(value: F) -> String {
    let mut names: Vec<String> = value.iter_names().map(|(name, _)| name.to_owned()).collect();
    let undefined = value.bits() & !F::all().bits();
    names.extend(
        (0..8)
            .filter(|bit| undefined & (1 << bit) != 0)
            .map(|bit| format!("bit{}", bit)),
    );
    names.join(" ")
}

macro_rules! display_via_names {
    ($($ty:ty),*) => {
        $(
            impl Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&bit_names(*self))
                }
            }
        )*
    };
}

display_via_names!(StatusByte, ServiceRequestEnable, EventStatus);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_byte_round_trips_all_subsets() {
        for raw in 0..=u8::MAX {
            let subset = StatusByte::from_bits_truncate(raw);
            assert_eq!(decode_status_byte(encode_enable_mask(subset)), subset);
        }
    }

    #[test]
    fn event_status_round_trips_all_subsets() {
        for raw in 0..=u8::MAX {
            let subset = EventStatus::from_bits_truncate(raw);
            assert_eq!(decode_event_status(encode_enable_mask(subset)), subset);
        }
    }

    #[test]
    fn service_request_enable_round_trips_all_subsets() {
        for raw in 0..=u8::MAX {
            let subset = ServiceRequestEnable::from_bits_truncate(raw);
            let decoded = ServiceRequestEnable::from_bits_retain(encode_enable_mask(subset));
            assert_eq!(decoded, subset);
        }
    }

    #[test]
    fn service_request_mask_drops_mss() {
        let stb = StatusByte::MSS | StatusByte::ESB;
        assert_eq!(stb.service_request_mask(), ServiceRequestEnable::ESB);
    }

    #[test]
    fn decode_keeps_undefined_bit() {
        let stb = decode_status_byte(0x18);
        assert!(stb.contains(StatusByte::MAV));
        assert_eq!(stb.bits(), 0x18);
    }

    #[test]
    fn format_status_byte() {
        assert_eq!(Register::Stb.format(0x30), "STB = 0x30 [MAV ESB]");
        assert_eq!(Register::Stb.format(0x08), "STB = 0x08 [bit3]");
        assert_eq!(Register::Sre.format(0), "SRE = 0x00 []");
    }

    #[test]
    fn format_event_status() {
        assert_eq!(Register::Esr.format(0x21), "ESR = 0x21 [OPC CME]");
        assert_eq!(Register::Ese.format(0x01), "ESE = 0x01 [OPC]");
    }

    #[test]
    fn register_properties() {
        assert!(Register::Sre.is_writable());
        assert!(!Register::Stb.is_writable());
    }

    #[test]
    fn capabilities_report_lists_aliases() {
        let caps = Capabilities::TRIGGER | Capabilities::REN_CONTROL;
        let report: Vec<_> = caps.report().collect();
        assert_eq!(report.len(), 9);
        assert!(report.contains(&("TRIGGER", true)));
        assert!(report.contains(&("LOCAL_LOCKOUT", true)));
        assert!(report.contains(&("FULL_SCPI", false)));
    }
}
