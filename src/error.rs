//! Error types for the tracker core
//!
//! Transient conditions (`ScanError`, `SendError`) are reported to the caller
//! and absorbed by the alarm cadence. `TrackerError` is fatal: the dispatcher
//! logs it and resets the device.

use core::fmt;

/// Scan engine failures. Both count as empty evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanError {
    /// GNSS stage ended without a position fix
    NoFix,
    /// Engine refused to start, stop, or report
    Engine,
}

/// LoRaWAN modem API failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemError {
    /// Command queue to the modem is full
    Busy,
    /// Operation requires a joined session
    NotJoined,
    /// Modem rejected the request
    Rejected,
}

/// Why an uplink was not handed to the modem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Regional duty-cycle budget exhausted; retry on the next alarm
    DutyCycleBlocked {
        /// Milliseconds until the band frees up
        wait_ms: u32,
    },
    /// Frame exceeds the next uplink's max payload; a flush uplink was requested
    PayloadTooLarge { len: usize, max: usize },
    /// The previous uplink has not completed yet
    InFlight,
    /// Modem API failure (fatal)
    Modem(ModemError),
}

/// Malformed configuration downlink. The whole downlink is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkError {
    /// Opcode not recognised
    UnknownOpcode(u8),
    /// Payload ended inside the opcode's argument
    Truncated { opcode: u8 },
    /// Argument out of range
    InvalidValue { opcode: u8 },
    /// More commands than one downlink may carry
    TooManyCommands,
}

/// Fatal tracker errors surfaced by `Tracker::dispatch`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerError {
    Modem(ModemError),
}

impl From<ModemError> for SendError {
    fn from(e: ModemError) -> Self {
        SendError::Modem(e)
    }
}

impl From<ModemError> for TrackerError {
    fn from(e: ModemError) -> Self {
        TrackerError::Modem(e)
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::NoFix => write!(f, "GNSS fix fail"),
            ScanError::Engine => write!(f, "Scan engine failure"),
        }
    }
}

impl fmt::Display for ModemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModemError::Busy => write!(f, "Modem busy"),
            ModemError::NotJoined => write!(f, "Modem not joined"),
            ModemError::Rejected => write!(f, "Modem rejected request"),
        }
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::DutyCycleBlocked { wait_ms } => {
                write!(f, "Duty-cycle limitation, next possible uplink in {} ms", wait_ms)
            }
            SendError::PayloadTooLarge { len, max } => {
                write!(f, "Payload too large: {} > {} bytes", len, max)
            }
            SendError::InFlight => write!(f, "Previous uplink still in flight"),
            SendError::Modem(e) => write!(f, "Modem error: {}", e),
        }
    }
}

impl fmt::Display for DownlinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownlinkError::UnknownOpcode(op) => write!(f, "Unknown downlink opcode 0x{:02X}", op),
            DownlinkError::Truncated { opcode } => {
                write!(f, "Downlink truncated in opcode 0x{:02X}", opcode)
            }
            DownlinkError::InvalidValue { opcode } => {
                write!(f, "Invalid value for downlink opcode 0x{:02X}", opcode)
            }
            DownlinkError::TooManyCommands => write!(f, "Too many commands in one downlink"),
        }
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::Modem(e) => write!(f, "Fatal modem error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modem_error_converts_and_formats() {
        let send: SendError = ModemError::NotJoined.into();
        assert_eq!(send, SendError::Modem(ModemError::NotJoined));
        assert_eq!(send.to_string(), "Modem error: Modem not joined");

        let fatal: TrackerError = ModemError::Busy.into();
        assert_eq!(fatal.to_string(), "Fatal modem error: Modem busy");
    }

    #[test]
    fn downlink_errors_show_opcode_in_hex() {
        let e = DownlinkError::Truncated { opcode: 0x01 };
        assert_eq!(e.to_string(), "Downlink truncated in opcode 0x01");
        assert_eq!(
            DownlinkError::UnknownOpcode(0xAB).to_string(),
            "Unknown downlink opcode 0xAB"
        );
    }
}
