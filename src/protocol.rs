//! Console and downlink protocols.
//!
//! Status and uplink reports go out as newline-delimited JSON (NDJSON) on the
//! serial console, as do console commands coming in. Configuration downlinks
//! on the application port use a compact binary opcode format.
//! Uses `heapless` types for no_std/no-alloc operation.

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::config::TrackerConfig;
use crate::error::DownlinkError;
use crate::orchestrator::ScanType;

/// Messages sent from the device on the serial console
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum DeviceMessage<'a> {
    /// Device status report
    #[serde(rename = "status")]
    Status {
        joined: bool,
        /// Current campaign phase: "idle", "scanning" or "sending"
        phase: &'static str,
        /// Evidence sources still queued for sending
        pending: u8,
        /// Completed uplinks since boot
        uplinks: u32,
        /// Beacon currently advertising
        beacon: bool,
        /// Uptime in seconds
        uptime: u32,
        /// Board identifier
        board: &'static str,
        /// Firmware version
        version: &'static str,
        config: &'a TrackerConfig,
    },
    /// An uplink was handed to the modem
    #[serde(rename = "uplink")]
    Uplink {
        kind: &'static str,
        len: usize,
        confirmed: bool,
        emergency: bool,
    },
    /// A downlink arrived
    #[serde(rename = "downlink")]
    Downlink {
        port: u8,
        rssi: i16,
        snr: i8,
        len: usize,
    },
}

/// Commands typed on the serial console.
///
/// Deserialized via [`RawCommand`] in `comm::parse_command()` because
/// `serde_json_core` does not support internally tagged enums (`deserialize_any`).
#[derive(Debug, PartialEq)]
pub enum HostCommand {
    /// Request current status
    GetStatus,
    /// Start a user-triggered (emergency) campaign
    Track,
    /// Leave the network and stop tracking
    Suspend,
    /// Apply a configuration command, same as a downlink would
    Configure(DownlinkCommand),
}

/// Wire format for console commands: a flat struct that `serde_json_core`
/// can deserialize without `deserialize_any`.
#[derive(Deserialize)]
pub(crate) struct RawCommand {
    pub cmd: heapless::String<16>,
    #[serde(default)]
    pub minutes: Option<u16>,
    #[serde(default)]
    pub scan_type: Option<u8>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Configuration commands carried by application-port downlinks.
///
/// Each command is an opcode byte followed by a fixed-size argument:
///
/// | opcode | argument | effect |
/// |---|---|---|
/// | `0x01` | u16 BE minutes | periodic interval |
/// | `0x02` | u8 | scan type (0-7) |
/// | `0x03` | u8 bool | accelerometer in frames |
/// | `0x04` | u8 bool | test mode |
/// | `0x05` | - | start tracking now |
///
/// A downlink may chain several commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkCommand {
    SetInterval { minutes: u16 },
    SetScanType(ScanType),
    SetAccel(bool),
    SetTestMode(bool),
    TrackNow,
}

pub const OP_SET_INTERVAL: u8 = 0x01;
pub const OP_SET_SCAN_TYPE: u8 = 0x02;
pub const OP_SET_ACCEL: u8 = 0x03;
pub const OP_SET_TEST_MODE: u8 = 0x04;
pub const OP_TRACK_NOW: u8 = 0x05;

/// Most commands accepted from one downlink
pub const MAX_DOWNLINK_COMMANDS: usize = 8;

impl DownlinkCommand {
    /// Apply a configuration change. `TrackNow` changes nothing here.
    pub fn apply(&self, config: &mut TrackerConfig) {
        match *self {
            DownlinkCommand::SetInterval { minutes } => {
                config.periodic_interval_min = minutes;
                log::info!("Periodic interval set to {} min", minutes);
            }
            DownlinkCommand::SetScanType(scan_type) => {
                config.scan_type = scan_type;
                log::info!("Scan type set to {:?}", scan_type);
            }
            DownlinkCommand::SetAccel(enabled) => {
                config.accel_enabled = enabled;
                log::info!("Accelerometer {}", if enabled { "enabled" } else { "disabled" });
            }
            DownlinkCommand::SetTestMode(enabled) => {
                config.test_mode = enabled;
                log::info!("Test mode {}", if enabled { "on" } else { "off" });
            }
            DownlinkCommand::TrackNow => {}
        }
    }
}

/// Decode every command in a downlink payload. Nothing is returned unless
/// the whole payload parses.
pub fn decode_downlink(
    payload: &[u8],
) -> Result<Vec<DownlinkCommand, MAX_DOWNLINK_COMMANDS>, DownlinkError> {
    let mut commands = Vec::new();
    let mut rest = payload;

    while let Some((&op, args)) = rest.split_first() {
        let (cmd, used) = match op {
            OP_SET_INTERVAL => {
                let [hi, lo] = take::<2>(op, args)?;
                let minutes = u16::from_be_bytes([hi, lo]);
                if minutes == 0 {
                    return Err(DownlinkError::InvalidValue { opcode: op });
                }
                (DownlinkCommand::SetInterval { minutes }, 2)
            }
            OP_SET_SCAN_TYPE => {
                let [raw] = take::<1>(op, args)?;
                let scan_type = ScanType::try_from(raw)
                    .map_err(|_| DownlinkError::InvalidValue { opcode: op })?;
                (DownlinkCommand::SetScanType(scan_type), 1)
            }
            OP_SET_ACCEL => {
                let [raw] = take::<1>(op, args)?;
                (DownlinkCommand::SetAccel(raw != 0), 1)
            }
            OP_SET_TEST_MODE => {
                let [raw] = take::<1>(op, args)?;
                (DownlinkCommand::SetTestMode(raw != 0), 1)
            }
            OP_TRACK_NOW => (DownlinkCommand::TrackNow, 0),
            other => return Err(DownlinkError::UnknownOpcode(other)),
        };
        commands
            .push(cmd)
            .map_err(|_| DownlinkError::TooManyCommands)?;
        rest = &args[used..];
    }

    Ok(commands)
}

fn take<const N: usize>(opcode: u8, args: &[u8]) -> Result<[u8; N], DownlinkError> {
    args.get(..N)
        .and_then(|s| s.try_into().ok())
        .ok_or(DownlinkError::Truncated { opcode })
}

/// Firmware version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a serialized JSON message
pub const MAX_MSG_LEN: usize = 512;

/// Buffer type for serialized JSON messages
pub type MsgBuffer = Vec<u8, MAX_MSG_LEN>;

#[cfg(test)]
mod tests {
    use super::*;

    // ── Downlink decoding ───────────────────────────────────────────

    #[test]
    fn decode_single_commands() {
        assert_eq!(
            decode_downlink(&[0x01, 0x00, 0x1E]).unwrap().as_slice(),
            &[DownlinkCommand::SetInterval { minutes: 30 }]
        );
        assert_eq!(
            decode_downlink(&[0x02, 0x05]).unwrap().as_slice(),
            &[DownlinkCommand::SetScanType(ScanType::BleWifi)]
        );
        assert_eq!(
            decode_downlink(&[0x05]).unwrap().as_slice(),
            &[DownlinkCommand::TrackNow]
        );
    }

    #[test]
    fn decode_chained_commands() {
        let cmds = decode_downlink(&[0x03, 0x01, 0x04, 0x00, 0x01, 0x01, 0x2C]).unwrap();
        assert_eq!(
            cmds.as_slice(),
            &[
                DownlinkCommand::SetAccel(true),
                DownlinkCommand::SetTestMode(false),
                DownlinkCommand::SetInterval { minutes: 300 },
            ]
        );
    }

    #[test]
    fn decode_rejects_bad_payloads() {
        assert_eq!(
            decode_downlink(&[0x01, 0x00]),
            Err(DownlinkError::Truncated { opcode: 0x01 })
        );
        assert_eq!(
            decode_downlink(&[0x02, 0x09]),
            Err(DownlinkError::InvalidValue { opcode: 0x02 })
        );
        assert_eq!(
            decode_downlink(&[0x01, 0x00, 0x00]),
            Err(DownlinkError::InvalidValue { opcode: 0x01 })
        );
        assert_eq!(
            decode_downlink(&[0x05, 0x7F]),
            Err(DownlinkError::UnknownOpcode(0x7F))
        );
        assert_eq!(
            decode_downlink(&[0x05; MAX_DOWNLINK_COMMANDS + 1]),
            Err(DownlinkError::TooManyCommands)
        );
    }

    #[test]
    fn decode_empty_payload() {
        assert!(decode_downlink(&[]).unwrap().is_empty());
    }

    #[test]
    fn apply_updates_config() {
        let mut config = TrackerConfig::new();
        DownlinkCommand::SetInterval { minutes: 5 }.apply(&mut config);
        DownlinkCommand::SetScanType(ScanType::Gnss).apply(&mut config);
        DownlinkCommand::SetAccel(true).apply(&mut config);
        DownlinkCommand::SetTestMode(true).apply(&mut config);
        DownlinkCommand::TrackNow.apply(&mut config);
        assert_eq!(config.periodic_interval_secs(), 300);
        assert_eq!(config.scan_type, ScanType::Gnss);
        assert!(config.accel_enabled);
        assert!(config.test_mode);
    }

    // ── DeviceMessage serialization ─────────────────────────────────

    #[test]
    fn serialize_status_message() {
        let config = TrackerConfig::new();
        let msg = DeviceMessage::Status {
            joined: true,
            phase: "idle",
            pending: 0,
            uplinks: 3,
            beacon: true,
            uptime: 120,
            board: "test_board",
            version: "0.1.0",
            config: &config,
        };
        let mut buf = [0u8; 512];
        let len = serde_json_core::to_slice(&msg, &mut buf).unwrap();
        let json = core::str::from_utf8(&buf[..len]).unwrap();
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""joined":true"#));
        assert!(json.contains(r#""uplinks":3"#));
        assert!(json.contains(r#""board":"test_board""#));
        assert!(json.contains(r#""config":{"scan_type":"ble_wifi_gnss""#));
    }

    #[test]
    fn serialize_uplink_message() {
        let msg = DeviceMessage::Uplink {
            kind: "ble",
            len: 22,
            confirmed: false,
            emergency: false,
        };
        let mut buf = [0u8; 128];
        let len = serde_json_core::to_slice(&msg, &mut buf).unwrap();
        let json = core::str::from_utf8(&buf[..len]).unwrap();
        assert_eq!(
            json,
            r#"{"type":"uplink","kind":"ble","len":22,"confirmed":false,"emergency":false}"#
        );
    }

    #[test]
    fn serialize_downlink_message() {
        let msg = DeviceMessage::Downlink {
            port: 5,
            rssi: -45,
            snr: 9,
            len: 3,
        };
        let mut buf = [0u8; 128];
        let len = serde_json_core::to_slice(&msg, &mut buf).unwrap();
        let json = core::str::from_utf8(&buf[..len]).unwrap();
        assert!(json.contains(r#""type":"downlink""#));
        assert!(json.contains(r#""rssi":-45"#));
    }

    // ── Version constant ────────────────────────────────────────────

    #[test]
    fn version_is_semver() {
        let parts: heapless::Vec<&str, 4> = VERSION.split('.').collect();
        assert_eq!(
            parts.len(),
            3,
            "VERSION should be semver (major.minor.patch)"
        );
        for part in &parts {
            assert!(part.parse::<u32>().is_ok(), "'{part}' is not a number");
        }
    }
}
