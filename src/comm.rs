//! Serial console transport: NDJSON status output and command input, plus
//! the line reader shared with the AT modem link.

use crate::protocol::{DeviceMessage, DownlinkCommand, HostCommand, RawCommand, MAX_MSG_LEN};
use crate::orchestrator::ScanType;

/// Serial baud rate
pub const SERIAL_BAUD: u32 = 115200;

// ── Serialization helpers ──────────────────────────────────────────────

/// Serialize a DeviceMessage to JSON bytes and write to the output buffer.
/// Returns the number of bytes written, or None if serialization failed.
pub fn serialize_message(msg: &DeviceMessage, buf: &mut [u8]) -> Option<usize> {
    match serde_json_core::to_slice(msg, buf) {
        Ok(len) => {
            // Append newline for NDJSON
            if len < buf.len() {
                buf[len] = b'\n';
                Some(len + 1)
            } else {
                Some(len)
            }
        }
        Err(_) => None,
    }
}

/// Deserialize a console command from a JSON line.
///
/// ```text
/// {"cmd":"status"}
/// {"cmd":"track"}
/// {"cmd":"suspend"}
/// {"cmd":"interval","minutes":30}
/// {"cmd":"scan_type","scan_type":7}
/// {"cmd":"accel","enabled":true}
/// {"cmd":"test_mode","enabled":false}
/// ```
pub fn parse_command(data: &[u8]) -> Option<HostCommand> {
    let trimmed = trim_trailing_whitespace(data);
    if trimmed.is_empty() {
        return None;
    }
    let (raw, _) = serde_json_core::from_slice::<RawCommand>(trimmed).ok()?;
    let cmd = match raw.cmd.as_str() {
        "status" => HostCommand::GetStatus,
        "track" => HostCommand::Track,
        "suspend" => HostCommand::Suspend,
        "interval" => match raw.minutes? {
            0 => return None,
            minutes => HostCommand::Configure(DownlinkCommand::SetInterval { minutes }),
        },
        "scan_type" => {
            let scan_type = ScanType::try_from(raw.scan_type?).ok()?;
            HostCommand::Configure(DownlinkCommand::SetScanType(scan_type))
        }
        "accel" => HostCommand::Configure(DownlinkCommand::SetAccel(raw.enabled?)),
        "test_mode" => HostCommand::Configure(DownlinkCommand::SetTestMode(raw.enabled?)),
        other => {
            log::warn!("Unknown console command: {}", other);
            return None;
        }
    };
    Some(cmd)
}

// ── Line reader ────────────────────────────────────────────────────────

/// Line accumulator for serial streams.
/// Accumulates bytes until a newline is found, then yields the line.
pub struct LineReader<const N: usize = MAX_MSG_LEN> {
    buf: [u8; N],
    pos: usize,
}

impl<const N: usize> LineReader<N> {
    pub const fn new() -> Self {
        Self { buf: [0; N], pos: 0 }
    }

    /// Feed a byte into the reader. Returns a complete line (without newline)
    /// when one is detected.
    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\n' || byte == b'\r' {
            if self.pos > 0 {
                let line = &self.buf[..self.pos];
                self.pos = 0;
                Some(line)
            } else {
                None
            }
        } else if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            // Overflow: discard and reset
            self.pos = 0;
            None
        }
    }
}

impl<const N: usize> Default for LineReader<N> {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_trailing_whitespace(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && matches!(data[end - 1], b' ' | b'\n' | b'\r' | b'\t') {
        end -= 1;
    }
    &data[..end]
}
