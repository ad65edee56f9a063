//! AT-command LoRaWAN modem driver (Wio-E5 command set)
//!
//! The driver does no I/O. The firmware writes whatever [`AtModem::next_command`]
//! yields to the modem UART and hands every response line back through
//! [`AtModem::on_line`], which turns the interesting ones into
//! [`TrackerEvent`]s. One command is outstanding at a time; the rest wait in a
//! small queue, with emergency uplinks jumping to the front.
//!
//! ```text
//! > AT+JOIN                      < +JOIN: Network joined / +JOIN: Done
//! > AT+PORT=5                    < +PORT: 5
//! > AT+CMSGHEX="0100500..."      < +CMSGHEX: ACK Received / +CMSGHEX: Done
//! > AT+LW=LEN                    < +LW: LEN, 51
//! ```

use core::fmt::Write;

use heapless::{Deque, String, Vec};

use crate::error::ModemError;
use crate::platform::LoraRadio;
use crate::tracker::{TrackerEvent, MAX_DOWNLINK_LEN};
use crate::uplink::TxStatus;

/// Modem UART baud rate
pub const MODEM_BAUD: u32 = 9600;

/// Longest command line: `AT+CMSGHEX="<484 hex digits>"\r\n`
pub const AT_LINE_LEN: usize = 512;

/// Commands waiting behind the outstanding one.
pub const COMMAND_QUEUE_LEN: usize = 4;

/// Payload limit assumed until the modem reports one (EU868 DR0).
pub const DEFAULT_MAX_PAYLOAD: u8 = 51;

/// Pause between failed join attempts.
pub const JOIN_BACKOFF_MS: u64 = 10_000;

/// Give up on a command with no terminal response after this long.
const JOIN_TIMEOUT_MS: u64 = 30_000;
const MSG_TIMEOUT_MS: u64 = 60_000;
const SHORT_TIMEOUT_MS: u64 = 2_000;

/// A modem command, formatted on the way out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtCommand {
    Join,
    Port(u8),
    Msg {
        confirmed: bool,
        payload: Vec<u8, MAX_DOWNLINK_LEN>,
    },
    /// Frame with no application payload, used to flush MAC commands.
    Empty { confirmed: bool },
    QueryLen,
    LowPower,
}

impl AtCommand {
    /// Format the command line, CRLF included.
    pub fn write_to(&self, out: &mut String<AT_LINE_LEN>) -> Result<(), core::fmt::Error> {
        out.clear();
        match self {
            AtCommand::Join => out.push_str("AT+JOIN").map_err(|_| core::fmt::Error)?,
            AtCommand::Port(port) => write!(out, "AT+PORT={}", port)?,
            AtCommand::Msg { confirmed, payload } => {
                out.push_str(if *confirmed { "AT+CMSGHEX=\"" } else { "AT+MSGHEX=\"" })
                    .map_err(|_| core::fmt::Error)?;
                for b in payload {
                    write!(out, "{:02X}", b)?;
                }
                out.push('"').map_err(|_| core::fmt::Error)?;
            }
            AtCommand::Empty { confirmed } => out
                .push_str(if *confirmed { "AT+CMSG" } else { "AT+MSG" })
                .map_err(|_| core::fmt::Error)?,
            AtCommand::QueryLen => out.push_str("AT+LW=LEN").map_err(|_| core::fmt::Error)?,
            AtCommand::LowPower => out.push_str("AT+LOWPOWER").map_err(|_| core::fmt::Error)?,
        }
        out.push_str("\r\n").map_err(|_| core::fmt::Error)
    }

    fn timeout_ms(&self) -> u64 {
        match self {
            AtCommand::Join => JOIN_TIMEOUT_MS,
            AtCommand::Msg { .. } | AtCommand::Empty { .. } => MSG_TIMEOUT_MS,
            _ => SHORT_TIMEOUT_MS,
        }
    }

    fn is_uplink(&self) -> bool {
        matches!(self, AtCommand::Msg { .. } | AtCommand::Empty { .. })
    }

    fn confirmed(&self) -> bool {
        matches!(
            self,
            AtCommand::Msg { confirmed: true, .. } | AtCommand::Empty { confirmed: true }
        )
    }
}

/// A recognised modem response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemReport {
    Joined,
    JoinFailed,
    JoinDone,
    Acked,
    MsgDone,
    /// Duty-cycle ban: no sub-band free for `wait_ms`.
    NoBand { wait_ms: u32 },
    RxInfo { rssi: i16, snr: i8 },
    Rx {
        port: u8,
        payload: Vec<u8, MAX_DOWNLINK_LEN>,
    },
    MaxPayload(u8),
    PortSet,
    Sleep,
    NotJoined,
    Busy,
    Error(i16),
}

/// Classify one response line. Unknown and informational lines yield `None`.
pub fn parse_line(line: &str) -> Option<ModemReport> {
    let (tag, body) = line.trim().split_once(": ")?;
    match tag {
        "+JOIN" => match body {
            "Network joined" | "Joined already" => Some(ModemReport::Joined),
            "Done" => Some(ModemReport::JoinDone),
            _ if body.starts_with("Join failed") => Some(ModemReport::JoinFailed),
            _ => parse_common(body),
        },
        "+MSG" | "+CMSG" | "+MSGHEX" | "+CMSGHEX" => match body {
            "Done" => Some(ModemReport::MsgDone),
            "ACK Received" => Some(ModemReport::Acked),
            "Please join network first" => Some(ModemReport::NotJoined),
            _ if body.starts_with("No band in ") => {
                let ms = body["No band in ".len()..].trim_end_matches("ms");
                Some(ModemReport::NoBand {
                    wait_ms: ms.parse().ok()?,
                })
            }
            _ if body.starts_with("RXWIN") => parse_rx_info(body),
            _ if body.starts_with("PORT: ") => parse_rx(body),
            _ => parse_common(body),
        },
        "+LW" => {
            let len = body.strip_prefix("LEN, ")?;
            Some(ModemReport::MaxPayload(len.trim().parse().ok()?))
        }
        "+PORT" => Some(ModemReport::PortSet),
        "+LOWPOWER" => Some(ModemReport::Sleep),
        _ => None,
    }
}

fn parse_common(body: &str) -> Option<ModemReport> {
    if body.starts_with("LoRaWAN modem is busy") {
        return Some(ModemReport::Busy);
    }
    let code = body.strip_prefix("ERROR(")?.strip_suffix(')')?;
    Some(ModemReport::Error(code.parse().ok()?))
}

/// `RXWIN1, RSSI -45, SNR 9.5`
fn parse_rx_info(body: &str) -> Option<ModemReport> {
    let mut rssi = None;
    let mut snr = None;
    for field in body.split(", ") {
        if let Some(v) = field.strip_prefix("RSSI ") {
            rssi = v.parse().ok();
        } else if let Some(v) = field.strip_prefix("SNR ") {
            let whole = v.split('.').next().unwrap_or(v);
            snr = whole.parse().ok();
        }
    }
    Some(ModemReport::RxInfo {
        rssi: rssi?,
        snr: snr.unwrap_or(0),
    })
}

/// `PORT: 5; RX: "0102AB"`
fn parse_rx(body: &str) -> Option<ModemReport> {
    let (port, rx) = body.strip_prefix("PORT: ")?.split_once("; RX: ")?;
    let hex = rx.trim().strip_prefix('"')?.strip_suffix('"')?;
    Some(ModemReport::Rx {
        port: port.trim().parse().ok()?,
        payload: decode_hex(hex)?,
    })
}

fn decode_hex<const N: usize>(hex: &str) -> Option<Vec<u8, N>> {
    let digits = hex.as_bytes();
    if digits.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::new();
    for pair in digits.chunks_exact(2) {
        let byte = (nibble(pair[0])? << 4) | nibble(pair[1])?;
        out.push(byte).ok()?;
    }
    Some(out)
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[derive(Debug)]
struct Outstanding {
    command: AtCommand,
    deadline_ms: u64,
}

/// Modem session state plus the command queue.
pub struct AtModem {
    queue: Deque<AtCommand, COMMAND_QUEUE_LEN>,
    outstanding: Option<Outstanding>,
    port: Option<u8>,
    joined: bool,
    acked: bool,
    max_payload: u8,
    rx_info: (i16, i8),
    now_ms: u64,
    blocked_until_ms: u64,
    join_hold_until_ms: u64,
}

impl AtModem {
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
            outstanding: None,
            port: None,
            joined: false,
            acked: false,
            max_payload: DEFAULT_MAX_PAYLOAD,
            rx_info: (0, 0),
            now_ms: 0,
            blocked_until_ms: 0,
            join_hold_until_ms: 0,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding.is_none() && self.queue.is_empty()
    }

    /// Next command to write, if the modem is free for one.
    pub fn next_command(&mut self, now_ms: u64) -> Option<AtCommand> {
        self.now_ms = now_ms;
        if self.outstanding.is_some() {
            return None;
        }
        if matches!(self.queue.front(), Some(AtCommand::Join)) && now_ms < self.join_hold_until_ms
        {
            return None;
        }
        let command = self.queue.pop_front()?;
        if command.is_uplink() {
            self.acked = false;
        }
        self.outstanding = Some(Outstanding {
            command: command.clone(),
            deadline_ms: now_ms + command.timeout_ms(),
        });
        Some(command)
    }

    /// Expire an outstanding command the modem never answered.
    pub fn poll(&mut self, now_ms: u64) -> Option<TrackerEvent> {
        self.now_ms = now_ms;
        let expired = self
            .outstanding
            .as_ref()
            .is_some_and(|o| now_ms >= o.deadline_ms);
        if !expired {
            return None;
        }
        log::warn!("Modem command timed out");
        self.fail_outstanding()
    }

    /// Process one response line.
    pub fn on_line(&mut self, line: &[u8], now_ms: u64) -> Option<TrackerEvent> {
        self.now_ms = now_ms;
        let text = core::str::from_utf8(line).ok()?;
        let report = parse_line(text)?;
        log::debug!("modem: {:?}", report);

        match report {
            ModemReport::Joined => {
                // "Joined already" has no trailing Done
                self.finish(|c| matches!(c, AtCommand::Join));
                self.joined = true;
                self.enqueue_back(AtCommand::QueryLen);
                Some(TrackerEvent::Joined)
            }
            ModemReport::JoinFailed => {
                self.join_hold_until_ms = now_ms + JOIN_BACKOFF_MS;
                Some(TrackerEvent::JoinFailed)
            }
            ModemReport::JoinDone => {
                self.finish(|c| matches!(c, AtCommand::Join));
                None
            }
            ModemReport::Acked => {
                self.acked = true;
                None
            }
            ModemReport::MsgDone => {
                let done = self.finish(AtCommand::is_uplink)?;
                // Payload limit follows the data rate, which ADR may have changed
                self.enqueue_back(AtCommand::QueryLen);
                let status = match (done.confirmed(), self.acked) {
                    (false, _) => TxStatus::Sent,
                    (true, true) => TxStatus::Acked,
                    (true, false) => TxStatus::NotAcked,
                };
                Some(TrackerEvent::TxDone { status })
            }
            ModemReport::NoBand { wait_ms } => {
                self.blocked_until_ms = now_ms + u64::from(wait_ms);
                log::warn!("Duty-cycle limitation, next possible uplink in {} ms", wait_ms);
                None
            }
            ModemReport::RxInfo { rssi, snr } => {
                self.rx_info = (rssi, snr);
                None
            }
            ModemReport::Rx { port, payload } => Some(TrackerEvent::Downlink {
                port,
                rssi: self.rx_info.0,
                snr: self.rx_info.1,
                payload,
            }),
            ModemReport::MaxPayload(len) => {
                self.max_payload = len;
                self.finish(|c| matches!(c, AtCommand::QueryLen));
                None
            }
            ModemReport::PortSet => {
                if let Some(AtCommand::Port(port)) = self.finish(|c| matches!(c, AtCommand::Port(_))) {
                    self.port = Some(port);
                }
                None
            }
            ModemReport::Sleep => {
                self.finish(|c| matches!(c, AtCommand::LowPower));
                None
            }
            ModemReport::NotJoined => {
                self.joined = false;
                self.fail_outstanding()
            }
            ModemReport::Busy | ModemReport::Error(_) => self.fail_outstanding(),
        }
    }

    /// Clear the outstanding command if it matches.
    fn finish(&mut self, pred: impl Fn(&AtCommand) -> bool) -> Option<AtCommand> {
        if self.outstanding.as_ref().is_some_and(|o| pred(&o.command)) {
            self.outstanding.take().map(|o| o.command)
        } else {
            None
        }
    }

    /// The outstanding command failed. Uplinks still complete so the beacon
    /// resumes; joins are retried after the back-off.
    fn fail_outstanding(&mut self) -> Option<TrackerEvent> {
        let failed = self.outstanding.take()?.command;
        log::warn!("Modem command failed: {:?}", failed);
        match failed {
            AtCommand::Msg { .. } | AtCommand::Empty { .. } => Some(TrackerEvent::TxDone {
                status: TxStatus::NotAcked,
            }),
            AtCommand::Join => {
                self.join_hold_until_ms = self.now_ms + JOIN_BACKOFF_MS;
                Some(TrackerEvent::JoinFailed)
            }
            _ => None,
        }
    }

    fn enqueue_back(&mut self, command: AtCommand) {
        if self.queue.iter().any(|c| *c == command) {
            return;
        }
        if self.queue.push_back(command).is_err() {
            log::warn!("Modem command queue full");
        }
    }

    fn free_slots(&self) -> usize {
        COMMAND_QUEUE_LEN - self.queue.len()
    }

    /// Port in effect for a command inserted at the head of the queue.
    fn port_at_front(&self) -> Option<u8> {
        match self.outstanding {
            Some(Outstanding {
                command: AtCommand::Port(port),
                ..
            }) => Some(port),
            _ => self.port,
        }
    }

    /// Port in effect for a command appended to the queue.
    fn port_at_back(&self) -> Option<u8> {
        self.queue
            .iter()
            .rev()
            .find_map(|c| match c {
                AtCommand::Port(port) => Some(*port),
                _ => None,
            })
            .or_else(|| self.port_at_front())
    }
}

impl Default for AtModem {
    fn default() -> Self {
        Self::new()
    }
}

impl LoraRadio for AtModem {
    /// The module reports bans, not budgets: zero unless a ban is running.
    fn duty_cycle_remaining_ms(&mut self) -> Result<i32, ModemError> {
        if self.now_ms < self.blocked_until_ms {
            let wait = (self.blocked_until_ms - self.now_ms).min(i32::MAX as u64) as i32;
            Ok(-wait)
        } else {
            Ok(0)
        }
    }

    fn max_payload(&mut self) -> Result<u8, ModemError> {
        if !self.joined {
            return Err(ModemError::NotJoined);
        }
        Ok(self.max_payload)
    }

    fn submit(
        &mut self,
        port: u8,
        payload: &[u8],
        confirmed: bool,
        emergency: bool,
    ) -> Result<(), ModemError> {
        if !self.joined {
            return Err(ModemError::NotJoined);
        }
        let needs_port = if emergency {
            self.port_at_front() != Some(port)
        } else {
            self.port_at_back() != Some(port)
        };
        if self.free_slots() < 1 + usize::from(needs_port) {
            return Err(ModemError::Busy);
        }
        let msg = AtCommand::Msg {
            confirmed,
            payload: Vec::from_slice(payload).map_err(|_| ModemError::Rejected)?,
        };

        if emergency {
            self.queue.push_front(msg).map_err(|_| ModemError::Busy)?;
            if needs_port {
                self.queue
                    .push_front(AtCommand::Port(port))
                    .map_err(|_| ModemError::Busy)?;
            }
        } else {
            if needs_port {
                self.queue
                    .push_back(AtCommand::Port(port))
                    .map_err(|_| ModemError::Busy)?;
            }
            self.queue.push_back(msg).map_err(|_| ModemError::Busy)?;
        }
        Ok(())
    }

    fn request_empty_uplink(&mut self, port: u8, confirmed: bool) -> Result<(), ModemError> {
        if !self.joined {
            return Err(ModemError::NotJoined);
        }
        let needs_port = self.port_at_back() != Some(port);
        if self.free_slots() < 1 + usize::from(needs_port) {
            return Err(ModemError::Busy);
        }
        if needs_port {
            self.queue
                .push_back(AtCommand::Port(port))
                .map_err(|_| ModemError::Busy)?;
        }
        self.queue
            .push_back(AtCommand::Empty { confirmed })
            .map_err(|_| ModemError::Busy)

    }

    fn join(&mut self) -> Result<(), ModemError> {
        self.joined = false;
        if self.queue.iter().any(|c| *c == AtCommand::Join) {
            return Ok(());
        }
        self.queue.push_back(AtCommand::Join).map_err(|_| ModemError::Busy)
    }

    fn leave_network(&mut self) -> Result<(), ModemError> {
        self.queue.clear();
        self.joined = false;
        self.port = None;
        self.queue
            .push_back(AtCommand::LowPower)
            .map_err(|_| ModemError::Busy)
    }
}
