//! Scan campaign orchestrator
//!
//! One alarm tick performs at most one phase transition. A campaign walks
//! the stage list of its [`ScanType`], collects each source into its
//! [`ResultBuffer`], and once terminal hands the highest-precedence evidence
//! to the encoder and uplink gate. Every tick leaves exactly one alarm armed.

use serde::Serialize;

use crate::beacon::BeaconState;
use crate::config::{
    PacketPolicy, TrackerConfig, MAX_PENDING_RESULTS, RESULT_CAPACITY, RETRY_INTERVAL_SECS,
};
use crate::encoder::{encode, EventState, TelemetrySnapshot};
use crate::error::{ScanError, SendError, TrackerError};
use crate::evidence::{Evidence, ResultBuffer};
use crate::platform::{Alarm, Hardware, SourceKind};
use crate::uplink::UplinkGate;

use SourceKind::{Ble, Gnss, Wifi};

/// Which sources a campaign runs, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ScanType {
    Gnss = 0,
    Wifi = 1,
    WifiGnss = 2,
    GnssWifi = 3,
    Ble = 4,
    BleWifi = 5,
    BleGnss = 6,
    BleWifiGnss = 7,
}

impl ScanType {
    /// Stage sequence for this combination.
    pub fn stages(self) -> &'static [SourceKind] {
        match self {
            ScanType::Gnss => &[Gnss],
            ScanType::Wifi => &[Wifi],
            ScanType::WifiGnss => &[Wifi, Gnss],
            ScanType::GnssWifi => &[Gnss, Wifi],
            ScanType::Ble => &[Ble],
            ScanType::BleWifi => &[Ble, Wifi],
            ScanType::BleGnss => &[Ble, Gnss],
            ScanType::BleWifiGnss => &[Ble, Wifi, Gnss],
        }
    }

    /// Whether any stage drives `kind`.
    pub fn uses(self, kind: SourceKind) -> bool {
        self.stages().contains(&kind)
    }
}

impl TryFrom<u8> for ScanType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ScanType::Gnss,
            1 => ScanType::Wifi,
            2 => ScanType::WifiGnss,
            3 => ScanType::GnssWifi,
            4 => ScanType::Ble,
            5 => ScanType::BleWifi,
            6 => ScanType::BleGnss,
            7 => ScanType::BleWifiGnss,
            other => return Err(other),
        })
    }
}

/// Where the live campaign stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Stage `n` of the scan type's sequence is running.
    Stage(u8),
    /// All scanning is done; results are being sent.
    Ready,
}

/// The uplink side of a send step.
pub struct Uplink<'a> {
    pub gate: &'a mut UplinkGate,
    pub beacon: &'a mut BeaconState,
    pub event: EventState,
}

pub struct ScanOrchestrator {
    phase: Phase,
    scan_type: ScanType,
    started_at: u32,
    pending: u8,
    gnss: ResultBuffer,
    wifi: ResultBuffer,
    ble: ResultBuffer,
}

impl ScanOrchestrator {
    pub const fn new() -> Self {
        Self {
            phase: Phase::Idle,
            scan_type: ScanType::BleWifiGnss,
            started_at: 0,
            pending: 0,
            gnss: ResultBuffer::new(Gnss, 1),
            wifi: ResultBuffer::new(Wifi, 0),
            ble: ResultBuffer::new(Ble, 0),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Distinct non-empty sources still waiting to be sent.
    pub fn pending(&self) -> u8 {
        self.pending
    }

    pub fn buffer(&self, kind: SourceKind) -> &ResultBuffer {
        match kind {
            Gnss => &self.gnss,
            Wifi => &self.wifi,
            Ble => &self.ble,
        }
    }

    fn buffer_mut(&mut self, kind: SourceKind) -> &mut ResultBuffer {
        match kind {
            Gnss => &mut self.gnss,
            Wifi => &mut self.wifi,
            Ble => &mut self.ble,
        }
    }

    /// Begin a campaign with the configured scan type. Returns `false` and
    /// leaves the running campaign untouched if one is active.
    pub fn start<H: Hardware + ?Sized>(&mut self, hw: &mut H, config: &TrackerConfig) -> bool {
        if self.is_active() {
            log::info!("Tracking already in progress, skipping new campaign");
            return false;
        }

        self.scan_type = config.scan_type;
        self.started_at = hw.alarm().now_secs();
        self.pending = 0;
        self.gnss.clear();
        self.wifi.clear();
        self.wifi.set_max_records(config.wifi_max_records);
        self.ble.clear();
        self.ble.set_max_records(config.ble_max_records);

        let first = self.scan_type.stages()[0];
        let delay = stage_secs(config, first);
        begin_source(hw, first);
        hw.alarm().start(delay);
        self.phase = Phase::Stage(0);
        log::info!("{} begin, new alarm {} s", first.as_str(), delay);
        true
    }

    /// Advance the campaign by one alarm. Idle starts a new campaign.
    ///
    /// Only a modem API failure escapes; it leaves no alarm armed.
    pub fn tick<H: Hardware + ?Sized>(
        &mut self,
        hw: &mut H,
        config: &TrackerConfig,
        uplink: Uplink<'_>,
    ) -> Result<(), TrackerError> {
        match self.phase {
            Phase::Idle => {
                self.start(hw, config);
                Ok(())
            }
            Phase::Stage(index) => {
                let stages = self.scan_type.stages();
                let index = index as usize;
                let kind = stages[index];
                let found = self.collect(hw, kind);

                let short_circuit = found && stages.len() > 1 && !config.test_mode;
                match stages.get(index + 1) {
                    Some(&next) if !short_circuit => {
                        let delay = stage_secs(config, next);
                        begin_source(hw, next);
                        hw.alarm().start(delay);
                        self.phase = Phase::Stage(index as u8 + 1);
                        log::info!(
                            "{} end, {} begin, new alarm {} s",
                            kind.as_str(),
                            next.as_str(),
                            delay
                        );
                        Ok(())
                    }
                    _ => {
                        log::info!("{} end", kind.as_str());
                        self.phase = Phase::Ready;
                        self.send(hw, config, uplink)
                    }
                }
            }
            Phase::Ready => self.send(hw, config, uplink),
        }
    }

    /// Drop the campaign without sending anything. The running source is
    /// stopped; the caller owns the alarm.
    pub fn abandon<H: Hardware + ?Sized>(&mut self, hw: &mut H) {
        if let Phase::Stage(index) = self.phase {
            let kind = self.scan_type.stages()[index as usize];
            if hw.source(kind).stop().is_err() {
                log::warn!("{} stop failed", kind.as_str());
            }
        }
        if self.is_active() {
            log::info!("Campaign abandoned");
        }
        self.phase = Phase::Idle;
        self.pending = 0;
        self.gnss.clear();
        self.wifi.clear();
        self.ble.clear();
    }

    /// Stop `kind` and move its results into the buffer. Returns whether
    /// any evidence was kept.
    fn collect<H: Hardware + ?Sized>(&mut self, hw: &mut H, kind: SourceKind) -> bool {
        let source = hw.source(kind);
        if source.stop().is_err() {
            log::warn!("{} stop failed", kind.as_str());
        }

        let mut raw = [0u8; RESULT_CAPACITY];
        let buffer = self.buffer_mut(kind);
        match source.results(&mut raw) {
            Ok(n) => buffer.fill(&raw[..n.min(RESULT_CAPACITY)]),
            Err(ScanError::NoFix) => {
                log::warn!("{}", ScanError::NoFix);
                buffer.clear();
            }
            Err(e) => {
                log::warn!("{} results unavailable: {}", kind.as_str(), e);
                buffer.clear();
            }
        }

        let found = !buffer.is_empty();
        if found {
            log::info!(
                "{}: {} bytes, {} records",
                kind.as_str(),
                buffer.len(),
                buffer.record_count()
            );
            self.pending = (self.pending + 1).min(MAX_PENDING_RESULTS);
        }
        found
    }

    /// Highest-precedence evidence still queued: GNSS, then WiFi, then BLE.
    pub fn evidence(&self) -> Evidence<'_> {
        [&self.gnss, &self.wifi, &self.ble]
            .into_iter()
            .map(Evidence::from_buffer)
            .find(|e| e.kind().is_some())
            .unwrap_or(Evidence::None)
    }

    /// Terminal step: encode one frame, try to send it, and arm the next
    /// wake-up.
    fn send<H: Hardware + ?Sized>(
        &mut self,
        hw: &mut H,
        config: &TrackerConfig,
        uplink: Uplink<'_>,
    ) -> Result<(), TrackerError> {
        let event = uplink.event;
        let snapshot = TelemetrySnapshot::capture(hw.sensors(), config.accel_enabled, event);
        uplink
            .beacon
            .update(hw.beacon(), &snapshot, event.is_emergency());

        let evidence = self.evidence();
        let sent_kind = evidence.kind();
        let frame = encode(config.accel_enabled, evidence, &snapshot);
        if sent_kind.is_none() {
            self.pending = 1;
        }

        let confirmed = config.packet_policy == PacketPolicy::Confirmed || event.is_emergency();
        match uplink
            .gate
            .try_send(hw, uplink.beacon, &frame, confirmed, event.is_emergency())
        {
            Ok(()) => {
                if let Some(kind) = sent_kind {
                    self.buffer_mut(kind).clear();
                }
                self.pending = self.pending.saturating_sub(1);
            }
            Err(SendError::Modem(e)) => {
                log::error!("Uplink request failed: {}", e);
                return Err(e.into());
            }
            Err(e) => log::warn!("{}", e),
        }

        let alarm = hw.alarm();
        if self.pending > 0 {
            alarm.start(RETRY_INTERVAL_SECS);
            log::info!("Next send, new alarm {} s", RETRY_INTERVAL_SECS);
        } else {
            let elapsed = alarm.now_secs().wrapping_sub(self.started_at);
            let delay = config.periodic_interval_secs().saturating_sub(elapsed).max(1);
            alarm.start(delay);
            self.phase = Phase::Idle;
            log::info!("Send end, new alarm {} s", delay);
        }
        Ok(())
    }
}

impl Default for ScanOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

fn stage_secs(config: &TrackerConfig, kind: SourceKind) -> u32 {
    let secs = match kind {
        Gnss => config.gnss_scan_secs,
        Wifi => config.wifi_scan_secs,
        Ble => config.ble_scan_secs,
    };
    secs.max(1)
}

fn begin_source<H: Hardware + ?Sized>(hw: &mut H, kind: SourceKind) {
    if let Err(e) = hw.source(kind).begin() {
        log::warn!("{} begin failed: {}", kind.as_str(), e);
    }
}
