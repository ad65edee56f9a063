//! Tracker application core
//!
//! [`Tracker`] owns every piece of mutable state: configuration, the scan
//! orchestrator, the uplink gate and the beacon. Modem reports, alarms and
//! user input arrive as [`TrackerEvent`]s and are consumed by one
//! [`Tracker::dispatch`], so nothing here needs a lock.

use heapless::Vec;

use crate::beacon::BeaconState;
use crate::config::{
    TrackerConfig, APP_PORT, JOINED_FIRST_ALARM_SECS, MAX_UPLINK_LEN, USER_TRIGGER_DELAY_SECS,
};
use crate::encoder::EventState;
use crate::error::TrackerError;
use crate::orchestrator::{Phase, ScanOrchestrator, Uplink};
use crate::platform::{Alarm, Cue, Hardware, LoraRadio};
use crate::protocol::{decode_downlink, DeviceMessage, DownlinkCommand, VERSION};
use crate::uplink::{InFlight, TxStatus, UplinkGate};

/// Largest downlink payload carried by an event.
pub const MAX_DOWNLINK_LEN: usize = MAX_UPLINK_LEN;

/// Everything that can wake the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    /// Modem came out of reset; start joining.
    Reset,
    /// OTAA join accepted.
    Joined,
    /// OTAA join attempt failed.
    JoinFailed,
    /// The armed alarm expired.
    Alarm,
    /// The modem finished a transmission.
    TxDone { status: TxStatus },
    /// The network sent data in a receive window.
    Downlink {
        port: u8,
        rssi: i16,
        snr: i8,
        payload: Vec<u8, MAX_DOWNLINK_LEN>,
    },
    /// Button press or console request for an immediate campaign.
    UserTrigger { event: EventState },
    /// Leave the network and stop tracking.
    Suspend,
}

pub struct Tracker<H: Hardware> {
    hw: H,
    config: TrackerConfig,
    orchestrator: ScanOrchestrator,
    gate: UplinkGate,
    beacon: BeaconState,
    event: EventState,
    joined: bool,
}

impl<H: Hardware> Tracker<H> {
    pub fn new(hw: H, config: TrackerConfig, beacon: BeaconState) -> Self {
        Self {
            hw,
            config,
            orchestrator: ScanOrchestrator::new(),
            gate: UplinkGate::new(),
            beacon,
            event: EventState::NONE,
            joined: false,
        }
    }

    pub fn hardware(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn event_state(&self) -> EventState {
        self.event
    }

    pub fn beacon(&self) -> &BeaconState {
        &self.beacon
    }

    pub fn orchestrator(&self) -> &ScanOrchestrator {
        &self.orchestrator
    }

    pub fn gate(&self) -> &UplinkGate {
        &self.gate
    }

    /// Handle one event. Returns the uplink handed to the modem while
    /// handling it, if any.
    ///
    /// A `TrackerError` means the modem API failed; the caller is expected
    /// to reset the device.
    pub fn dispatch(&mut self, event: TrackerEvent) -> Result<Option<InFlight>, TrackerError> {
        let submitted = self.gate.submitted();

        match event {
            TrackerEvent::Reset => {
                log::info!("Modem reset, joining network");
                self.orchestrator.abandon(&mut self.hw);
                self.gate.reset();
                self.joined = false;
                self.hw.indicate(Cue::BootUp);
                self.hw.radio().join()?;
            }
            TrackerEvent::Joined => {
                log::info!("Network joined");
                self.joined = true;
                self.beacon.start(self.hw.beacon());
                self.hw.indicate(Cue::Joined);
                self.hw.alarm().start(JOINED_FIRST_ALARM_SECS);
            }
            TrackerEvent::JoinFailed => {
                log::warn!("Join failed, retrying");
                self.hw.radio().join()?;
            }
            TrackerEvent::Alarm => self.on_alarm()?,
            TrackerEvent::TxDone { status } => self.on_tx_done(status),
            TrackerEvent::Downlink {
                port,
                rssi,
                snr,
                payload,
            } => {
                log::info!(
                    "Downlink received: port {}, {} bytes, RSSI {} dBm, SNR {} dB",
                    port,
                    payload.len(),
                    rssi,
                    snr
                );
                if port == APP_PORT && !payload.is_empty() {
                    self.on_config_downlink(&payload);
                }
            }
            TrackerEvent::UserTrigger { event } => self.trigger(event),
            TrackerEvent::Suspend => {
                log::info!("Suspending: leaving network");
                self.hw.alarm().clear();
                self.orchestrator.abandon(&mut self.hw);
                self.gate.reset();
                self.event = EventState::NONE;
                self.joined = false;
                self.hw.radio().leave_network()?;
            }
        }

        if self.gate.submitted() != submitted {
            Ok(self.gate.in_flight().copied())
        } else {
            Ok(None)
        }
    }

    /// Apply one configuration command, as from a downlink or the console.
    pub fn configure(&mut self, cmd: DownlinkCommand) {
        match cmd {
            DownlinkCommand::TrackNow => self.trigger(EventState::NONE),
            other => other.apply(&mut self.config),
        }
    }

    fn on_alarm(&mut self) -> Result<(), TrackerError> {
        if !self.joined {
            log::warn!("Alarm while not joined, ignored");
            return Ok(());
        }
        let uplink = Uplink {
            gate: &mut self.gate,
            beacon: &mut self.beacon,
            event: self.event,
        };
        self.orchestrator.tick(&mut self.hw, &self.config, uplink)
    }

    fn on_tx_done(&mut self, status: TxStatus) {
        let done = self.gate.on_tx_done(&mut self.hw, &mut self.beacon, status);
        if status == TxStatus::Acked && self.event.is_emergency() {
            log::info!("Emergency uplink acknowledged");
            self.hw.indicate(Cue::EmergencyAcked);
        }
        if done.is_none() {
            log::debug!("Tx done without a tracked uplink");
        }
        self.event = EventState::NONE;
    }

    fn on_config_downlink(&mut self, payload: &[u8]) {
        match decode_downlink(payload) {
            Ok(commands) => {
                for cmd in commands {
                    self.configure(cmd);
                }
            }
            Err(e) => log::warn!("{}", e),
        }
    }

    /// Start a campaign one second from now. The event state is recorded even
    /// when a campaign is already running, so that campaign reports it.
    fn trigger(&mut self, event: EventState) {
        if !self.orchestrator.is_active() && !self.joined {
            self.event = EventState::NONE;
            log::warn!("Not joined, skipping new tracking");
            return;
        }
        self.event = event;
        if self.orchestrator.is_active() {
            log::info!("Tracking already in progress, skipping new one");
            return;
        }
        self.hw.alarm().clear();
        self.hw.alarm().start(USER_TRIGGER_DELAY_SECS);
        log::info!("Tracking requested, new alarm {} s", USER_TRIGGER_DELAY_SECS);
    }

    /// Name of the current campaign phase for status reports.
    pub fn phase_name(&self) -> &'static str {
        match self.orchestrator.phase() {
            Phase::Idle => "idle",
            Phase::Stage(_) => "scanning",
            Phase::Ready => "sending",
        }
    }

    pub fn status(&self, uptime: u32, board: &'static str) -> DeviceMessage<'_> {
        DeviceMessage::Status {
            joined: self.joined,
            phase: self.phase_name(),
            pending: self.orchestrator.pending(),
            uplinks: self.gate.uplink_count(),
            beacon: self.beacon.is_active(),
            uptime,
            board,
            version: VERSION,
            config: &self.config,
        }
    }
}

/// Report for an uplink handed to the modem.
pub fn uplink_message(sent: &InFlight) -> DeviceMessage<'static> {
    DeviceMessage::Uplink {
        kind: sent.kind.as_str(),
        len: sent.len,
        confirmed: sent.confirmed,
        emergency: sent.emergency,
    }
}
