//! Capability traits for the tracker's external collaborators
//!
//! The core never touches registers or radio stacks directly. Scan engines,
//! the LoRaWAN modem, the beacon advertiser, sensors and the alarm facility
//! are injected through these traits, so the whole state machine runs on the
//! host under `cargo test` with the recording mocks in `crate::mock`.

use crate::error::{ModemError, ScanError};

/// A location evidence engine (GNSS receiver, WiFi AP scan, BLE scan).
///
/// Engines may run asynchronously in hardware; the orchestrator only starts
/// them, stops them when the stage budget elapses, and polls the results.
pub trait ScanSource {
    /// Start collecting. Previous results are discarded.
    fn begin(&mut self) -> Result<(), ScanError>;

    /// Stop collecting. Results stay available until the next `begin`.
    fn stop(&mut self) -> Result<(), ScanError>;

    /// Copy raw results into `out`, returning the number of bytes written.
    fn results(&mut self, out: &mut [u8]) -> Result<usize, ScanError>;
}

/// The LoRaWAN modem runtime.
///
/// Transmit completion is not a callback here: the firmware turns the
/// modem's tx-done report into `TrackerEvent::TxDone`.
pub trait LoraRadio {
    /// Remaining duty-cycle budget in milliseconds. Negative means blocked
    /// for that many milliseconds.
    fn duty_cycle_remaining_ms(&mut self) -> Result<i32, ModemError>;

    /// Largest application payload the next uplink can carry.
    fn max_payload(&mut self) -> Result<u8, ModemError>;

    /// Queue an uplink. `emergency` selects the priority submission path.
    fn submit(
        &mut self,
        port: u8,
        payload: &[u8],
        confirmed: bool,
        emergency: bool,
    ) -> Result<(), ModemError>;

    /// Queue an empty uplink so pending MAC commands can be flushed.
    fn request_empty_uplink(&mut self, port: u8, confirmed: bool) -> Result<(), ModemError>;

    /// Start an OTAA join.
    fn join(&mut self) -> Result<(), ModemError>;

    /// Drop the session and suspend radio communications.
    fn leave_network(&mut self) -> Result<(), ModemError>;
}

/// Failure reported by the BLE advertiser. Logged, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertiseFault;

/// The short-range BLE advertiser carrying the beacon.
pub trait BeaconRadio {
    /// Replace advertising and scan-response data. Does not restart an
    /// ongoing advertising session.
    fn configure(&mut self, adv: &[u8], scan_rsp: &[u8]) -> Result<(), AdvertiseFault>;

    fn start(&mut self) -> Result<(), AdvertiseFault>;

    fn stop(&mut self) -> Result<(), AdvertiseFault>;
}

/// Board sensors sampled once per send.
pub trait Sensors {
    /// Battery level, 0-100 %
    fn battery_percent(&mut self) -> u8;

    /// Temperature in 0.1 °C
    fn temperature_decicelsius(&mut self) -> i16;

    /// Ambient light in lux
    fn light_lux(&mut self) -> u16;

    /// Raw accelerometer x/y/z in LSB, if an accelerometer is fitted.
    fn acceleration(&mut self) -> Option<[i16; 3]>;
}

/// One-shot wake-up facility. Arming replaces any pending alarm.
pub trait Alarm {
    /// Seconds since boot.
    fn now_secs(&self) -> u32;

    /// Arm the alarm `secs` seconds from now.
    fn start(&mut self, secs: u32);

    /// Cancel the pending alarm, if any.
    fn clear(&mut self);
}

/// Audible/visual cues the tracker asks the board to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    BootUp,
    Joined,
    /// The network acknowledged an emergency uplink.
    EmergencyAcked,
}

/// One buzzer step: sound for `on_ms`, then stay silent for `off_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tone {
    pub on_ms: u16,
    pub off_ms: u16,
}

const fn tone(on_ms: u16, off_ms: u16) -> Tone {
    Tone { on_ms, off_ms }
}

const BOOT_UP_TONES: &[Tone] = &[tone(80, 40), tone(80, 40), tone(200, 0)];
const JOINED_TONES: &[Tone] = &[tone(300, 0)];
const EMERGENCY_ACKED_TONES: &[Tone] = &[tone(60, 60), tone(60, 60), tone(60, 60), tone(60, 0)];

impl Cue {
    /// Beep pattern played by boards with a buzzer.
    pub fn tones(self) -> &'static [Tone] {
        match self {
            Cue::BootUp => BOOT_UP_TONES,
            Cue::Joined => JOINED_TONES,
            Cue::EmergencyAcked => EMERGENCY_ACKED_TONES,
        }
    }
}

/// Which evidence source a stage drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Gnss,
    Wifi,
    Ble,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Gnss => "gnss",
            SourceKind::Wifi => "wifi",
            SourceKind::Ble => "ble",
        }
    }
}

/// Aggregate of every collaborator the tracker needs.
///
/// Implementations provide concrete types via associated types, so the core
/// compiles to static dispatch on the target.
pub trait Hardware {
    type Gnss: ScanSource + 'static;
    type Wifi: ScanSource + 'static;
    type Ble: ScanSource + 'static;
    type Radio: LoraRadio;
    type Beacon: BeaconRadio;
    type Sensors: Sensors;
    type Alarm: Alarm;

    fn gnss(&mut self) -> &mut Self::Gnss;
    fn wifi(&mut self) -> &mut Self::Wifi;
    fn ble(&mut self) -> &mut Self::Ble;
    fn radio(&mut self) -> &mut Self::Radio;
    fn beacon(&mut self) -> &mut Self::Beacon;
    fn sensors(&mut self) -> &mut Self::Sensors;
    fn alarm(&mut self) -> &mut Self::Alarm;

    /// Play a cue. Boards without a buzzer or LED ignore it.
    fn indicate(&mut self, _cue: Cue) {}

    /// The scan engine behind `kind`.
    fn source(&mut self, kind: SourceKind) -> &mut dyn ScanSource {
        match kind {
            SourceKind::Gnss => self.gnss(),
            SourceKind::Wifi => self.wifi(),
            SourceKind::Ble => self.ble(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cues_are_distinguishable() {
        let cues = [Cue::BootUp, Cue::Joined, Cue::EmergencyAcked];
        for (i, a) in cues.iter().enumerate() {
            assert!(!a.tones().is_empty());
            for b in &cues[i + 1..] {
                assert_ne!(a.tones(), b.tones());
            }
        }
    }

    #[test]
    fn tone_tables_are_static() {
        let boot: &'static [Tone] = Cue::BootUp.tones();
        assert_eq!(
            boot,
            &[
                Tone { on_ms: 80, off_ms: 40 },
                Tone { on_ms: 80, off_ms: 40 },
                Tone { on_ms: 200, off_ms: 0 },
            ]
        );
        assert_eq!(Cue::Joined.tones(), &[Tone { on_ms: 300, off_ms: 0 }]);
        assert_eq!(Cue::EmergencyAcked.tones().len(), 4);
    }

    #[test]
    fn patterns_end_silent() {
        for cue in [Cue::BootUp, Cue::Joined, Cue::EmergencyAcked] {
            assert_eq!(cue.tones().last().map(|t| t.off_ms), Some(0));
        }
    }
}
