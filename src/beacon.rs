//! iBeacon state: advertising data, scan response, and the on/off switch
//! the uplink gate flips around long-range transmissions.

use core::fmt::Write;

use heapless::{String, Vec};

use crate::encoder::TelemetrySnapshot;
use crate::platform::BeaconRadio;

/// Proximity UUID shared by every tracker.
pub const BEACON_UUID: [u8; 16] = [
    0xE2, 0xC5, 0x6D, 0xB5, 0xDF, 0xFB, 0x48, 0xD2, 0xB0, 0x60, 0xD0, 0xF5, 0xA7, 0x10, 0x96, 0xE0,
];

/// Calibrated RSSI at 1 m, two's complement (-59 dBm).
pub const MEASURED_POWER: u8 = 0xC5;

/// Company identifier of the sensor manufacturer field, little-endian on air.
pub const SENSOR_COMPANY_ID: u16 = 0xFFEE;

pub const NORMAL_MAJOR: u16 = 0x0001;
pub const NORMAL_MINOR: u16 = 0x0001;
pub const EMERGENCY_MAJOR: u16 = 0xFF00;

/// Advertising payload: flags (3) + iBeacon manufacturer data (27).
pub const ADV_LEN: usize = 30;

/// Longest device name that still fits the 31-byte scan response.
pub const MAX_NAME_LEN: usize = 13;

const SCAN_RSP_CAP: usize = 31;

const OFFSET_MAJOR: usize = 25;
const OFFSET_MINOR: usize = 27;

/// Latest telemetry as broadcast by the beacon.
pub struct BeaconState {
    name: String<MAX_NAME_LEN>,
    snapshot: TelemetrySnapshot,
    emergency: bool,
    active: bool,
    adv: [u8; ADV_LEN],
    scan_rsp: Vec<u8, SCAN_RSP_CAP>,
}

impl BeaconState {
    /// `address` is the device address; its three low bytes name the beacon.
    pub fn new(prefix: &str, address: [u8; 6]) -> Self {
        let mut state = Self {
            name: device_name(prefix, address),
            snapshot: TelemetrySnapshot::default(),
            emergency: false,
            active: false,
            adv: [0; ADV_LEN],
            scan_rsp: Vec::new(),
        };
        state.rebuild();
        state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency
    }

    pub fn snapshot(&self) -> &TelemetrySnapshot {
        &self.snapshot
    }

    pub fn advertising_data(&self) -> &[u8] {
        &self.adv
    }

    pub fn scan_response(&self) -> &[u8] {
        &self.scan_rsp
    }

    /// (major, minor) currently advertised.
    pub fn major_minor(&self) -> (u16, u16) {
        if self.emergency {
            (EMERGENCY_MAJOR, self.snapshot.battery as u16)
        } else {
            (NORMAL_MAJOR, NORMAL_MINOR)
        }
    }

    /// Store a new snapshot and rebuild both payloads. An advertising
    /// session picks up the new data without restarting.
    pub fn update<B: BeaconRadio + ?Sized>(
        &mut self,
        radio: &mut B,
        snapshot: &TelemetrySnapshot,
        emergency: bool,
    ) {
        self.snapshot = *snapshot;
        self.emergency = emergency;
        self.rebuild();

        if self.active && radio.configure(&self.adv, &self.scan_rsp).is_err() {
            log::warn!("Beacon data update failed");
        }
        log::debug!(
            "Beacon updated: battery {}%, emergency {}",
            self.snapshot.battery,
            self.emergency
        );
    }

    /// Begin advertising. No-op when already advertising.
    pub fn start<B: BeaconRadio + ?Sized>(&mut self, radio: &mut B) {
        if self.active {
            return;
        }
        let started = radio
            .configure(&self.adv, &self.scan_rsp)
            .and_then(|()| radio.start());
        match started {
            Ok(()) => {
                self.active = true;
                log::info!("Beacon advertising started");
            }
            Err(_) => log::error!("Beacon advertising start failed"),
        }
    }

    /// Stop advertising. No-op when not advertising. The state is
    /// considered stopped even if the advertiser reports a failure.
    pub fn stop<B: BeaconRadio + ?Sized>(&mut self, radio: &mut B) {
        if !self.active {
            return;
        }
        self.active = false;
        if radio.stop().is_err() {
            log::error!("Beacon advertising stop failed");
        } else {
            log::info!("Beacon advertising paused");
        }
    }

    fn rebuild(&mut self) {
        self.adv[..9].copy_from_slice(&[0x02, 0x01, 0x06, 0x1A, 0xFF, 0x4C, 0x00, 0x02, 0x15]);
        self.adv[9..OFFSET_MAJOR].copy_from_slice(&BEACON_UUID);
        let (major, minor) = self.major_minor();
        self.adv[OFFSET_MAJOR..OFFSET_MINOR].copy_from_slice(&major.to_be_bytes());
        self.adv[OFFSET_MINOR..OFFSET_MINOR + 2].copy_from_slice(&minor.to_be_bytes());
        self.adv[ADV_LEN - 1] = MEASURED_POWER;

        let s = &self.snapshot;
        let [ax, ay, az] = s.accel.unwrap_or([0; 3]);
        let rsp = &mut self.scan_rsp;
        rsp.clear();
        let _ = rsp.push(self.name.len() as u8 + 1);
        let _ = rsp.push(0x09);
        let _ = rsp.extend_from_slice(self.name.as_bytes());
        // length, type, company id, 11 sensor bytes, emergency flag
        let _ = rsp.extend_from_slice(&[15, 0xFF]);
        let _ = rsp.extend_from_slice(&SENSOR_COMPANY_ID.to_le_bytes());
        let _ = rsp.push(s.battery);
        let _ = rsp.extend_from_slice(&s.temperature.to_le_bytes());
        let _ = rsp.extend_from_slice(&s.light.to_le_bytes());
        let _ = rsp.extend_from_slice(&ax.to_le_bytes());
        let _ = rsp.extend_from_slice(&ay.to_le_bytes());
        let _ = rsp.extend_from_slice(&az.to_le_bytes());
        let _ = rsp.push(if self.emergency { 0xFF } else { 0x00 });
    }
}

/// `<prefix>-XXXXXX` from the three low address bytes, truncated to fit.
pub fn device_name(prefix: &str, address: [u8; 6]) -> String<MAX_NAME_LEN> {
    let mut full: String<32> = String::new();
    let _ = write!(
        full,
        "{}-{:02X}{:02X}{:02X}",
        prefix, address[3], address[4], address[5]
    );
    let mut name = String::new();
    for c in full.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EventState;
    use crate::platform::AdvertiseFault;

    #[derive(Default)]
    struct Advertiser {
        configured: usize,
        starts: usize,
        stops: usize,
        fail: bool,
    }

    impl BeaconRadio for Advertiser {
        fn configure(&mut self, _adv: &[u8], _scan_rsp: &[u8]) -> Result<(), AdvertiseFault> {
            self.configured += 1;
            Ok(())
        }
        fn start(&mut self) -> Result<(), AdvertiseFault> {
            if self.fail {
                return Err(AdvertiseFault);
            }
            self.starts += 1;
            Ok(())
        }
        fn stop(&mut self) -> Result<(), AdvertiseFault> {
            self.stops += 1;
            if self.fail {
                return Err(AdvertiseFault);
            }
            Ok(())
        }
    }

    const ADDR: [u8; 6] = [0x00, 0x11, 0x22, 0xA1, 0xB2, 0xC3];

    fn snapshot(battery: u8) -> TelemetrySnapshot {
        TelemetrySnapshot {
            battery,
            temperature: 250,
            light: 120,
            accel: Some([1, -1, 1000]),
            event: EventState::NONE,
        }
    }

    #[test]
    fn advertising_layout() {
        let beacon = BeaconState::new("t1000", ADDR);
        let adv = beacon.advertising_data();
        assert_eq!(adv.len(), ADV_LEN);
        assert_eq!(&adv[..9], &[0x02, 0x01, 0x06, 0x1A, 0xFF, 0x4C, 0x00, 0x02, 0x15]);
        assert_eq!(&adv[9..25], &BEACON_UUID);
        assert_eq!(&adv[25..29], &[0x00, 0x01, 0x00, 0x01]);
        assert_eq!(adv[29], 0xC5);
        // manufacturer AD length covers everything after itself
        assert_eq!(adv[3] as usize, ADV_LEN - 4);
    }

    #[test]
    fn device_name_from_address() {
        let beacon = BeaconState::new("t1000", ADDR);
        assert_eq!(beacon.name(), "t1000-A1B2C3");
    }

    #[test]
    fn long_prefix_truncated() {
        let name = device_name("tracker01", ADDR);
        assert_eq!(name.len(), MAX_NAME_LEN);
        assert_eq!(name.as_str(), "tracker01-A1B");
    }

    #[test]
    fn scan_response_layout() {
        let mut radio = Advertiser::default();
        let mut beacon = BeaconState::new("t1000", ADDR);
        beacon.update(&mut radio, &snapshot(80), false);

        let rsp = beacon.scan_response();
        assert_eq!(rsp[0], 13);
        assert_eq!(rsp[1], 0x09);
        assert_eq!(&rsp[2..14], b"t1000-A1B2C3");
        let m = &rsp[14..];
        assert_eq!(m.len(), 16);
        assert_eq!(m[0] as usize, m.len() - 1);
        assert_eq!(&m[1..4], &[0xFF, 0xEE, 0xFF]);
        assert_eq!(m[4], 80);
        assert_eq!(&m[5..7], &[0xFA, 0x00]);
        assert_eq!(&m[7..9], &[0x78, 0x00]);
        assert_eq!(&m[9..15], &[0x01, 0x00, 0xFF, 0xFF, 0xE8, 0x03]);
        assert_eq!(m[15], 0x00);
        assert!(rsp.len() <= 31);
    }

    #[test]
    fn emergency_pair_and_flag() {
        let mut radio = Advertiser::default();
        let mut beacon = BeaconState::new("t1000", ADDR);
        beacon.update(&mut radio, &snapshot(40), true);

        assert_eq!(beacon.major_minor(), (0xFF00, 40));
        assert_eq!(&beacon.advertising_data()[25..29], &[0xFF, 0x00, 0x00, 40]);
        assert_eq!(*beacon.scan_response().last().unwrap(), 0xFF);

        beacon.update(&mut radio, &snapshot(40), false);
        assert_eq!(beacon.major_minor(), (NORMAL_MAJOR, NORMAL_MINOR));
        assert_eq!(*beacon.scan_response().last().unwrap(), 0x00);
    }

    #[test]
    fn update_pushes_data_only_while_active() {
        let mut radio = Advertiser::default();
        let mut beacon = BeaconState::new("t1000", ADDR);
        beacon.update(&mut radio, &snapshot(50), false);
        assert_eq!(radio.configured, 0);

        beacon.start(&mut radio);
        let after_start = radio.configured;
        beacon.update(&mut radio, &snapshot(51), false);
        assert_eq!(radio.configured, after_start + 1);
        assert_eq!(radio.starts, 1);
    }

    #[test]
    fn redundant_start_stop_are_noops() {
        let mut radio = Advertiser::default();
        let mut beacon = BeaconState::new("t1000", ADDR);

        beacon.stop(&mut radio);
        assert_eq!(radio.stops, 0);

        beacon.start(&mut radio);
        beacon.start(&mut radio);
        assert_eq!(radio.starts, 1);
        assert!(beacon.is_active());

        beacon.stop(&mut radio);
        beacon.stop(&mut radio);
        assert_eq!(radio.stops, 1);
        assert!(!beacon.is_active());
    }

    #[test]
    fn advertiser_failures_are_absorbed() {
        let mut radio = Advertiser {
            fail: true,
            ..Default::default()
        };
        let mut beacon = BeaconState::new("t1000", ADDR);
        beacon.start(&mut radio);
        assert!(!beacon.is_active());

        radio.fail = false;
        beacon.start(&mut radio);
        assert!(beacon.is_active());

        radio.fail = true;
        beacon.stop(&mut radio);
        assert!(!beacon.is_active());
    }
}
