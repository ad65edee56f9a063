//! WiFi and BLE evidence collection.
//!
//! WiFi: promiscuous-mode frames parsed with the ieee80211 crate; only access
//! points (beacons and probe responses) count as location evidence.
//! BLE: advertisement reports from the host stack's scanner.
//!
//! Both feed a [`RecordCollector`], which the orchestrator drives as a
//! [`ScanSource`] and which packs sightings into 7-byte MAC + RSSI records.

use heapless::Vec;

use ieee80211::match_frames;
use ieee80211::mgmt_frame::{BeaconFrame, ProbeResponseFrame};

use crate::config::{RECORD_LEN, RESULT_CAPACITY};
use crate::error::ScanError;
use crate::platform::ScanSource;

/// WiFi channels to scan (2.4 GHz only; ESP32/ESP32-S3 promiscuous mode is 2.4 GHz)
pub const WIFI_CHANNELS: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13];

/// Dwell time per channel in milliseconds.
/// 120ms ensures reliable beacon capture (beacons broadcast every ~100ms).
pub const DEFAULT_DWELL_MS: u64 = 120;

/// Distinct transmitters remembered per scan; enough to fill a result buffer.
pub const MAX_SIGHTINGS: usize = RESULT_CAPACITY / RECORD_LEN;

/// SSID suffix by which an AP owner opts out of location services.
const NOMAP_SUFFIX: &str = "_nomap";

/// One transmitter heard during a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sighting {
    pub mac: [u8; 6],
    pub rssi: i8,
}

impl Sighting {
    /// Pack as MAC followed by RSSI (two's complement).
    pub fn to_record(&self) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        record[..6].copy_from_slice(&self.mac);
        record[6] = self.rssi as u8;
        record
    }
}

/// Parse a raw 802.11 frame into an access point sighting.
///
/// Returns `None` for anything that is not a beacon or probe response, and
/// for APs whose SSID ends in `_nomap`.
///
/// Safe to call from ISR context (no allocation, no blocking).
pub fn parse_wifi_frame(frame: &[u8], rssi: i8) -> Option<Sighting> {
    let result = match_frames! {
        frame,
        beacon = BeaconFrame<'_> => {
            ap_sighting(&beacon.header.transmitter_address.0, beacon.body.ssid(), rssi)
        }
        probe_resp = ProbeResponseFrame<'_> => {
            ap_sighting(&probe_resp.header.transmitter_address.0, probe_resp.body.ssid(), rssi)
        }
    };
    result.ok().flatten()
}

fn ap_sighting(mac: &[u8; 6], ssid: Option<&str>, rssi: i8) -> Option<Sighting> {
    if ssid.is_some_and(|s| s.ends_with(NOMAP_SUFFIX)) {
        return None;
    }
    Some(Sighting { mac: *mac, rssi })
}

/// Accumulates sightings between `begin` and `stop`.
///
/// A transmitter is stored once, at its first sighting; later sightings only
/// raise its RSSI. Results are emitted strongest first.
#[derive(Debug, Default)]
pub struct RecordCollector {
    sightings: Vec<Sighting, MAX_SIGHTINGS>,
    running: bool,
    dropped: u16,
}

impl RecordCollector {
    pub const fn new() -> Self {
        Self {
            sightings: Vec::new(),
            running: false,
            dropped: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn len(&self) -> usize {
        self.sightings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sightings.is_empty()
    }

    /// Record a sighting. Ignored unless a scan is running.
    pub fn push(&mut self, sighting: Sighting) {
        if !self.running {
            return;
        }
        if let Some(known) = self.sightings.iter_mut().find(|s| s.mac == sighting.mac) {
            known.rssi = known.rssi.max(sighting.rssi);
            return;
        }
        if self.sightings.push(sighting).is_err() {
            self.dropped = self.dropped.saturating_add(1);
        }
    }
}

impl ScanSource for RecordCollector {
    fn begin(&mut self) -> Result<(), ScanError> {
        self.sightings.clear();
        self.dropped = 0;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ScanError> {
        if self.running && self.dropped > 0 {
            log::debug!("{} sightings dropped, collector full", self.dropped);
        }
        self.running = false;
        Ok(())
    }

    fn results(&mut self, out: &mut [u8]) -> Result<usize, ScanError> {
        let mut sorted = self.sightings.clone();
        sorted.sort_unstable_by(|a, b| b.rssi.cmp(&a.rssi));

        let mut written = 0;
        for (slot, sighting) in out.chunks_exact_mut(RECORD_LEN).zip(sorted.iter()) {
            slot.copy_from_slice(&sighting.to_record());
            written += RECORD_LEN;
        }
        Ok(written)
    }
}
