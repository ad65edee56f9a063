//! Compiled-in tracker defaults and the runtime tracker configuration.
//!
//! The constants mirror the LoRaWAN application contract (port, MTU, retry
//! cadence). `TrackerConfig` holds the knobs a downlink can change without
//! reflashing.

use serde::Serialize;

use crate::orchestrator::ScanType;

/// LoRaWAN application port for every uplink and for config downlinks.
pub const APP_PORT: u8 = 5;

/// Largest uplink frame the application will ever build.
pub const MAX_UPLINK_LEN: usize = 242;

/// Delay before the next send attempt while results are still queued.
pub const RETRY_INTERVAL_SECS: u32 = 15;

/// First campaign alarm after joining the network.
pub const JOINED_FIRST_ALARM_SECS: u32 = 15;

/// Wake-up delay for a user-triggered campaign.
pub const USER_TRIGGER_DELAY_SECS: u32 = 1;

/// Cap on distinct evidence sources queued per campaign.
pub const MAX_PENDING_RESULTS: u8 = 3;

/// Bytes per WiFi/BLE evidence record: 6-byte MAC + 1-byte RSSI.
pub const RECORD_LEN: usize = 7;

/// GNSS evidence: 4-byte longitude + 4-byte latitude.
pub const GNSS_EVIDENCE_LEN: usize = 8;

/// Capacity of each per-source result buffer.
pub const RESULT_CAPACITY: usize = 64;

/// Whether an uplink asks the network for an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketPolicy {
    /// One unconfirmed uplink; only emergencies are confirmed.
    Unconfirmed,
    /// Every uplink is confirmed.
    Confirmed,
}

/// Runtime tracker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackerConfig {
    /// Which scan sources run, and in what order.
    pub scan_type: ScanType,
    /// GNSS stage duration in seconds
    pub gnss_scan_secs: u32,
    /// WiFi stage duration in seconds
    pub wifi_scan_secs: u32,
    /// BLE stage duration in seconds
    pub ble_scan_secs: u32,
    /// Campaign period in minutes
    pub periodic_interval_min: u16,
    /// WiFi records kept per campaign
    pub wifi_max_records: u8,
    /// BLE records kept per campaign
    pub ble_max_records: u8,
    /// Append the accelerometer triple to every frame
    pub accel_enabled: bool,
    pub packet_policy: PacketPolicy,
    /// Run every stage even after evidence is found.
    pub test_mode: bool,
}

impl TrackerConfig {
    pub const fn new() -> Self {
        Self {
            scan_type: ScanType::BleWifiGnss,
            gnss_scan_secs: 30,
            wifi_scan_secs: 3,
            ble_scan_secs: 3,
            periodic_interval_min: 60,
            wifi_max_records: 3,
            ble_max_records: 3,
            accel_enabled: false,
            packet_policy: PacketPolicy::Unconfirmed,
            test_mode: false,
        }
    }

    /// Campaign period in seconds.
    pub const fn periodic_interval_secs(&self) -> u32 {
        self.periodic_interval_min as u32 * 60
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tracker_contract() {
        let config = TrackerConfig::default();
        assert_eq!(config.scan_type, ScanType::BleWifiGnss);
        assert_eq!(config.gnss_scan_secs, 30);
        assert_eq!(config.wifi_scan_secs, 3);
        assert_eq!(config.ble_scan_secs, 3);
        assert_eq!(config.periodic_interval_secs(), 3600);
        assert!(!config.accel_enabled);
        assert!(!config.test_mode);
    }

    #[test]
    fn max_records_fit_result_buffer() {
        let config = TrackerConfig::new();
        assert!(config.wifi_max_records as usize * RECORD_LEN <= RESULT_CAPACITY);
        assert!(config.ble_max_records as usize * RECORD_LEN <= RESULT_CAPACITY);
    }

    #[test]
    fn serialize_config() {
        let mut buf = [0u8; 512];
        let len = serde_json_core::to_slice(&TrackerConfig::new(), &mut buf).unwrap();
        let json = core::str::from_utf8(&buf[..len]).unwrap();
        assert!(json.contains(r#""scan_type":"ble_wifi_gnss""#));
        assert!(json.contains(r#""packet_policy":"unconfirmed""#));
        assert!(json.contains(r#""periodic_interval_min":60"#));
    }
}
