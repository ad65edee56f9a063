//! Uplink payload encoder.
//!
//! Every frame starts with the same telemetry prefix, all multi-byte fields
//! big-endian:
//!
//! ```text
//! [0]      data_kind
//! [1]      event_state
//! [2]      battery (0-100)
//! [3..5]   temperature, i16, 0.1 °C
//! [5..7]   light, u16, lux
//! [7..13]  accel x, y, z, i16 each (only with the accelerometer enabled)
//! ```
//!
//! WiFi/BLE frames append a record-count byte and the raw 7-byte records.
//! GNSS frames append 8 bytes (longitude, latitude) with no count, since the
//! data kind already fixes the size.

use heapless::Vec;
use serde::Serialize;

use crate::config::{MAX_UPLINK_LEN, RECORD_LEN};
use crate::evidence::Evidence;
use crate::platform::Sensors;

/// Frame type identifier, first byte of every uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DataKind {
    Sensor = 0x01,
    SensorAccel = 0x02,
    Gnss = 0x03,
    GnssAccel = 0x04,
    Wifi = 0x05,
    WifiAccel = 0x06,
    Ble = 0x07,
    BleAccel = 0x08,
}

impl DataKind {
    /// Pick the data kind for an evidence type and accelerometer setting.
    pub fn select(evidence: &Evidence<'_>, accel: bool) -> Self {
        match (evidence, accel) {
            (Evidence::None, false) => DataKind::Sensor,
            (Evidence::None, true) => DataKind::SensorAccel,
            (Evidence::Gnss(_), false) => DataKind::Gnss,
            (Evidence::Gnss(_), true) => DataKind::GnssAccel,
            (Evidence::Wifi(_), false) => DataKind::Wifi,
            (Evidence::Wifi(_), true) => DataKind::WifiAccel,
            (Evidence::Ble(_), false) => DataKind::Ble,
            (Evidence::Ble(_), true) => DataKind::BleAccel,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Sensor => "sensor",
            DataKind::SensorAccel => "sensor_accel",
            DataKind::Gnss => "gnss",
            DataKind::GnssAccel => "gnss_accel",
            DataKind::Wifi => "wifi",
            DataKind::WifiAccel => "wifi_accel",
            DataKind::Ble => "ble",
            DataKind::BleAccel => "ble_accel",
        }
    }
}

/// Why a campaign was started. Carried in byte 1 of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventState(pub u8);

impl EventState {
    /// Periodic report
    pub const NONE: EventState = EventState(0);
    /// User-triggered SOS
    pub const USER: EventState = EventState(0x80);

    /// User-triggered reports are emergencies.
    pub fn is_emergency(self) -> bool {
        self == EventState::USER
    }
}

/// Sensor readings captured once per send and shared by the uplink frame and
/// the beacon so the two reports never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetrySnapshot {
    pub battery: u8,
    /// 0.1 °C units
    pub temperature: i16,
    pub light: u16,
    pub accel: Option<[i16; 3]>,
    pub event: EventState,
}

impl TelemetrySnapshot {
    /// Sample every sensor. The accelerometer is only read when enabled.
    pub fn capture<S: Sensors + ?Sized>(sensors: &mut S, accel_enabled: bool, event: EventState) -> Self {
        let battery = sensors.battery_percent().min(100);
        let temperature = sensors.temperature_decicelsius();
        let light = sensors.light_lux();
        let accel = if accel_enabled {
            Some(sensors.acceleration().unwrap_or([0; 3]))
        } else {
            None
        };
        Self {
            battery,
            temperature,
            light,
            accel,
            event,
        }
    }

    pub fn is_emergency(&self) -> bool {
        self.event.is_emergency()
    }
}

/// Appends big-endian fields to a fixed-capacity byte vector.
///
/// Writes past capacity are dropped; callers size their buffers so that
/// cannot happen.
pub struct BeWriter<'a, const N: usize> {
    buf: &'a mut Vec<u8, N>,
}

impl<'a, const N: usize> BeWriter<'a, N> {
    pub fn new(buf: &'a mut Vec<u8, N>) -> Self {
        Self { buf }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        let _ = self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.bytes(&v.to_be_bytes())
    }

    pub fn i16(&mut self, v: i16) -> &mut Self {
        self.bytes(&v.to_be_bytes())
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.bytes(&v.to_be_bytes())
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        let _ = self.buf.extend_from_slice(v);
        self
    }
}

/// One encoded uplink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkFrame {
    kind: DataKind,
    bytes: Vec<u8, MAX_UPLINK_LEN>,
}

impl UplinkFrame {
    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Build the uplink frame for a snapshot and optional evidence.
pub fn encode(accel_enabled: bool, evidence: Evidence<'_>, snapshot: &TelemetrySnapshot) -> UplinkFrame {
    let kind = DataKind::select(&evidence, accel_enabled);
    let mut bytes = Vec::new();
    let mut w = BeWriter::new(&mut bytes);

    w.u8(kind.as_u8())
        .u8(snapshot.event.0)
        .u8(snapshot.battery)
        .i16(snapshot.temperature)
        .u16(snapshot.light);

    if accel_enabled {
        let [x, y, z] = snapshot.accel.unwrap_or([0; 3]);
        w.i16(x).i16(y).i16(z);
    }

    match evidence {
        Evidence::None => {}
        Evidence::Gnss(position) => {
            w.bytes(position);
        }
        Evidence::Wifi(records) | Evidence::Ble(records) => {
            w.u8((records.len() / RECORD_LEN) as u8).bytes(records);
        }
    }

    UplinkFrame { kind, bytes }
}

/// Pack a position as GNSS evidence: longitude then latitude, big-endian
/// microdegrees.
pub fn pack_position(lat_udeg: i32, lon_udeg: i32) -> [u8; 8] {
    let mut out: Vec<u8, 8> = Vec::new();
    BeWriter::new(&mut out).i32(lon_udeg).i32(lat_udeg);
    let mut packed = [0u8; 8];
    packed.copy_from_slice(&out);
    packed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GNSS_EVIDENCE_LEN, RESULT_CAPACITY};
    use crate::evidence::ResultBuffer;
    use crate::platform::SourceKind;

    fn snapshot() -> TelemetrySnapshot {
        TelemetrySnapshot {
            battery: 80,
            temperature: 250,
            light: 120,
            accel: None,
            event: EventState::NONE,
        }
    }

    #[test]
    fn sensor_only_frame_layout() {
        let frame = encode(false, Evidence::None, &snapshot());
        assert_eq!(frame.kind(), DataKind::Sensor);
        assert_eq!(frame.as_bytes(), &[0x01, 0x00, 80, 0x00, 0xFA, 0x00, 0x78]);
        assert_eq!(frame.len(), 7);
    }

    #[test]
    fn sensor_accel_frame_is_13_bytes() {
        let mut snap = snapshot();
        snap.accel = Some([-1, 256, 1000]);
        let frame = encode(true, Evidence::None, &snap);
        assert_eq!(frame.kind(), DataKind::SensorAccel);
        assert_eq!(frame.len(), 13);
        assert_eq!(&frame.as_bytes()[7..], &[0xFF, 0xFF, 0x01, 0x00, 0x03, 0xE8]);
    }

    #[test]
    fn accel_enabled_without_reading_encodes_zeros() {
        let frame = encode(true, Evidence::None, &snapshot());
        assert_eq!(&frame.as_bytes()[7..13], &[0; 6]);
    }

    #[test]
    fn negative_temperature_big_endian() {
        let mut snap = snapshot();
        snap.temperature = -55;
        let frame = encode(false, Evidence::None, &snap);
        assert_eq!(&frame.as_bytes()[3..5], &[0xFF, 0xC9]);
    }

    #[test]
    fn event_state_in_second_byte() {
        let mut snap = snapshot();
        snap.event = EventState::USER;
        let frame = encode(false, Evidence::None, &snap);
        assert_eq!(frame.as_bytes()[1], 0x80);
    }

    #[test]
    fn gnss_frame_has_no_count_prefix() {
        let pos = pack_position(48_117_300, 11_516_667);
        let frame = encode(false, Evidence::Gnss(&pos), &snapshot());
        assert_eq!(frame.kind(), DataKind::Gnss);
        assert_eq!(frame.len(), 7 + GNSS_EVIDENCE_LEN);
        assert_eq!(&frame.as_bytes()[7..11], &11_516_667i32.to_be_bytes());
        assert_eq!(&frame.as_bytes()[11..15], &48_117_300i32.to_be_bytes());
    }

    #[test]
    fn gnss_accel_frame() {
        let pos = pack_position(-33_868_800, 151_209_300);
        let frame = encode(true, Evidence::Gnss(&pos), &snapshot());
        assert_eq!(frame.kind(), DataKind::GnssAccel);
        assert_eq!(frame.len(), 13 + 8);
    }

    #[test]
    fn wifi_frame_has_record_count() {
        let records = [0x11u8; 21];
        let frame = encode(false, Evidence::Wifi(&records), &snapshot());
        assert_eq!(frame.kind(), DataKind::Wifi);
        assert_eq!(frame.as_bytes()[7], 3);
        assert_eq!(&frame.as_bytes()[8..], &records[..]);
        assert_eq!(frame.len(), 7 + 1 + 21);
    }

    #[test]
    fn ble_accel_frame_record_count_after_accel() {
        let records = [0x22u8; 14];
        let frame = encode(true, Evidence::Ble(&records), &snapshot());
        assert_eq!(frame.kind(), DataKind::BleAccel);
        assert_eq!(frame.as_bytes()[0], 0x08);
        assert_eq!(frame.as_bytes()[13], 2);
        assert_eq!(frame.len(), 13 + 1 + 14);
    }

    #[test]
    fn largest_possible_frame_fits_uplink() {
        let mut buf = ResultBuffer::new(SourceKind::Wifi, u8::MAX);
        buf.fill(&[0x33; RESULT_CAPACITY]);
        let mut snap = snapshot();
        snap.accel = Some([1, 2, 3]);
        let frame = encode(true, Evidence::from_buffer(&buf), &snap);
        assert!(frame.len() <= MAX_UPLINK_LEN);
        assert_eq!(frame.len(), 13 + 1 + 63);
    }

    #[test]
    fn data_kind_table_is_stable() {
        let rec = [0u8; 7];
        let pos = [0u8; 8];
        let cases = [
            (Evidence::None, false, 0x01),
            (Evidence::None, true, 0x02),
            (Evidence::Gnss(&pos), false, 0x03),
            (Evidence::Gnss(&pos), true, 0x04),
            (Evidence::Wifi(&rec), false, 0x05),
            (Evidence::Wifi(&rec), true, 0x06),
            (Evidence::Ble(&rec), false, 0x07),
            (Evidence::Ble(&rec), true, 0x08),
        ];
        for (ev, accel, id) in cases {
            assert_eq!(DataKind::select(&ev, accel).as_u8(), id);
        }
    }

    #[test]
    fn pack_position_is_lon_then_lat() {
        let packed = pack_position(0x0102_0304, -2);
        assert_eq!(packed, [0xFF, 0xFF, 0xFF, 0xFE, 0x01, 0x02, 0x03, 0x04]);
    }

    struct FixedSensors;

    impl Sensors for FixedSensors {
        fn battery_percent(&mut self) -> u8 {
            140
        }
        fn temperature_decicelsius(&mut self) -> i16 {
            -12
        }
        fn light_lux(&mut self) -> u16 {
            9
        }
        fn acceleration(&mut self) -> Option<[i16; 3]> {
            Some([4, 5, 6])
        }
    }

    #[test]
    fn capture_clamps_battery_and_gates_accel() {
        let snap = TelemetrySnapshot::capture(&mut FixedSensors, false, EventState::NONE);
        assert_eq!(snap.battery, 100);
        assert_eq!(snap.temperature, -12);
        assert_eq!(snap.accel, None);

        let snap = TelemetrySnapshot::capture(&mut FixedSensors, true, EventState::USER);
        assert_eq!(snap.accel, Some([4, 5, 6]));
        assert!(snap.is_emergency());
    }
}
