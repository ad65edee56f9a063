//! Sensor sampling helpers.
//!
//! The firmware samples the board periodically into a [`SensorSample`]; the
//! tracker reads the latest sample through the [`Sensors`] trait at send time.
//! Boards without a light sensor report 0 lux; boards without an IMU report
//! 0.0 °C and no acceleration.

use crate::platform::Sensors;

/// Single-cell LiPo discharge curve: (millivolts, percent), descending.
const LIPO_CURVE: &[(u16, u8)] = &[
    (4200, 100),
    (4100, 90),
    (4000, 78),
    (3900, 65),
    (3800, 50),
    (3700, 32),
    (3600, 15),
    (3500, 5),
    (3300, 0),
];

/// Map a cell voltage to a charge estimate, interpolating between curve points.
pub fn battery_percent_from_mv(mv: u16) -> u8 {
    let (top_mv, top_pct) = LIPO_CURVE[0];
    if mv >= top_mv {
        return top_pct;
    }
    for pair in LIPO_CURVE.windows(2) {
        let (hi_mv, hi_pct) = pair[0];
        let (lo_mv, lo_pct) = pair[1];
        if mv >= lo_mv {
            let span_mv = u32::from(hi_mv - lo_mv);
            let span_pct = u32::from(hi_pct - lo_pct);
            let above = u32::from(mv - lo_mv);
            return lo_pct + (above * span_pct / span_mv) as u8;
        }
    }
    0
}

/// Latest board readings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorSample {
    pub battery_mv: u16,
    /// 0.1 °C
    pub temperature: i16,
    /// lux
    pub light: u16,
    pub accel: Option<[i16; 3]>,
}

impl Sensors for SensorSample {
    fn battery_percent(&mut self) -> u8 {
        battery_percent_from_mv(self.battery_mv)
    }

    fn temperature_decicelsius(&mut self) -> i16 {
        self.temperature
    }

    fn light_lux(&mut self) -> u16 {
        self.light
    }

    fn acceleration(&mut self) -> Option<[i16; 3]> {
        self.accel
    }
}

/// MPU6886 IMU (M5StickC Plus2) register map subset.
pub mod mpu6886 {
    pub const ADDR: u8 = 0x68;
    pub const PWR_MGMT_1: u8 = 0x6B;
    pub const ACCEL_CONFIG: u8 = 0x1C;
    /// Start of ACCEL_XOUT_H..TEMP_OUT_L, 8 bytes
    pub const ACCEL_XOUT_H: u8 = 0x3B;
    pub const WHO_AM_I: u8 = 0x75;
    pub const WHO_AM_I_VALUE: u8 = 0x19;
    /// Wake up, auto-select clock
    pub const PWR_MGMT_1_CLKSEL_AUTO: u8 = 0x01;
    /// ±2 g full scale
    pub const ACCEL_FS_2G: u8 = 0x00;

    /// Raw accelerometer triple and die temperature in 0.1 °C from an
    /// `ACCEL_XOUT_H` burst read.
    pub fn decode(buf: &[u8; 8]) -> ([i16; 3], i16) {
        let accel = [
            i16::from_be_bytes([buf[0], buf[1]]),
            i16::from_be_bytes([buf[2], buf[3]]),
            i16::from_be_bytes([buf[4], buf[5]]),
        ];
        let raw_temp = i32::from(i16::from_be_bytes([buf[6], buf[7]]));
        // 326.8 LSB/°C, 0 LSB at 25 °C
        let temperature = 250 + raw_temp * 100 / 3268;
        (accel, temperature as i16)
    }
}
