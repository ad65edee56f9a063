//! Hardware abstraction for supported boards.
//!
//! Each board module defines pin assignments and capabilities
//! selected at compile time via feature flags.

#[cfg(feature = "board-xiao")]
mod hw {
    pub const GNSS_RX_PIN: u8 = 6;
    pub const MODEM_RX_PIN: u8 = 8; // D9, to the LoRaWAN module's TX
    pub const MODEM_TX_PIN: u8 = 7; // D8
    pub const CONSOLE_RX_PIN: u8 = 44; // D7, UART0
    pub const BUTTON_PIN: u8 = 0; // BOOT button
    pub const BATTERY_ADC_PIN: u8 = 1;
    pub const BATTERY_DIVIDER: u16 = 2; // 2x 200k divider on the cell
    pub const HAS_GNSS: bool = true;
    pub const HAS_BUZZER: bool = false;
    pub const HAS_IMU: bool = false;
    pub const BEACON_NAME_PREFIX: &str = "xtrk";
    pub const BOARD_NAME: &str = "xiao_esp32s3";
}

#[cfg(feature = "board-m5stickc")]
mod hw {
    pub const GNSS_RX_PIN: u8 = 36; // HAT header
    pub const MODEM_RX_PIN: u8 = 33; // Grove port
    pub const MODEM_TX_PIN: u8 = 32;
    pub const CONSOLE_RX_PIN: u8 = 3; // UART0 via the USB bridge
    pub const BUTTON_PIN: u8 = 37; // Front button A
    pub const BATTERY_ADC_PIN: u8 = 38;
    pub const BATTERY_DIVIDER: u16 = 2;
    pub const HAS_GNSS: bool = true;
    pub const HAS_BUZZER: bool = true;
    pub const BUZZER_PIN: u8 = 2;
    pub const BUZZER_FREQ_HZ: u32 = 4000;
    pub const POWER_HOLD_PIN: u8 = 4;
    pub const HAS_IMU: bool = true; // MPU6886 on the internal I2C bus
    pub const IMU_SDA_PIN: u8 = 21;
    pub const IMU_SCL_PIN: u8 = 22;
    pub const BEACON_NAME_PREFIX: &str = "m5trk";
    pub const BOARD_NAME: &str = "m5stickc_plus2";
}

#[cfg(not(any(feature = "board-xiao", feature = "board-m5stickc")))]
mod hw {
    pub const HAS_GNSS: bool = false;
    pub const HAS_BUZZER: bool = false;
    pub const HAS_IMU: bool = false;
    pub const BEACON_NAME_PREFIX: &str = "t1000";
    pub const BOARD_NAME: &str = "unknown";
}

pub use hw::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::{device_name, MAX_NAME_LEN};

    #[test]
    fn host_build_has_no_optional_hardware() {
        assert!(!HAS_GNSS && !HAS_BUZZER && !HAS_IMU);
        assert_eq!(BOARD_NAME, "unknown");
    }

    #[test]
    fn beacon_name_fits() {
        let name = device_name(BEACON_NAME_PREFIX, [0, 0, 0, 0xAB, 0xCD, 0xEF]);
        assert_eq!(name.as_str(), "t1000-ABCDEF");
        assert!(name.len() <= MAX_NAME_LEN);
    }
}
