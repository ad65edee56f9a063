//! GNSS receiver (NMEA protocol)
//!
//! Bytes from the receiver's UART are fed through an `nmea0183` parser. While
//! a GNSS stage is running, every GGA sentence carrying a fix replaces the
//! stored position; the stage result is the last fix, packed as big-endian
//! microdegree longitude then latitude.

use nmea0183::{ParseResult, Parser};

use crate::config::GNSS_EVIDENCE_LEN;
use crate::encoder::pack_position;
use crate::error::ScanError;
use crate::platform::ScanSource;

/// A position in microdegrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub lat_udeg: i32,
    pub lon_udeg: i32,
}

impl Position {
    pub fn from_degrees(lat: f64, lon: f64) -> Self {
        Self {
            lat_udeg: to_microdegrees(lat),
            lon_udeg: to_microdegrees(lon),
        }
    }
}

/// Round half away from zero; `f64::round` needs std.
fn to_microdegrees(deg: f64) -> i32 {
    let scaled = deg * 1_000_000.0;
    (scaled + if scaled >= 0.0 { 0.5 } else { -0.5 }) as i32
}

pub struct GnssReceiver {
    parser: Parser,
    running: bool,
    fix: Option<Position>,
    sentences: u32,
}

impl GnssReceiver {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            running: false,
            fix: None,
            sentences: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Last fix of the current or previous stage.
    pub fn fix(&self) -> Option<Position> {
        self.fix
    }

    /// Process one byte from the receiver. Returns the new position when a
    /// GGA sentence with a fix completes during a stage.
    pub fn feed(&mut self, byte: u8) -> Option<Position> {
        let result = self.parser.parse_from_byte(byte)?;
        if !self.running {
            return None;
        }
        self.sentences = self.sentences.wrapping_add(1);
        match result {
            Ok(ParseResult::GGA(Some(gga))) => {
                let position = Position::from_degrees(gga.latitude.as_f64(), gga.longitude.as_f64());
                self.fix = Some(position);
                Some(position)
            }
            // Valid sentence but no fix, or other sentence types - ignore
            Ok(_) => None,
            Err(e) => {
                log::debug!("NMEA parse error: {}", e);
                None
            }
        }
    }

    pub fn feed_all(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.feed(b);
        }
    }
}

impl Default for GnssReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanSource for GnssReceiver {
    fn begin(&mut self) -> Result<(), ScanError> {
        self.fix = None;
        self.sentences = 0;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ScanError> {
        self.running = false;
        log::debug!("GNSS stage ended after {} sentences", self.sentences);
        Ok(())
    }

    fn results(&mut self, out: &mut [u8]) -> Result<usize, ScanError> {
        let position = self.fix.ok_or(ScanError::NoFix)?;
        let slot = out.get_mut(..GNSS_EVIDENCE_LEN).ok_or(ScanError::Engine)?;
        slot.copy_from_slice(&pack_position(position.lat_udeg, position.lon_udeg));
        log::info!(
            "lat: {}, lon: {} (microdegrees)",
            position.lat_udeg,
            position.lon_udeg
        );
        Ok(GNSS_EVIDENCE_LEN)
    }
}
