//! Per-source result buffers and the tagged evidence handed to the encoder.
//!
//! WiFi and BLE engines report 7-byte records (MAC + RSSI); GNSS reports one
//! 8-byte position. Over-production is truncated deterministically: the
//! earliest whole records are kept, a trailing partial record is dropped.

use heapless::Vec;

use crate::config::{GNSS_EVIDENCE_LEN, RECORD_LEN, RESULT_CAPACITY};
use crate::platform::SourceKind;

/// Fixed-capacity raw scan output for one source.
#[derive(Debug, Clone)]
pub struct ResultBuffer {
    source: SourceKind,
    max_records: u8,
    data: Vec<u8, RESULT_CAPACITY>,
}

impl ResultBuffer {
    /// `max_records` is ignored for GNSS, which holds exactly one position.
    pub const fn new(source: SourceKind, max_records: u8) -> Self {
        Self {
            source,
            max_records,
            data: Vec::new(),
        }
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    /// Size of one record for this source.
    pub fn record_len(&self) -> usize {
        match self.source {
            SourceKind::Gnss => GNSS_EVIDENCE_LEN,
            SourceKind::Wifi | SourceKind::Ble => RECORD_LEN,
        }
    }

    /// Largest fill this buffer accepts.
    pub fn max_len(&self) -> usize {
        let records = match self.source {
            SourceKind::Gnss => 1,
            SourceKind::Wifi | SourceKind::Ble => self.max_records as usize,
        };
        let cap = (records * self.record_len()).min(RESULT_CAPACITY);
        cap - cap % self.record_len()
    }

    pub fn set_max_records(&mut self, max_records: u8) {
        self.max_records = max_records;
    }

    /// Replace the contents with `raw`, keeping the earliest whole records
    /// that fit. GNSS output of any length other than 8 is treated as no fix.
    pub fn fill(&mut self, raw: &[u8]) {
        self.data.clear();
        if self.source == SourceKind::Gnss && raw.len() != GNSS_EVIDENCE_LEN {
            if !raw.is_empty() {
                log::warn!("Discarding malformed GNSS result ({} bytes)", raw.len());
            }
            return;
        }
        let whole = raw.len() - raw.len() % self.record_len();
        let keep = whole.min(self.max_len());
        if keep < raw.len() {
            log::debug!(
                "{} results truncated from {} to {} bytes",
                self.source.as_str(),
                raw.len(),
                keep
            );
        }
        let _ = self.data.extend_from_slice(&raw[..keep]);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Number of whole records held.
    pub fn record_count(&self) -> u8 {
        (self.data.len() / self.record_len()) as u8
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Evidence attached to one uplink frame.
#[derive(Debug, Clone, Copy)]
pub enum Evidence<'a> {
    /// Sensor-only report
    None,
    /// Longitude then latitude, each big-endian i32 microdegrees
    Gnss(&'a [u8]),
    /// Whole 7-byte AP records
    Wifi(&'a [u8]),
    /// Whole 7-byte beacon records
    Ble(&'a [u8]),
}

impl<'a> Evidence<'a> {
    /// Wrap a buffer's contents, or `None` when it is empty.
    pub fn from_buffer(buffer: &'a ResultBuffer) -> Self {
        if buffer.is_empty() {
            return Evidence::None;
        }
        match buffer.source() {
            SourceKind::Gnss => Evidence::Gnss(buffer.as_bytes()),
            SourceKind::Wifi => Evidence::Wifi(buffer.as_bytes()),
            SourceKind::Ble => Evidence::Ble(buffer.as_bytes()),
        }
    }

    pub fn kind(&self) -> Option<SourceKind> {
        match self {
            Evidence::None => None,
            Evidence::Gnss(_) => Some(SourceKind::Gnss),
            Evidence::Wifi(_) => Some(SourceKind::Wifi),
            Evidence::Ble(_) => Some(SourceKind::Ble),
        }
    }
}
