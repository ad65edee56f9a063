//! Uplink gate: duty-cycle and size checks in front of the modem, and the
//! beacon pause that brackets every accepted transmission.

use crate::beacon::BeaconState;
use crate::config::APP_PORT;
use crate::encoder::{DataKind, UplinkFrame};
use crate::error::SendError;
use crate::platform::{Hardware, LoraRadio};

/// Outcome reported by the modem when a transmission completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Unconfirmed uplink left the radio
    Sent,
    /// Confirmed uplink acknowledged by the network
    Acked,
    /// Confirmed uplink went unanswered after all retries
    NotAcked,
}

/// The transmission the gate is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub kind: DataKind,
    pub len: usize,
    pub confirmed: bool,
    pub emergency: bool,
}

#[derive(Debug, Default)]
pub struct UplinkGate {
    in_flight: Option<InFlight>,
    submitted: u32,
    uplink_count: u32,
}

impl UplinkGate {
    pub const fn new() -> Self {
        Self {
            in_flight: None,
            submitted: 0,
            uplink_count: 0,
        }
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    /// Frames handed to the modem since boot.
    pub fn submitted(&self) -> u32 {
        self.submitted
    }

    /// Completed transmissions since boot.
    pub fn uplink_count(&self) -> u32 {
        self.uplink_count
    }

    /// Hand `frame` to the modem if no uplink is outstanding and the duty
    /// cycle and the next max payload allow it. The beacon is paused on
    /// success and stays paused until [`UplinkGate::on_tx_done`].
    pub fn try_send<H: Hardware + ?Sized>(
        &mut self,
        hw: &mut H,
        beacon: &mut BeaconState,
        frame: &UplinkFrame,
        confirmed: bool,
        emergency: bool,
    ) -> Result<(), SendError> {
        if self.in_flight.is_some() {
            return Err(SendError::InFlight);
        }

        let radio = hw.radio();

        let remaining = radio.duty_cycle_remaining_ms()?;
        if remaining < 0 {
            return Err(SendError::DutyCycleBlocked {
                wait_ms: remaining.unsigned_abs(),
            });
        }

        let max = radio.max_payload()? as usize;
        if frame.len() > max {
            log::warn!("Not enough space in buffer, sending empty uplink to flush MAC commands");
            radio.request_empty_uplink(APP_PORT, confirmed)?;
            return Err(SendError::PayloadTooLarge {
                len: frame.len(),
                max,
            });
        }

        beacon.stop(hw.beacon());
        log::info!(
            "Request uplink: {} ({} bytes){}{}",
            frame.kind().as_str(),
            frame.len(),
            if confirmed { ", confirmed" } else { "" },
            if emergency { ", emergency" } else { "" }
        );
        hw.radio()
            .submit(APP_PORT, frame.as_bytes(), confirmed, emergency)?;

        self.in_flight = Some(InFlight {
            kind: frame.kind(),
            len: frame.len(),
            confirmed,
            emergency,
        });
        self.submitted = self.submitted.wrapping_add(1);
        Ok(())
    }

    /// Transmission finished: resume the beacon and release the in-flight
    /// record.
    pub fn on_tx_done<H: Hardware + ?Sized>(
        &mut self,
        hw: &mut H,
        beacon: &mut BeaconState,
        status: TxStatus,
    ) -> Option<InFlight> {
        self.uplink_count = self.uplink_count.wrapping_add(1);
        log::info!("Uplink count: {} ({:?})", self.uplink_count, status);
        beacon.start(hw.beacon());
        self.in_flight.take()
    }

    /// Forget any in-flight record, e.g. after leaving the network.
    pub fn reset(&mut self) {
        self.in_flight = None;
    }
}
