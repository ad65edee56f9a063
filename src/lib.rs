//! LoRaWAN location tracker with a companion iBeacon.
//!
//! On every alarm the tracker runs a scan campaign over up to three location
//! sources (GNSS, WiFi access points, BLE advertisers), packs the first
//! usable evidence with a sensor snapshot into a LoRaWAN uplink, and keeps
//! an iBeacon advertising in between transmissions. A user trigger turns the
//! next campaign into an emergency: confirmed priority uplink and an
//! emergency beacon.
//!
//! The library holds the whole state machine and every codec with no
//! platform dependencies, testable on the host with `cargo test`. Radios,
//! sensors and the alarm are reached through the traits in [`platform`]; the
//! ESP32 firmware binary supplies them.

#![cfg_attr(not(test), no_std)]

pub mod beacon;
pub mod board;
pub mod comm;
pub mod config;
pub mod encoder;
pub mod error;
pub mod evidence;
pub mod gnss;
pub mod modem;
pub mod orchestrator;
pub mod platform;
pub mod protocol;
pub mod scanner;
pub mod sensors;
pub mod tracker;
pub mod uplink;

#[cfg(test)]
mod mock;
