//! Recording mocks for the collaborator traits
//!
//! Every mock appends to one shared [`Journal`], so tests can assert the
//! relative order of scan, radio, beacon and alarm calls.

use std::cell::RefCell;
use std::rc::Rc;
use std::vec::Vec;

use crate::error::{ModemError, ScanError};
use crate::platform::{
    AdvertiseFault, Alarm, BeaconRadio, Cue, Hardware, LoraRadio, ScanSource, Sensors, SourceKind,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Begin(SourceKind),
    Stop(SourceKind),
    Submit {
        port: u8,
        len: usize,
        confirmed: bool,
        emergency: bool,
    },
    EmptyUplink {
        port: u8,
        confirmed: bool,
    },
    Join,
    Leave,
    BeaconConfigure,
    BeaconStart,
    BeaconStop,
    AlarmStart(u32),
    AlarmClear,
}

/// Shared, ordered call log.
#[derive(Debug, Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<Call>>>);

impl Journal {
    pub fn record(&self, call: Call) {
        self.0.borrow_mut().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.borrow().clone()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }

    /// Only scan source begin/stop calls.
    pub fn source_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Begin(_) | Call::Stop(_)))
            .collect()
    }

    /// Every armed alarm delay, in order.
    pub fn alarms(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AlarmStart(secs) => Some(secs),
                _ => None,
            })
            .collect()
    }
}

/// Scan engine returning canned results.
#[derive(Debug)]
pub struct MockSource {
    kind: SourceKind,
    journal: Journal,
    pub results: Vec<u8>,
    pub error: Option<ScanError>,
    pub running: bool,
}

impl MockSource {
    pub fn new(kind: SourceKind, journal: Journal) -> Self {
        Self {
            kind,
            journal,
            results: Vec::new(),
            error: None,
            running: false,
        }
    }
}

impl ScanSource for MockSource {
    fn begin(&mut self) -> Result<(), ScanError> {
        self.journal.record(Call::Begin(self.kind));
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ScanError> {
        self.journal.record(Call::Stop(self.kind));
        self.running = false;
        Ok(())
    }

    fn results(&mut self, out: &mut [u8]) -> Result<usize, ScanError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let n = self.results.len().min(out.len());
        out[..n].copy_from_slice(&self.results[..n]);
        Ok(n)
    }
}

/// LoRaWAN modem with a configurable duty cycle and payload limit.
#[derive(Debug)]
pub struct MockRadio {
    journal: Journal,
    pub duty_cycle_ms: i32,
    pub max_payload: u8,
    pub fail_submit: Option<ModemError>,
    /// Payloads accepted by `submit`, in order
    pub submitted: Vec<Vec<u8>>,
}

impl MockRadio {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            duty_cycle_ms: 0,
            max_payload: 242,
            fail_submit: None,
            submitted: Vec::new(),
        }
    }
}

impl LoraRadio for MockRadio {
    fn duty_cycle_remaining_ms(&mut self) -> Result<i32, ModemError> {
        Ok(self.duty_cycle_ms)
    }

    fn max_payload(&mut self) -> Result<u8, ModemError> {
        Ok(self.max_payload)
    }

    fn submit(
        &mut self,
        port: u8,
        payload: &[u8],
        confirmed: bool,
        emergency: bool,
    ) -> Result<(), ModemError> {
        if let Some(e) = self.fail_submit {
            return Err(e);
        }
        self.journal.record(Call::Submit {
            port,
            len: payload.len(),
            confirmed,
            emergency,
        });
        self.submitted.push(payload.to_vec());
        Ok(())
    }

    fn request_empty_uplink(&mut self, port: u8, confirmed: bool) -> Result<(), ModemError> {
        self.journal.record(Call::EmptyUplink { port, confirmed });
        Ok(())
    }

    fn join(&mut self) -> Result<(), ModemError> {
        self.journal.record(Call::Join);
        Ok(())
    }

    fn leave_network(&mut self) -> Result<(), ModemError> {
        self.journal.record(Call::Leave);
        Ok(())
    }
}

/// Advertiser keeping the last configured payloads.
#[derive(Debug)]
pub struct MockBeacon {
    journal: Journal,
    pub adv: Vec<u8>,
    pub scan_rsp: Vec<u8>,
    pub advertising: bool,
}

impl MockBeacon {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            adv: Vec::new(),
            scan_rsp: Vec::new(),
            advertising: false,
        }
    }
}

impl BeaconRadio for MockBeacon {
    fn configure(&mut self, adv: &[u8], scan_rsp: &[u8]) -> Result<(), AdvertiseFault> {
        self.journal.record(Call::BeaconConfigure);
        self.adv = adv.to_vec();
        self.scan_rsp = scan_rsp.to_vec();
        Ok(())
    }

    fn start(&mut self) -> Result<(), AdvertiseFault> {
        self.journal.record(Call::BeaconStart);
        self.advertising = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AdvertiseFault> {
        self.journal.record(Call::BeaconStop);
        self.advertising = false;
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockSensors {
    pub battery: u8,
    pub temperature: i16,
    pub light: u16,
    pub accel: Option<[i16; 3]>,
}

impl Default for MockSensors {
    fn default() -> Self {
        Self {
            battery: 80,
            temperature: 250,
            light: 120,
            accel: None,
        }
    }
}

impl Sensors for MockSensors {
    fn battery_percent(&mut self) -> u8 {
        self.battery
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

/// Simulated clock with a single armed alarm.
#[derive(Debug)]
pub struct MockAlarm {
    journal: Journal,
    pub now: u32,
    /// Delay of the currently armed alarm
    pub armed: Option<u32>,
}

impl MockAlarm {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            now: 0,
            armed: None,
        }
    }

    /// Advance the clock to the armed deadline and disarm.
    pub fn fire(&mut self) {
        if let Some(secs) = self.armed.take() {
            self.now += secs;
        }
    }
}

impl Alarm for MockAlarm {
    fn now_secs(&self) -> u32 {
        self.now
    }

    fn start(&mut self, secs: u32) {
        self.journal.record(Call::AlarmStart(secs));
        self.armed = Some(secs);
    }

    fn clear(&mut self) {
        self.journal.record(Call::AlarmClear);
        self.armed = None;
    }
}

pub struct MockHardware {
    pub journal: Journal,
    pub gnss: MockSource,
    pub wifi: MockSource,
    pub ble: MockSource,
    pub radio: MockRadio,
    pub beacon: MockBeacon,
    pub sensors: MockSensors,
    pub alarm: MockAlarm,
    pub cues: Vec<Cue>,
}

impl MockHardware {
    pub fn new() -> Self {
        let journal = Journal::default();
        Self {
            gnss: MockSource::new(SourceKind::Gnss, journal.clone()),
            wifi: MockSource::new(SourceKind::Wifi, journal.clone()),
            ble: MockSource::new(SourceKind::Ble, journal.clone()),
            radio: MockRadio::new(journal.clone()),
            beacon: MockBeacon::new(journal.clone()),
            sensors: MockSensors::default(),
            alarm: MockAlarm::new(journal.clone()),
            cues: Vec::new(),
            journal,
        }
    }
}

impl Default for MockHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl Hardware for MockHardware {
    type Gnss = MockSource;
    type Wifi = MockSource;
    type Ble = MockSource;
    type Radio = MockRadio;
    type Beacon = MockBeacon;
    type Sensors = MockSensors;
    type Alarm = MockAlarm;

    fn gnss(&mut self) -> &mut MockSource {
        &mut self.gnss
    }

    fn wifi(&mut self) -> &mut MockSource {
        &mut self.wifi
    }

    fn ble(&mut self) -> &mut MockSource {
        &mut self.ble
    }

    fn radio(&mut self) -> &mut MockRadio {
        &mut self.radio
    }

    fn beacon(&mut self) -> &mut MockBeacon {
        &mut self.beacon
    }

    fn sensors(&mut self) -> &mut MockSensors {
        &mut self.sensors
    }

    fn alarm(&mut self) -> &mut MockAlarm {
        &mut self.alarm
    }

    fn indicate(&mut self, cue: Cue) {
        self.cues.push(cue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_is_shared_across_mocks() {
        let mut hw = MockHardware::new();
        hw.source(SourceKind::Wifi).begin().unwrap();
        hw.alarm().start(3);
        hw.radio().join().unwrap();
        assert_eq!(
            hw.journal.calls(),
            vec![Call::Begin(SourceKind::Wifi), Call::AlarmStart(3), Call::Join]
        );
        assert_eq!(hw.journal.alarms(), vec![3]);
    }

    #[test]
    fn alarm_fire_advances_clock() {
        let mut alarm = MockAlarm::new(Journal::default());
        alarm.start(30);
        alarm.fire();
        assert_eq!(alarm.now_secs(), 30);
        assert_eq!(alarm.armed, None);
        alarm.fire();
        assert_eq!(alarm.now_secs(), 30);
    }
}
