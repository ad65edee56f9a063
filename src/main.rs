//! LoRaWAN tracker firmware
//!
//! Wires the tracker core to an ESP32 board: WiFi sniffer and BLE scanner as
//! evidence sources, a UART GNSS receiver, an AT-command LoRaWAN modem, and a
//! trouble-host advertiser for the iBeacon. One task owns the `Tracker`;
//! everything else feeds it through `INPUT`.

#![no_std]
#![no_main]

extern crate alloc;

use esp_backtrace as _;

esp_bootloader_esp_idf::esp_app_desc!();

#[cfg(not(any(feature = "board-xiao", feature = "board-m5stickc")))]
compile_error!("select a board feature: `xiao` or `m5stickc`");

// Hardware-specific modules (binary crate only)
#[cfg(feature = "m5stickc")]
mod buzzer;

pub(crate) use lora_tracker::board;

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicBool, Ordering};
use critical_section::Mutex;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use esp_hal::analog::adc::{Adc, AdcConfig, Attenuation};
use esp_hal::gpio::{Input, InputConfig, Pull};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::uart::{Config as UartConfig, Uart, UartRx, UartTx};
#[cfg(feature = "m5stickc")]
use esp_hal::{
    i2c::master::{Config as I2cConfig, I2c},
    time::Rate,
};
use esp_hal::Async;
use heapless::{String, Vec};
use static_cell::StaticCell;

use trouble_host::prelude::*;

use lora_tracker::beacon::BeaconState;
use lora_tracker::comm::{self, LineReader};
use lora_tracker::config::TrackerConfig;
use lora_tracker::encoder::EventState;
use lora_tracker::error::{ScanError, TrackerError};
use lora_tracker::gnss::GnssReceiver;
use lora_tracker::modem::{AtModem, AT_LINE_LEN, MODEM_BAUD};
use lora_tracker::platform::{
    AdvertiseFault, Alarm, BeaconRadio, Cue, Hardware, ScanSource, Sensors,
};
use lora_tracker::protocol::{DeviceMessage, HostCommand, MsgBuffer, MAX_MSG_LEN, VERSION};
use lora_tracker::scanner::{self, RecordCollector, Sighting};
use lora_tracker::sensors::SensorSample;
#[cfg(feature = "m5stickc")]
use lora_tracker::sensors::mpu6886;
use lora_tracker::tracker::{uplink_message, Tracker, TrackerEvent};

/// Longest BLE advertising or scan-response payload
const BLE_DATA_LEN: usize = 31;

/// Battery sampling period
const BATTERY_PERIOD: Duration = Duration::from_secs(60);

/// Accelerometer and temperature sampling period
#[cfg(feature = "m5stickc")]
const IMU_PERIOD: Duration = Duration::from_secs(5);

/// Status line period
const STATUS_PERIOD: Duration = Duration::from_secs(60);

/// How often the modem driver is polled for command timeouts
const MODEM_POLL: Duration = Duration::from_secs(1);

#[cfg(feature = "xiao")]
type BatteryPin = esp_hal::peripherals::GPIO1<'static>;
#[cfg(feature = "m5stickc")]
type BatteryPin = esp_hal::peripherals::GPIO38<'static>;

// ── Inputs to the tracker task ───────────────────────────────────────

enum TrackerInput {
    Event(TrackerEvent),
    ModemLine(Vec<u8, MAX_MSG_LEN>),
    Console(HostCommand),
}

#[derive(Clone)]
enum BeaconCommand {
    Advertise {
        adv: Vec<u8, BLE_DATA_LEN>,
        scan_rsp: Vec<u8, BLE_DATA_LEN>,
    },
    Stop,
}

type InputChannel = Channel<CriticalSectionRawMutex, TrackerInput, 4>;
type ModemTxChannel = Channel<CriticalSectionRawMutex, String<AT_LINE_LEN>, 2>;

// ── Static channels and shared state ─────────────────────────────────

/// Everything the tracker task reacts to
static INPUT: InputChannel = Channel::new();

/// Formatted AT command lines for the modem UART writer
static MODEM_TX: ModemTxChannel = Channel::new();

/// Cues for the buzzer task
pub(crate) static CUE_CHANNEL: Channel<CriticalSectionRawMutex, Cue, 4> = Channel::new();

/// Latest beacon request for the advertiser
static BEACON_CMD: Signal<CriticalSectionRawMutex, BeaconCommand> = Signal::new();

/// BLE scan on/off requests for the scanner
static BLE_SCAN: Signal<CriticalSectionRawMutex, bool> = Signal::new();

/// Whether the channel hopper should run
static WIFI_SCANNING: AtomicBool = AtomicBool::new(false);

/// Evidence collectors, shared with the sniffer ISR and the BLE runner
static WIFI_COLLECTOR: Mutex<RefCell<RecordCollector>> =
    Mutex::new(RefCell::new(RecordCollector::new()));
static BLE_COLLECTOR: Mutex<RefCell<RecordCollector>> =
    Mutex::new(RefCell::new(RecordCollector::new()));
static GNSS: StaticCell<Mutex<RefCell<GnssReceiver>>> = StaticCell::new();

/// Latest sensor readings
static SENSOR_SAMPLE: Mutex<Cell<SensorSample>> = Mutex::new(Cell::new(SensorSample {
    battery_mv: 0,
    temperature: 0,
    light: 0,
    accel: None,
}));

fn now_ms() -> u64 {
    Instant::now().as_millis()
}

fn uptime_secs() -> u32 {
    Instant::now().as_secs() as u32
}

// ── Hardware bindings ────────────────────────────────────────────────

/// A collector shared with an interrupt-context producer. `radio` switches
/// the producer on at `begin` and off at `stop`.
struct SharedSource<T: 'static> {
    inner: &'static Mutex<RefCell<T>>,
    radio: fn(bool),
}

impl<T: ScanSource> ScanSource for SharedSource<T> {
    fn begin(&mut self) -> Result<(), ScanError> {
        critical_section::with(|cs| self.inner.borrow(cs).borrow_mut().begin())?;
        (self.radio)(true);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ScanError> {
        (self.radio)(false);
        critical_section::with(|cs| self.inner.borrow(cs).borrow_mut().stop())
    }

    fn results(&mut self, out: &mut [u8]) -> Result<usize, ScanError> {
        critical_section::with(|cs| self.inner.borrow(cs).borrow_mut().results(out))
    }
}

fn wifi_radio(on: bool) {
    WIFI_SCANNING.store(on, Ordering::Relaxed);
}

fn ble_radio(on: bool) {
    BLE_SCAN.signal(on);
}

/// GNSS stays powered; the receiver only listens during its stage.
fn gnss_radio(_on: bool) {}

/// Beacon payloads relayed to the advertiser in the BLE join.
#[derive(Default)]
struct EspBeacon {
    adv: Vec<u8, BLE_DATA_LEN>,
    scan_rsp: Vec<u8, BLE_DATA_LEN>,
    active: bool,
}

impl EspBeacon {
    fn advertise(&self) {
        BEACON_CMD.signal(BeaconCommand::Advertise {
            adv: self.adv.clone(),
            scan_rsp: self.scan_rsp.clone(),
        });
    }
}

impl BeaconRadio for EspBeacon {
    fn configure(&mut self, adv: &[u8], scan_rsp: &[u8]) -> Result<(), AdvertiseFault> {
        self.adv = Vec::from_slice(adv).map_err(|_| AdvertiseFault)?;
        self.scan_rsp = Vec::from_slice(scan_rsp).map_err(|_| AdvertiseFault)?;
        if self.active {
            self.advertise();
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), AdvertiseFault> {
        if self.adv.is_empty() {
            return Err(AdvertiseFault);
        }
        self.active = true;
        self.advertise();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AdvertiseFault> {
        self.active = false;
        BEACON_CMD.signal(BeaconCommand::Stop);
        Ok(())
    }
}

/// Reads the sample kept current by `battery_task`.
struct SharedSensors;

impl SharedSensors {
    fn sample(&self) -> SensorSample {
        critical_section::with(|cs| SENSOR_SAMPLE.borrow(cs).get())
    }
}

impl Sensors for SharedSensors {
    fn battery_percent(&mut self) -> u8 {
        self.sample().battery_percent()
    }

    fn temperature_decicelsius(&mut self) -> i16 {
        self.sample().temperature_decicelsius()
    }

    fn light_lux(&mut self) -> u16 {
        self.sample().light_lux()
    }

    fn acceleration(&mut self) -> Option<[i16; 3]> {
        self.sample().acceleration()
    }
}

/// Alarm backed by a deadline the tracker task sleeps on.
#[derive(Default)]
struct DeadlineAlarm {
    deadline: Option<Instant>,
}

impl DeadlineAlarm {
    /// Disarm and report whether the deadline has passed.
    fn take_expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(at) if at <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

impl Alarm for DeadlineAlarm {
    fn now_secs(&self) -> u32 {
        uptime_secs()
    }

    fn start(&mut self, secs: u32) {
        self.deadline = Some(Instant::now() + Duration::from_secs(u64::from(secs)));
    }

    fn clear(&mut self) {
        self.deadline = None;
    }
}

struct Board {
    gnss: SharedSource<GnssReceiver>,
    wifi: SharedSource<RecordCollector>,
    ble: SharedSource<RecordCollector>,
    radio: AtModem,
    beacon: EspBeacon,
    sensors: SharedSensors,
    alarm: DeadlineAlarm,
}

impl Hardware for Board {
    type Gnss = SharedSource<GnssReceiver>;
    type Wifi = SharedSource<RecordCollector>;
    type Ble = SharedSource<RecordCollector>;
    type Radio = AtModem;
    type Beacon = EspBeacon;
    type Sensors = SharedSensors;
    type Alarm = DeadlineAlarm;

    fn gnss(&mut self) -> &mut Self::Gnss {
        &mut self.gnss
    }

    fn wifi(&mut self) -> &mut Self::Wifi {
        &mut self.wifi
    }

    fn ble(&mut self) -> &mut Self::Ble {
        &mut self.ble
    }

    fn radio(&mut self) -> &mut Self::Radio {
        &mut self.radio
    }

    fn beacon(&mut self) -> &mut Self::Beacon {
        &mut self.beacon
    }

    fn sensors(&mut self) -> &mut Self::Sensors {
        &mut self.sensors
    }

    fn alarm(&mut self) -> &mut Self::Alarm {
        &mut self.alarm
    }

    fn indicate(&mut self, cue: Cue) {
        if board::HAS_BUZZER {
            let _ = CUE_CHANNEL.try_send(cue);
        } else {
            log::info!("Cue: {:?}", cue);
        }
    }
}

// ── WiFi sniffer ─────────────────────────────────────────────────────

/// WiFi sniffer callback — called from ISR context by the esp-radio sniffer.
///
/// Parses raw 802.11 frames using `parse_wifi_frame()` (ieee80211 crate)
/// and records AP sightings; the collector drops them outside a WiFi stage.
fn wifi_sniffer_callback(pkt: esp_radio::wifi::sniffer::PromiscuousPkt<'_>) {
    let rssi = pkt.rx_cntl.rssi as i8;
    if let Some(sighting) = scanner::parse_wifi_frame(pkt.data, rssi) {
        critical_section::with(|cs| WIFI_COLLECTOR.borrow(cs).borrow_mut().push(sighting));
    }
}

// FFI binding for WiFi channel control.
// The symbol is linked via esp-radio's WiFi driver.
unsafe extern "C" {
    fn esp_wifi_set_channel(primary: u8, second: u32) -> i32;
}

/// WiFi channel hop task — cycles through 2.4 GHz channels while a WiFi
/// stage is running.
#[embassy_executor::task]
async fn wifi_channel_hop_task() {
    loop {
        if !WIFI_SCANNING.load(Ordering::Relaxed) {
            Timer::after(Duration::from_millis(100)).await;
            continue;
        }
        for &ch in scanner::WIFI_CHANNELS {
            unsafe {
                esp_wifi_set_channel(ch, 0);
            }
            Timer::after(Duration::from_millis(scanner::DEFAULT_DWELL_MS)).await;
        }
    }
}

// ── BLE scan event handler ───────────────────────────────────────────

/// EventHandler for BLE advertisement reports from trouble-host.
///
/// Called synchronously from the runner — must not block.
struct ScanEventHandler;

impl EventHandler for ScanEventHandler {
    fn on_adv_reports(&self, mut it: LeAdvReportsIter<'_>) {
        while let Some(Ok(report)) = it.next() {
            let Ok(mut mac) = <[u8; 6]>::try_from(report.addr.raw()) else {
                continue;
            };
            // HCI addresses are little-endian
            mac.reverse();
            let sighting = Sighting {
                mac,
                rssi: report.rssi,
            };
            critical_section::with(|cs| BLE_COLLECTOR.borrow(cs).borrow_mut().push(sighting));
        }
    }
}

// ── Entry point ──────────────────────────────────────────────────────

#[esp_rtos::main]
async fn main(spawner: embassy_executor::Spawner) {
    esp_println::logger::init_logger_from_env();

    let peripherals = esp_hal::init(esp_hal::Config::default());

    // Set up heap allocator (needed for BLE + WiFi coex stacks).
    // ESP32-S3 needs more heap for coex; ESP32 is tighter on DRAM.
    #[cfg(feature = "esp32")]
    {
        esp_alloc::heap_allocator!(size: 64 * 1024);
    }
    #[cfg(not(feature = "esp32"))]
    {
        esp_alloc::heap_allocator!(size: 128 * 1024);
    }

    // Start the RTOS — requires timer + software interrupt
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    log::info!("lora-tracker v{} starting on {}", VERSION, board::BOARD_NAME);

    // Hold power on (M5StickC Plus2 needs GPIO4 HIGH to stay powered)
    #[cfg(feature = "m5stickc")]
    let _power_hold = {
        log::info!("Power hold on GPIO{}", board::POWER_HOLD_PIN);
        esp_hal::gpio::Output::new(
            peripherals.GPIO4,
            esp_hal::gpio::Level::High,
            esp_hal::gpio::OutputConfig::default(),
        )
    };

    // ── Board pins ─────────────────────────────────────────────────────

    #[cfg(feature = "xiao")]
    let (gnss_rx, modem_rx, modem_tx, console_rx, button_pin, battery_pin) = (
        peripherals.GPIO6,
        peripherals.GPIO8,
        peripherals.GPIO7,
        peripherals.GPIO44,
        peripherals.GPIO0,
        peripherals.GPIO1,
    );
    #[cfg(feature = "m5stickc")]
    let (gnss_rx, modem_rx, modem_tx, console_rx, button_pin, battery_pin) = (
        peripherals.GPIO36,
        peripherals.GPIO33,
        peripherals.GPIO32,
        peripherals.GPIO3,
        peripherals.GPIO37,
        peripherals.GPIO38,
    );
    log::info!(
        "Pins: GNSS rx GPIO{}, modem rx GPIO{} tx GPIO{}, console rx GPIO{}, button GPIO{}, battery GPIO{}",
        board::GNSS_RX_PIN,
        board::MODEM_RX_PIN,
        board::MODEM_TX_PIN,
        board::CONSOLE_RX_PIN,
        board::BUTTON_PIN,
        board::BATTERY_ADC_PIN
    );

    // ── UARTs ──────────────────────────────────────────────────────────

    let (modem_uart_rx, modem_uart_tx) = Uart::new(
        peripherals.UART1,
        UartConfig::default().with_baudrate(MODEM_BAUD),
    )
    .expect("modem UART init failed")
    .with_rx(modem_rx)
    .with_tx(modem_tx)
    .into_async()
    .split();

    let (gnss_uart_rx, _) = Uart::new(peripherals.UART2, UartConfig::default().with_baudrate(9600))
        .expect("GNSS UART init failed")
        .with_rx(gnss_rx)
        .into_async()
        .split();

    let (console_uart_rx, _) = Uart::new(
        peripherals.UART0,
        UartConfig::default().with_baudrate(comm::SERIAL_BAUD),
    )
    .expect("console UART init failed")
    .with_rx(console_rx)
    .into_async()
    .split();

    let button = Input::new(button_pin, InputConfig::default().with_pull(Pull::Up));

    let gnss_shared: &'static Mutex<RefCell<GnssReceiver>> =
        GNSS.init(Mutex::new(RefCell::new(GnssReceiver::new())));

    spawner.spawn(modem_rx_task(modem_uart_rx)).unwrap();
    spawner.spawn(modem_tx_task(modem_uart_tx)).unwrap();
    if board::HAS_GNSS {
        spawner.spawn(gnss_task(gnss_uart_rx, gnss_shared)).unwrap();
    } else {
        log::warn!("No GNSS receiver on this board, GNSS stages will report no fix");
    }
    spawner.spawn(console_task(console_uart_rx)).unwrap();
    spawner.spawn(button_task(button)).unwrap();
    spawner.spawn(battery_task(peripherals.ADC1, battery_pin)).unwrap();
    spawner.spawn(status_task()).unwrap();

    #[cfg(feature = "m5stickc")]
    {
        spawner
            .spawn(buzzer::buzzer_task(peripherals.LEDC, peripherals.GPIO2))
            .unwrap();
        log::info!("Buzzer task spawned");
    }

    #[cfg(feature = "m5stickc")]
    {
        let i2c = I2c::new(
            peripherals.I2C0,
            I2cConfig::default().with_frequency(Rate::from_khz(400)),
        )
        .expect("IMU I2C init failed")
        .with_sda(peripherals.GPIO21)
        .with_scl(peripherals.GPIO22)
        .into_async();
        log::info!(
            "IMU on I2C (SDA GPIO{}, SCL GPIO{})",
            board::IMU_SDA_PIN,
            board::IMU_SCL_PIN
        );
        spawner.spawn(imu_task(i2c)).unwrap();
    }

    // ── BLE radio initialization ───────────────────────────────────────
    // BLE must be initialized BEFORE WiFi for coexistence to work
    // (especially on ESP32-S3).

    let connector =
        esp_radio::ble::controller::BleConnector::new(peripherals.BT, Default::default())
            .expect("BLE connector init failed");

    log::info!("BLE connector initialized");

    // ── WiFi sniffer initialization ─────────────────────────────────────

    let (_wifi_controller, wifi_interfaces) =
        esp_radio::wifi::new(peripherals.WIFI, Default::default()).expect("WiFi init failed");

    let mut sniffer = wifi_interfaces.sniffer;
    sniffer.set_receive_cb(wifi_sniffer_callback);
    sniffer
        .set_promiscuous_mode(true)
        .expect("Promiscuous mode failed");

    spawner.spawn(wifi_channel_hop_task()).unwrap();

    log::info!("WiFi sniffer initialized in promiscuous mode");

    // ── Tracker core ───────────────────────────────────────────────────

    let mac = esp_hal::efuse::Efuse::mac_address();
    let beacon = BeaconState::new(board::BEACON_NAME_PREFIX, mac);
    log::info!("Beacon name: {}", beacon.name());

    let hardware = Board {
        gnss: SharedSource {
            inner: gnss_shared,
            radio: gnss_radio,
        },
        wifi: SharedSource {
            inner: &WIFI_COLLECTOR,
            radio: wifi_radio,
        },
        ble: SharedSource {
            inner: &BLE_COLLECTOR,
            radio: ble_radio,
        },
        radio: AtModem::new(),
        beacon: EspBeacon::default(),
        sensors: SharedSensors,
        alarm: DeadlineAlarm::default(),
    };
    let tracker = Tracker::new(hardware, TrackerConfig::new(), beacon);
    spawner.spawn(tracker_task(tracker)).unwrap();

    // ── BLE host ───────────────────────────────────────────────────────

    let controller: ExternalController<_, 20> = ExternalController::new(connector);

    static HOST_RESOURCES: StaticCell<HostResources<DefaultPacketPool, 1, 2>> = StaticCell::new();
    let resources = HOST_RESOURCES.init(HostResources::new());

    // Static random address: two top bits set
    let mut addr = mac;
    addr.reverse();
    addr[5] |= 0xC0;
    let address = Address::random(addr);

    let stack = trouble_host::new(controller, resources).set_random_address(address);
    let Host {
        mut peripheral,
        central,
        mut runner,
        ..
    } = stack.build();

    log::info!("BLE radio initialized");

    let scan_handler = ScanEventHandler;

    // ── BLE orchestration ──────────────────────────────────────────────
    //
    // Three concurrent futures via join3:
    //   1. BLE stack runner (drives HCI, delivers scan reports to handler)
    //   2. BLE scanner (scan session open only during BLE stages)
    //   3. Beacon advertiser (non-connectable, follows BEACON_CMD)

    let _ = embassy_futures::join::join3(
        // ── Runner: drives the BLE stack ────────────────────────────────
        async {
            loop {
                if let Err(e) = runner.run_with_handler(&scan_handler).await {
                    log::error!("BLE runner error: {:?}", e);
                    Timer::after(Duration::from_secs(1)).await;
                }
            }
        },
        // ── Scanner: session lives from scan on to scan off ────────────
        async {
            let mut scanner = trouble_host::scan::Scanner::new(central);
            let config = ScanConfig::default();

            loop {
                if !BLE_SCAN.wait().await {
                    continue;
                }
                match scanner.scan(&config).await {
                    Ok(_session) => {
                        log::debug!("BLE scan started");
                        // Reports flow through ScanEventHandler until the
                        // session is dropped.
                        while BLE_SCAN.wait().await {}
                        log::debug!("BLE scan stopped");
                    }
                    Err(e) => log::error!("BLE scan failed to start: {:?}", e),
                }
            }
        },
        // ── Advertiser: iBeacon while the tracker wants it ─────────────
        async {
            let mut command = BEACON_CMD.wait().await;
            loop {
                command = match command {
                    BeaconCommand::Stop => BEACON_CMD.wait().await,
                    BeaconCommand::Advertise { adv, scan_rsp } => {
                        let result = peripheral
                            .advertise(
                                &Default::default(),
                                Advertisement::NonconnectableScannableUndirected {
                                    adv_data: &adv,
                                    scan_data: &scan_rsp,
                                },
                            )
                            .await;
                        match result {
                            // Advertising runs until the advertiser is dropped
                            Ok(_advertiser) => BEACON_CMD.wait().await,
                            Err(e) => {
                                log::error!("BLE advertise error: {:?}", e);
                                match select(BEACON_CMD.wait(), Timer::after(Duration::from_secs(5)))
                                    .await
                                {
                                    Either::First(next) => next,
                                    Either::Second(()) => BeaconCommand::Advertise {
                                        adv: adv.clone(),
                                        scan_rsp: scan_rsp.clone(),
                                    },
                                }
                            }
                        }
                    }
                };
            }
        },
    )
    .await;
}

// ── Tracker task ─────────────────────────────────────────────────────

/// Owns the tracker. Sleeps until an input arrives, the alarm deadline
/// passes, or the modem needs polling.
#[embassy_executor::task]
async fn tracker_task(mut tracker: Tracker<Board>) {
    log::info!("Tracker task started");

    handle_event(&mut tracker, TrackerEvent::Reset);
    flush_modem(&mut tracker).await;

    loop {
        let poll_at = Instant::now() + MODEM_POLL;
        let wake = match tracker.hardware().alarm.deadline {
            Some(at) if at < poll_at => at,
            _ => poll_at,
        };

        match select(INPUT.receive(), Timer::at(wake)).await {
            Either::First(TrackerInput::Event(event)) => handle_event(&mut tracker, event),
            Either::First(TrackerInput::ModemLine(line)) => {
                if let Some(event) = tracker.hardware().radio.on_line(&line, now_ms()) {
                    handle_event(&mut tracker, event);
                }
            }
            Either::First(TrackerInput::Console(cmd)) => handle_console(&mut tracker, cmd),
            Either::Second(()) => {
                if let Some(event) = tracker.hardware().radio.poll(now_ms()) {
                    handle_event(&mut tracker, event);
                }
                if tracker.hardware().alarm.take_expired(Instant::now()) {
                    handle_event(&mut tracker, TrackerEvent::Alarm);
                }
            }
        }

        flush_modem(&mut tracker).await;
    }
}

fn handle_event(tracker: &mut Tracker<Board>, event: TrackerEvent) {
    if let TrackerEvent::Downlink {
        port,
        rssi,
        snr,
        ref payload,
    } = event
    {
        emit(&DeviceMessage::Downlink {
            port,
            rssi,
            snr,
            len: payload.len(),
        });
    }

    match tracker.dispatch(event) {
        Ok(Some(sent)) => emit(&uplink_message(&sent)),
        Ok(None) => {}
        Err(e) => fatal(e),
    }
}

fn handle_console(tracker: &mut Tracker<Board>, cmd: HostCommand) {
    match cmd {
        HostCommand::GetStatus => {}
        HostCommand::Track => handle_event(
            tracker,
            TrackerEvent::UserTrigger {
                event: EventState::USER,
            },
        ),
        HostCommand::Suspend => handle_event(tracker, TrackerEvent::Suspend),
        HostCommand::Configure(c) => tracker.configure(c),
    }
    emit(&tracker.status(uptime_secs(), board::BOARD_NAME));
}

/// Hand the modem its next command, if it is ready for one.
async fn flush_modem(tracker: &mut Tracker<Board>) {
    let Some(command) = tracker.hardware().radio.next_command(now_ms()) else {
        return;
    };
    let mut line = String::new();
    match command.write_to(&mut line) {
        Ok(()) => MODEM_TX.send(line).await,
        Err(_) => log::error!("AT command does not fit a line: {:?}", command),
    }
}

fn fatal(e: TrackerError) -> ! {
    log::error!("{}, resetting", e);
    esp_hal::system::software_reset()
}

/// Serialize and log one NDJSON line on the console.
fn emit(msg: &DeviceMessage) {
    let mut buf = MsgBuffer::new();
    buf.resize_default(MAX_MSG_LEN).ok();
    if let Some(len) = comm::serialize_message(msg, &mut buf) {
        buf.truncate(len);
        if let Ok(s) = core::str::from_utf8(&buf) {
            log::info!("{}", s.trim_end());
        }
    }
}

// ── Peripheral tasks ─────────────────────────────────────────────────

/// Modem response reader — splits the UART stream into lines for the
/// tracker task.
#[embassy_executor::task]
async fn modem_rx_task(mut rx: UartRx<'static, Async>) {
    let mut reader: LineReader = LineReader::new();
    let mut buf = [0u8; 64];

    loop {
        let n = match rx.read_async(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Modem UART error: {:?}", e);
                continue;
            }
        };
        for &byte in &buf[..n] {
            if let Some(line) = reader.feed(byte) {
                if let Ok(line) = Vec::from_slice(line) {
                    INPUT.send(TrackerInput::ModemLine(line)).await;
                }
            }
        }
    }
}

/// Modem command writer
#[embassy_executor::task]
async fn modem_tx_task(mut tx: UartTx<'static, Async>) {
    loop {
        let line = MODEM_TX.receive().await;
        log::debug!("> {}", line.trim_end());
        let mut bytes = line.as_bytes();
        while !bytes.is_empty() {
            match tx.write_async(bytes).await {
                Ok(n) => bytes = &bytes[n..],
                Err(e) => {
                    log::warn!("Modem UART write error: {:?}", e);
                    break;
                }
            }
        }
    }
}

/// GNSS NMEA reader
#[embassy_executor::task]
async fn gnss_task(
    mut rx: UartRx<'static, Async>,
    receiver: &'static Mutex<RefCell<GnssReceiver>>,
) {
    let mut buf = [0u8; 64];
    loop {
        match rx.read_async(&mut buf).await {
            Ok(n) => critical_section::with(|cs| {
                receiver.borrow(cs).borrow_mut().feed_all(&buf[..n]);
            }),
            Err(e) => log::warn!("GNSS UART error: {:?}", e),
        }
    }
}

/// Serial console — NDJSON commands, one per line
#[embassy_executor::task]
async fn console_task(mut rx: UartRx<'static, Async>) {
    let mut reader: LineReader = LineReader::new();
    let mut buf = [0u8; 32];

    loop {
        let Ok(n) = rx.read_async(&mut buf).await else {
            continue;
        };
        for &byte in &buf[..n] {
            if let Some(line) = reader.feed(byte) {
                if let Some(cmd) = comm::parse_command(line) {
                    INPUT.send(TrackerInput::Console(cmd)).await;
                }
            }
        }
    }
}

/// User button — each press requests an emergency campaign.
#[embassy_executor::task]
async fn button_task(mut button: Input<'static>) {
    loop {
        button.wait_for_falling_edge().await;
        // debounce
        Timer::after(Duration::from_millis(50)).await;
        if button.is_high() {
            continue;
        }
        log::info!("Button pressed");
        INPUT
            .send(TrackerInput::Event(TrackerEvent::UserTrigger {
                event: EventState::USER,
            }))
            .await;
        button.wait_for_high().await;
    }
}

/// Battery voltage sampling
#[embassy_executor::task]
async fn battery_task(adc_peripheral: esp_hal::peripherals::ADC1<'static>, pin: BatteryPin) {
    let mut adc_config = AdcConfig::new();
    let mut pin = adc_config.enable_pin(pin, Attenuation::_11dB);
    let mut adc = Adc::new(adc_peripheral, adc_config);

    loop {
        let raw = loop {
            if let Ok(raw) = adc.read_oneshot(&mut pin) {
                break raw;
            }
            Timer::after(Duration::from_millis(1)).await;
        };
        // TODO: apply eFuse ADC calibration (AdcCalCurve) instead of the
        // nominal 11 dB full scale.
        let mv = (u32::from(raw) * 3100 / 4095) as u16 * board::BATTERY_DIVIDER;
        critical_section::with(|cs| {
            let cell = SENSOR_SAMPLE.borrow(cs);
            let mut sample = cell.get();
            sample.battery_mv = mv;
            cell.set(sample);
        });
        log::debug!("Battery: {} mV", mv);

        Timer::after(BATTERY_PERIOD).await;
    }
}

/// IMU sampling: acceleration and die temperature from the MPU6886
#[cfg(feature = "m5stickc")]
#[embassy_executor::task]
async fn imu_task(mut i2c: I2c<'static, Async>) {
    let mut id = [0u8; 1];
    match i2c.write_read(mpu6886::ADDR, &[mpu6886::WHO_AM_I], &mut id).await {
        Ok(()) if id[0] == mpu6886::WHO_AM_I_VALUE => {}
        Ok(()) => log::warn!("Unexpected IMU id 0x{:02X}", id[0]),
        Err(e) => {
            log::error!("IMU not responding: {:?}", e);
            return;
        }
    }
    let setup = [
        [mpu6886::PWR_MGMT_1, mpu6886::PWR_MGMT_1_CLKSEL_AUTO],
        [mpu6886::ACCEL_CONFIG, mpu6886::ACCEL_FS_2G],
    ];
    for write in setup {
        if let Err(e) = i2c.write(mpu6886::ADDR, &write).await {
            log::error!("IMU setup failed: {:?}", e);
            return;
        }
        Timer::after(Duration::from_millis(10)).await;
    }
    log::info!("IMU ready");

    let mut buf = [0u8; 8];
    loop {
        match i2c
            .write_read(mpu6886::ADDR, &[mpu6886::ACCEL_XOUT_H], &mut buf)
            .await
        {
            Ok(()) => {
                let (accel, temperature) = mpu6886::decode(&buf);
                critical_section::with(|cs| {
                    let cell = SENSOR_SAMPLE.borrow(cs);
                    let mut sample = cell.get();
                    sample.accel = Some(accel);
                    sample.temperature = temperature;
                    cell.set(sample);
                });
                log::debug!("IMU: accel {:?}, {} dC", accel, temperature);
            }
            Err(e) => log::warn!("IMU read failed: {:?}", e),
        }
        Timer::after(IMU_PERIOD).await;
    }
}

/// Periodic status reporting task
#[embassy_executor::task]
async fn status_task() {
    loop {
        Timer::after(STATUS_PERIOD).await;
        INPUT.send(TrackerInput::Console(HostCommand::GetStatus)).await;
    }
}
