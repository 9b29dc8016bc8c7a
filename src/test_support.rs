//! Test doubles for the opaque external interfaces (`Board`, `Pigeon`) —
//! shared across module test blocks so the worker loops' state-machine and
//! timing logic can be exercised end-to-end without real USB/GPS hardware.
//! `ParamStore` and `Publisher`/`Subscriber` already have in-memory
//! implementations usable directly in tests (`paramstore::MemParamStore`,
//! `messaging::Hub`), so only `Board` and `Pigeon` need fakes here.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::board::{
    Board, FaultStatus, FirmwareVersion, HarnessStatus, HealthSnapshot, HwType, SafetyModel,
    UsbPowerMode,
};
use crate::errors::Result;
use crate::pigeon::Pigeon;

/// Every command issued to a [`FakeBoard`], recorded behind an `Arc` so a
/// test can keep a handle to it after the board itself is boxed up as a
/// `dyn Board` and moved into a `BoardHandle`.
#[derive(Default)]
pub struct FakeBoardLog {
    pub can_tx: Mutex<Vec<Vec<u8>>>,
    pub safety_models: Mutex<Vec<(SafetyModel, u16)>>,
    pub power_saves: Mutex<Vec<bool>>,
    pub fan_speeds: Mutex<Vec<u16>>,
    pub ir_powers: Mutex<Vec<u16>>,
    pub usb_power_modes: Mutex<Vec<UsbPowerMode>>,
    pub heartbeats: AtomicU32,
    pub unsafe_modes: Mutex<Vec<u16>>,
    pub rtc_writes: Mutex<Vec<SystemTime>>,
}

pub fn blank_health() -> HealthSnapshot {
    HealthSnapshot {
        uptime: std::time::Duration::from_secs(0),
        voltage_mv: 12000,
        current_ma: 0,
        ignition_line: false,
        ignition_can: false,
        controls_allowed: false,
        gas_interceptor: false,
        can_rx_errs: 0,
        can_tx_errs: 0,
        can_fwd_errs: 0,
        gmlan_errs: 0,
        safety_model: SafetyModel::NoOutput,
        safety_param: 0,
        usb_power_mode: UsbPowerMode::Client,
        fault_status: FaultStatus::Normal,
        power_save_enabled: false,
        heartbeat_lost: false,
        harness_status: HarnessStatus::NotPresent,
        faults: 0,
    }
}

/// In-memory `Board` double. Every command lands both in `health` (so a
/// subsequent `get_state()` reflects it, mirroring a real board) and in
/// `log` (so a test holding a clone of the `Arc` can assert on it after
/// the board has been boxed and moved into a worker thread).
pub struct FakeBoard {
    pub hw_type: HwType,
    pub usb_serial: String,
    pub connected: bool,
    pub comms_healthy: bool,
    pub has_rtc: bool,
    pub health: HealthSnapshot,
    pub rtc: SystemTime,
    pub can_rx_queue: Vec<Vec<u8>>,
    pub log: Arc<FakeBoardLog>,
}

impl FakeBoard {
    pub fn new(hw_type: HwType) -> Self {
        Self::with_log(hw_type, Arc::new(FakeBoardLog::default()))
    }

    pub fn with_log(hw_type: HwType, log: Arc<FakeBoardLog>) -> Self {
        Self {
            hw_type,
            usb_serial: "FAKE0001".to_string(),
            connected: true,
            comms_healthy: true,
            has_rtc: true,
            health: blank_health(),
            rtc: SystemTime::now(),
            can_rx_queue: Vec::new(),
            log,
        }
    }
}

impl Board for FakeBoard {
    fn hw_type(&self) -> HwType {
        self.hw_type
    }

    fn usb_serial(&self) -> &str {
        &self.usb_serial
    }

    fn connected(&self) -> bool {
        self.connected
    }

    fn comms_healthy(&self) -> bool {
        self.comms_healthy
    }

    fn has_rtc(&self) -> bool {
        self.has_rtc
    }

    fn get_firmware_version(&mut self) -> Result<FirmwareVersion> {
        Ok(FirmwareVersion { raw: [0xAA; 8] })
    }

    fn get_state(&mut self) -> Result<HealthSnapshot> {
        Ok(self.health.clone())
    }

    fn set_usb_power_mode(&mut self, mode: UsbPowerMode) -> Result<()> {
        self.health.usb_power_mode = mode;
        self.log.usb_power_modes.lock().unwrap().push(mode);
        Ok(())
    }

    fn set_safety_model(&mut self, model: SafetyModel, param: u16) -> Result<()> {
        self.health.safety_model = model;
        self.health.safety_param = param;
        self.log.safety_models.lock().unwrap().push((model, param));
        Ok(())
    }

    fn set_unsafe_mode(&mut self, mode: u16) -> Result<()> {
        self.log.unsafe_modes.lock().unwrap().push(mode);
        Ok(())
    }

    fn set_power_saving(&mut self, enabled: bool) -> Result<()> {
        self.health.power_save_enabled = enabled;
        self.log.power_saves.lock().unwrap().push(enabled);
        Ok(())
    }

    fn set_loopback(&mut self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    fn get_rtc(&mut self) -> Result<SystemTime> {
        Ok(self.rtc)
    }

    fn set_rtc(&mut self, time: SystemTime) -> Result<()> {
        self.rtc = time;
        self.log.rtc_writes.lock().unwrap().push(time);
        Ok(())
    }

    fn can_receive(&mut self, _bus_shift: u8) -> Result<Vec<u8>> {
        Ok(self.can_rx_queue.pop().unwrap_or_default())
    }

    fn can_send(&mut self, batch: &[u8]) -> Result<()> {
        self.log.can_tx.lock().unwrap().push(batch.to_vec());
        Ok(())
    }

    fn set_fan_speed(&mut self, rpm: u16) -> Result<()> {
        self.log.fan_speeds.lock().unwrap().push(rpm);
        Ok(())
    }

    fn get_fan_speed(&mut self) -> Result<u16> {
        Ok(self.log.fan_speeds.lock().unwrap().last().copied().unwrap_or(0))
    }

    fn set_ir_power(&mut self, percent: u16) -> Result<()> {
        self.log.ir_powers.lock().unwrap().push(percent);
        Ok(())
    }

    fn send_heartbeat(&mut self) -> Result<()> {
        self.log.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Call counters for a [`FakePigeon`], kept behind an `Arc` so a test can
/// retain a handle after the pigeon itself has been moved into a worker
/// thread.
#[derive(Default)]
pub struct FakePigeonLog {
    pub inits: AtomicU32,
    pub stops: AtomicU32,
    pub powered: Mutex<bool>,
}

/// In-memory `Pigeon` double recording init/stop/power calls and yielding
/// pre-queued receive buffers.
pub struct FakePigeon {
    pub log: Arc<FakePigeonLog>,
    pub to_receive: std::collections::VecDeque<Vec<u8>>,
}

impl FakePigeon {
    pub fn new() -> Self {
        Self::with_log(Arc::new(FakePigeonLog::default()))
    }

    pub fn with_log(log: Arc<FakePigeonLog>) -> Self {
        Self {
            log,
            to_receive: std::collections::VecDeque::new(),
        }
    }
}

impl Default for FakePigeon {
    fn default() -> Self {
        Self::new()
    }
}

impl Pigeon for FakePigeon {
    fn init(&mut self) -> Result<()> {
        self.log.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        Ok(self.to_receive.pop_front().unwrap_or_default())
    }

    fn stop(&mut self) -> Result<()> {
        self.log.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_power(&mut self, on: bool) -> Result<()> {
        *self.log.powered.lock().unwrap() = on;
        Ok(())
    }
}
