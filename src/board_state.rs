//! Board-state loop (spec §4.4): the 2 Hz supervisor of ignition, safety
//! mode, and power-saving — the most involved of the worker loops.

use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use crate::board::{Board, FaultKind, HwType, SafetyModel, UsbPowerMode};
use crate::config::{Config, Platform};
use crate::messaging::{Message, Publisher};
use crate::paramstore::{ParamStore, CLEAR_ON_IGNITION_OFF, CLEAR_ON_IGNITION_ON};
use crate::periodic::Ticker;
use crate::state::Shared;
use crate::supervisor::BoardHandle;

const TICK_PERIOD: Duration = Duration::from_millis(500);
/// RTC write-back tolerance (spec §4.4 item 8, §8 boundary behavior).
const RTC_TOLERANCE: Duration = Duration::from_millis(1100);

/// Sysfs nodes `TICI` reads voltage/current from instead of trusting the
/// board's own health report. The exact nodes are a platform detail outside
/// this daemon's opaque-interface boundary (spec §1); these are the
/// conventional hwmon locations on that hardware.
const TICI_VOLTAGE_PATH: &str = "/sys/class/hwmon/hwmon1/in1_input";
const TICI_CURRENT_PATH: &str = "/sys/class/hwmon/hwmon1/curr1_input";
/// A sysfs read exceeding this is logged (spec §4.4 final paragraph).
const SYSFS_READ_WARN_AFTER: Duration = Duration::from_millis(50);

#[derive(Serialize)]
struct PandaStateMessage {
    valid: bool,
    panda_type: &'static str,
    ignition_line: bool,
    fan_rpm: u16,
    faults: Vec<&'static str>,
    uptime_secs: u64,
    voltage_mv: u32,
    current_ma: u32,
    controls_allowed: bool,
    safety_model: u16,
    safety_param: u16,
    usb_power_mode: &'static str,
    power_save_enabled: bool,
    harness_status: &'static str,
}

fn hw_type_name(hw_type: HwType) -> &'static str {
    match hw_type {
        HwType::White => "WHITE",
        HwType::Grey => "GREY",
        HwType::Black => "BLACK",
        HwType::Pedal => "PEDAL",
        HwType::Uno => "UNO",
        HwType::Dos => "DOS",
        HwType::Unknown => "UNKNOWN",
    }
}

fn fault_name(kind: FaultKind) -> &'static str {
    match kind {
        FaultKind::RelayMalfunction => "RELAY_MALFUNCTION",
        FaultKind::UnusedInterruptRateTach => "UNUSED_INTERRUPT_RATE_TACH",
        FaultKind::Sensor => "SENSOR",
        FaultKind::CanCommunication => "CAN_COMMUNICATION",
        FaultKind::GmlanCommunication => "GMLAN_COMMUNICATION",
        FaultKind::OverheatingShutdown => "OVERHEATING_SHUTDOWN",
        FaultKind::WatchdogReset => "WATCHDOG_RESET",
        FaultKind::InterruptRateTick => "INTERRUPT_RATE_TICK",
    }
}

fn usb_power_mode_name(mode: UsbPowerMode) -> &'static str {
    match mode {
        UsbPowerMode::Client => "CLIENT",
        UsbPowerMode::Cdp => "CDP",
        UsbPowerMode::Dcp => "DCP",
    }
}

fn harness_status_name(status: crate::board::HarnessStatus) -> &'static str {
    use crate::board::HarnessStatus::*;
    match status {
        NotPresent => "NOT_PRESENT",
        Normal => "NORMAL",
        Flipped => "FLIPPED",
    }
}

struct State {
    last_ignition: bool,
    no_ignition_cnt: u64,
}

pub fn run(
    shared: &Shared,
    config: &Config,
    params: &dyn ParamStore,
    main: Option<&BoardHandle>,
    aux: Option<&BoardHandle>,
    panda_state_out: &dyn Publisher,
    spawn_safety_setter: impl Fn(),
) {
    let mut ticker = Ticker::new(TICK_PERIOD);
    let mut state = State {
        last_ignition: false,
        no_ignition_cnt: 0,
    };

    loop {
        if shared.exit_requested() {
            return;
        }
        ticker.tick();

        let Some(main) = main else {
            publish_keepalive(panda_state_out);
            continue;
        };

        if !main.lock().unwrap().connected() {
            log::info!("board_state: main disconnected, exiting");
            return;
        }

        tick(shared, config, params, main, aux, panda_state_out, &mut state, &spawn_safety_setter);
    }
}

#[allow(clippy::too_many_arguments)]
fn tick(
    shared: &Shared,
    config: &Config,
    params: &dyn ParamStore,
    main: &BoardHandle,
    aux: Option<&BoardHandle>,
    panda_state_out: &dyn Publisher,
    state: &mut State,
    spawn_safety_setter: &impl Fn(),
) {
    let mut main_board = main.lock().unwrap();

    let mut main_health = match main_board.get_state() {
        Ok(health) => health,
        Err(err) => {
            log::warn!("board_state: main poll failed: {err}");
            return;
        }
    };
    coerce_silent(&mut main_health, &mut *main_board);

    if config.platform == Platform::Tici {
        if let Some((voltage_mv, current_ma)) = read_tici_power() {
            main_health.voltage_mv = voltage_mv;
            main_health.current_ma = current_ma;
        }
    }

    let mut aux_health = aux.map(|aux| {
        let mut board = aux.lock().unwrap();
        let mut health = board.get_state().ok();
        if let Some(health) = &mut health {
            coerce_silent(health, &mut *board);
        }
        health
    }).flatten();

    // Ignition derivation (spec §4.4 item 3): from whichever slot is
    // logically bound to the vehicle's main bus.
    let primary_line_can = if shared.main_shift() == 0 {
        (main_health.ignition_line, main_health.ignition_can)
    } else if let Some(health) = &aux_health {
        (health.ignition_line, health.ignition_can)
    } else {
        (main_health.ignition_line, main_health.ignition_can)
    };
    let ignition = config.started || primary_line_can.0 || primary_line_can.1;
    shared.set_ignition(ignition);

    if ignition {
        state.no_ignition_cnt = 0;
    } else {
        state.no_ignition_cnt = state.no_ignition_cnt.saturating_add(1);
    }

    // Power-save (item 4).
    let desired_power_save = !ignition;
    if main_health.power_save_enabled != desired_power_save {
        let _ = main_board.set_power_saving(desired_power_save);
    }
    if let (Some(aux), Some(health)) = (aux, &aux_health) {
        if health.power_save_enabled != desired_power_save {
            let _ = aux.lock().unwrap().set_power_saving(desired_power_save);
        }
    }

    // Safety-off-when-parked (item 5).
    if !ignition && main_health.safety_model != SafetyModel::NoOutput {
        let _ = main_board.set_safety_model(SafetyModel::NoOutput, 0);
    }
    // Open Question #1 (DESIGN.md): aux mirrors main's parked state under
    // the same literal guard spec.md §9 specifies, as a separate command.
    if let Some(aux) = aux {
        if aux_health.is_some() && !ignition && main_health.safety_model != SafetyModel::NoOutput {
            let _ = aux.lock().unwrap().set_safety_model(SafetyModel::NoOutput, 0);
        }
    }

    // Ignition edges (items 6, 7).
    if ignition && !state.last_ignition {
        if let Err(err) = params.clear_all(CLEAR_ON_IGNITION_ON) {
            log::warn!("board_state: clear_all(ON) failed: {err}");
        }
        if shared.try_start_safety_setter() {
            spawn_safety_setter();
        }
    } else if !ignition && state.last_ignition {
        if let Err(err) = params.clear_all(CLEAR_ON_IGNITION_OFF) {
            log::warn!("board_state: clear_all(OFF) failed: {err}");
        }
    }
    state.last_ignition = ignition;

    // RTC write-back (item 8): has_rtc, parked, on the 120-tick cadence, and
    // the host clock itself must be trustworthy — otherwise this would
    // stamp the board with an unsynced/garbage time.
    if main_board.has_rtc()
        && !ignition
        && state.no_ignition_cnt % 120 == 1
        && crate::supervisor::host_clock_is_valid()
    {
        if let Ok(now) = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
            if let Ok(board_time) = main_board.get_rtc() {
                if let Ok(board_secs) = board_time.duration_since(SystemTime::UNIX_EPOCH) {
                    let delta = if now > board_secs { now - board_secs } else { board_secs - now };
                    if delta > RTC_TOLERANCE {
                        let _ = main_board.set_rtc(SystemTime::UNIX_EPOCH + now);
                    }
                }
            }
        }
    }

    // Publish board-state (item 9).
    let faults: Vec<&'static str> = main_health.active_faults().into_iter().map(fault_name).collect();
    let message = PandaStateMessage {
        valid: main_board.comms_healthy(),
        panda_type: hw_type_name(main_board.hw_type()),
        ignition_line: ignition,
        fan_rpm: main_board.get_fan_speed().unwrap_or(0),
        faults,
        uptime_secs: main_health.uptime.as_secs(),
        voltage_mv: main_health.voltage_mv,
        current_ma: main_health.current_ma,
        controls_allowed: main_health.controls_allowed,
        safety_model: main_health.safety_model.code(),
        safety_param: main_health.safety_param,
        usb_power_mode: usb_power_mode_name(main_health.usb_power_mode),
        power_save_enabled: main_health.power_save_enabled,
        harness_status: harness_status_name(main_health.harness_status),
    };
    publish(panda_state_out, &message);

    // Heartbeat (item 10).
    let _ = main_board.send_heartbeat();
    if let Some(aux) = aux {
        let _ = aux.lock().unwrap().send_heartbeat();
    }
}

/// Reads voltage/current from sysfs, warning if the read is slow enough to
/// threaten the loop's 2 Hz cadence (spec §4.4 final paragraph).
fn read_tici_power() -> Option<(u32, u32)> {
    let start = Instant::now();
    let voltage_mv = read_sysfs_u32(TICI_VOLTAGE_PATH);
    let current_ma = read_sysfs_u32(TICI_CURRENT_PATH);
    let elapsed = start.elapsed();
    if elapsed > SYSFS_READ_WARN_AFTER {
        log::warn!("board_state: TICI sysfs power read took {elapsed:?}");
    }
    match (voltage_mv, current_ma) {
        (Some(voltage_mv), Some(current_ma)) => Some((voltage_mv, current_ma)),
        _ => None,
    }
}

fn read_sysfs_u32(path: &str) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// On `SILENT`, command `NO_OUTPUT` immediately — the silent model doesn't
/// keep CAN peripherals awake, so the safety-setter handshake can never
/// complete on a quiet bus (spec §4.4 item 2).
fn coerce_silent(health: &mut crate::board::HealthSnapshot, board: &mut dyn Board) {
    if health.safety_model == SafetyModel::Silent {
        let _ = board.set_safety_model(SafetyModel::NoOutput, 0);
        health.safety_model = SafetyModel::NoOutput;
    }
}

fn publish_keepalive(panda_state_out: &dyn Publisher) {
    let message = PandaStateMessage {
        valid: false,
        panda_type: hw_type_name(HwType::Unknown),
        ignition_line: false,
        fan_rpm: 0,
        faults: Vec::new(),
        uptime_secs: 0,
        voltage_mv: 0,
        current_ma: 0,
        controls_allowed: false,
        safety_model: SafetyModel::NoOutput.code(),
        safety_param: 0,
        usb_power_mode: usb_power_mode_name(UsbPowerMode::Client),
        power_save_enabled: false,
        harness_status: harness_status_name(crate::board::HarnessStatus::NotPresent),
    };
    publish(panda_state_out, &message);
}

fn publish(panda_state_out: &dyn Publisher, message: &PandaStateMessage) {
    match serde_json::to_vec(message) {
        Ok(bytes) => {
            if let Err(err) = panda_state_out.publish(Message::new(bytes)) {
                log::warn!("board_state: publish failed: {err}");
            }
        }
        Err(err) => log::warn!("board_state: encode failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::paramstore::MemParamStore;
    use crate::test_support::{blank_health, FakeBoard, FakeBoardLog};

    #[test]
    fn rtc_tolerance_boundary() {
        assert!(Duration::from_millis(1100) <= RTC_TOLERANCE);
        assert!(Duration::from_millis(1101) > RTC_TOLERANCE);
    }

    fn test_config() -> Config {
        Config {
            loopback: false,
            started: false,
            fakesend: false,
            aux_can_drive: false,
            platform: Platform::Other,
            realtime_priority: 54,
            cpu_affinity: None,
        }
    }

    fn board_handle(log: Arc<FakeBoardLog>, health: crate::board::HealthSnapshot) -> BoardHandle {
        let mut board = FakeBoard::with_log(HwType::Black, log);
        board.health = health;
        Arc::new(Mutex::new(Box::new(board) as Box<dyn Board>))
    }

    #[test]
    fn safety_off_when_parked_commands_no_output() {
        let shared = Shared::new(0, 3);
        let config = test_config();
        let params = MemParamStore::new();
        let log = Arc::new(FakeBoardLog::default());

        let mut health = blank_health();
        health.safety_model = SafetyModel::Elm327;
        let main = board_handle(Arc::clone(&log), health);

        let mut state = State {
            last_ignition: false,
            no_ignition_cnt: 0,
        };
        let mut hub = crate::messaging::Hub::new();
        let panda_state_out = hub.publisher("pandaState");
        let noop = || {};

        tick(&shared, &config, &params, &main, None, &panda_state_out, &mut state, &noop);

        let sent = log.safety_models.lock().unwrap();
        assert_eq!(sent.last(), Some(&(SafetyModel::NoOutput, 0)));
    }

    #[test]
    fn ignition_rising_edge_spawns_safety_setter_once() {
        let shared = Shared::new(0, 3);
        let config = test_config();
        let params = MemParamStore::new();
        let log = Arc::new(FakeBoardLog::default());

        let mut health = blank_health();
        health.ignition_line = true;
        let main = board_handle(Arc::clone(&log), health);

        let mut state = State {
            last_ignition: false,
            no_ignition_cnt: 0,
        };
        let mut hub = crate::messaging::Hub::new();
        let panda_state_out = hub.publisher("pandaState");
        let spawn_count = Arc::new(AtomicU32::new(0));
        let spawn_count_clone = Arc::clone(&spawn_count);
        let spawn = move || {
            spawn_count_clone.fetch_add(1, Ordering::SeqCst);
        };

        tick(&shared, &config, &params, &main, None, &panda_state_out, &mut state, &spawn);
        // A second tick with ignition still high must not spawn again —
        // "at most one safety-setter per ignition cycle".
        tick(&shared, &config, &params, &main, None, &panda_state_out, &mut state, &spawn);

        assert_eq!(spawn_count.load(Ordering::SeqCst), 1);
        assert!(shared.safety_setter_running());
    }

    #[test]
    fn silent_safety_model_is_coerced_to_no_output() {
        let shared = Shared::new(0, 3);
        let config = test_config();
        let params = MemParamStore::new();
        let log = Arc::new(FakeBoardLog::default());

        let mut health = blank_health();
        health.safety_model = SafetyModel::Silent;
        health.ignition_line = true; // keep ignition on so this isolates coercion.
        let main = board_handle(Arc::clone(&log), health);

        let mut state = State {
            last_ignition: true,
            no_ignition_cnt: 0,
        };
        let mut hub = crate::messaging::Hub::new();
        let panda_state_out = hub.publisher("pandaState");
        let noop = || {};

        tick(&shared, &config, &params, &main, None, &panda_state_out, &mut state, &noop);

        let sent = log.safety_models.lock().unwrap();
        assert!(sent.contains(&(SafetyModel::NoOutput, 0)));
    }

    #[test]
    fn rtc_write_back_fires_once_host_clock_and_cadence_align() {
        let shared = Shared::new(0, 3);
        let config = test_config();
        let params = MemParamStore::new();
        let log = Arc::new(FakeBoardLog::default());

        let mut board = FakeBoard::with_log(HwType::Black, Arc::clone(&log));
        board.health = blank_health(); // ignition off by default.
        board.rtc = SystemTime::UNIX_EPOCH;
        let main: BoardHandle = Arc::new(Mutex::new(Box::new(board) as Box<dyn Board>));

        let mut state = State {
            last_ignition: false,
            no_ignition_cnt: 0,
        };
        let mut hub = crate::messaging::Hub::new();
        let panda_state_out = hub.publisher("pandaState");
        let noop = || {};

        tick(&shared, &config, &params, &main, None, &panda_state_out, &mut state, &noop);

        assert_eq!(state.no_ignition_cnt, 1);
        assert_eq!(log.rtc_writes.lock().unwrap().len(), 1);
    }
}
