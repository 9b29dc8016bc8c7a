//! Hardware-control loop (spec §4.6): fan speed, infrared illuminator
//! power, and host-charging mode, driven by device/camera telemetry.

use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::board::{HwType, UsbPowerMode};
use crate::config::{Config, Platform};
use crate::messaging::Subscriber;
use crate::state::Shared;
use crate::supervisor::BoardHandle;

const CUTOFF_IL: f32 = 200.0;
const SATURATE_IL: f32 = 1600.0;
const MIN_IR_POWER: f32 = 0.0;
const MAX_IR_POWER: f32 = 0.5;
const KEEPALIVE_ITERS: u64 = 100;
const CAMERA_STALE_AFTER: Duration = Duration::from_secs(1);

/// First-order low-pass filter, time constant 30.0, sample period 0.05
/// (spec §4.6, `TICI` integLines smoothing).
struct LowPass {
    value: f32,
    alpha: f32,
}

impl LowPass {
    fn new(time_constant: f32, sample_period: f32) -> Self {
        Self {
            value: 0.0,
            alpha: sample_period / (time_constant + sample_period),
        }
    }

    fn update(&mut self, input: f32) -> f32 {
        self.value += self.alpha * (input - self.value);
        self.value
    }
}

/// `integLines` → IR power percent (spec §4.6, §8 boundary values).
fn ir_power_percent(integ_lines: f32) -> u16 {
    let watts = if integ_lines <= CUTOFF_IL {
        MIN_IR_POWER
    } else if integ_lines >= SATURATE_IL {
        MAX_IR_POWER
    } else {
        let fraction = (integ_lines - CUTOFF_IL) / (SATURATE_IL - CUTOFF_IL);
        MIN_IR_POWER + fraction * (MAX_IR_POWER - MIN_IR_POWER)
    };
    (watts * 100.0).round() as u16
}

#[derive(Deserialize, Default)]
struct DeviceState {
    #[serde(default)]
    charging_disabled: bool,
    #[serde(default)]
    fan_speed: u16,
}

#[derive(Deserialize, Default)]
struct DriverCameraState {
    #[serde(default)]
    integ_lines: f32,
}

pub fn run(
    shared: &Shared,
    config: &Config,
    main: &BoardHandle,
    device_state: &dyn Subscriber,
    driver_camera_state: &dyn Subscriber,
) {
    let mut low_pass = LowPass::new(30.0, 0.05);
    let mut last_fan: Option<u16> = None;
    let mut last_ir: Option<u16> = None;
    let mut charging_disabled: Option<bool> = None;
    let mut last_camera_frame: Option<Instant> = None;
    let mut iteration: u64 = 0;

    loop {
        if shared.exit_requested() {
            return;
        }

        if !main.lock().unwrap().connected() {
            log::info!("hwctl: main disconnected, exiting");
            return;
        }

        let device_update = device_state.recv_timeout(Duration::from_millis(1000));
        let device_update = match device_update {
            Ok(update) => update,
            Err(_) => {
                shared.request_exit();
                return;
            }
        };

        if let Some(message) = device_update {
            if let Ok(state) = serde_json::from_slice::<DeviceState>(&message.bytes) {
                if config.platform != Platform::Pc {
                    if charging_disabled != Some(state.charging_disabled) {
                        let mode = if state.charging_disabled {
                            UsbPowerMode::Client
                        } else {
                            UsbPowerMode::Cdp
                        };
                        let _ = main.lock().unwrap().set_usb_power_mode(mode);
                        charging_disabled = Some(state.charging_disabled);
                    }
                }

                if fan_ir_eligible(main) {
                    let changed = last_fan != Some(state.fan_speed);
                    if changed || iteration % KEEPALIVE_ITERS == 0 {
                        let _ = main.lock().unwrap().set_fan_speed(state.fan_speed);
                        last_fan = Some(state.fan_speed);
                    }
                }
            }
        }

        if let Ok(Some(message)) = driver_camera_state.recv_timeout(Duration::from_millis(0)) {
            if let Ok(state) = serde_json::from_slice::<DriverCameraState>(&message.bytes) {
                last_camera_frame = Some(Instant::now());

                let smoothed = if config.platform == Platform::Tici {
                    low_pass.update(state.integ_lines)
                } else {
                    state.integ_lines
                };

                if fan_ir_eligible(main) {
                    let percent = ir_power_percent(smoothed);
                    send_ir_if_due(main, percent, &mut last_ir, iteration);
                }
            }
        }

        if let Some(last_frame) = last_camera_frame {
            if last_frame.elapsed() > CAMERA_STALE_AFTER && fan_ir_eligible(main) {
                send_ir_if_due(main, 0, &mut last_ir, iteration);
            }
        }

        iteration += 1;
    }
}

fn fan_ir_eligible(main: &BoardHandle) -> bool {
    matches!(main.lock().unwrap().hw_type(), HwType::Uno | HwType::Dos)
}

fn send_ir_if_due(main: &BoardHandle, percent: u16, last_ir: &mut Option<u16>, iteration: u64) {
    let changed = *last_ir != Some(percent);
    if changed || iteration % KEEPALIVE_ITERS == 0 || percent >= 50 {
        let _ = main.lock().unwrap().set_ir_power(percent);
        *last_ir = Some(percent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use crate::board::Board;
    use crate::messaging::{Hub, Message};
    use crate::state::Shared;
    use crate::test_support::{FakeBoard, FakeBoardLog};

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

    #[test]
    fn exits_once_main_disconnects() {
        let shared = Arc::new(Shared::new(0, 3));
        let config = test_config();
        let mut board = FakeBoard::new(HwType::Uno);
        board.connected = false;
        let board: BoardHandle = Arc::new(Mutex::new(Box::new(board) as Box<dyn Board>));

        let mut hub = Hub::new();
        let device_state = hub.subscriber("deviceState");
        let driver_camera_state = hub.subscriber("driverCameraState");

        let shared_thread = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            run(&shared_thread, &config, &board, &device_state, &driver_camera_state);
        });

        handle.join().unwrap();
        assert!(!shared.exit_requested());
    }

    #[test]
    fn fan_speed_update_reaches_an_eligible_board() {
        let shared = Arc::new(Shared::new(0, 3));
        let config = test_config();
        let log = Arc::new(FakeBoardLog::default());
        let board: BoardHandle = Arc::new(Mutex::new(
            Box::new(FakeBoard::with_log(HwType::Uno, Arc::clone(&log))) as Box<dyn Board>,
        ));

        let mut hub = Hub::new();
        let device_publisher = hub.publisher("deviceState");
        let device_state = hub.subscriber("deviceState");
        let driver_camera_state = hub.subscriber("driverCameraState");

        device_publisher
            .publish(Message::new(
                br#"{"charging_disabled": false, "fan_speed": 1234}"#.to_vec(),
            ))
            .unwrap();

        let shared_thread = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            run(&shared_thread, &config, &board, &device_state, &driver_camera_state);
        });

        thread::sleep(Duration::from_millis(150));
        shared.request_exit();
        handle.join().unwrap();

        assert_eq!(log.fan_speeds.lock().unwrap().last(), Some(&1234));
    }

    #[test]
    fn ir_power_boundary_values() {
        assert_eq!(ir_power_percent(200.0), 0);
        assert_eq!(ir_power_percent(1600.0), 50);
        assert_eq!(ir_power_percent(900.0), 25);
    }

    #[test]
    fn ir_power_monotone_between_bounds() {
        let mut last = ir_power_percent(CUTOFF_IL);
        let mut lines = CUTOFF_IL;
        while lines < SATURATE_IL {
            lines += 50.0;
            let next = ir_power_percent(lines);
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn low_pass_converges_to_input() {
        let mut filter = LowPass::new(30.0, 0.05);
        let mut last = 0.0;
        for _ in 0..2000 {
            last = filter.update(900.0);
        }
        assert!((last - 900.0).abs() < 1.0);
    }
}
