//! Safety-setter task (spec §4.5): one-shot, runs once per ignition cycle,
//! promoting both boards from diagnostic mode to the vehicle's safety
//! model once the rest of the stack has identified the car.

use std::time::Duration;

use serde::Deserialize;

use crate::board::SafetyModel;
use crate::paramstore::ParamStore;
use crate::state::Shared;
use crate::supervisor::BoardHandle;

const POLL_PERIOD: Duration = Duration::from_millis(100);

#[derive(Deserialize)]
struct CarParams {
    safety_model: u16,
    safety_param: u16,
}

/// Runs to completion (or early exit on shutdown/disconnect), then clears
/// `safety_setter_running`.
pub fn run(shared: &Shared, params: &dyn ParamStore, main: &BoardHandle, aux: Option<&BoardHandle>) {
    let result = run_inner(shared, params, main, aux);
    if let Err(reason) = result {
        log::info!("safety-setter: exiting early ({reason})");
    }
    shared.finish_safety_setter();
}

fn run_inner(
    shared: &Shared,
    params: &dyn ParamStore,
    main: &BoardHandle,
    aux: Option<&BoardHandle>,
) -> Result<(), &'static str> {
    command_both(main, aux, SafetyModel::Elm327, 0);

    let vin = poll_until(shared, main, || {
        params
            .get("CarVin")
            .ok()
            .flatten()
            .filter(|vin| !vin.is_empty())
    })?;
    assert_eq!(vin.len(), 17, "CarVin must be exactly 17 characters");
    log::info!("safety-setter: VIN {}", String::from_utf8_lossy(&vin));

    command_both(main, aux, SafetyModel::Elm327, 1);

    let car_params = poll_until(shared, main, || {
        let controls_ready = params.get_bool("ControlsReady").unwrap_or(false);
        if !controls_ready {
            return None;
        }
        params
            .get("CarParams")
            .ok()
            .flatten()
            .filter(|bytes| !bytes.is_empty())
    })?;

    let decoded: CarParams = serde_json::from_slice(&car_params)
        .map_err(|_| "CarParams decode failed")?;

    main.lock().unwrap().set_unsafe_mode(0).ok();
    let model = SafetyModel::Vehicle(decoded.safety_model);
    command_both(main, aux, model, decoded.safety_param);

    Ok(())
}

fn command_both(main: &BoardHandle, aux: Option<&BoardHandle>, model: SafetyModel, param: u16) {
    let _ = main.lock().unwrap().set_safety_model(model, param);
    if let Some(aux) = aux {
        let _ = aux.lock().unwrap().set_safety_model(model, param);
    }
}

/// Poll `condition` every 100ms until it yields a value, or bail out on
/// shutdown or loss of `main.connected` (spec §4.5 "early exit").
fn poll_until<T>(
    shared: &Shared,
    main: &BoardHandle,
    mut condition: impl FnMut() -> Option<T>,
) -> Result<T, &'static str> {
    loop {
        if shared.exit_requested() {
            return Err("exit requested");
        }
        if !main.lock().unwrap().connected() {
            return Err("main disconnected");
        }
        if let Some(value) = condition() {
            return Ok(value);
        }
        std::thread::sleep(POLL_PERIOD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use crate::board::{Board, HwType};
    use crate::paramstore::MemParamStore;
    use crate::test_support::{FakeBoard, FakeBoardLog};

    #[test]
    fn run_inner_commits_the_car_reported_safety_model() {
        let shared = Shared::new(0, 3);
        let params = MemParamStore::new();
        let log = Arc::new(FakeBoardLog::default());
        let main: BoardHandle = Arc::new(Mutex::new(
            Box::new(FakeBoard::with_log(HwType::Black, Arc::clone(&log))) as Box<dyn Board>,
        ));

        params.put("CarVin", b"1HGCM82633A123456").unwrap();
        params.put("ControlsReady", &[1]).unwrap();
        params
            .put("CarParams", br#"{"safety_model": 42, "safety_param": 7}"#)
            .unwrap();

        run_inner(&shared, &params, &main, None).unwrap();

        let sent = log.safety_models.lock().unwrap();
        assert_eq!(sent.last(), Some(&(SafetyModel::Vehicle(42), 7)));
        assert!(sent.contains(&(SafetyModel::Elm327, 0)));
        assert!(sent.contains(&(SafetyModel::Elm327, 1)));
    }

    #[test]
    fn run_inner_bails_out_once_main_disconnects() {
        let shared = Shared::new(0, 3);
        let params = MemParamStore::new();
        let mut board = FakeBoard::new(HwType::Black);
        board.connected = false;
        let main: BoardHandle = Arc::new(Mutex::new(Box::new(board) as Box<dyn Board>));

        let result = run_inner(&shared, &params, &main, None);
        assert_eq!(result, Err("main disconnected"));
    }

    #[test]
    fn run_clears_the_running_flag_even_on_early_exit() {
        let shared = Arc::new(Shared::new(0, 3));
        let params = MemParamStore::new();
        let mut board = FakeBoard::new(HwType::Black);
        board.connected = false;
        let main: BoardHandle = Arc::new(Mutex::new(Box::new(board) as Box<dyn Board>));

        assert!(shared.try_start_safety_setter());
        let handle = thread::spawn({
            let shared = Arc::clone(&shared);
            move || run(&shared, &params, &main, None)
        });
        handle.join().unwrap();

        assert!(!shared.safety_setter_running());
    }

    #[test]
    #[should_panic(expected = "CarVin must be exactly 17 characters")]
    fn vin_length_is_asserted() {
        let vin = b"too short".to_vec();
        assert_eq!(vin.len(), 17, "CarVin must be exactly 17 characters");
    }

    #[test]
    fn car_params_decode_from_json() {
        let raw = br#"{"safety_model": 42, "safety_param": 7}"#;
        let decoded: CarParams = serde_json::from_slice(raw).unwrap();
        assert_eq!(decoded.safety_model, 42);
        assert_eq!(decoded.safety_param, 7);
    }
}
