//! Process entry point: logging, real-time scheduling, the outer
//! connect/supervise/reconnect loop, and worker thread lifecycle.

use std::sync::Arc;
use std::thread;

use boardd::board::Board;
use boardd::config::Config;
use boardd::errors::{Error, Result};
use boardd::messaging::Hub;
use boardd::paramstore::{FileParamStore, ParamStore};
use boardd::pigeon::{BoardTunneledPigeon, Pigeon, SerialPigeon};
use boardd::state::Shared;
use boardd::supervisor::Supervisor;
use boardd::{board_state, can_recv, can_send, gps, hwctl, safety_setter};

fn main() -> std::process::ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            log::error!("unrecoverable startup error: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let config = Config::from_env();
    apply_realtime_scheduling(&config);

    let (main_shift, aux_shift) = config.bus_shifts();
    let shared = Arc::new(Shared::new(main_shift, aux_shift));

    {
        let shared = Arc::clone(&shared);
        ctrlc::set_handler(move || shared.request_exit())
            .map_err(|err| Error::Config(format!("failed to install signal handler: {err}")))?;
    }

    let params: Arc<dyn ParamStore> = Arc::new(FileParamStore::new("/tmp/boardd/params")?);

    // Created once per process lifetime, not per reconnect cycle, so
    // `usb_power_set_once` (spec §4.1: CDP commanded once per process) isn't
    // re-armed on every reconnect.
    let mut supervisor = Supervisor::new();
    while !shared.exit_requested() {
        let connected = supervisor.connect(&shared, &config, params.as_ref());
        if !connected {
            if shared.exit_requested() {
                break;
            }
            log::warn!("connect cycle failed to populate main; retrying");
            continue;
        }

        run_workers(&shared, &config, Arc::clone(&params), &mut supervisor);
        supervisor.reset();

        if shared.exit_requested() {
            break;
        }
        log::info!("reconnecting after worker exit");
    }

    log::info!("exiting cleanly");
    Ok(())
}

fn run_workers(shared: &Arc<Shared>, config: &Config, params: Arc<dyn ParamStore>, supervisor: &mut Supervisor) {
    let main = supervisor
        .main
        .clone()
        .expect("connect() guarantees main is populated");
    let aux = supervisor.aux.clone();

    let mut hub = Hub::new();
    let can_pub = hub.publisher("can");
    let panda_state_pub = hub.publisher("pandaState");
    let ublox_raw_pub = hub.publisher("ubloxRaw");
    let sendcan_sub = hub.subscriber("sendcan");
    let device_state_sub = hub.subscriber("deviceState");
    let driver_camera_state_sub = hub.subscriber("driverCameraState");

    thread::scope(|scope| {
        {
            let shared = Arc::clone(shared);
            let main = main.clone();
            let aux = aux.clone();
            scope.spawn(move || {
                can_recv::run(&shared, &main, aux.as_ref(), &can_pub);
            });
        }

        {
            let shared = Arc::clone(shared);
            let config = config.clone();
            let main = main.clone();
            let aux = aux.clone();
            scope.spawn(move || {
                can_send::run(&shared, &config, &main, aux.as_ref(), &sendcan_sub);
            });
        }

        {
            let shared = Arc::clone(shared);
            let config = config.clone();
            let params = Arc::clone(&params);
            let main = main.clone();
            let aux = aux.clone();
            scope.spawn(move || {
                let spawn_setter = {
                    let shared = Arc::clone(&shared);
                    let params = Arc::clone(&params);
                    let main = main.clone();
                    let aux = aux.clone();
                    move || {
                        let shared = Arc::clone(&shared);
                        let params = Arc::clone(&params);
                        let main = main.clone();
                        let aux = aux.clone();
                        thread::spawn(move || {
                            safety_setter::run(&shared, params.as_ref(), &main, aux.as_ref());
                        });
                    }
                };
                board_state::run(
                    &shared,
                    &config,
                    params.as_ref(),
                    Some(&main),
                    aux.as_ref(),
                    &panda_state_pub,
                    spawn_setter,
                );
            });
        }

        {
            let shared = Arc::clone(shared);
            let config = config.clone();
            let main = main.clone();
            scope.spawn(move || {
                hwctl::run(&shared, &config, &main, &device_state_sub, &driver_camera_state_sub);
            });
        }

        {
            let shared = Arc::clone(shared);
            let platform = config.platform;
            let main = main.clone();
            scope.spawn(move || {
                let mut pigeon: Box<dyn Pigeon> = if platform == boardd::config::Platform::Tici {
                    match SerialPigeon::connect("/dev/ttyAMA1") {
                        Ok(pigeon) => Box::new(pigeon),
                        Err(err) => {
                            log::warn!("gps: failed to connect serial pigeon: {err}");
                            return;
                        }
                    }
                } else {
                    match BoardTunneledPigeon::connect() {
                        Ok(pigeon) => Box::new(pigeon),
                        Err(err) => {
                            log::warn!("gps: failed to connect tunneled pigeon: {err}");
                            return;
                        }
                    }
                };
                gps::run(&shared, &main, pigeon.as_mut(), &ublox_raw_pub);
            });
        }
    });
}

fn apply_realtime_scheduling(config: &Config) {
    unsafe {
        let params = libc::sched_param {
            sched_priority: config.realtime_priority as libc::c_int,
        };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &params) != 0 {
            log::warn!("failed to set real-time scheduling priority");
        }
    }

    if let Some(core_id) = config.cpu_affinity {
        if let Some(core) = core_affinity::get_core_ids()
            .and_then(|ids| ids.into_iter().find(|id| id.id == core_id))
        {
            core_affinity::set_for_current(core);
        }
    }
}
