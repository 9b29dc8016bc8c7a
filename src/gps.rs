//! GPS loop (spec §4.7): 100 Hz pump of raw receiver bytes, per-message-
//! class timeout tracking, and ignition-synchronized cold start/power-down.

use std::time::{Duration, Instant};

use crate::fresh::Fresh;
use crate::messaging::{Message, Publisher};
use crate::pigeon::Pigeon;
use crate::state::Shared;
use crate::supervisor::BoardHandle;

const PREAMBLE: [u8; 2] = [0xB5, 0x62];
const NAVIGATION_CLASS: u8 = 0x01;
const RECEIVER_MANAGER_CLASS: u8 = 0x02;
const CLASS_TIMEOUT: Duration = Duration::from_millis(900);
const STARTUP_GRACE: Duration = Duration::from_secs(10);
const TICK_PERIOD: Duration = Duration::from_millis(10);

pub fn run(shared: &Shared, main: &BoardHandle, pigeon: &mut dyn Pigeon, ublox_raw_out: &dyn Publisher) {
    let mut nav: Fresh<()> = Fresh::new(CLASS_TIMEOUT);
    let mut rxm: Fresh<()> = Fresh::new(CLASS_TIMEOUT);
    let mut ignition_last = false;
    let mut need_reset = false;

    loop {
        if shared.exit_requested() {
            return;
        }

        if !main.lock().unwrap().connected() {
            log::info!("gps: main disconnected, exiting");
            return;
        }

        let ignition = shared.ignition();

        let bytes = match pigeon.receive() {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("gps: receive failed: {err}");
                Vec::new()
            }
        };

        if ignition && bytes.len() >= 3 && bytes[0] == PREAMBLE[0] && bytes[1] == PREAMBLE[1] {
            match bytes[2] {
                NAVIGATION_CLASS => nav.set(()),
                RECEIVER_MANAGER_CLASS => rxm.set(()),
                _ => {}
            }
        }

        if ignition && ignition_last {
            if nav.is_stale() {
                log::warn!("gps: navigation-class timeout");
            }
            if rxm.is_stale() {
                log::warn!("gps: receiver-manager-class timeout");
            }
        }

        if ignition && !bytes.is_empty() && bytes[0] == 0 {
            // Reset-on-null-byte is specified but gated off pending
            // validation (spec.md §9 Open Question, §4.7 step 4): log only.
            need_reset = true;
            log::warn!("gps: would reset receiver (leading null byte)");
        }

        if !bytes.is_empty() {
            if let Err(err) = ublox_raw_out.publish(Message::new(bytes)) {
                log::warn!("gps: publish failed: {err}");
            }
        }

        if (ignition && !ignition_last) || need_reset {
            if let Err(err) = pigeon.init() {
                log::warn!("gps: init failed: {err}");
            }
            let grace_until = Instant::now() + STARTUP_GRACE;
            nav.prime_at((), grace_until);
            rxm.prime_at((), grace_until);
            need_reset = false;
        } else if !ignition && ignition_last {
            let _ = pigeon.stop();
            let _ = pigeon.set_power(false);
        }

        ignition_last = ignition;
        std::thread::sleep(TICK_PERIOD);
    }
}
