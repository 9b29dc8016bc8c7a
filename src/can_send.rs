//! CAN send loop (spec §4.3): event-driven pusher for the `sendcan`
//! channel, with stale-batch drop and `FAKESEND` short-circuit.

use std::time::Duration;

use crate::can::SendCanEvent;
use crate::config::Config;
use crate::messaging::Subscriber;
use crate::state::Shared;
use crate::supervisor::BoardHandle;

/// Max age of a `sendcan` batch before it's silently dropped (spec §3, §8).
const STALE_AFTER: Duration = Duration::from_secs(1);

pub fn run(
    shared: &Shared,
    config: &Config,
    main: &BoardHandle,
    aux: Option<&BoardHandle>,
    sendcan: &dyn Subscriber,
) {
    loop {
        if shared.exit_requested() {
            return;
        }

        if !main.lock().unwrap().connected() {
            log::info!("can_send: main disconnected, exiting");
            return;
        }

        let message = match sendcan.recv_timeout(Duration::from_millis(100)) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(_) => {
                // Subscriber interrupted: treated as a shutdown signal
                // (spec §7).
                shared.request_exit();
                return;
            }
        };

        let event = match SendCanEvent::decode(&message.bytes) {
            Some(event) => event,
            None => continue,
        };

        if event.is_stale() {
            continue;
        }

        if config.fakesend {
            continue;
        }

        let target = if shared.main_shift() == 0 { main } else { aux.unwrap_or(main) };
        if let Err(err) = target.lock().unwrap().can_send(&event.frames) {
            log::warn!("can_send: board write failed: {err}");
        }
    }
}
