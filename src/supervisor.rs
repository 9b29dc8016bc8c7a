//! Connection supervisor (spec §4.1): the one-shot discover/open/classify
//! routine run on the main thread before workers start, and again after
//! every restart cycle.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::board::{Board, UsbBoard, UsbPowerMode};
use crate::config::Config;
use crate::paramstore::ParamStore;
use crate::state::Shared;

pub type BoardHandle = Arc<Mutex<Box<dyn Board>>>;

/// A USB board handle is only ever read/written through this mutex, which
/// exists to satisfy Rust's aliasing rules around the opaque `dyn Board`
/// object — it is held only for the duration of a single call, never
/// across a blocking wait, so distinct worker loops calling distinct
/// operations on the same board never contend for long (spec §5: board
/// operations aren't serialized beyond what the underlying USB stack
/// already guarantees per-endpoint).
fn handle(board: Box<dyn Board>) -> BoardHandle {
    Arc::new(Mutex::new(board))
}

/// Owns the two optional board slots plus the discover/open bookkeeping
/// (spec §3 `detected`/`connected`), replacing the source's process-wide
/// singleton handles with a single value passed by reference to workers
/// (spec §9).
pub struct Supervisor {
    pub main: Option<BoardHandle>,
    pub aux: Option<BoardHandle>,
    detected: Vec<String>,
    connected: Vec<String>,
    usb_power_set_once: bool,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            main: None,
            aux: None,
            detected: Vec::new(),
            connected: Vec::new(),
            usb_power_set_once: false,
        }
    }

    /// Tear down both boards, releasing USB, ahead of a reconnect cycle
    /// (spec §5 "Cancellation").
    pub fn reset(&mut self) {
        self.main = None;
        self.aux = None;
        self.connected.clear();
        self.detected.clear();
    }

    /// Runs the discover/open/classify loop to completion. Returns success
    /// iff `main` is populated and `exit_requested` is false (spec §4.1).
    pub fn connect(&mut self, shared: &Shared, config: &Config, params: &dyn ParamStore) -> bool {
        loop {
            if shared.exit_requested() {
                return false;
            }

            self.detected = match UsbBoard::list() {
                Ok(serials) => serials,
                Err(err) => {
                    log::warn!("board discovery failed: {err}");
                    Vec::new()
                }
            };

            if self.detected.is_empty() {
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }

            for serial in self.detected.clone() {
                if self.connected.contains(&serial) {
                    continue;
                }
                match self.open_and_install(&serial, config, params) {
                    Ok(()) => self.connected.push(serial),
                    Err(err) => {
                        log::warn!("failed to open board {serial}: {err}");
                        // No retry budget here: the next discovery tick
                        // will see the same serial again and retry.
                    }
                }
            }

            if self.connected.len() == self.detected.len() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        self.main.is_some() && !shared.exit_requested()
    }

    fn open_and_install(
        &mut self,
        serial: &str,
        config: &Config,
        params: &dyn ParamStore,
    ) -> crate::errors::Result<()> {
        let mut board = UsbBoard::open(serial)?;

        if !self.usb_power_set_once {
            board.set_usb_power_mode(UsbPowerMode::Cdp)?;
            self.usb_power_set_once = true;
        }

        let firmware = board.get_firmware_version()?;
        params.put("PandaFirmware", &firmware.raw)?;
        params.put("PandaFirmwareHex", firmware.hex().as_bytes())?;
        params.put("PandaDongleId", board.usb_serial().as_bytes())?;

        if board.has_rtc() {
            if let Ok(rtc_time) = board.get_rtc() {
                if !host_clock_is_valid() {
                    set_host_clock(rtc_time);
                }
            }
        }

        if config.loopback {
            board.set_loopback(true)?;
        }

        let hw_type = board.hw_type();
        let boxed: Box<dyn Board> = Box::new(board);
        if hw_type.is_main_eligible() {
            log::info!("board {serial} ({hw_type:?}) installed as main");
            self.main = Some(handle(boxed));
        } else {
            log::info!("board {serial} ({hw_type:?}) installed as aux");
            self.aux = Some(handle(boxed));
        }
        Ok(())
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// The process clock is considered invalid if it predates this daemon's
/// own existence — the same heuristic embedded systems use to detect an
/// unset RTC (a clock reading before a known-good date can't be real).
pub(crate) fn host_clock_is_valid() -> bool {
    const EARLIEST_PLAUSIBLE: u64 = 1_700_000_000; // 2023-11-14
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() > EARLIEST_PLAUSIBLE)
        .unwrap_or(false)
}

fn set_host_clock(_time: SystemTime) {
    // Setting the system clock requires a privileged syscall outside this
    // daemon's opaque-interface boundary (spec §1); logging stands in for
    // the action so the decision point is still exercised and observable.
    log::info!("host clock invalid; would set from board RTC");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_supervisor_has_no_boards() {
        let supervisor = Supervisor::new();
        assert!(supervisor.main.is_none());
        assert!(supervisor.aux.is_none());
    }
}
