//! Process-wide shared state: the atomics every worker loop reads, and that
//! the board-state loop (and the signal handler, for `exit_requested`) write.
//!
//! Per spec: `exit_requested`, `ignition` and `safety_setter_running` each
//! have a single writer and many readers, so plain atomics at
//! sequentially-consistent ordering are sufficient — no locking is needed
//! because mutation windows never overlap with reader phases (see
//! `Supervisor` in `supervisor.rs` for the board slots, which follow the
//! same discipline).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Shared, lock-free process state. Lifetime = process.
pub struct Shared {
    exit_requested: AtomicBool,
    ignition: AtomicBool,
    safety_setter_running: AtomicBool,
    main_shift: AtomicU8,
    aux_shift: AtomicU8,
}

impl Shared {
    pub fn new(main_shift: u8, aux_shift: u8) -> Self {
        Self {
            exit_requested: AtomicBool::new(false),
            ignition: AtomicBool::new(false),
            safety_setter_running: AtomicBool::new(false),
            main_shift: AtomicU8::new(main_shift),
            aux_shift: AtomicU8::new(aux_shift),
        }
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    /// Called by the `ctrlc` signal handler (and by workers that observe an
    /// unrecoverable condition, e.g. a subscriber interrupt).
    pub fn request_exit(&self) {
        if !self.exit_requested.swap(true, Ordering::SeqCst) {
            log::info!("exit requested");
        }
    }

    pub fn ignition(&self) -> bool {
        self.ignition.load(Ordering::SeqCst)
    }

    /// Written only by the board-state loop. Logs on every observed
    /// transition, mirroring the teacher's `CarState::set_ignition_on`.
    pub fn set_ignition(&self, value: bool) {
        let previous = self.ignition.swap(value, Ordering::SeqCst);
        if previous != value {
            log::info!("ignition => {value}");
        }
    }

    pub fn safety_setter_running(&self) -> bool {
        self.safety_setter_running.load(Ordering::SeqCst)
    }

    /// Atomically claim the "at most one safety-setter" slot. Returns `true`
    /// if the caller won the claim.
    pub fn try_start_safety_setter(&self) -> bool {
        self.safety_setter_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn finish_safety_setter(&self) {
        self.safety_setter_running.store(false, Ordering::SeqCst);
    }

    pub fn main_shift(&self) -> u8 {
        self.main_shift.load(Ordering::SeqCst)
    }

    pub fn aux_shift(&self) -> u8 {
        self.aux_shift.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_requested_latches_true() {
        let shared = Shared::new(0, 3);
        assert!(!shared.exit_requested());
        shared.request_exit();
        assert!(shared.exit_requested());
        shared.request_exit(); // idempotent
        assert!(shared.exit_requested());
    }

    #[test]
    fn only_one_safety_setter_claim_succeeds() {
        let shared = Shared::new(0, 3);
        assert!(shared.try_start_safety_setter());
        assert!(!shared.try_start_safety_setter());
        shared.finish_safety_setter();
        assert!(shared.try_start_safety_setter());
    }

    #[test]
    fn ignition_flip_is_observed() {
        let shared = Shared::new(0, 3);
        assert!(!shared.ignition());
        shared.set_ignition(true);
        assert!(shared.ignition());
        shared.set_ignition(false);
        assert!(!shared.ignition());
    }
}
