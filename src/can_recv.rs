//! CAN receive loop (spec §4.2): fixed 100 Hz puller that drains main (and
//! aux, if present) and republishes on the `can` channel.

use std::time::Duration;

use crate::messaging::{Message, Publisher};
use crate::periodic::{Ticker, TickOutcome};
use crate::state::Shared;
use crate::supervisor::BoardHandle;

pub fn run(shared: &Shared, main: &BoardHandle, aux: Option<&BoardHandle>, can_out: &dyn Publisher) {
    let mut ticker = Ticker::new(Duration::from_millis(10));

    loop {
        if shared.exit_requested() {
            return;
        }

        match ticker.tick() {
            TickOutcome::OnTime => {}
            TickOutcome::Overrun { behind_by } => {
                if shared.ignition() {
                    log::warn!("can_recv tick overrun by {behind_by:?}");
                }
            }
        }

        let main_connected = main.lock().unwrap().connected();
        if !main_connected {
            log::info!("can_recv: main disconnected, exiting");
            return;
        }

        if let Some(bytes) = board_can_receive(main, shared.main_shift()) {
            if !bytes.is_empty() {
                if let Err(err) = can_out.publish(Message::new(bytes)) {
                    log::warn!("can_recv: publish failed: {err}");
                }
            }
        }

        if let Some(aux) = aux {
            if let Some(bytes) = board_can_receive(aux, shared.aux_shift()) {
                if !bytes.is_empty() {
                    if let Err(err) = can_out.publish(Message::new(bytes)) {
                        log::warn!("can_recv: aux publish failed: {err}");
                    }
                }
            }
        }
    }
}

fn board_can_receive(board: &BoardHandle, bus_shift: u8) -> Option<Vec<u8>> {
    let mut board = board.lock().unwrap();
    match board.can_receive(bus_shift) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            log::warn!("can_recv: board read failed: {err}");
            Some(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use crate::board::{Board, HwType};
    use crate::messaging::Hub;
    use crate::test_support::FakeBoard;

    #[test]
    fn drained_frames_are_republished_on_the_can_topic() {
        let shared = Arc::new(Shared::new(0, 3));
        let mut board = FakeBoard::new(HwType::Black);
        board.can_rx_queue.push(vec![1, 2, 3]);
        let main: BoardHandle = Arc::new(Mutex::new(Box::new(board) as Box<dyn Board>));

        let mut hub = Hub::new();
        let can_pub = hub.publisher("can");
        let can_sub = hub.subscriber("can");

        let shared_thread = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            run(&shared_thread, &main, None, &can_pub);
        });

        let received = can_sub
            .recv_timeout(Duration::from_millis(500))
            .unwrap()
            .expect("frame republished");
        assert_eq!(received.bytes, vec![1, 2, 3]);

        shared.request_exit();
        handle.join().unwrap();
    }

    #[test]
    fn exits_once_main_disconnects() {
        let shared = Arc::new(Shared::new(0, 3));
        let mut board = FakeBoard::new(HwType::Black);
        board.connected = false;
        let main: BoardHandle = Arc::new(Mutex::new(Box::new(board) as Box<dyn Board>));

        let mut hub = Hub::new();
        let can_pub = hub.publisher("can");

        let shared_thread = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            run(&shared_thread, &main, None, &can_pub);
        });

        handle.join().unwrap();
        assert!(!shared.exit_requested());
    }
}
