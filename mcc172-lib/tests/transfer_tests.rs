//! SPI transaction layer tests against the scripted firmware simulator:
//! ready-poll timeout, command mismatch, firmware status demux, and bus
//! lock behavior.

mod common;

use common::*;
use mcc172_lib::Error;
use std::sync::Arc;
use std::time::Instant;

#[test]
fn ready_poll_timeout_when_device_never_readies() {
    let (board, _backplane, sim) = open_sim(0);

    sim.lock().unwrap().never_ready = true;
    let start = Instant::now();
    let err = board.blink_led(1).unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, Error::Timeout), "got {err:?}");
    // blink uses the 20 ms config deadline; the poll must run it out.
    assert!(elapsed.as_millis() >= 20, "gave up after {elapsed:?}");
}

#[test]
fn reply_command_mismatch_is_bad_parameter() {
    let (board, _backplane, sim) = open_sim(1);

    sim.lock().unwrap().respond_as = Some(0x7F);
    let err = board.blink_led(1).unwrap_err();
    assert!(matches!(err, Error::BadParameter(_)), "got {err:?}");
}

#[test]
fn firmware_status_codes_demultiplex() {
    let (board, _backplane, sim) = open_sim(2);

    sim.lock().unwrap().fw_status = 0x02;
    assert!(matches!(
        board.blink_led(1).unwrap_err(),
        Error::BadParameter(_)
    ));

    sim.lock().unwrap().fw_status = 0x03;
    assert!(matches!(board.blink_led(1).unwrap_err(), Error::Busy));

    sim.lock().unwrap().fw_status = 0x05;
    assert!(matches!(board.blink_led(1).unwrap_err(), Error::Timeout));

    // Codes outside the known set never fall through silently.
    for code in [0x01, 0x04, 0x06, 0x5A] {
        sim.lock().unwrap().fw_status = code;
        assert!(
            matches!(board.blink_led(1).unwrap_err(), Error::Undefined(_)),
            "status {code:#04x}"
        );
    }

    sim.lock().unwrap().fw_status = 0;
    board.blink_led(1).unwrap();
}

#[test]
fn delayed_ready_byte_is_tolerated() {
    let (board, _backplane, sim) = open_sim(3);

    sim.lock().unwrap().ready_delay = 40;
    board.blink_led(2).unwrap();
    board.reset().unwrap();
}

#[test]
fn foreign_lock_holder_times_out_the_transaction() {
    let (board, backplane, _sim) = open_sim(4);

    assert!(backplane.steal_lock());
    let err = board.blink_led(1).unwrap_err();
    assert!(matches!(err, Error::LockTimeout), "got {err:?}");

    backplane.return_lock();
    board.blink_led(1).unwrap();
}

#[test]
fn concurrent_transactions_never_interleave() {
    let (board, _backplane, sim) = open_sim(5);
    let board = Arc::new(board);

    let mut workers = Vec::new();
    for _ in 0..4 {
        let board = Arc::clone(&board);
        workers.push(std::thread::spawn(move || {
            for _ in 0..25 {
                board.blink_led(1).unwrap();
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    let sim = sim.lock().unwrap();
    assert!(!sim.interleaved, "a command cut into another reply");
}

#[test]
fn every_transaction_reasserts_the_board_address() {
    let (board, backplane, _sim) = open_sim(6);

    backplane.addresses.lock().unwrap().clear();
    board.blink_led(1).unwrap();
    board.reset().unwrap();
    let addresses = backplane.addresses.lock().unwrap();
    assert_eq!(&*addresses, &[6, 6]);
}
