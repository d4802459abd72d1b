//! Open/close lifecycle, handle sharing, and the configuration lockout
//! while a scan is active.

mod common;

use common::*;
use mcc172_lib::hal::Backplane;
use mcc172_lib::{is_open, Error, Mcc172, Options, TriggerMode, TriggerSource};
use std::sync::Arc;

#[test]
fn open_reads_identity_and_calibration() {
    let (board, _backplane, _sim) = open_sim(0);

    assert!(is_open(0));
    assert_eq!(board.serial(), "01DF818C");
    assert_eq!(board.calibration_date(), "2019-03-18");
    assert_eq!(board.firmware_version(), FW_VERSION);
    assert_eq!(board.calibration_coefficient_read(0).unwrap(), (1.0, 0.0));
    assert!(board.calibration_coefficient_read(2).is_err());

    board.close();
    assert!(!is_open(0));
}

#[test]
fn wrong_eeprom_id_is_invalid_device() {
    let backplane = MockBackplane::with_eeprom(Some((0x0142, Vec::new())));
    let (bus, _sim) = SimBus::new();
    let err = Mcc172::open_with(1, backplane as Arc<dyn Backplane>, Box::new(bus)).unwrap_err();
    assert!(
        matches!(err, Error::InvalidDevice { id: 0x0142, .. }),
        "got {err:?}"
    );
    assert!(!is_open(1));
}

#[test]
fn blank_eeprom_opens_with_defaults() {
    let backplane = MockBackplane::with_eeprom(None);
    let (bus, _sim) = SimBus::new();
    let board = Mcc172::open_with(2, backplane as Arc<dyn Backplane>, Box::new(bus)).unwrap();

    assert_eq!(board.serial(), "00000000");
    assert_eq!(board.calibration_date(), "1970-01-01");
    assert_eq!(board.calibration_coefficient_read(1).unwrap(), (1.0, 0.0));
}

#[test]
fn unresponsive_board_only_opens_for_update() {
    let backplane = MockBackplane::new();
    let (bus, sim) = SimBus::new();
    sim.lock().unwrap().never_ready = true;
    let err = Mcc172::open_with(
        3,
        Arc::clone(&backplane) as Arc<dyn Backplane>,
        Box::new(bus),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Timeout), "got {err:?}");
    assert!(!is_open(3));

    let (bus, sim) = SimBus::new();
    sim.lock().unwrap().never_ready = true;
    let board =
        Mcc172::open_for_update_with(3, backplane as Arc<dyn Backplane>, Box::new(bus)).unwrap();
    assert!(is_open(3));
    assert_eq!(board.firmware_version(), 0);
}

#[test]
fn handles_share_one_record_per_address() {
    let (first, backplane, sim) = open_sim(4);
    // A second open for the same address must not re-run discovery, so the
    // injected parts are unused stand-ins.
    let (spare_bus, _spare) = SimBus::new();
    let second = Mcc172::open_with(
        4,
        MockBackplane::new() as Arc<dyn Backplane>,
        Box::new(spare_bus),
    )
    .unwrap();

    // Both handles drive the same simulator.
    let before = sim.lock().unwrap().commands_seen.len();
    second.blink_led(1).unwrap();
    assert_eq!(sim.lock().unwrap().commands_seen.len(), before + 1);

    first.close();
    assert!(is_open(4), "record lives while a handle remains");
    second.close();
    assert!(!is_open(4));
    drop(backplane);
}

#[test]
fn reopen_after_close_reinitialises() {
    let (board, _backplane, _sim) = open_sim(5);
    board.close();
    assert!(!is_open(5));

    let doc = r#"{
        "serial": "AABBCCDD",
        "calibration": { "date": "2021-06-01", "slopes": [2.0, 2.0], "offsets": [1.0, 1.0] }
    }"#;
    let backplane = MockBackplane::with_eeprom(Some((MCC172_ID, doc.as_bytes().to_vec())));
    let (bus, _sim) = SimBus::new();
    let board = Mcc172::open_with(5, backplane as Arc<dyn Backplane>, Box::new(bus)).unwrap();
    assert_eq!(board.serial(), "AABBCCDD");
}

#[test]
fn dropping_the_last_handle_closes_the_record() {
    {
        let (_board, _backplane, _sim) = open_sim(6);
        assert!(is_open(6));
    }
    assert!(!is_open(6));
}

#[test]
fn config_writes_are_rejected_while_scanning() {
    let (board, _backplane, sim) = open_sim(7);
    sim.lock().unwrap().fill_per_status = 8;

    board.a_in_scan_start(0b01, 0, Options::CONTINUOUS).unwrap();

    assert!(matches!(
        board.a_in_clock_config_write(0, 51200.0),
        Err(Error::Busy)
    ));
    assert!(matches!(board.iepe_config_write(0, true), Err(Error::Busy)));
    assert!(matches!(
        board.trigger_config(TriggerSource::Local, TriggerMode::RisingEdge),
        Err(Error::Busy)
    ));
    assert!(matches!(
        board.calibration_coefficient_write(0, 1.0, 0.0),
        Err(Error::Busy)
    ));
    assert!(matches!(
        board.a_in_scan_start(0b01, 100, Options::DEFAULT),
        Err(Error::Busy)
    ));

    // Reads stay available during the scan.
    board.iepe_config_read(0).unwrap();
    board.a_in_clock_config_read().unwrap();

    board.a_in_scan_stop().unwrap();
    board.a_in_scan_cleanup().unwrap();
    board.a_in_clock_config_write(0, 51200.0).unwrap();
}
