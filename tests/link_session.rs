mod common;

use std::time::Duration;

use common::SimBus;
use danibot_zenoh_runtime::motor::{
    Command, LinkSession, LinkTiming, MotorError, PidGains, PidMode, Protocol,
};

fn open_link(bus: &SimBus) -> LinkSession {
    let mut link = bus.link(LinkTiming {
        response_timeout: Duration::from_millis(5),
        inter_frame_gap: Duration::ZERO,
    });
    link.open().unwrap();
    link
}

#[test]
fn test_velocity_frame_on_the_wire() {
    let bus = SimBus::new(Protocol::CanSerial);
    let mut link = open_link(&bus);

    link.set_velocity(1, 100, 2).unwrap();
    assert_eq!(
        link.last_tx(),
        Some(&[0xAA, 0xC5, 0x01, 0x00, 0xF6, 0x00, 0x64, 0x02, 0x5D, 0x55][..])
    );

    link.set_velocity(1, -50, 2).unwrap();
    assert_eq!(bus.commands().last(), Some(&(1, Command::velocity(-50, 2))));
}

#[test]
fn test_rs485_velocity_frame_on_the_wire() {
    let bus = SimBus::new(Protocol::Rs485);
    let mut link = open_link(&bus);

    link.set_velocity(1, 100, 2).unwrap();
    assert_eq!(
        link.last_tx(),
        Some(&[0xFA, 0x01, 0xF6, 0x00, 0x64, 0x02, 0x57][..])
    );
}

#[test]
fn test_velocity_saturates() {
    let bus = SimBus::new(Protocol::CanSerial);
    let mut link = open_link(&bus);

    link.set_velocity(2, 10_000, 0).unwrap();
    link.set_velocity(2, -10_000, 0).unwrap();
    let log = bus.commands();
    assert_eq!(log[0], (2, Command::Velocity { rpm: 3000, acceleration: 0 }));
    assert_eq!(log[1], (2, Command::Velocity { rpm: -3000, acceleration: 0 }));
}

#[test]
fn test_queries_match_replies() {
    for protocol in [Protocol::CanSerial, Protocol::Rs485] {
        let bus = SimBus::new(protocol);
        bus.with_state(|s| s.encoder = -123_456);
        let mut link = open_link(&bus);

        assert!(!link.query_enabled(3).unwrap());
        link.set_enabled(3, true).unwrap();
        assert!(link.query_enabled(3).unwrap());
        assert_eq!(link.read_encoder(3).unwrap(), -123_456);
        assert_eq!(link.set_working_current(3, 1600).unwrap(), Some(true));
        assert_eq!(link.set_holding_current(3, 50).unwrap(), Some(true));
        assert_eq!(link.missed_replies(), 0);
        assert!(link.last_rx().is_some());
    }
}

#[test]
fn test_replies_found_through_noise() {
    let bus = SimBus::new(Protocol::CanSerial);
    bus.with_state(|s| s.noise = vec![0x13, 0xAA, 0x42, 0x55, 0xAA]);
    let mut link = open_link(&bus);

    link.set_enabled(4, true).unwrap();
    assert!(link.query_enabled(4).unwrap());
    assert!(link.discarded_bytes() > 0);
}

#[test]
fn test_missing_reply_is_not_fatal() {
    let bus = SimBus::new(Protocol::CanSerial);
    bus.with_state(|s| s.replies = false);
    let mut link = open_link(&bus);

    assert!(matches!(
        link.query_enabled(1),
        Err(MotorError::NoResponse {
            address: 1,
            code: 0x3A
        })
    ));
    assert_eq!(link.set_working_current(1, 1000).unwrap(), None);
    assert_eq!(link.missed_replies(), 2);
    assert!(link.is_open());
}

#[test]
fn test_pid_gains_written_as_two_frames() {
    let bus = SimBus::new(Protocol::CanSerial);
    let mut link = open_link(&bus);

    let gains = PidGains {
        kp: 220,
        ki: 100,
        kd: 270,
        kv: 2000,
    };
    let acks = link.set_pid_gains(6, PidMode::Close, gains).unwrap();
    assert_eq!(acks, [Some(true), Some(true)]);

    let log = bus.commands();
    assert_eq!(log.len(), 2);
    let payloads: Vec<Vec<u8>> = log.iter().map(|(_, c)| c.payload()).collect();
    assert_eq!(payloads[0], vec![0x97, 0x00, 220, 0, 100, 0]);
    // kv clamps to 1024
    assert_eq!(payloads[1], vec![0x97, 0x01, 0x0E, 0x01, 0x00, 0x04]);
}

#[test]
fn test_invalid_holding_current_sends_nothing() {
    let bus = SimBus::new(Protocol::CanSerial);
    let mut link = open_link(&bus);

    let err = link.set_holding_current(1, 55).unwrap_err();
    assert!(matches!(err, MotorError::InvalidArgument(_)));
    assert!(!err.is_transport());
    assert!(bus.commands().is_empty());
}

#[test]
fn test_address_out_of_range() {
    let bus = SimBus::new(Protocol::CanSerial);
    let mut link = open_link(&bus);
    assert!(matches!(
        link.set_velocity(0x800, 10, 0),
        Err(MotorError::InvalidArgument(_))
    ));
    assert!(matches!(
        link.set_velocity(0, 10, 0),
        Err(MotorError::InvalidArgument(_))
    ));
}

#[test]
fn test_write_failure_closes_link() {
    let bus = SimBus::new(Protocol::CanSerial);
    let mut link = open_link(&bus);
    bus.with_state(|s| s.fail_writes = true);

    let err = link.set_velocity(1, 10, 0).unwrap_err();
    assert!(err.is_transport());
    assert!(!link.is_open());
    assert!(matches!(
        link.set_velocity(1, 10, 0),
        Err(MotorError::LinkClosed)
    ));

    bus.with_state(|s| s.fail_writes = false);
    link.open().unwrap();
    link.set_velocity(1, 10, 0).unwrap();
    assert_eq!(bus.with_state(|s| s.connects), 2);
}

#[test]
fn test_closed_until_opened() {
    let bus = SimBus::new(Protocol::CanSerial);
    let mut link = bus.link(LinkTiming::default());
    assert!(!link.is_open());
    assert!(matches!(link.set_enabled(1, false), Err(MotorError::LinkClosed)));
}
