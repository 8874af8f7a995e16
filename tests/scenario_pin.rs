//! Seed scenario 2: a SIM that requires a PIN. With enough retries left
//! and a configured PIN, the SIM FSM verifies it and reaches Ready;
//! with only one retry left, it refuses to spend it and reports
//! `PinRequired` without ever sending Verify-Pin.

mod common;

use std::sync::Mutex;
use std::time::Duration;

use bytes::BytesMut;

use qmid::codec::{put_tlv, uim, ServiceId};
use qmid::modem::{Modem, ModemConfig};
use qmid::sim_fsm::{SimFsm, SimOutcome};
use qmid::transport::TransportMode;

fn slot_status_tlv() -> BytesMut {
    let mut v = BytesMut::new();
    let mut slots = BytesMut::new();
    slots.extend_from_slice(&[0x01]);
    slots.extend_from_slice(&[0x01, 0x01, 0x05]);
    slots.extend_from_slice(&[0x89, 0x86, 0x00, 0x18, 0xff]);
    put_tlv(&mut v, 0x10, &slots);
    v
}

fn card_status_tlv(pin1_enabled: bool, pin1_retries: u8) -> BytesMut {
    let mut v = BytesMut::new();
    let mut cards = BytesMut::new();
    cards.extend_from_slice(&[0x00, 0x00]);
    cards.extend_from_slice(&[0x01]);
    cards.extend_from_slice(&[0x01, 0x02, 0x03, 0x03]);
    cards.extend_from_slice(&[0x01]);
    let pin1_state: u8 = if pin1_enabled { 0x01 } else { 0x02 };
    cards.extend_from_slice(&[0x05, pin1_state, pin1_retries, 0x03]);
    put_tlv(&mut v, 0x10, &cards);
    v
}

fn imsi_content_tlv() -> BytesMut {
    let mut v = BytesMut::new();
    put_tlv(&mut v, 0x01, &[0x08, 0x29, 0x82, 0x60, 0x82, 0x00, 0x00, 0x20, 0x80]);
    v
}

#[tokio::test]
async fn pin_verified_when_retries_sufficient() {
    let clock = common::fake_clock();
    let (device, loopback) = common::spawn_loopback_device(TransportMode::Raw, clock.clone());

    common::spawn_stub(loopback, TransportMode::Raw, 0, |msg, count| {
        let ok = |extra: &[u8]| vec![common::success(msg, extra)];
        match (msg.service_id, msg.message_id, count) {
            (ServiceId::Uim, m, _) if m == uim::MSG_GET_SLOT_STATUS => ok(&slot_status_tlv()),
            (ServiceId::Uim, m, 1) if m == uim::MSG_GET_CARD_STATUS => ok(&card_status_tlv(true, 3)),
            (ServiceId::Uim, m, 2) if m == uim::MSG_GET_CARD_STATUS => ok(&card_status_tlv(false, 3)),
            (ServiceId::Uim, m, _) if m == uim::MSG_VERIFY_PIN => {
                let mut v = BytesMut::new();
                put_tlv(&mut v, 0x10, &[0x03, 0x03]);
                ok(&v)
            }
            (ServiceId::Uim, m, _) if m == uim::MSG_READ_TRANSPARENT => ok(&imsi_content_tlv()),
            _ => vec![],
        }
    });

    let modem_arc = Modem::new("modem0".to_string(), "/dev/cdc-wdm0".to_string(), device.clone());
    modem_arc.lock().unwrap().config = ModemConfig { pin: Some("1234".to_string()), ..Default::default() };
    let modem: &Mutex<Modem> = &modem_arc;

    let mut sim_fsm = SimFsm::new(clock);
    let outcome = tokio::time::timeout(Duration::from_secs(5), sim_fsm.run(modem, &device))
        .await
        .expect("sim fsm did not finish in time");

    assert!(matches!(outcome, SimOutcome::Ready));
    assert_eq!(modem_arc.lock().unwrap().identity.imsi.as_deref(), Some("228062800000208"));
}

#[tokio::test]
async fn pin_required_when_only_one_retry_left() {
    let clock = common::fake_clock();
    let (device, loopback) = common::spawn_loopback_device(TransportMode::Raw, clock.clone());

    common::spawn_stub(loopback.clone(), TransportMode::Raw, 0, |msg, _count| {
        let ok = |extra: &[u8]| vec![common::success(msg, extra)];
        match (msg.service_id, msg.message_id) {
            (ServiceId::Uim, m) if m == uim::MSG_GET_SLOT_STATUS => ok(&slot_status_tlv()),
            (ServiceId::Uim, m) if m == uim::MSG_GET_CARD_STATUS => ok(&card_status_tlv(true, 1)),
            _ => vec![],
        }
    });

    let modem_arc = Modem::new("modem0".to_string(), "/dev/cdc-wdm0".to_string(), device.clone());
    modem_arc.lock().unwrap().config = ModemConfig { pin: Some("1234".to_string()), ..Default::default() };
    let modem: &Mutex<Modem> = &modem_arc;

    let mut sim_fsm = SimFsm::new(clock);
    let outcome = tokio::time::timeout(Duration::from_secs(5), sim_fsm.run(modem, &device))
        .await
        .expect("sim fsm did not finish in time");

    assert!(matches!(outcome, SimOutcome::PinRequired));

    let writes = loopback.recorded_writes().await;
    let mut reassembler = qmid::transport::frame::QmuxReassembler::new();
    let sent_verify_pin = writes.iter().any(|w| {
        reassembler.feed(w).unwrap_or_default().iter().any(|m| m.service_id == ServiceId::Uim && m.message_id == uim::MSG_VERIFY_PIN)
    });
    assert!(!sent_verify_pin, "must not spend the last PIN retry");
}
