//! Seed scenario 3: Start-Network comes back NO_EFFECT (a bearer from a
//! previous session is still dangling on the modem), which the FSM
//! clears with Stop-Network(handle=0xffffffff, disable_autoconnect=true)
//! before retrying Start-Network, which then succeeds.

mod common;

use std::time::Duration;

use bytes::BytesMut;

use qmid::codec::{ctl, dms, nas, put_tlv, uim, wda, wds, QmiMessage, ServiceId};
use qmid::error::QmiErrorCode;
use qmid::modem::{Modem, ModemConfig};
use qmid::modem_fsm::ModemFsm;
use qmid::netdev::fake::FakeNetdevAdapter;
use qmid::transport::TransportMode;

fn responder(msg: &QmiMessage, count: u32) -> Vec<QmiMessage> {
    let ok = |extra: &[u8]| vec![common::success(msg, extra)];

    match (msg.service_id, msg.message_id, count) {
        (ServiceId::Ctl, m, _) if m == ctl::MSG_SYNC => ok(&[]),
        (ServiceId::Ctl, m, _) if m == ctl::MSG_GET_VERSION_INFO => ok(&[]),

        (ServiceId::Dms, m, _) if m == dms::MSG_GET_MODEL => ok(b""),
        (ServiceId::Dms, m, _) if m == dms::MSG_GET_MANUFACTURER => ok(b""),
        (ServiceId::Dms, m, _) if m == dms::MSG_GET_REVISION => ok(b""),
        (ServiceId::Dms, m, 1) if m == dms::MSG_GET_OPERATING_MODE => {
            let mut v = BytesMut::new();
            put_tlv(&mut v, 0x01, &[dms::OperatingMode::LowPower.wire()]);
            ok(&v)
        }
        (ServiceId::Dms, m, 2) if m == dms::MSG_GET_OPERATING_MODE => {
            let mut v = BytesMut::new();
            put_tlv(&mut v, 0x01, &[dms::OperatingMode::Offline.wire()]);
            ok(&v)
        }
        (ServiceId::Dms, m, _) if m == dms::MSG_GET_OPERATING_MODE => {
            let mut v = BytesMut::new();
            put_tlv(&mut v, 0x01, &[dms::OperatingMode::Online.wire()]);
            ok(&v)
        }
        (ServiceId::Dms, m, _) if m == dms::MSG_SET_OPERATING_MODE => ok(&[]),

        (ServiceId::Uim, m, _) if m == uim::MSG_GET_SLOT_STATUS => {
            let mut v = BytesMut::new();
            let mut slots = BytesMut::new();
            slots.extend_from_slice(&[0x01, 0x01, 0x01, 0x05, 0x89, 0x86, 0x00, 0x18, 0xff]);
            put_tlv(&mut v, 0x10, &slots);
            ok(&v)
        }
        (ServiceId::Uim, m, _) if m == uim::MSG_GET_CARD_STATUS => {
            let mut v = BytesMut::new();
            let mut cards = BytesMut::new();
            cards.extend_from_slice(&[0x00, 0x00, 0x01, 0x01, 0x02, 0x03, 0x03, 0x01, 0x05, 0x02, 0x03, 0x03]);
            put_tlv(&mut v, 0x10, &cards);
            ok(&v)
        }
        (ServiceId::Uim, m, _) if m == uim::MSG_READ_TRANSPARENT => {
            let mut v = BytesMut::new();
            put_tlv(&mut v, 0x01, &[0x08, 0x29, 0x82, 0x60, 0x82, 0x00, 0x00, 0x20, 0x80]);
            ok(&v)
        }

        (ServiceId::Wds, m, _) if m == wds::MSG_GET_PROFILE_LIST => {
            let mut v = BytesMut::new();
            put_tlv(&mut v, 0x01, &[0x01, 0x00, 0x01, 0x00]);
            ok(&v)
        }
        (ServiceId::Wds, m, _) if m == wds::MSG_MODIFY_PROFILE => ok(&[]),

        (ServiceId::Wda, m, _) if m == wda::MSG_SET_DATA_FORMAT => ok(&[]),

        (ServiceId::Nas, m, _) if m == nas::MSG_REGISTER_INDICATIONS => ok(&[]),
        (ServiceId::Nas, m, _) if m == nas::MSG_GET_SERVING_SYSTEM => {
            let mut v = BytesMut::new();
            put_tlv(&mut v, 0x01, &[0x01, 0x01, 0x01, 0x08]);
            ok(&v)
        }

        // The dangling bearer: first Start-Network comes back NO_EFFECT.
        (ServiceId::Wds, m, 1) if m == wds::MSG_START_NETWORK => vec![common::error(msg, QmiErrorCode::NoEffect.code())],
        (ServiceId::Wds, m, _) if m == wds::MSG_STOP_NETWORK => {
            // Assert the FSM asked to clear the dangling bearer, not a
            // specific handle it happened to track.
            let tlv = msg.tlvs().find(0x01).expect("stop-network must carry a handle TLV");
            assert_eq!(&tlv[..], &wds::STOP_NETWORK_ANY_HANDLE.to_le_bytes());
            assert!(msg.tlvs().find(0x10).is_some(), "disable_autoconnect TLV must be present");
            ok(&[])
        }
        (ServiceId::Wds, m, 2) if m == wds::MSG_START_NETWORK => {
            let mut v = BytesMut::new();
            put_tlv(&mut v, 0x01, &99u32.to_le_bytes());
            ok(&v)
        }

        (ServiceId::Wds, m, _) if m == wds::MSG_GET_CURRENT_SETTINGS => {
            let addr = "10.20.0.5".parse().unwrap();
            let mask = "255.255.255.0".parse().unwrap();
            ok(&common::ipv4_settings_tlv(addr, mask, None))
        }

        _ => vec![],
    }
}

#[tokio::test]
async fn start_network_no_effect_retries_after_stop_network() {
    let clock = common::fake_clock();
    let (device, loopback) = common::spawn_loopback_device(TransportMode::Raw, clock.clone());

    common::spawn_stub(loopback, TransportMode::Raw, 0, responder);

    let modem = Modem::new("modem0".to_string(), "/dev/cdc-wdm0".to_string(), device.clone());
    let netdev = FakeNetdevAdapter::default();
    let handle = ModemFsm::spawn(modem, device, clock, netdev);

    handle.configure(ModemConfig { apn: Some("internet".to_string()), ..Default::default() });
    handle.start();

    let reached = common::wait_until(Duration::from_secs(5), || {
        handle.modem.lock().unwrap().bearer.packet_data_handle.map(|h| h != 0).unwrap_or(false)
    })
    .await;

    assert!(reached, "modem did not recover from NO_EFFECT and reach a live bearer");
    assert_eq!(handle.modem.lock().unwrap().bearer.packet_data_handle, Some(99));
}
