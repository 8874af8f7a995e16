//! Seed scenario 1: a PIN-less SIM cold-attaches straight through to a
//! LIVE IPv4 bearer with a non-zero packet-data handle.

mod common;

use std::time::Duration;

use bytes::BytesMut;

use qmid::codec::{ctl, dms, nas, put_tlv, uim, wda, wds, ServiceId};
use qmid::modem::{Modem, ModemConfig};
use qmid::modem_fsm::ModemFsm;
use qmid::netdev::fake::FakeNetdevAdapter;
use qmid::transport::TransportMode;

fn responder(msg: &qmid::codec::QmiMessage, count: u32) -> Vec<qmid::codec::QmiMessage> {
    let ok = |extra: &[u8]| vec![common::success(msg, extra)];

    match (msg.service_id, msg.message_id, count) {
        (ServiceId::Ctl, m, _) if m == ctl::MSG_SYNC => ok(&[]),
        (ServiceId::Ctl, m, _) if m == ctl::MSG_GET_VERSION_INFO => ok(&[]),

        (ServiceId::Dms, m, _) if m == dms::MSG_GET_MODEL => {
            let mut v = BytesMut::new();
            put_tlv(&mut v, 0x01, b"TestModel");
            ok(&v)
        }
        (ServiceId::Dms, m, _) if m == dms::MSG_GET_MANUFACTURER => {
            let mut v = BytesMut::new();
            put_tlv(&mut v, 0x01, b"TestMfg");
            ok(&v)
        }
        (ServiceId::Dms, m, _) if m == dms::MSG_GET_REVISION => {
            let mut v = BytesMut::new();
            put_tlv(&mut v, 0x01, b"TestRev");
            ok(&v)
        }
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
            slots.extend_from_slice(&[0x01]); // count
            slots.extend_from_slice(&[0x01, 0x01, 0x05]); // Present, Active, iccid_len=5
            slots.extend_from_slice(&[0x89, 0x86, 0x00, 0x18, 0xff]);
            put_tlv(&mut v, 0x10, &slots);
            ok(&v)
        }
        (ServiceId::Uim, m, _) if m == uim::MSG_GET_CARD_STATUS => {
            let mut v = BytesMut::new();
            let mut cards = BytesMut::new();
            cards.extend_from_slice(&[0x00, 0x00]); // index_gw_primary
            cards.extend_from_slice(&[0x01]); // card_count
            cards.extend_from_slice(&[0x01, 0x02, 0x03, 0x03]); // card_state, upin_state, upin_retries, upuk_retries
            cards.extend_from_slice(&[0x01]); // app_count
            cards.extend_from_slice(&[0x05, 0x02, 0x03, 0x03]); // app_state Ready, pin1_state Disabled, retries
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
            put_tlv(&mut v, 0x01, &[0x01, 0x01, 0x01, 0x08]); // Registered, cs, ps, LTE
            let mut plmn = BytesMut::new();
            plmn.extend_from_slice(&262u16.to_le_bytes());
            plmn.extend_from_slice(&1u16.to_le_bytes());
            plmn.extend_from_slice(&[0x02]);
            plmn.extend_from_slice(b"Test Operator");
            put_tlv(&mut v, 0x12, &plmn);
            ok(&v)
        }

        (ServiceId::Wds, m, _) if m == wds::MSG_START_NETWORK => {
            let mut v = BytesMut::new();
            put_tlv(&mut v, 0x01, &42u32.to_le_bytes());
            ok(&v)
        }
        (ServiceId::Wds, m, _) if m == wds::MSG_GET_CURRENT_SETTINGS => {
            let addr = "10.20.0.5".parse().unwrap();
            let mask = "255.255.255.0".parse().unwrap();
            let gw = "10.20.0.1".parse().unwrap();
            ok(&common::ipv4_settings_tlv(addr, mask, Some(gw)))
        }

        _ => vec![],
    }
}

#[tokio::test]
async fn cold_attach_pinless_reaches_live_with_ipv4_bearer() {
    let clock = common::fake_clock();
    let (device, loopback) = common::spawn_loopback_device(TransportMode::Raw, clock.clone());

    common::spawn_stub(loopback, TransportMode::Raw, 0, responder);

    let modem = Modem::new("modem0".to_string(), "/dev/cdc-wdm0".to_string(), device.clone());
    let netdev = FakeNetdevAdapter::default();
    let handle = ModemFsm::spawn(modem, device, clock, netdev);

    handle.configure(ModemConfig { apn: Some("internet".to_string()), ..Default::default() });
    handle.start();

    let reached = common::wait_until(Duration::from_secs(5), || {
        let m = handle.modem.lock().unwrap();
        m.bearer.packet_data_handle.map(|h| h != 0).unwrap_or(false) && m.bearer.v4_addr.is_some()
    })
    .await;

    assert!(reached, "modem did not reach a live IPv4 bearer in time");

    let m = handle.modem.lock().unwrap();
    assert_eq!(m.bearer.packet_data_handle, Some(42));
    assert_eq!(m.bearer.v4_addr, Some("10.20.0.5".parse().unwrap()));
    assert_eq!(m.identity.iccid.as_deref(), Some("98680081"));
    assert_eq!(m.identity.imsi.as_deref(), Some("228062800000208"));
}
