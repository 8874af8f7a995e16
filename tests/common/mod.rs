//! Shared scaffolding for the seed-scenario integration tests: a stub
//! responder that watches a `LoopbackTransport`'s writes and answers them
//! with canned QMI frames, handling client-id allocation the way a real
//! modem would so each scenario's handler only has to cover the business
//! messages it cares about.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use qmid::clock::{fake::FakeClock, Clock, TokioClock};
use qmid::codec::{self, ctl, put_tlv, QmiMessage, ServiceId, TLV_RESULT};
use qmid::transport::frame::{self, QmuxReassembler};
use qmid::transport::io::loopback::LoopbackTransport;
use qmid::transport::{Device, DeviceHandle, TransportMode};

/// Mirrors `frame::MBIM_MESSAGE_TYPE_COMMAND_DONE`, which is private to
/// that module; the value is part of the wire format, not an
/// implementation detail, so duplicating it here is safe.
const MBIM_MESSAGE_TYPE_COMMAND_DONE: u32 = 0x8000_0003;

pub fn spawn_loopback_device(mode: TransportMode, clock: Arc<dyn Clock>) -> (DeviceHandle, LoopbackTransport) {
    let loopback = LoopbackTransport::new();
    let path = match mode {
        TransportMode::Mbim => Some("/dev/cdc-wdm0".to_string()),
        TransportMode::Raw => None,
    };
    let handle = Device::spawn(Box::new(loopback.clone()), mode, path, clock);
    (handle, loopback)
}

pub fn fake_clock() -> Arc<dyn Clock> {
    Arc::new(FakeClock::new())
}

pub fn tokio_clock() -> Arc<dyn Clock> {
    Arc::new(TokioClock)
}

/// Builds a successful response echoing `req`'s service/tid/message id,
/// with `tlvs` appended after the standard result TLV.
pub fn success(req: &QmiMessage, tlvs: &[u8]) -> QmiMessage {
    let mut payload = BytesMut::new();
    put_tlv(&mut payload, TLV_RESULT, &[0x00, 0x00, 0x00, 0x00]);
    payload.extend_from_slice(tlvs);
    reply(req, payload.freeze())
}

/// Builds a protocol-error response carrying the given QMI error code.
pub fn error(req: &QmiMessage, error_code: u16) -> QmiMessage {
    let mut payload = BytesMut::new();
    let mut result = BytesMut::new();
    result.put_u16_le(0x0001);
    result.put_u16_le(error_code);
    put_tlv(&mut payload, TLV_RESULT, &result);
    reply(req, payload.freeze())
}

fn reply(req: &QmiMessage, payload: Bytes) -> QmiMessage {
    let flags = if matches!(req.service_id, ServiceId::Ctl) { codec::ctl_flags::RESPONSE } else { codec::svc_flags::RESPONSE };
    QmiMessage { service_id: req.service_id, client_id: req.client_id, flags, tid: req.tid, message_id: req.message_id, payload }
}

fn unwrap_mbim_command(bytes: &[u8]) -> Option<Bytes> {
    if bytes.len() < 48 {
        return None;
    }
    let buffer_length = u32::from_le_bytes(bytes[44..48].try_into().ok()?) as usize;
    if bytes.len() < 48 + buffer_length {
        return None;
    }
    Some(Bytes::copy_from_slice(&bytes[48..48 + buffer_length]))
}

fn wrap_command_done(qmi_bytes: &[u8]) -> Bytes {
    let wrapped = frame::mbim_wrap_qmi(qmi_bytes, 1);
    let mut buf = BytesMut::from(&wrapped[..]);
    buf[0..4].copy_from_slice(&MBIM_MESSAGE_TYPE_COMMAND_DONE.to_le_bytes());
    buf.freeze()
}

/// Completes the MBIM proxy-control handshake `Device::run` performs
/// before its main loop by echoing write #0 back with its message type
/// flipped to Command-Done, the same trick `frame.rs`'s own handshake
/// unit test uses.
pub async fn complete_mbim_handshake(loopback: &LoopbackTransport) {
    let handshake = loopback.wait_for_write(0).await;
    let mut buf = BytesMut::from(&handshake[..]);
    buf[0..4].copy_from_slice(&MBIM_MESSAGE_TYPE_COMMAND_DONE.to_le_bytes());
    loopback.push_inbound(&buf).await;
}

/// Decodes the service id a `Get-Client-Id` request is asking for.
fn requested_service(msg: &QmiMessage) -> Option<ServiceId> {
    let v = msg.tlvs().find(0x01)?;
    ServiceId::from_wire(*v.first()?)
}

/// Spawns a background task that answers every write the device makes:
/// `Get-Client-Id`/`Release-Client-Id` are handled generically (an
/// incrementing client id per service, matching the device's own
/// allocate-then-flush flow); everything else is handed to `handler`,
/// which gets the call count for that (service, message id) pair so far
/// (starting at 1) and returns zero or more response messages to feed
/// back.
pub fn spawn_stub<F>(loopback: LoopbackTransport, mode: TransportMode, start_index: usize, mut handler: F)
where
    F: FnMut(&QmiMessage, u32) -> Vec<QmiMessage> + Send + 'static,
{
    tokio::spawn(async move {
        let mut counts: HashMap<(u8, u16), u32> = HashMap::new();
        let mut next_client_id: u8 = 1;
        let mut index = start_index;
        loop {
            let bytes = loopback.wait_for_write(index).await;
            index += 1;
            let qmi_bytes = match mode {
                TransportMode::Raw => Bytes::copy_from_slice(&bytes),
                TransportMode::Mbim => match unwrap_mbim_command(&bytes) {
                    Some(b) => b,
                    None => continue,
                },
            };
            let mut reassembler = QmuxReassembler::new();
            let msgs = match reassembler.feed(&qmi_bytes) {
                Ok(m) => m,
                Err(_) => continue,
            };
            for msg in &msgs {
                let responses = if matches!(msg.service_id, ServiceId::Ctl) && msg.message_id == ctl::MSG_GET_CLIENT_ID {
                    let service = requested_service(msg).unwrap_or(ServiceId::Dms);
                    let client_id = next_client_id;
                    next_client_id += 1;
                    let mut tlvs = BytesMut::new();
                    put_tlv(&mut tlvs, 0x01, &[service.wire(), client_id]);
                    vec![success(msg, &tlvs)]
                } else if matches!(msg.service_id, ServiceId::Ctl) && msg.message_id == ctl::MSG_RELEASE_CLIENT_ID {
                    vec![success(msg, &[])]
                } else {
                    let key = (msg.service_id.wire(), msg.message_id);
                    let count = counts.entry(key).or_insert(0);
                    *count += 1;
                    handler(msg, *count)
                };
                for resp in responses {
                    let out = match mode {
                        TransportMode::Raw => frame::encode_qmux(&resp),
                        TransportMode::Mbim => wrap_command_done(&frame::encode_qmux(&resp)),
                    };
                    loopback.push_inbound(&out).await;
                }
            }
        }
    });
}

/// Polls `check` until it returns `true` or `timeout` elapses, yielding
/// to the runtime between attempts so the device/FSM tasks make
/// progress.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn ipv4_settings_tlv(addr: Ipv4Addr, mask: Ipv4Addr, gateway: Option<Ipv4Addr>) -> BytesMut {
    let mut out = BytesMut::new();
    let mut addr_mask = BytesMut::new();
    addr_mask.extend_from_slice(&addr.octets());
    addr_mask.extend_from_slice(&mask.octets());
    put_tlv(&mut out, 0x1e, &addr_mask);
    if let Some(gw) = gateway {
        put_tlv(&mut out, 0x20, &gw.octets());
    }
    out
}
