//! Frame Layer: translates between a continuous byte
//! stream and whole `QmiMessage` values, either as raw QMUX frames or as
//! QMI messages tunnelled inside MBIM Command / Command-Done envelopes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{ctl_flags, svc_flags, QmiMessage, ServiceId};
use crate::error::TransportError;

const QMUX_MARKER: u8 = 0x01;

/// Encodes one `QmiMessage` as a raw QMUX frame.
pub fn encode_qmux(msg: &QmiMessage) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(QMUX_MARKER);
    buf.put_u16_le(0); // length placeholder, patched below
    buf.put_u8(0); // flags byte of the QMUX header itself (always 0x80 for requests historically; kept 0 here, unused by receivers)
    buf.put_u8(msg.service_id.wire());
    buf.put_u8(msg.client_id);

    if matches!(msg.service_id, ServiceId::Ctl) {
        buf.put_u8(msg.flags);
        buf.put_u8(msg.tid as u8);
    } else {
        buf.put_u8(msg.flags);
        buf.put_u16_le(msg.tid);
    }
    buf.put_u16_le(msg.message_id);
    buf.put_u16_le(msg.payload.len() as u16);
    buf.put_slice(&msg.payload);

    let total_len = buf.len();
    let len_field = (total_len - 1) as u16;
    buf[1..3].copy_from_slice(&len_field.to_le_bytes());
    buf.freeze()
}

/// Reassembles whole QMUX frames from a byte stream, retaining any
/// partial suffix across calls.
#[derive(Default)]
pub struct QmuxReassembler {
    buf: BytesMut,
}

impl QmuxReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<QmiMessage>, TransportError> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            match try_parse_one(&self.buf)? {
                Some((msg, consumed)) => {
                    self.buf.advance(consumed);
                    out.push(msg);
                }
                None => break,
            }
        }
        Ok(out)
    }
}

/// Attempts to parse exactly one QMUX frame from the front of `buf`.
/// Returns `Ok(None)` if `buf` holds an incomplete frame so far.
fn try_parse_one(buf: &[u8]) -> Result<Option<(QmiMessage, usize)>, TransportError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    if buf[0] != QMUX_MARKER {
        return Err(TransportError::MalformedFrame(format!(
            "bad QMUX marker 0x{:02x}",
            buf[0]
        )));
    }
    let declared_len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
    let total_len = declared_len + 1;
    if total_len > 64 * 1024 {
        return Err(TransportError::MalformedFrame(format!(
            "declared length {} exceeds buffer cap",
            total_len
        )));
    }
    if buf.len() < total_len {
        return Ok(None);
    }

    let mut cursor = &buf[3..total_len];
    if cursor.len() < 2 {
        return Err(TransportError::MalformedFrame("truncated QMUX header".into()));
    }
    let _qmux_flags = cursor.get_u8();
    let service_wire = cursor.get_u8();
    if cursor.is_empty() {
        return Err(TransportError::MalformedFrame("truncated QMUX header".into()));
    }
    let client_id = cursor.get_u8();
    let service_id = ServiceId::from_wire(service_wire)
        .ok_or_else(|| TransportError::MalformedFrame(format!("unknown service id {service_wire}")))?;

    let (flags, tid) = if matches!(service_id, ServiceId::Ctl) {
        if cursor.len() < 2 {
            return Err(TransportError::MalformedFrame("truncated CTL header".into()));
        }
        let flags = cursor.get_u8();
        let tid = cursor.get_u8() as u16;
        (flags, tid)
    } else {
        if cursor.len() < 3 {
            return Err(TransportError::MalformedFrame("truncated service header".into()));
        }
        let flags = cursor.get_u8();
        let tid = cursor.get_u16_le();
        (flags, tid)
    };

    if cursor.len() < 4 {
        return Err(TransportError::MalformedFrame("truncated message header".into()));
    }
    let message_id = cursor.get_u16_le();
    let tlv_len = cursor.get_u16_le() as usize;
    if cursor.len() < tlv_len {
        return Err(TransportError::MalformedFrame("tlv length exceeds frame".into()));
    }
    let payload = Bytes::copy_from_slice(&cursor[..tlv_len]);

    let msg = QmiMessage { service_id, client_id, flags, tid, message_id, payload };
    Ok(Some((msg, total_len)))
}

/// Fixed QMI service UUID used by the MBIM tunnel (`common/mbim.c`).
pub const MBIM_QMI_UUID: [u8; 16] = [
    0xd1, 0xa3, 0x0b, 0xc2, 0xf9, 0x7a, 0x6e, 0x43, 0xbf, 0x65, 0xc7, 0xe2, 0x4f, 0xb0, 0xf0, 0xd3,
];

/// Proxy-control UUID used for the `qmi-proxy` handshake.
pub const MBIM_PROXY_UUID: [u8; 16] = [
    0x83, 0x8c, 0xf7, 0xfb, 0x8d, 0x0d, 0x4d, 0x7f, 0x87, 0x1e, 0xd7, 0x1d, 0xbe, 0xfb, 0xb3, 0x9b,
];

const MBIM_MESSAGE_TYPE_COMMAND: u32 = 0x0000_0003;
const MBIM_MESSAGE_TYPE_COMMAND_DONE: u32 = 0x8000_0003;
const MBIM_COMMAND_TYPE_SET: u32 = 1;
const MBIM_CID_QMI_MSG: u32 = 1;
const MBIM_CID_PROXY_CONTROL_CONFIGURATION: u32 = 1;

/// Wraps an already-encoded QMI message in an MBIM Command envelope.
pub fn mbim_wrap_qmi(qmi_bytes: &[u8], mbim_tid: u32) -> Bytes {
    mbim_command(mbim_tid, &MBIM_QMI_UUID, MBIM_CID_QMI_MSG, MBIM_COMMAND_TYPE_SET, qmi_bytes)
}

/// Builds the MBIM proxy handshake command: `{dev_off, dev_len, timeout}`
/// followed by the device path as UTF-16LE with each code unit's high
/// byte zeroed.
pub fn mbim_proxy_handshake(device_path: &str, mbim_tid: u32, timeout_secs: u32) -> Bytes {
    let path_units: Vec<u16> = device_path.encode_utf16().collect();
    let mut inner = BytesMut::new();
    inner.put_u32_le(12); // dev_off: size of the {dev_off,dev_len,timeout} header
    inner.put_u32_le((path_units.len() * 2) as u32);
    inner.put_u32_le(timeout_secs);
    for unit in path_units {
        inner.put_u16_le(unit);
    }
    mbim_command(
        mbim_tid,
        &MBIM_PROXY_UUID,
        MBIM_CID_PROXY_CONTROL_CONFIGURATION,
        MBIM_COMMAND_TYPE_SET,
        &inner,
    )
}

fn mbim_command(mbim_tid: u32, uuid: &[u8; 16], command_id: u32, command_type: u32, buffer: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    let fixed_len = 12 + 8 + 16 + 4 + 4 + 4;
    buf.put_u32_le(MBIM_MESSAGE_TYPE_COMMAND);
    buf.put_u32_le((fixed_len + buffer.len()) as u32);
    buf.put_u32_le(mbim_tid);
    buf.put_u32_le(1); // fragment total
    buf.put_u32_le(0); // fragment current
    buf.put_slice(uuid);
    buf.put_u32_le(command_id);
    buf.put_u32_le(command_type);
    buf.put_u32_le(buffer.len() as u32);
    buf.put_slice(buffer);
    buf.freeze()
}

/// One complete MBIM packet pulled off the wire, classified for the
/// reassembler's dispatch logic.
pub enum MbimPacket {
    /// A Command-Done carrying a tunnelled QMI message.
    QmiCommandDone { payload: Bytes },
    /// A Command-Done answering the proxy-control handshake.
    ProxyHandshakeDone,
    /// Anything else (other CIDs, other UUIDs) — consumed and ignored.
    Other,
}

/// Reassembles MBIM packets and unwraps the QMI payload from
/// Command-Done envelopes, skipping anything not addressed to the QMI or
/// proxy-control UUID.
#[derive(Default)]
pub struct MbimReassembler {
    buf: BytesMut,
    next_tid: u32,
}

impl MbimReassembler {
    pub fn new() -> Self {
        MbimReassembler { buf: BytesMut::new(), next_tid: 1 }
    }

    /// Allocates the next outer MBIM transaction id (distinct from the
    /// tunnelled QMI message's own tid).
    pub fn next_mbim_tid(&mut self) -> u32 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1).max(1);
        tid
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<MbimPacket>, TransportError> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            match try_parse_mbim_one(&self.buf)? {
                Some((packet, consumed)) => {
                    self.buf.advance(consumed);
                    out.push(packet);
                }
                None => break,
            }
        }
        Ok(out)
    }
}

fn try_parse_mbim_one(buf: &[u8]) -> Result<Option<(MbimPacket, usize)>, TransportError> {
    if buf.len() < 12 {
        return Ok(None);
    }
    let msg_type = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let total_len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
    if total_len > 64 * 1024 {
        return Err(TransportError::MalformedFrame(format!(
            "MBIM declared length {total_len} exceeds buffer cap"
        )));
    }
    if buf.len() < total_len {
        return Ok(None);
    }
    if msg_type != MBIM_MESSAGE_TYPE_COMMAND_DONE {
        // Not a command-done we understand (e.g. an open/close ack);
        // consume it and move on.
        return Ok(Some((MbimPacket::Other, total_len)));
    }
    if total_len < 12 + 8 + 16 + 4 + 4 + 4 {
        return Err(TransportError::MalformedFrame("truncated MBIM command-done".into()));
    }
    let mut cursor = &buf[12..total_len];
    cursor.advance(8); // fragment header: total, current
    let mut uuid = [0u8; 16];
    cursor.copy_to_slice(&mut uuid);
    let command_id = cursor.get_u32_le();
    let _status_or_type = cursor.get_u32_le();
    let buffer_length = cursor.get_u32_le() as usize;
    if cursor.len() < buffer_length {
        return Err(TransportError::MalformedFrame("MBIM buffer_length exceeds frame".into()));
    }
    let buffer = Bytes::copy_from_slice(&cursor[..buffer_length]);

    let packet = if uuid == MBIM_QMI_UUID && command_id == MBIM_CID_QMI_MSG {
        MbimPacket::QmiCommandDone { payload: buffer }
    } else if uuid == MBIM_PROXY_UUID && command_id == MBIM_CID_PROXY_CONTROL_CONFIGURATION {
        MbimPacket::ProxyHandshakeDone
    } else {
        MbimPacket::Other
    };
    Ok(Some((packet, total_len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(tid: u16) -> QmiMessage {
        QmiMessage {
            service_id: ServiceId::Dms,
            client_id: 7,
            flags: svc_flags::RESPONSE,
            tid,
            message_id: 0x0021,
            payload: Bytes::from_static(b"\x01\x04\x00abcd"),
        }
    }

    #[test]
    fn qmux_round_trip() {
        let msg = sample_message(0x0007);
        let encoded = encode_qmux(&msg);
        let mut reassembler = QmuxReassembler::new();
        let mut out = reassembler.feed(&encoded).unwrap();
        assert_eq!(out.len(), 1);
        let parsed = out.remove(0);
        assert_eq!(parsed.tid, msg.tid);
        assert_eq!(parsed.message_id, msg.message_id);
        assert_eq!(parsed.client_id, msg.client_id);
        assert_eq!(&parsed.payload[..], &msg.payload[..]);
    }

    #[test]
    fn partial_frame_yields_nothing() {
        let msg = sample_message(1);
        let encoded = encode_qmux(&msg);
        let mut reassembler = QmuxReassembler::new();
        let split = encoded.len() - 2;
        let out = reassembler.feed(&encoded[..split]).unwrap();
        assert!(out.is_empty());
        let out2 = reassembler.feed(&encoded[split..]).unwrap();
        assert_eq!(out2.len(), 1);
    }

    #[test]
    fn bad_marker_is_malformed() {
        let mut reassembler = QmuxReassembler::new();
        let err = reassembler.feed(&[0x02, 0x00, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame(_)));
    }

    #[test]
    fn mbim_wrap_unwrap_round_trip() {
        let msg = sample_message(0x0007);
        let qmi_bytes = encode_qmux(&msg);
        let wrapped = mbim_wrap_qmi(&qmi_bytes, 42);

        // Flip type to COMMAND_DONE and zero the "status" word to mimic a
        // device echoing the command back as its done-response.
        let mut wrapped = BytesMut::from(&wrapped[..]);
        wrapped[0..4].copy_from_slice(&MBIM_MESSAGE_TYPE_COMMAND_DONE.to_le_bytes());

        let mut reassembler = MbimReassembler::new();
        let packets = reassembler.feed(&wrapped).unwrap();
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            MbimPacket::QmiCommandDone { payload } => assert_eq!(&payload[..], &qmi_bytes[..]),
            _ => panic!("expected QmiCommandDone"),
        }
    }

    #[test]
    fn mbim_proxy_handshake_is_recognised() {
        let handshake = mbim_proxy_handshake("/dev/cdc-wdm0", 1, 5);
        let mut done = BytesMut::from(&handshake[..]);
        done[0..4].copy_from_slice(&MBIM_MESSAGE_TYPE_COMMAND_DONE.to_le_bytes());
        let mut reassembler = MbimReassembler::new();
        let packets = reassembler.feed(&done).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(matches!(packets[0], MbimPacket::ProxyHandshakeDone));
    }

    #[test]
    fn ctl_flags_roundtrip_through_frame() {
        let msg = QmiMessage {
            service_id: ServiceId::Ctl,
            client_id: 0,
            flags: ctl_flags::RESPONSE,
            tid: 0xff,
            message_id: 0x0027,
            payload: Bytes::new(),
        };
        let encoded = encode_qmux(&msg);
        let mut reassembler = QmuxReassembler::new();
        let out = reassembler.feed(&encoded).unwrap();
        assert_eq!(out[0].tid, 0xff);
        assert!(out[0].is_response());
    }
}
