//! DMS (Device Management Service) messages: identity strings, IMSI
//! fallback, operating mode.

use bytes::BytesMut;

use super::{put_tlv, Decodable, Encodable, ServiceId, TlvReader};
use crate::error::QmidError;

pub const MSG_GET_MODEL: u16 = 0x0021;
pub const MSG_GET_MANUFACTURER: u16 = 0x0020;
pub const MSG_GET_REVISION: u16 = 0x0022;
pub const MSG_GET_IMEI: u16 = 0x0025;
pub const MSG_GET_OPERATING_MODE: u16 = 0x002d;
pub const MSG_SET_OPERATING_MODE: u16 = 0x002e;
pub const MSG_GET_IMSI: u16 = 0x0011; // legacy UIM-less IMSI read, fallback only

const TLV_STRING: u8 = 0x01;
const TLV_OPERATING_MODE: u8 = 0x01;

/// QMI operating mode, as surfaced by `get_operating_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Online,
    LowPower,
    FactoryTest,
    Offline,
    Reset,
    ShuttingDown,
    PersistentLowPower,
    ModeOnlyLowPower,
}

impl OperatingMode {
    pub fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => OperatingMode::Online,
            0x01 => OperatingMode::LowPower,
            0x02 => OperatingMode::FactoryTest,
            0x03 => OperatingMode::Offline,
            0x04 => OperatingMode::Reset,
            0x05 => OperatingMode::ShuttingDown,
            0x06 => OperatingMode::PersistentLowPower,
            0x07 => OperatingMode::ModeOnlyLowPower,
            _ => return None,
        })
    }

    pub fn wire(self) -> u8 {
        match self {
            OperatingMode::Online => 0x00,
            OperatingMode::LowPower => 0x01,
            OperatingMode::FactoryTest => 0x02,
            OperatingMode::Offline => 0x03,
            OperatingMode::Reset => 0x04,
            OperatingMode::ShuttingDown => 0x05,
            OperatingMode::PersistentLowPower => 0x06,
            OperatingMode::ModeOnlyLowPower => 0x07,
        }
    }
}

macro_rules! simple_string_request {
    ($name:ident, $msg_id:expr) => {
        pub struct $name;
        impl Encodable for $name {
            const SERVICE: ServiceId = ServiceId::Dms;
            const MESSAGE_ID: u16 = $msg_id;
            type Response = StringResponse;
            fn encode_tlvs(&self, _buf: &mut BytesMut) {}
        }
    };
}

simple_string_request!(GetModelRequest, MSG_GET_MODEL);
simple_string_request!(GetManufacturerRequest, MSG_GET_MANUFACTURER);
simple_string_request!(GetRevisionRequest, MSG_GET_REVISION);
simple_string_request!(GetImeiRequest, MSG_GET_IMEI);
simple_string_request!(GetImsiFallbackRequest, MSG_GET_IMSI);

pub struct StringResponse {
    pub value: String,
}

impl Decodable for StringResponse {
    fn decode(tlvs: TlvReader) -> Result<Self, QmidError> {
        let v = tlvs.find(TLV_STRING).unwrap_or_default();
        let value = String::from_utf8_lossy(&v).trim_end_matches('\0').to_string();
        Ok(StringResponse { value })
    }
}

pub struct GetOperatingModeRequest;

impl Encodable for GetOperatingModeRequest {
    const SERVICE: ServiceId = ServiceId::Dms;
    const MESSAGE_ID: u16 = MSG_GET_OPERATING_MODE;
    type Response = GetOperatingModeResponse;
    fn encode_tlvs(&self, _buf: &mut BytesMut) {}
}

pub struct GetOperatingModeResponse {
    pub mode: OperatingMode,
}

impl Decodable for GetOperatingModeResponse {
    fn decode(tlvs: TlvReader) -> Result<Self, QmidError> {
        let v = tlvs
            .find(TLV_OPERATING_MODE)
            .ok_or_else(|| malformed("missing operating mode TLV"))?;
        let wire = *v.first().ok_or_else(|| malformed("empty operating mode TLV"))?;
        let mode = OperatingMode::from_wire(wire)
            .ok_or_else(|| malformed("unknown operating mode"))?;
        Ok(GetOperatingModeResponse { mode })
    }
}

pub struct SetOperatingModeRequest {
    pub mode: OperatingMode,
}

impl Encodable for SetOperatingModeRequest {
    const SERVICE: ServiceId = ServiceId::Dms;
    const MESSAGE_ID: u16 = MSG_SET_OPERATING_MODE;
    type Response = SetOperatingModeResponse;

    fn encode_tlvs(&self, buf: &mut BytesMut) {
        put_tlv(buf, TLV_OPERATING_MODE, &[self.mode.wire()]);
    }
}

pub struct SetOperatingModeResponse;

impl Decodable for SetOperatingModeResponse {
    fn decode(_tlvs: TlvReader) -> Result<Self, QmidError> {
        Ok(SetOperatingModeResponse)
    }
}

/// Decodes a BCD-packed IMSI read from DMS (legacy, UIM unavailable).
/// Every nibble 0-9 is a digit, in the order they appear (no odd/even
/// length flag as UIM's EF.IMSI has — DMS returns the digits already
/// extracted as ASCII in `TLV_STRING` on real modems, but some older
/// basebands pack them; accept either).
pub fn decode_imsi_digits(raw: &[u8]) -> String {
    if raw.iter().all(|b| b.is_ascii_digit()) {
        return String::from_utf8_lossy(raw).to_string();
    }
    let mut out = String::new();
    for byte in raw {
        for nibble in [byte & 0x0f, byte >> 4] {
            if nibble <= 9 {
                out.push((b'0' + nibble) as char);
            }
        }
    }
    out
}

fn malformed(msg: &str) -> QmidError {
    QmidError::Transport(crate::error::TransportError::MalformedFrame(msg.to_string()))
}
