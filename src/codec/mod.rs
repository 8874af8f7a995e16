//! The message codec: typed encode/parse of QMI requests,
//! responses and indications to/from a TLV payload. In the original this
//! is code-generated from `qmi-message-*.h` definitions; here it is a
//! small hand-written set covering only the operations the FSMs use.

pub mod ctl;
pub mod dms;
pub mod nas;
pub mod uim;
pub mod wda;
pub mod wds;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{QmiErrorCode, QmiResultTlv};

/// QMI service identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceId {
    Ctl,
    Wds,
    Dms,
    Nas,
    Wms,
    Uim,
    Wda,
}

impl ServiceId {
    pub fn wire(self) -> u8 {
        match self {
            ServiceId::Ctl => 0x00,
            ServiceId::Wds => 0x01,
            ServiceId::Dms => 0x02,
            ServiceId::Nas => 0x03,
            ServiceId::Wms => 0x05,
            ServiceId::Uim => 0x0b,
            ServiceId::Wda => 0x1a,
        }
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => ServiceId::Ctl,
            0x01 => ServiceId::Wds,
            0x02 => ServiceId::Dms,
            0x03 => ServiceId::Nas,
            0x05 => ServiceId::Wms,
            0x0b => ServiceId::Uim,
            0x1a => ServiceId::Wda,
            _ => return None,
        })
    }

    /// Width, in bytes, of the transaction id field for this service's
    /// header: 8 bits for CTL, 16 bits little-endian for every other
    /// service.
    pub fn tid_width(self) -> u8 {
        if matches!(self, ServiceId::Ctl) {
            1
        } else {
            2
        }
    }
}

/// Control-flag bit positions for the CTL header. Distinct from the
/// service-level bits.
pub mod ctl_flags {
    pub const RESPONSE: u8 = 0x01;
    pub const INDICATION: u8 = 0x02;
}

/// Control-flag bit positions for non-CTL service headers.
pub mod svc_flags {
    pub const RESPONSE: u8 = 0x02;
    pub const INDICATION: u8 = 0x04;
}

/// Standard "result" TLV type, present in every response.
pub const TLV_RESULT: u8 = 0x02;

/// A single type-length-value record from a QMI message payload.
#[derive(Debug, Clone)]
pub struct Tlv {
    pub tlv_type: u8,
    pub value: Bytes,
}

/// Iterates the TLV records of a message payload in wire order.
pub struct TlvReader {
    buf: Bytes,
}

impl TlvReader {
    pub fn new(buf: Bytes) -> Self {
        TlvReader { buf }
    }

    /// Finds the first TLV of the given type, consuming nothing before it
    /// (this is a read-only scan, not a destructive pop).
    pub fn find(&self, tlv_type: u8) -> Option<Bytes> {
        self.clone_iter().find(|t| t.tlv_type == tlv_type).map(|t| t.value)
    }

    fn clone_iter(&self) -> TlvIter {
        TlvIter { buf: self.buf.clone() }
    }
}

impl IntoIterator for TlvReader {
    type Item = Tlv;
    type IntoIter = TlvIter;
    fn into_iter(self) -> TlvIter {
        TlvIter { buf: self.buf }
    }
}

pub struct TlvIter {
    buf: Bytes,
}

impl Iterator for TlvIter {
    type Item = Tlv;
    fn next(&mut self) -> Option<Tlv> {
        if self.buf.len() < 3 {
            return None;
        }
        let tlv_type = self.buf.get_u8();
        let len = self.buf.get_u16_le() as usize;
        if self.buf.len() < len {
            return None;
        }
        let value = self.buf.split_to(len);
        Some(Tlv { tlv_type, value })
    }
}

/// Appends one TLV record to an encode buffer.
pub fn put_tlv(buf: &mut BytesMut, tlv_type: u8, value: &[u8]) {
    buf.put_u8(tlv_type);
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(value);
}

/// Parses the standard result TLV (0x02): two 16-bit LE words, result and
/// error code.
pub fn parse_result_tlv(tlvs: &TlvReader) -> QmiResultTlv {
    match tlvs.find(TLV_RESULT) {
        Some(mut v) if v.len() >= 4 => {
            let result = v.get_u16_le();
            let error = v.get_u16_le();
            QmiResultTlv { result, error: QmiErrorCode::from_code(error) }
        }
        _ => QmiResultTlv::success(),
    }
}

/// Implemented by every typed QMI request. Generalizes the generated
/// `qmi_set_<service>_<op>_request()` functions a code generator would
/// otherwise emit.
pub trait Encodable {
    const SERVICE: ServiceId;
    const MESSAGE_ID: u16;

    /// The typed response this request pairs with, so the transaction
    /// engine can decode generically (`engine::request::<Req>`) without
    /// every call site naming the response type by hand.
    type Response: Decodable;

    /// Encodes this request's TLV payload (not the QMUX/CTL/service
    /// headers, which the transaction engine stamps on send).
    fn encode_tlvs(&self, buf: &mut BytesMut);
}

/// Implemented by every typed QMI response. Generalizes the generated
/// `qmi_parse_<service>_<op>_response()` functions a code generator
/// would otherwise emit.
/// Callers are expected to check `QmiResultTlv::is_success` themselves
/// before decoding (a failed response commonly omits the TLVs a
/// successful one carries).
pub trait Decodable: Sized {
    fn decode(tlvs: TlvReader) -> Result<Self, crate::error::QmidError>;
}

/// An in-memory QMI message, independent of whether it
/// arrived over raw QMUX or a tunnelled MBIM Command-Done.
#[derive(Debug, Clone)]
pub struct QmiMessage {
    pub service_id: ServiceId,
    pub client_id: u8,
    pub flags: u8,
    pub tid: u16,
    pub message_id: u16,
    pub payload: Bytes,
}

impl QmiMessage {
    /// A synthetic message for engine-internal completions (tid exhaustion,
    /// client id allocation failure) that never actually crossed the wire.
    pub fn empty(service_id: ServiceId) -> Self {
        QmiMessage { service_id, client_id: 0, flags: 0, tid: 0, message_id: 0, payload: Bytes::new() }
    }

    pub fn is_response(&self) -> bool {
        let bit = if matches!(self.service_id, ServiceId::Ctl) {
            ctl_flags::RESPONSE
        } else {
            svc_flags::RESPONSE
        };
        self.flags & bit != 0
    }

    pub fn is_indication(&self) -> bool {
        let bit = if matches!(self.service_id, ServiceId::Ctl) {
            ctl_flags::INDICATION
        } else {
            svc_flags::INDICATION
        };
        self.flags & bit != 0
    }

    pub fn tlvs(&self) -> TlvReader {
        TlvReader::new(self.payload.clone())
    }

    pub fn result(&self) -> QmiResultTlv {
        parse_result_tlv(&self.tlvs())
    }
}
