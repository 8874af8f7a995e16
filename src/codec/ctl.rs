//! CTL service messages: version query, client id allocate/release, sync.
//!
//! CTL is the one service with a fixed client id of 0; it is
//! never allocated through itself.

use bytes::{Buf, BytesMut};

use super::{put_tlv, Decodable, Encodable, ServiceId, TlvReader};
use crate::error::QmidError;

pub const MSG_SET_INSTANCE_ID: u16 = 0x0020;
pub const MSG_GET_VERSION_INFO: u16 = 0x0021;
pub const MSG_GET_CLIENT_ID: u16 = 0x0022;
pub const MSG_RELEASE_CLIENT_ID: u16 = 0x0023;
pub const MSG_SYNC: u16 = 0x0027;

const TLV_CLIENT_SERVICE: u8 = 0x01;
const TLV_CLIENT_ID: u8 = 0x01;
const TLV_SERVICE_LIST: u8 = 0x01;

pub struct GetClientIdRequest {
    pub service: ServiceId,
}

impl Encodable for GetClientIdRequest {
    const SERVICE: ServiceId = ServiceId::Ctl;
    const MESSAGE_ID: u16 = MSG_GET_CLIENT_ID;
    type Response = GetClientIdResponse;

    fn encode_tlvs(&self, buf: &mut BytesMut) {
        put_tlv(buf, TLV_CLIENT_SERVICE, &[self.service.wire()]);
    }
}

pub struct GetClientIdResponse {
    pub service: ServiceId,
    pub client_id: u8,
}

impl Decodable for GetClientIdResponse {
    fn decode(tlvs: TlvReader) -> Result<Self, QmidError> {
        let mut v = tlvs
            .find(TLV_CLIENT_ID)
            .ok_or_else(|| malformed("missing client id TLV"))?;
        if v.len() < 2 {
            return Err(malformed("short client id TLV"));
        }
        let service_wire = v.get_u8();
        let client_id = v.get_u8();
        let service = ServiceId::from_wire(service_wire)
            .ok_or_else(|| malformed("unknown service id in allocate response"))?;
        Ok(GetClientIdResponse { service, client_id })
    }
}

pub struct ReleaseClientIdRequest {
    pub service: ServiceId,
    pub client_id: u8,
}

impl Encodable for ReleaseClientIdRequest {
    const SERVICE: ServiceId = ServiceId::Ctl;
    const MESSAGE_ID: u16 = MSG_RELEASE_CLIENT_ID;
    type Response = ReleaseClientIdResponse;

    fn encode_tlvs(&self, buf: &mut BytesMut) {
        put_tlv(buf, TLV_CLIENT_SERVICE, &[self.service.wire(), self.client_id]);
    }
}

pub struct ReleaseClientIdResponse;

impl Decodable for ReleaseClientIdResponse {
    fn decode(_tlvs: TlvReader) -> Result<Self, QmidError> {
        Ok(ReleaseClientIdResponse)
    }
}

pub struct GetVersionInfoRequest;

impl Encodable for GetVersionInfoRequest {
    const SERVICE: ServiceId = ServiceId::Ctl;
    const MESSAGE_ID: u16 = MSG_GET_VERSION_INFO;
    type Response = GetVersionInfoResponse;

    fn encode_tlvs(&self, _buf: &mut BytesMut) {}
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceVersion {
    pub service: ServiceId,
    pub major: u16,
    pub minor: u16,
}

pub struct GetVersionInfoResponse {
    pub services: Vec<ServiceVersion>,
}

impl Decodable for GetVersionInfoResponse {
    fn decode(tlvs: TlvReader) -> Result<Self, QmidError> {
        let mut v = match tlvs.find(TLV_SERVICE_LIST) {
            Some(v) => v,
            None => return Ok(GetVersionInfoResponse { services: Vec::new() }),
        };
        if v.is_empty() {
            return Ok(GetVersionInfoResponse { services: Vec::new() });
        }
        let count = v.get_u8() as usize;
        let mut services = Vec::with_capacity(count);
        for _ in 0..count {
            if v.len() < 5 {
                break;
            }
            let service_wire = v.get_u8();
            let major = v.get_u16_le();
            let minor = v.get_u16_le();
            if let Some(service) = ServiceId::from_wire(service_wire) {
                services.push(ServiceVersion { service, major, minor });
            }
        }
        Ok(GetVersionInfoResponse { services })
    }
}

pub struct SyncRequest;

impl Encodable for SyncRequest {
    const SERVICE: ServiceId = ServiceId::Ctl;
    const MESSAGE_ID: u16 = MSG_SYNC;
    type Response = SyncResponse;

    fn encode_tlvs(&self, _buf: &mut BytesMut) {}
}

pub struct SyncResponse;

impl Decodable for SyncResponse {
    fn decode(_tlvs: TlvReader) -> Result<Self, QmidError> {
        Ok(SyncResponse)
    }
}

fn malformed(msg: &str) -> QmidError {
    QmidError::Transport(crate::error::TransportError::MalformedFrame(msg.to_string()))
}
