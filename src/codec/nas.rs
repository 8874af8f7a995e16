//! NAS (Network Access Service) messages: registration indications,
//! serving system, forced network search.

use bytes::{Buf, BufMut, BytesMut};

use super::{put_tlv, Decodable, Encodable, ServiceId, TlvReader};
use crate::error::QmidError;

pub const MSG_REGISTER_INDICATIONS: u16 = 0x0003;
pub const MSG_GET_SERVING_SYSTEM: u16 = 0x0024;
pub const MSG_FORCE_NETWORK_SEARCH: u16 = 0x0025;
pub const MSG_SERVING_SYSTEM_IND: u16 = 0x0024;

const TLV_REGISTER_MASK: u8 = 0x10;
const TLV_REGISTRATION_STATE: u8 = 0x01;
const TLV_CURRENT_PLMN: u8 = 0x12;

/// Which indication classes NAS should emit: serving-system,
/// subscription, system-info, signal, and reject.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndicationMask {
    pub serving_system: bool,
    pub subscription_info: bool,
    pub system_info: bool,
    pub signal_info: bool,
    pub reject: bool,
}

impl IndicationMask {
    fn bits(self) -> u32 {
        let mut m = 0u32;
        if self.serving_system {
            m |= 1 << 0;
        }
        if self.subscription_info {
            m |= 1 << 1;
        }
        if self.system_info {
            m |= 1 << 2;
        }
        if self.signal_info {
            m |= 1 << 3;
        }
        if self.reject {
            m |= 1 << 4;
        }
        m
    }
}

pub struct RegisterIndicationsRequest {
    pub mask: IndicationMask,
}

impl Encodable for RegisterIndicationsRequest {
    const SERVICE: ServiceId = ServiceId::Nas;
    const MESSAGE_ID: u16 = MSG_REGISTER_INDICATIONS;
    type Response = RegisterIndicationsResponse;

    fn encode_tlvs(&self, buf: &mut BytesMut) {
        let mut v = BytesMut::new();
        v.put_u32_le(self.mask.bits());
        put_tlv(buf, TLV_REGISTER_MASK, &v);
    }
}

pub struct RegisterIndicationsResponse;

impl Decodable for RegisterIndicationsResponse {
    fn decode(_tlvs: TlvReader) -> Result<Self, QmidError> {
        Ok(RegisterIndicationsResponse)
    }
}

/// Registration state as seen by NAS: registered, unregistered, or
/// still searching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    NotRegistered,
    Registered,
    Searching,
    RegistrationDenied,
    Unknown,
}

impl RegistrationState {
    fn from_wire(v: u8) -> Self {
        match v {
            0x00 => RegistrationState::NotRegistered,
            0x01 => RegistrationState::Registered,
            0x02 => RegistrationState::Searching,
            0x03 => RegistrationState::RegistrationDenied,
            _ => RegistrationState::Unknown,
        }
    }
}

/// Radio Access Technology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rat {
    Gsm,
    Umts,
    Lte,
    Nr,
    Unknown(u8),
}

impl Rat {
    fn from_wire(v: u8) -> Self {
        match v {
            0x04 => Rat::Gsm,
            0x05 => Rat::Umts,
            0x08 => Rat::Lte,
            0x09 => Rat::Nr,
            other => Rat::Unknown(other),
        }
    }
}

pub struct GetServingSystemRequest;

impl Encodable for GetServingSystemRequest {
    const SERVICE: ServiceId = ServiceId::Nas;
    const MESSAGE_ID: u16 = MSG_GET_SERVING_SYSTEM;
    type Response = ServingSystem;
    fn encode_tlvs(&self, _buf: &mut BytesMut) {}
}

pub struct ServingSystem {
    pub state: RegistrationState,
    pub rat: Rat,
    pub cs_attached: bool,
    pub ps_attached: bool,
    pub mcc: Option<u16>,
    pub mnc: Option<u16>,
    pub mnc_len: u8,
    pub operator_name: Option<String>,
}

impl Decodable for ServingSystem {
    fn decode(tlvs: TlvReader) -> Result<Self, QmidError> {
        let mut state = RegistrationState::Unknown;
        let mut rat = Rat::Unknown(0);
        let mut cs_attached = false;
        let mut ps_attached = false;
        let mut mcc = None;
        let mut mnc = None;
        let mut mnc_len = 2u8;
        let mut operator_name = None;

        for tlv in tlvs {
            match tlv.tlv_type {
                TLV_REGISTRATION_STATE => {
                    let mut v = tlv.value;
                    if v.len() >= 4 {
                        state = RegistrationState::from_wire(v.get_u8());
                        let cs = v.get_u8();
                        let ps = v.get_u8();
                        cs_attached = cs == 0x01;
                        ps_attached = ps == 0x01;
                        let rat_byte = v.get_u8();
                        rat = Rat::from_wire(rat_byte);
                    }
                }
                TLV_CURRENT_PLMN => {
                    let mut v = tlv.value;
                    if v.len() >= 5 {
                        mcc = Some(v.get_u16_le());
                        mnc = Some(v.get_u16_le());
                        let len_byte = v.get_u8();
                        mnc_len = if len_byte == 3 { 3 } else { 2 };
                        let rest = v;
                        if !rest.is_empty() {
                            operator_name =
                                Some(String::from_utf8_lossy(&rest).trim_end_matches('\0').to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(ServingSystem {
            state,
            rat,
            cs_attached,
            ps_attached,
            mcc,
            mnc,
            mnc_len,
            operator_name,
        })
    }
}

pub struct ForceNetworkSearchRequest;

impl Encodable for ForceNetworkSearchRequest {
    const SERVICE: ServiceId = ServiceId::Nas;
    const MESSAGE_ID: u16 = MSG_FORCE_NETWORK_SEARCH;
    type Response = ForceNetworkSearchResponse;
    fn encode_tlvs(&self, _buf: &mut BytesMut) {}
}

pub struct ForceNetworkSearchResponse;

impl Decodable for ForceNetworkSearchResponse {
    fn decode(_tlvs: TlvReader) -> Result<Self, QmidError> {
        Ok(ForceNetworkSearchResponse)
    }
}
