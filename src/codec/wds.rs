//! WDS (Wireless Data Service) messages: profile lookup/modify, bearer
//! start/stop, current settings.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, BytesMut};

use super::{put_tlv, Decodable, Encodable, ServiceId, TlvReader};
use crate::error::QmidError;

pub const MSG_START_NETWORK: u16 = 0x0020;
pub const MSG_STOP_NETWORK: u16 = 0x0021;
pub const MSG_GET_CURRENT_SETTINGS: u16 = 0x002d;
pub const MSG_GET_PROFILE_LIST: u16 = 0x0027;
pub const MSG_MODIFY_PROFILE: u16 = 0x0028;

const TLV_APN: u8 = 0x14;
const TLV_IP_FAMILY: u8 = 0x19;
const TLV_AUTOCONNECT: u8 = 0x17;
const TLV_PROFILE_INDEX_3GPP: u8 = 0x31;
const TLV_DISABLE_AUTOCONNECT: u8 = 0x10;

const TLV_PROFILE_HANDLE: u8 = 0x01;
const TLV_CALL_END_REASON: u8 = 0x11;

const TLV_PROFILE_LIST: u8 = 0x01;

const TLV_MODIFY_APN: u8 = 0x14;
const TLV_MODIFY_USERNAME: u8 = 0x1b;
const TLV_MODIFY_PASSWORD: u8 = 0x1c;
const TLV_MODIFY_PDP_TYPE: u8 = 0x11;
const TLV_MODIFY_ROAMING_DISALLOWED: u8 = 0x1d;

const TLV_SETTINGS_PDP_TYPE: u8 = 0x11;
const TLV_SETTINGS_IPV4_ADDR: u8 = 0x1e;
const TLV_SETTINGS_IPV4_GW: u8 = 0x20;
const TLV_SETTINGS_IPV4_DNS: u8 = 0x15;
const TLV_SETTINGS_IPV6_ADDR: u8 = 0x25;
const TLV_SETTINGS_IPV6_DNS: u8 = 0x26;
const TLV_SETTINGS_MTU: u8 = 0x29;
const TLV_SETTINGS_DOMAINS: u8 = 0x28;

/// IP family requested for a bearer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
    Unspecified,
}

impl IpFamily {
    fn wire(self) -> u8 {
        match self {
            IpFamily::V4 => 0x04,
            IpFamily::V6 => 0x06,
            IpFamily::Unspecified => 0x00,
        }
    }

    fn from_wire(v: u8) -> Self {
        match v {
            0x04 => IpFamily::V4,
            0x06 => IpFamily::V6,
            _ => IpFamily::Unspecified,
        }
    }
}

/// Packet data protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdpType {
    Ipv4,
    Ipv6,
    Ipv4v6,
    Ppp,
}

impl PdpType {
    pub fn wire(self) -> u8 {
        match self {
            PdpType::Ipv4 => 0x00,
            PdpType::Ipv6 => 0x01,
            PdpType::Ipv4v6 => 0x02,
            PdpType::Ppp => 0x03,
        }
    }

    /// Maps a requested PDP type to the IP family WDS should bring up.
    pub fn ip_family(self) -> IpFamily {
        match self {
            PdpType::Ipv4 => IpFamily::V4,
            PdpType::Ipv6 => IpFamily::V6,
            PdpType::Ipv4v6 => IpFamily::V4,
            PdpType::Ppp => IpFamily::Unspecified,
        }
    }
}

pub struct GetProfileListRequest;

impl Encodable for GetProfileListRequest {
    const SERVICE: ServiceId = ServiceId::Wds;
    const MESSAGE_ID: u16 = MSG_GET_PROFILE_LIST;
    type Response = GetProfileListResponse;
    fn encode_tlvs(&self, _buf: &mut BytesMut) {}
}

#[derive(Debug, Clone, Copy)]
pub struct ProfileEntry {
    pub index: u8,
    pub pdp_type: u8,
}

pub struct GetProfileListResponse {
    pub profiles: Vec<ProfileEntry>,
}

impl Decodable for GetProfileListResponse {
    fn decode(tlvs: TlvReader) -> Result<Self, QmidError> {
        let mut v = match tlvs.find(TLV_PROFILE_LIST) {
            Some(v) => v,
            None => return Ok(GetProfileListResponse { profiles: Vec::new() }),
        };
        if v.is_empty() {
            return Ok(GetProfileListResponse { profiles: Vec::new() });
        }
        let count = v.get_u8() as usize;
        let mut profiles = Vec::with_capacity(count);
        for _ in 0..count {
            if v.len() < 3 {
                break;
            }
            let pdp_type = v.get_u8();
            let index = v.get_u8();
            let _kind = v.get_u8();
            profiles.push(ProfileEntry { index, pdp_type });
        }
        Ok(GetProfileListResponse { profiles })
    }
}

pub struct ModifyProfileRequest {
    pub index: u8,
    pub apn: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pdp_type: PdpType,
    pub roaming_disallowed: bool,
}

impl Encodable for ModifyProfileRequest {
    const SERVICE: ServiceId = ServiceId::Wds;
    const MESSAGE_ID: u16 = MSG_MODIFY_PROFILE;
    type Response = ModifyProfileResponse;

    fn encode_tlvs(&self, buf: &mut BytesMut) {
        let mut idx = BytesMut::new();
        idx.put_u8(self.index);
        put_tlv(buf, TLV_PROFILE_HANDLE, &idx);
        put_tlv(buf, TLV_MODIFY_APN, self.apn.as_bytes());
        put_tlv(buf, TLV_MODIFY_PDP_TYPE, &[self.pdp_type.wire()]);
        if let Some(u) = &self.username {
            put_tlv(buf, TLV_MODIFY_USERNAME, u.as_bytes());
        }
        if let Some(p) = &self.password {
            put_tlv(buf, TLV_MODIFY_PASSWORD, p.as_bytes());
        }
        put_tlv(buf, TLV_MODIFY_ROAMING_DISALLOWED, &[self.roaming_disallowed as u8]);
    }
}

pub struct ModifyProfileResponse;

impl Decodable for ModifyProfileResponse {
    fn decode(_tlvs: TlvReader) -> Result<Self, QmidError> {
        Ok(ModifyProfileResponse)
    }
}

pub struct StartNetworkRequest {
    pub profile_index: u8,
    pub ip_family: IpFamily,
    pub autoconnect: bool,
    pub apn: Option<String>,
}

impl Encodable for StartNetworkRequest {
    const SERVICE: ServiceId = ServiceId::Wds;
    const MESSAGE_ID: u16 = MSG_START_NETWORK;
    type Response = StartNetworkResponse;

    fn encode_tlvs(&self, buf: &mut BytesMut) {
        if let Some(apn) = &self.apn {
            put_tlv(buf, TLV_APN, apn.as_bytes());
        }
        let mut idx = BytesMut::new();
        idx.put_u8(self.profile_index);
        put_tlv(buf, TLV_PROFILE_INDEX_3GPP, &idx);
        put_tlv(buf, TLV_IP_FAMILY, &[self.ip_family.wire()]);
        put_tlv(buf, TLV_AUTOCONNECT, &[self.autoconnect as u8]);
    }
}

pub struct StartNetworkResponse {
    pub packet_data_handle: u32,
}

impl Decodable for StartNetworkResponse {
    fn decode(tlvs: TlvReader) -> Result<Self, QmidError> {
        let mut v = tlvs
            .find(TLV_PROFILE_HANDLE)
            .ok_or_else(|| malformed("missing packet data handle"))?;
        if v.len() < 4 {
            return Err(malformed("short packet data handle"));
        }
        Ok(StartNetworkResponse { packet_data_handle: v.get_u32_le() })
    }
}

/// Sentinel handle used to clear a dangling bearer:
/// `Stop-Network(handle=0xffffffff, disable_autoconnect=true)`.
pub const STOP_NETWORK_ANY_HANDLE: u32 = 0xffff_ffff;

pub struct StopNetworkRequest {
    pub packet_data_handle: u32,
    pub disable_autoconnect: bool,
}

impl Encodable for StopNetworkRequest {
    const SERVICE: ServiceId = ServiceId::Wds;
    const MESSAGE_ID: u16 = MSG_STOP_NETWORK;
    type Response = StopNetworkResponse;

    fn encode_tlvs(&self, buf: &mut BytesMut) {
        let mut h = BytesMut::new();
        h.put_u32_le(self.packet_data_handle);
        put_tlv(buf, TLV_PROFILE_HANDLE, &h);
        if self.disable_autoconnect {
            put_tlv(buf, TLV_DISABLE_AUTOCONNECT, &[0x01]);
        }
    }
}

pub struct StopNetworkResponse;

impl Decodable for StopNetworkResponse {
    fn decode(_tlvs: TlvReader) -> Result<Self, QmidError> {
        Ok(StopNetworkResponse)
    }
}

#[allow(dead_code)]
pub fn call_end_reason(tlvs: &TlvReader) -> Option<u16> {
    let mut v = tlvs.find(TLV_CALL_END_REASON)?;
    if v.len() < 2 {
        return None;
    }
    Some(v.get_u16_le())
}

pub struct GetCurrentSettingsRequest {
    pub ip_family: IpFamily,
}

impl Encodable for GetCurrentSettingsRequest {
    const SERVICE: ServiceId = ServiceId::Wds;
    const MESSAGE_ID: u16 = MSG_GET_CURRENT_SETTINGS;
    type Response = CurrentSettings;

    fn encode_tlvs(&self, buf: &mut BytesMut) {
        put_tlv(buf, TLV_IP_FAMILY, &[self.ip_family.wire()]);
    }
}

#[derive(Debug, Clone, Default)]
pub struct CurrentSettings {
    pub pdp_type: Option<u8>,
    pub v4_addr: Option<Ipv4Addr>,
    pub v4_mask: Option<Ipv4Addr>,
    pub v4_gateway: Option<Ipv4Addr>,
    pub v4_dns: Vec<Ipv4Addr>,
    pub v6_addr: Option<(Ipv6Addr, u8)>,
    pub v6_dns: Vec<Ipv6Addr>,
    pub mtu: Option<u32>,
    pub domains: Vec<String>,
}

impl Decodable for CurrentSettings {
    fn decode(tlvs: TlvReader) -> Result<Self, QmidError> {
        let mut out = CurrentSettings::default();
        for tlv in tlvs {
            match tlv.tlv_type {
                TLV_SETTINGS_PDP_TYPE => {
                    if let Some(&b) = tlv.value.first() {
                        out.pdp_type = Some(b);
                    }
                }
                TLV_SETTINGS_IPV4_ADDR => {
                    let mut v = tlv.value;
                    if v.len() >= 8 {
                        out.v4_addr = Some(Ipv4Addr::from(v.get_u32_le().to_be()));
                        out.v4_mask = Some(Ipv4Addr::from(v.get_u32_le().to_be()));
                    }
                }
                TLV_SETTINGS_IPV4_GW => {
                    let mut v = tlv.value;
                    if v.len() >= 4 {
                        out.v4_gateway = Some(Ipv4Addr::from(v.get_u32_le().to_be()));
                    }
                }
                TLV_SETTINGS_IPV4_DNS => {
                    let mut v = tlv.value;
                    while v.len() >= 4 {
                        out.v4_dns.push(Ipv4Addr::from(v.get_u32_le().to_be()));
                    }
                }
                TLV_SETTINGS_IPV6_ADDR => {
                    let mut v = tlv.value;
                    if v.len() >= 17 {
                        let mut octets = [0u8; 16];
                        v.copy_to_slice(&mut octets);
                        let prefix = v.get_u8();
                        out.v6_addr = Some((Ipv6Addr::from(octets), prefix));
                    }
                }
                TLV_SETTINGS_IPV6_DNS => {
                    let mut v = tlv.value;
                    while v.len() >= 16 {
                        let mut octets = [0u8; 16];
                        v.copy_to_slice(&mut octets);
                        out.v6_dns.push(Ipv6Addr::from(octets));
                    }
                }
                TLV_SETTINGS_MTU => {
                    let mut v = tlv.value;
                    if v.len() >= 4 {
                        out.mtu = Some(v.get_u32_le());
                    }
                }
                TLV_SETTINGS_DOMAINS => {
                    let s = String::from_utf8_lossy(&tlv.value).trim_end_matches('\0').to_string();
                    if !s.is_empty() {
                        out.domains = s.split(',').map(|d| d.to_string()).collect();
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }
}

fn malformed(msg: &str) -> QmidError {
    QmidError::Transport(crate::error::TransportError::MalformedFrame(msg.to_string()))
}
