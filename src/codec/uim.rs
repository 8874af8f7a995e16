//! UIM (User Identity Module) messages: slot/card status, PIN/PUK
//! verification, transparent file reads.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{put_tlv, Decodable, Encodable, ServiceId, TlvReader};
use crate::error::QmidError;

pub const MSG_GET_SLOT_STATUS: u16 = 0x0047;
pub const MSG_GET_CARD_STATUS: u16 = 0x002f;
pub const MSG_VERIFY_PIN: u16 = 0x0028;
pub const MSG_UNBLOCK_PIN: u16 = 0x0029;
pub const MSG_READ_TRANSPARENT: u16 = 0x0020;

const TLV_SLOTS: u8 = 0x10;
const TLV_CARDS: u8 = 0x10;
const TLV_PIN_ID: u8 = 0x01;
const TLV_PIN_VALUE: u8 = 0x02;
const TLV_PUK_VALUE: u8 = 0x01;
const TLV_RETRIES: u8 = 0x10;
const TLV_FILE_ID: u8 = 0x01;
const TLV_CONTENT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Absent,
    Present,
    Error,
    Unknown,
}

impl CardState {
    fn from_wire(v: u8) -> Self {
        match v {
            0x00 => CardState::Absent,
            0x01 => CardState::Present,
            0x02 => CardState::Error,
            _ => CardState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Inactive,
    Active,
}

impl SlotState {
    fn from_wire(v: u8) -> Self {
        if v == 0x01 {
            SlotState::Active
        } else {
            SlotState::Inactive
        }
    }
}

pub struct GetSlotStatusRequest;

impl Encodable for GetSlotStatusRequest {
    const SERVICE: ServiceId = ServiceId::Uim;
    const MESSAGE_ID: u16 = MSG_GET_SLOT_STATUS;
    type Response = GetSlotStatusResponse;
    fn encode_tlvs(&self, _buf: &mut BytesMut) {}
}

#[derive(Debug, Clone)]
pub struct SlotEntry {
    pub card_state: CardState,
    pub slot_state: SlotState,
    pub iccid_raw: Bytes,
}

pub struct GetSlotStatusResponse {
    pub slots: Vec<SlotEntry>,
}

impl Decodable for GetSlotStatusResponse {
    fn decode(tlvs: TlvReader) -> Result<Self, QmidError> {
        let mut v = match tlvs.find(TLV_SLOTS) {
            Some(v) => v,
            None => return Ok(GetSlotStatusResponse { slots: Vec::new() }),
        };
        if v.is_empty() {
            return Ok(GetSlotStatusResponse { slots: Vec::new() });
        }
        let count = v.get_u8() as usize;
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            if v.len() < 3 {
                break;
            }
            let card_state = CardState::from_wire(v.get_u8());
            let slot_state = SlotState::from_wire(v.get_u8());
            let iccid_len = v.get_u8() as usize;
            if v.len() < iccid_len {
                break;
            }
            let iccid_raw = v.split_to(iccid_len);
            slots.push(SlotEntry { card_state, slot_state, iccid_raw });
        }
        Ok(GetSlotStatusResponse { slots })
    }
}

pub struct GetCardStatusRequest;

impl Encodable for GetCardStatusRequest {
    const SERVICE: ServiceId = ServiceId::Uim;
    const MESSAGE_ID: u16 = MSG_GET_CARD_STATUS;
    type Response = GetCardStatusResponse;
    fn encode_tlvs(&self, _buf: &mut BytesMut) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    NotInitialized,
    Enabled,
    Disabled,
    Blocked,
    PermanentlyBlocked,
    Unknown(u8),
}

impl PinState {
    fn from_wire(v: u8) -> Self {
        match v {
            0x00 => PinState::NotInitialized,
            0x01 => PinState::Enabled,
            0x02 => PinState::Disabled,
            0x03 => PinState::Blocked,
            0x04 => PinState::PermanentlyBlocked,
            other => PinState::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Unknown,
    Detected,
    PinOrUPinRequired,
    PukOrUPukRequired,
    SubscriptionPersoRequired,
    Ready,
    Other(u8),
}

impl AppState {
    fn from_wire(v: u8) -> Self {
        match v {
            0x00 => AppState::Unknown,
            0x01 => AppState::Detected,
            0x02 => AppState::PinOrUPinRequired,
            0x03 => AppState::PukOrUPukRequired,
            0x04 => AppState::SubscriptionPersoRequired,
            0x05 => AppState::Ready,
            other => AppState::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Application {
    pub app_state: AppState,
    pub pin1_state: PinState,
    pub pin1_retries: u8,
    pub puk1_retries: u8,
    pub upin_state: PinState,
    pub upin_retries: u8,
    pub upuk_retries: u8,
}

#[derive(Debug, Clone)]
pub struct CardEntry {
    pub card_state: CardState,
    pub applications: Vec<Application>,
}

pub struct GetCardStatusResponse {
    pub cards: Vec<CardEntry>,
}

impl Decodable for GetCardStatusResponse {
    fn decode(tlvs: TlvReader) -> Result<Self, QmidError> {
        let mut v = match tlvs.find(TLV_CARDS) {
            Some(v) => v,
            None => return Ok(GetCardStatusResponse { cards: Vec::new() }),
        };
        // wire layout (compact, hand-rolled): index_gw_primary(2) +
        // card_count(1) then per card: card_state(1), upin_state(1),
        // upin_retries(1), upuk_retries(1), app_count(1), then per
        // application: app_state(1), pin1_state(1), pin1_retries(1),
        // puk1_retries(1).
        if v.len() < 3 {
            return Ok(GetCardStatusResponse { cards: Vec::new() });
        }
        let _index_gw_primary = v.get_u16_le();
        let card_count = v.get_u8() as usize;
        let mut cards = Vec::with_capacity(card_count);
        for _ in 0..card_count {
            if v.len() < 5 {
                break;
            }
            let card_state = CardState::from_wire(v.get_u8());
            let upin_state = PinState::from_wire(v.get_u8());
            let upin_retries = v.get_u8();
            let upuk_retries = v.get_u8();
            let app_count = v.get_u8() as usize;
            let mut applications = Vec::with_capacity(app_count);
            for _ in 0..app_count {
                if v.len() < 4 {
                    break;
                }
                let app_state = AppState::from_wire(v.get_u8());
                let pin1_state = PinState::from_wire(v.get_u8());
                let pin1_retries = v.get_u8();
                let puk1_retries = v.get_u8();
                applications.push(Application {
                    app_state,
                    pin1_state,
                    pin1_retries,
                    puk1_retries,
                    upin_state,
                    upin_retries,
                    upuk_retries,
                });
            }
            cards.push(CardEntry { card_state, applications });
        }
        Ok(GetCardStatusResponse { cards })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinId {
    Pin1,
    UPin,
}

impl PinId {
    fn wire(self) -> u8 {
        match self {
            PinId::Pin1 => 0x01,
            PinId::UPin => 0x03,
        }
    }
}

pub struct VerifyPinRequest {
    pub pin_id: PinId,
    pub pin: String,
}

impl Encodable for VerifyPinRequest {
    const SERVICE: ServiceId = ServiceId::Uim;
    const MESSAGE_ID: u16 = MSG_VERIFY_PIN;
    type Response = VerifyPinResponse;

    fn encode_tlvs(&self, buf: &mut BytesMut) {
        let mut v = BytesMut::new();
        v.put_u8(self.pin_id.wire());
        v.put_u8(self.pin.len() as u8);
        v.put_slice(self.pin.as_bytes());
        put_tlv(buf, TLV_PIN_VALUE, &v);
    }
}

pub struct VerifyPinResponse {
    pub pin_retries: Option<u8>,
    pub puk_retries: Option<u8>,
}

impl Decodable for VerifyPinResponse {
    fn decode(tlvs: TlvReader) -> Result<Self, QmidError> {
        let mut pin_retries = None;
        let mut puk_retries = None;
        if let Some(mut v) = tlvs.find(TLV_RETRIES) {
            if v.len() >= 2 {
                pin_retries = Some(v.get_u8());
                puk_retries = Some(v.get_u8());
            }
        }
        Ok(VerifyPinResponse { pin_retries, puk_retries })
    }
}

pub struct UnblockPinRequest {
    pub pin_id: PinId,
    pub puk: String,
    pub new_pin: String,
}

impl Encodable for UnblockPinRequest {
    const SERVICE: ServiceId = ServiceId::Uim;
    const MESSAGE_ID: u16 = MSG_UNBLOCK_PIN;
    type Response = UnblockPinResponse;

    fn encode_tlvs(&self, buf: &mut BytesMut) {
        let mut v = BytesMut::new();
        v.put_u8(self.pin_id.wire());
        v.put_u8(self.puk.len() as u8);
        v.put_slice(self.puk.as_bytes());
        v.put_u8(self.new_pin.len() as u8);
        v.put_slice(self.new_pin.as_bytes());
        put_tlv(buf, TLV_PUK_VALUE, &v);
    }
}

pub struct UnblockPinResponse {
    pub pin_retries: Option<u8>,
    pub puk_retries: Option<u8>,
}

impl Decodable for UnblockPinResponse {
    fn decode(tlvs: TlvReader) -> Result<Self, QmidError> {
        let resp = VerifyPinResponse::decode(tlvs)?;
        Ok(UnblockPinResponse { pin_retries: resp.pin_retries, puk_retries: resp.puk_retries })
    }
}

/// Reads the transparent EF.IMSI file at path 0x3F00/0x7FFF, file id
/// 0x6F07.
pub struct ReadTransparentRequest {
    pub path: Vec<u16>,
    pub file_id: u16,
}

impl ReadTransparentRequest {
    pub fn ef_imsi() -> Self {
        ReadTransparentRequest { path: vec![0x3F00, 0x7FFF], file_id: 0x6F07 }
    }
}

impl Encodable for ReadTransparentRequest {
    const SERVICE: ServiceId = ServiceId::Uim;
    const MESSAGE_ID: u16 = MSG_READ_TRANSPARENT;
    type Response = ReadTransparentResponse;

    fn encode_tlvs(&self, buf: &mut BytesMut) {
        let mut v = BytesMut::new();
        v.put_u16_le(self.file_id);
        v.put_u8(self.path.len() as u8);
        for step in &self.path {
            v.put_u16_le(*step);
        }
        put_tlv(buf, TLV_FILE_ID, &v);
    }
}

pub struct ReadTransparentResponse {
    pub content: Bytes,
}

impl Decodable for ReadTransparentResponse {
    fn decode(tlvs: TlvReader) -> Result<Self, QmidError> {
        let content = tlvs.find(TLV_CONTENT).unwrap_or_default();
        Ok(ReadTransparentResponse { content })
    }
}
