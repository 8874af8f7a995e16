//! WDA (Wireless Data Administration) messages: link-layer data format,
//! used during kernel link-layer configuration to pin the modem to
//! raw-IP framing.

use bytes::BufMut;
use bytes::BytesMut;

use super::{put_tlv, Decodable, Encodable, ServiceId, TlvReader};
use crate::error::QmidError;

pub const MSG_SET_DATA_FORMAT: u16 = 0x0020;

const TLV_LINK_LAYER_PROTOCOL: u8 = 0x11;
const TLV_UL_DATA_AGGREGATION: u8 = 0x15;
const TLV_DL_DATA_AGGREGATION: u8 = 0x16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayerProtocol {
    RawIp,
    Ethernet,
}

impl LinkLayerProtocol {
    fn wire(self) -> u32 {
        match self {
            LinkLayerProtocol::RawIp => 0x02,
            LinkLayerProtocol::Ethernet => 0x01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAggregation {
    Disabled,
}

impl DataAggregation {
    fn wire(self) -> u32 {
        match self {
            DataAggregation::Disabled => 0x00,
        }
    }
}

pub struct SetDataFormatRequest {
    pub link_layer: LinkLayerProtocol,
    pub aggregation: DataAggregation,
}

impl Encodable for SetDataFormatRequest {
    const SERVICE: ServiceId = ServiceId::Wda;
    const MESSAGE_ID: u16 = MSG_SET_DATA_FORMAT;
    type Response = SetDataFormatResponse;

    fn encode_tlvs(&self, buf: &mut BytesMut) {
        let mut llp = BytesMut::new();
        llp.put_u32_le(self.link_layer.wire());
        put_tlv(buf, TLV_LINK_LAYER_PROTOCOL, &llp);

        let mut ul = BytesMut::new();
        ul.put_u32_le(self.aggregation.wire());
        put_tlv(buf, TLV_UL_DATA_AGGREGATION, &ul);

        let mut dl = BytesMut::new();
        dl.put_u32_le(self.aggregation.wire());
        put_tlv(buf, TLV_DL_DATA_AGGREGATION, &dl);
    }
}

pub struct SetDataFormatResponse;

impl Decodable for SetDataFormatResponse {
    fn decode(_tlvs: TlvReader) -> Result<Self, QmidError> {
        Ok(SetDataFormatResponse)
    }
}
