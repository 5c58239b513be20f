mod connack;
mod connect;
mod disconnect;
mod pingreq;
mod pingresp;
mod puback;
mod pubcomp;
mod publish;
mod pubrec;
mod pubrel;
mod suback;
mod subscribe;
mod unsuback;
mod unsubscribe;

pub use connack::{ConnAckPacket, ConnectReturnCode};
pub use connect::{ConnectPacket, MqttVersion, Will};
pub use disconnect::DisconnectPacket;
pub use pingreq::PingReqPacket;
pub use pingresp::PingRespPacket;
pub use puback::PubAckPacket;
pub use pubcomp::PubCompPacket;
pub use publish::PublishPacket;
pub use pubrec::PubRecPacket;
pub use pubrel::PubRelPacket;
pub use suback::SubAckPacket;
pub use subscribe::SubscribePacket;
pub use unsuback::UnsubAckPacket;
pub use unsubscribe::UnsubscribePacket;

use bytes::{Buf, Bytes};

use crate::err::{DecodeError, DecodeErrorKind, EncodeError};
use crate::io::decode_packet_length;

const PACKET_TYPE_BITS: u8 = 0b1111_0000;
const PACKET_FLAG_BITS: u8 = 0b0000_1111;

#[derive(PartialEq, Debug, Clone)]
pub enum MqttPacket {
    Connect(ConnectPacket),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(PubAckPacket),
    PubRec(PubRecPacket),
    PubRel(PubRelPacket),
    PubComp(PubCompPacket),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(UnsubAckPacket),
    PingReq(PingReqPacket),
    PingResp(PingRespPacket),
    Disconnect(DisconnectPacket),
}

impl MqttPacket {
    pub fn decode(f_header: FixedHeader, bytes: &mut Bytes) -> Result<Self, DecodeError> {
        match f_header.type_ {
            PacketType::Connect => Ok(Self::Connect(ConnectPacket::decode(bytes)?)),
            PacketType::ConnAck => Ok(Self::ConnAck(ConnAckPacket::decode(bytes)?)),
            PacketType::Publish => Ok(Self::Publish(PublishPacket::decode(f_header, bytes)?)),
            PacketType::PubAck => Ok(Self::PubAck(PubAckPacket::decode(bytes)?)),
            PacketType::PubRec => Ok(Self::PubRec(PubRecPacket::decode(bytes)?)),
            PacketType::PubRel => Ok(Self::PubRel(PubRelPacket::decode(bytes)?)),
            PacketType::PubComp => Ok(Self::PubComp(PubCompPacket::decode(bytes)?)),
            PacketType::Subscribe => Ok(Self::Subscribe(SubscribePacket::decode(bytes)?)),
            PacketType::SubAck => Ok(Self::SubAck(SubAckPacket::decode(bytes)?)),
            PacketType::Unsubscribe => Ok(Self::Unsubscribe(UnsubscribePacket::decode(bytes)?)),
            PacketType::UnsubAck => Ok(Self::UnsubAck(UnsubAckPacket::decode(bytes)?)),
            PacketType::PingReq => Ok(Self::PingReq(PingReqPacket)),
            PacketType::PingResp => Ok(Self::PingResp(PingRespPacket)),
            PacketType::Disconnect => Ok(Self::Disconnect(DisconnectPacket)),
        }
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        match self {
            Self::Connect(p) => p.encode(),
            Self::ConnAck(p) => Ok(p.encode()),
            Self::Publish(p) => p.encode(),
            Self::PubAck(p) => Ok(p.encode()),
            Self::PubRec(p) => Ok(p.encode()),
            Self::PubRel(p) => Ok(p.encode()),
            Self::PubComp(p) => Ok(p.encode()),
            Self::Subscribe(p) => p.encode(),
            Self::SubAck(p) => p.encode(),
            Self::Unsubscribe(p) => p.encode(),
            Self::UnsubAck(p) => Ok(p.encode()),
            Self::PingReq(p) => Ok(p.encode()),
            Self::PingResp(p) => Ok(p.encode()),
            Self::Disconnect(p) => Ok(p.encode()),
        }
    }

    /// The MQTT message id this packet carries, if its type carries one.
    pub fn msg_id(&self) -> Option<u16> {
        match self {
            Self::Publish(p) => p.msg_id(),
            Self::PubAck(p) => Some(p.msg_id()),
            Self::PubRec(p) => Some(p.msg_id()),
            Self::PubRel(p) => Some(p.msg_id()),
            Self::PubComp(p) => Some(p.msg_id()),
            Self::Subscribe(p) => Some(p.msg_id()),
            Self::SubAck(p) => Some(p.msg_id()),
            Self::Unsubscribe(p) => Some(p.msg_id()),
            Self::UnsubAck(p) => Some(p.msg_id()),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketType {
    Connect,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

impl PacketType {
    fn as_byte(self) -> u8 {
        match self {
            Self::Connect => 1,
            Self::ConnAck => 2,
            Self::Publish => 3,
            Self::PubAck => 4,
            Self::PubRec => 5,
            Self::PubRel => 6,
            Self::PubComp => 7,
            Self::Subscribe => 8,
            Self::SubAck => 9,
            Self::Unsubscribe => 10,
            Self::UnsubAck => 11,
            Self::PingReq => 12,
            Self::PingResp => 13,
            Self::Disconnect => 14,
        }
    }

    /// The fixed flag bits mandated for packet types whose flags aren't PUBLISH-variable.
    fn fixed_flags(self) -> Option<u8> {
        match self {
            Self::Connect
            | Self::ConnAck
            | Self::PubAck
            | Self::PubRec
            | Self::PubComp
            | Self::SubAck
            | Self::UnsubAck
            | Self::PingReq
            | Self::PingResp
            | Self::Disconnect => Some(0b0000),
            Self::PubRel | Self::Subscribe | Self::Unsubscribe => Some(0b0010),
            Self::Publish => None,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    fn try_from(byte: u8) -> Result<Self, DecodeError> {
        match (byte & PACKET_TYPE_BITS) >> 4 {
            1 => Ok(Self::Connect),
            2 => Ok(Self::ConnAck),
            3 => Ok(Self::Publish),
            4 => Ok(Self::PubAck),
            5 => Ok(Self::PubRec),
            6 => Ok(Self::PubRel),
            7 => Ok(Self::PubComp),
            8 => Ok(Self::Subscribe),
            9 => Ok(Self::SubAck),
            10 => Ok(Self::Unsubscribe),
            11 => Ok(Self::UnsubAck),
            12 => Ok(Self::PingReq),
            13 => Ok(Self::PingResp),
            14 => Ok(Self::Disconnect),
            other => Err(DecodeError::new(
                DecodeErrorKind::PacketType,
                format!("unrecognised packet type nibble: {other}"),
            )),
        }
    }
}

/// PUBLISH header flags: DUP (bit 3), QoS (bits 2-1), RETAIN (bit 0).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct PublishFlags {
    pub dup: bool,
    pub qos_bits: u8,
    pub retain: bool,
}

impl PublishFlags {
    pub(crate) fn as_byte(self) -> u8 {
        (self.dup as u8) << 3 | (self.qos_bits & 0b11) << 1 | self.retain as u8
    }

    fn from_byte(byte: u8) -> Self {
        Self {
            dup: byte & 0b1000 != 0,
            qos_bits: (byte & 0b0110) >> 1,
            retain: byte & 0b0001 != 0,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct FixedHeader {
    pub type_: PacketType,
    pub flags: u8,
    header_len: usize,
    rest_len: usize,
}

impl FixedHeader {
    pub fn decode(bytes: &mut Bytes) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::new(
                DecodeErrorKind::ImproperDisconnect,
                "received packet of length zero".into(),
            ));
        }

        let byte = bytes[0];
        let type_ = PacketType::try_from(byte)?;
        let flags = byte & PACKET_FLAG_BITS;

        if let Some(expected) = type_.fixed_flags() {
            if flags != expected {
                return Err(DecodeError::new(
                    DecodeErrorKind::FlagBits,
                    format!("packet type {type_:?} requires header flags {expected:#06b}, found {flags:#06b}"),
                ));
            }
        }

        bytes.advance(1);
        let (header_len, rest_len) = decode_packet_length(bytes)?;

        Ok(Self {
            type_,
            flags,
            header_len: header_len + 1,
            rest_len,
        })
    }

    pub fn publish_flags(&self) -> PublishFlags {
        PublishFlags::from_byte(self.flags)
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn rest_len(&self) -> usize {
        self.rest_len
    }

}

pub(crate) fn write_fixed_header(
    buf: &mut bytes::BytesMut,
    type_: PacketType,
    flags: u8,
    remaining_len: usize,
) -> Result<(), EncodeError> {
    use bytes::BufMut;
    buf.put_u8((type_.as_byte() << 4) | flags);
    crate::io::encode_packet_length(buf, remaining_len)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fixed_header_type_and_flags() {
        let mut bytes = Bytes::from_static(&[0b0011_0010, 0x00]);
        let header = FixedHeader::decode(&mut bytes).unwrap();
        assert_eq!(header.type_, PacketType::Publish);
        assert_eq!(header.rest_len(), 0);
    }

    #[test]
    fn rejects_bad_fixed_flags() {
        let mut bytes = Bytes::from_static(&[0b0010_0001, 0x00]);
        assert!(FixedHeader::decode(&mut bytes).is_err());
    }
}
