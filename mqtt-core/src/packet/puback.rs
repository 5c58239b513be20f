use bytes::{Bytes, BytesMut};

use super::{write_fixed_header, PacketType};
use crate::err::{DecodeError, DecodeErrorKind};

/// Acknowledges a QoS 1 PUBLISH. Carries only the message id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PubAckPacket {
    msg_id: u16,
}

impl PubAckPacket {
    pub fn new(msg_id: u16) -> Self {
        Self { msg_id }
    }

    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        write_fixed_header(&mut buf, PacketType::PubAck, 0, 2).expect("2-byte payload never overflows");
        buf.extend_from_slice(&self.msg_id.to_be_bytes());
        buf.freeze()
    }

    pub fn decode(bytes: &mut Bytes) -> Result<Self, DecodeError> {
        if bytes.len() < 2 {
            return Err(DecodeError::new(
                DecodeErrorKind::UnexpectedEof,
                "PUBACK requires a 2-byte message id".into(),
            ));
        }
        Ok(Self {
            msg_id: u16::from_be_bytes([bytes[0], bytes[1]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let packet = PubAckPacket::new(7);
        let encoded = packet.encode();
        let mut bytes = Bytes::from(encoded);
        super::super::FixedHeader::decode(&mut bytes).unwrap();
        assert_eq!(PubAckPacket::decode(&mut bytes).unwrap().msg_id(), 7);
    }
}
