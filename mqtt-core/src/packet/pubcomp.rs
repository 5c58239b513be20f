use bytes::{Bytes, BytesMut};

use super::{write_fixed_header, PacketType};
use crate::err::{DecodeError, DecodeErrorKind};

/// Final acknowledgement of a QoS 2 flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PubCompPacket {
    msg_id: u16,
}

impl PubCompPacket {
    pub fn new(msg_id: u16) -> Self {
        Self { msg_id }
    }

    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        write_fixed_header(&mut buf, PacketType::PubComp, 0, 2).expect("2-byte payload never overflows");
        buf.extend_from_slice(&self.msg_id.to_be_bytes());
        buf.freeze()
    }

    pub fn decode(bytes: &mut Bytes) -> Result<Self, DecodeError> {
        if bytes.len() < 2 {
            return Err(DecodeError::new(
                DecodeErrorKind::UnexpectedEof,
                "PUBCOMP requires a 2-byte message id".into(),
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
        let packet = PubCompPacket::new(13);
        let encoded = packet.encode();
        let mut bytes = Bytes::from(encoded);
        super::super::FixedHeader::decode(&mut bytes).unwrap();
        assert_eq!(PubCompPacket::decode(&mut bytes).unwrap().msg_id(), 13);
    }
}
