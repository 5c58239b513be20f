use bytes::{Bytes, BytesMut};

use super::{write_fixed_header, PacketType};
use crate::err::{DecodeError, DecodeErrorKind, EncodeError};
use crate::qos::SubAckQoS;

/// Per-filter granted QoS (or failure, `0x80`), in the same order the SUBSCRIBE requested.
#[derive(Clone, Debug, PartialEq)]
pub struct SubAckPacket {
    msg_id: u16,
    granted: Vec<SubAckQoS>,
}

impl SubAckPacket {
    pub fn new(msg_id: u16, granted: Vec<SubAckQoS>) -> Self {
        Self { msg_id, granted }
    }

    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    pub fn granted(&self) -> &[SubAckQoS] {
        &self.granted
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut payload = BytesMut::with_capacity(2 + self.granted.len());
        payload.extend_from_slice(&self.msg_id.to_be_bytes());
        for qos in &self.granted {
            payload.extend_from_slice(&[u8::from(*qos)]);
        }

        let mut buf = BytesMut::with_capacity(payload.len() + 5);
        write_fixed_header(&mut buf, PacketType::SubAck, 0, payload.len())?;
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    pub fn decode(bytes: &mut Bytes) -> Result<Self, DecodeError> {
        use bytes::Buf;

        if bytes.len() < 2 {
            return Err(DecodeError::new(
                DecodeErrorKind::UnexpectedEof,
                "SUBACK requires a 2-byte message id".into(),
            ));
        }
        let msg_id = u16::from_be_bytes([bytes[0], bytes[1]]);
        bytes.advance(2);

        let mut granted = Vec::with_capacity(bytes.len());
        while !bytes.is_empty() {
            granted.push(SubAckQoS::try_from(bytes[0])?);
            bytes.advance(1);
        }

        Ok(Self { msg_id, granted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::QosLevel;

    #[test]
    fn round_trips_mixed_grants() {
        let packet = SubAckPacket::new(
            3,
            vec![SubAckQoS::Qos(QosLevel::AtLeastOnce), SubAckQoS::Failure],
        );
        let encoded = packet.encode().unwrap();
        let mut bytes = Bytes::from(encoded);
        super::super::FixedHeader::decode(&mut bytes).unwrap();
        assert_eq!(SubAckPacket::decode(&mut bytes).unwrap(), packet);
    }
}
