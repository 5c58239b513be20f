use bytes::{Bytes, BytesMut};

use super::{write_fixed_header, PacketType};
use crate::err::{DecodeError, DecodeErrorKind, EncodeError};
use crate::io::encode_utf8;
use crate::topic::TopicFilter;

/// Header flags are fixed at `0b0010` [MQTT-3.10.1-1], mirroring SUBSCRIBE.
#[derive(Clone, Debug, PartialEq)]
pub struct UnsubscribePacket {
    msg_id: u16,
    filters: Vec<TopicFilter>,
}

impl UnsubscribePacket {
    pub fn new(msg_id: u16, filters: Vec<TopicFilter>) -> Self {
        Self { msg_id, filters }
    }

    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    pub fn filters(&self) -> &[TopicFilter] {
        &self.filters
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        if self.filters.is_empty() {
            return Err(EncodeError::new(
                crate::err::EncodeErrorKind::MissingField,
                "UNSUBSCRIBE requires at least one topic filter [MQTT-3.10.3-2]".into(),
            ));
        }

        let mut payload = BytesMut::new();
        payload.extend_from_slice(&self.msg_id.to_be_bytes());
        for filter in &self.filters {
            encode_utf8(&mut payload, filter.as_str())?;
        }

        let mut buf = BytesMut::with_capacity(payload.len() + 5);
        write_fixed_header(&mut buf, PacketType::Unsubscribe, 0b0010, payload.len())?;
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    pub fn decode(bytes: &mut Bytes) -> Result<Self, DecodeError> {
        use bytes::Buf;

        if bytes.len() < 2 {
            return Err(DecodeError::new(
                DecodeErrorKind::UnexpectedEof,
                "UNSUBSCRIBE requires a 2-byte message id".into(),
            ));
        }
        let msg_id = u16::from_be_bytes([bytes[0], bytes[1]]);
        bytes.advance(2);

        let mut filters = Vec::new();
        while !bytes.is_empty() {
            filters.push(TopicFilter::decode(bytes)?);
        }

        if filters.is_empty() {
            return Err(DecodeError::new(
                DecodeErrorKind::ProtocolError,
                "UNSUBSCRIBE requires at least one topic filter [MQTT-3.10.3-2]".into(),
            ));
        }

        Ok(Self { msg_id, filters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let packet = UnsubscribePacket::new(
            8,
            vec![
                TopicFilter::from_str("a/b").unwrap(),
                TopicFilter::from_str("c/+").unwrap(),
            ],
        );
        let encoded = packet.encode().unwrap();
        let mut bytes = Bytes::from(encoded);
        super::super::FixedHeader::decode(&mut bytes).unwrap();
        assert_eq!(UnsubscribePacket::decode(&mut bytes).unwrap(), packet);
    }
}
