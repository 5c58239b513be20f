use bytes::{Bytes, BytesMut};

use super::{write_fixed_header, PacketType};
use crate::err::{DecodeError, DecodeErrorKind, EncodeError};
use crate::io::encode_utf8;
use crate::qos::QosLevel;
use crate::topic::TopicFilter;

/// A SUBSCRIBE packet's header flags are fixed at `0b0010` [MQTT-3.8.1-1].
#[derive(Clone, Debug, PartialEq)]
pub struct SubscribePacket {
    msg_id: u16,
    filters: Vec<(TopicFilter, QosLevel)>,
}

impl SubscribePacket {
    pub fn new(msg_id: u16, filters: Vec<(TopicFilter, QosLevel)>) -> Self {
        Self { msg_id, filters }
    }

    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    pub fn filters(&self) -> &[(TopicFilter, QosLevel)] {
        &self.filters
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        if self.filters.is_empty() {
            return Err(EncodeError::new(
                crate::err::EncodeErrorKind::MissingField,
                "SUBSCRIBE requires at least one topic filter [MQTT-3.8.3-3]".into(),
            ));
        }

        let mut payload = BytesMut::new();
        payload.extend_from_slice(&self.msg_id.to_be_bytes());
        for (filter, qos) in &self.filters {
            encode_utf8(&mut payload, filter.as_str())?;
            payload.extend_from_slice(&[*qos as u8]);
        }

        let mut buf = BytesMut::with_capacity(payload.len() + 5);
        write_fixed_header(&mut buf, PacketType::Subscribe, 0b0010, payload.len())?;
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    pub fn decode(bytes: &mut Bytes) -> Result<Self, DecodeError> {
        use bytes::Buf;

        if bytes.len() < 2 {
            return Err(DecodeError::new(
                DecodeErrorKind::UnexpectedEof,
                "SUBSCRIBE requires a 2-byte message id".into(),
            ));
        }
        let msg_id = u16::from_be_bytes([bytes[0], bytes[1]]);
        bytes.advance(2);

        let mut filters = Vec::new();
        while !bytes.is_empty() {
            let filter = TopicFilter::decode(bytes)?;
            if bytes.is_empty() {
                return Err(DecodeError::new(
                    DecodeErrorKind::UnexpectedEof,
                    "SUBSCRIBE filter missing its requested QoS byte".into(),
                ));
            }
            let qos = QosLevel::try_from(bytes[0])?;
            bytes.advance(1);
            filters.push((filter, qos));
        }

        if filters.is_empty() {
            return Err(DecodeError::new(
                DecodeErrorKind::ProtocolError,
                "SUBSCRIBE requires at least one topic filter [MQTT-3.8.3-3]".into(),
            ));
        }

        Ok(Self { msg_id, filters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_multiple_filters() {
        let packet = SubscribePacket::new(
            5,
            vec![
                (TopicFilter::from_str("a/b").unwrap(), QosLevel::AtLeastOnce),
                (TopicFilter::from_str("c/#").unwrap(), QosLevel::ExactlyOnce),
            ],
        );
        let encoded = packet.encode().unwrap();
        let mut bytes = Bytes::from(encoded);
        super::super::FixedHeader::decode(&mut bytes).unwrap();
        let decoded = SubscribePacket::decode(&mut bytes).unwrap();
        assert_eq!(decoded, packet);
    }
}
