use bytes::{Bytes, BytesMut};

use super::{write_fixed_header, FixedHeader, PacketType, PublishFlags};
use crate::err::{DecodeError, DecodeErrorKind, EncodeError};
use crate::io::encode_utf8;
use crate::qos::QosLevel;
use crate::topic::TopicName;

/// A PUBLISH carries an application message. `msg_id` is present for QoS 1/2 and
/// absent for QoS 0 [MQTT-3.3.2.2]; `dup` is set on retransmission of an
/// unacknowledged QoS 1/2 message.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishPacket {
    topic: TopicName,
    msg_id: Option<u16>,
    payload: Bytes,
    qos: QosLevel,
    dup: bool,
    retain: bool,
}

impl PublishPacket {
    pub fn new(topic: TopicName, payload: Bytes, qos: QosLevel, retain: bool, msg_id: Option<u16>) -> Self {
        Self {
            topic,
            msg_id,
            payload,
            qos,
            dup: false,
            retain,
        }
    }

    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn qos(&self) -> QosLevel {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn dup(&self) -> bool {
        self.dup
    }

    pub fn msg_id(&self) -> Option<u16> {
        self.msg_id
    }

    pub fn set_dup(&mut self, dup: bool) {
        self.dup = dup;
    }

    /// Stamps the message id after out-of-band allocation. Only meaningful before
    /// the first transmission of a QoS 1/2 publish.
    pub fn set_msg_id(&mut self, msg_id: u16) {
        self.msg_id = Some(msg_id);
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        if self.qos != QosLevel::AtMostOnce && self.msg_id.is_none() {
            return Err(EncodeError::new(
                crate::err::EncodeErrorKind::MissingField,
                "QoS 1/2 PUBLISH requires a message id [MQTT-3.3.2.2]".into(),
            ));
        }

        let mut variable_header = BytesMut::new();
        encode_utf8(&mut variable_header, self.topic.as_str())?;
        if let Some(id) = self.msg_id {
            variable_header.extend_from_slice(&id.to_be_bytes());
        }

        let remaining_len = variable_header.len() + self.payload.len();
        let mut buf = BytesMut::with_capacity(remaining_len + 5);
        let flags = PublishFlags {
            dup: self.dup,
            qos_bits: self.qos as u8,
            retain: self.retain,
        };
        write_fixed_header(&mut buf, PacketType::Publish, flags.as_byte(), remaining_len)?;
        buf.extend_from_slice(&variable_header);
        buf.extend_from_slice(&self.payload);

        Ok(buf.freeze())
    }

    pub fn decode(header: FixedHeader, bytes: &mut Bytes) -> Result<Self, DecodeError> {
        use bytes::Buf;

        let flags = header.publish_flags();
        let qos = QosLevel::try_from(flags.qos_bits)?;
        if qos == QosLevel::AtMostOnce && flags.dup {
            return Err(DecodeError::new(
                DecodeErrorKind::FlagBits,
                "DUP must be 0 for QoS 0 PUBLISH [MQTT-3.3.1-2]".into(),
            ));
        }

        let start_len = bytes.len();
        let topic = TopicName::decode(bytes)?;

        let msg_id = if qos != QosLevel::AtMostOnce {
            if bytes.len() < 2 {
                return Err(DecodeError::new(
                    DecodeErrorKind::UnexpectedEof,
                    "PUBLISH with QoS > 0 requires a 2-byte message id".into(),
                ));
            }
            let id = u16::from_be_bytes([bytes[0], bytes[1]]);
            bytes.advance(2);
            Some(id)
        } else {
            None
        };

        let consumed = start_len - bytes.len();
        let payload_len = header.rest_len().saturating_sub(consumed);
        if payload_len > bytes.len() {
            return Err(DecodeError::new(
                DecodeErrorKind::MalformedLength,
                "PUBLISH payload length exceeds remaining bytes".into(),
            ));
        }
        let payload = bytes.slice(0..payload_len);
        bytes.advance(payload_len);

        Ok(Self {
            topic,
            msg_id,
            payload,
            qos,
            dup: flags.dup,
            retain: flags.retain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_qos0() {
        let packet = PublishPacket::new(
            TopicName::from_str("a/b").unwrap(),
            Bytes::from_static(b"x"),
            QosLevel::AtMostOnce,
            false,
            None,
        );
        let encoded = packet.encode().unwrap();
        let mut bytes = Bytes::from(encoded);
        let header = FixedHeader::decode(&mut bytes).unwrap();
        let decoded = PublishPacket::decode(header, &mut bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn round_trips_qos2_with_dup() {
        let mut packet = PublishPacket::new(
            TopicName::from_str("t").unwrap(),
            Bytes::from_static(b"hello"),
            QosLevel::ExactlyOnce,
            false,
            Some(42),
        );
        packet.set_dup(true);

        let encoded = packet.encode().unwrap();
        let mut bytes = Bytes::from(encoded);
        let header = FixedHeader::decode(&mut bytes).unwrap();
        let decoded = PublishPacket::decode(header, &mut bytes).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.msg_id(), Some(42));
    }

    #[test]
    fn rejects_qos1_without_msg_id() {
        let packet = PublishPacket::new(
            TopicName::from_str("t").unwrap(),
            Bytes::from_static(b"x"),
            QosLevel::AtLeastOnce,
            false,
            None,
        );
        assert!(packet.encode().is_err());
    }
}
