use bytes::{Buf, Bytes, BytesMut};

use super::{write_fixed_header, PacketType};
use crate::err::{DecodeError, DecodeErrorKind, EncodeError};
use crate::io::{decode_bytes, decode_u16_len, decode_utf8, encode_bytes, encode_utf8};
use crate::qos::QosLevel;

/// The MQTT protocol revision a CONNECT packet negotiates. `Default` lets the caller try
/// 3.1.1 first and fall back to 3.1 on the next connect attempt (see the engine's
/// multi-URI/version fallback).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MqttVersion {
    V3_1,
    V3_1_1,
}

impl MqttVersion {
    fn protocol_name(self) -> &'static str {
        match self {
            Self::V3_1 => "MQIsdp",
            Self::V3_1_1 => "MQTT",
        }
    }

    fn protocol_level(self) -> u8 {
        match self {
            Self::V3_1 => 3,
            Self::V3_1_1 => 4,
        }
    }

    fn from_wire(name: &str, level: u8) -> Result<Self, DecodeError> {
        match (name, level) {
            ("MQIsdp", 3) => Ok(Self::V3_1),
            ("MQTT", 4) => Ok(Self::V3_1_1),
            _ => Err(DecodeError::new(
                DecodeErrorKind::InvalidProtocol,
                format!("unsupported protocol name/level: {name}/{level}"),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QosLevel,
    pub retain: bool,
}

/// The first packet sent on a fresh network connection [MQTT-3.1.0-1]. Carries the
/// negotiated protocol version, clean-session flag, keepalive interval, and the
/// optional will/credentials payload.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectPacket {
    pub version: MqttVersion,
    pub clean_session: bool,
    pub keep_alive_secs: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl ConnectPacket {
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut payload = BytesMut::new();
        encode_utf8(&mut payload, &self.client_id)?;

        if let Some(will) = &self.will {
            encode_utf8(&mut payload, &will.topic)?;
            encode_bytes(&mut payload, &will.payload)?;
        }
        if let Some(username) = &self.username {
            encode_utf8(&mut payload, username)?;
        }
        if let Some(password) = &self.password {
            encode_bytes(&mut payload, password)?;
        }

        let mut variable_header = BytesMut::new();
        encode_utf8(&mut variable_header, self.version.protocol_name())?;
        variable_header.extend_from_slice(&[self.version.protocol_level(), self.connect_flags()]);
        variable_header.extend_from_slice(&self.keep_alive_secs.to_be_bytes());

        let remaining_len = variable_header.len() + payload.len();
        let mut buf = BytesMut::with_capacity(remaining_len + 5);
        write_fixed_header(&mut buf, PacketType::Connect, 0, remaining_len)?;
        buf.extend_from_slice(&variable_header);
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    fn connect_flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.username.is_some() {
            flags |= 0b1000_0000;
        }
        if self.password.is_some() {
            flags |= 0b0100_0000;
        }
        if let Some(will) = &self.will {
            if will.retain {
                flags |= 0b0010_0000;
            }
            flags |= (will.qos as u8) << 3;
            flags |= 0b0000_0100;
        }
        if self.clean_session {
            flags |= 0b0000_0010;
        }
        flags
    }

    pub fn decode(bytes: &mut Bytes) -> Result<Self, DecodeError> {
        let protocol_name = decode_utf8(bytes)?;
        if bytes.len() < 4 {
            return Err(DecodeError::new(
                DecodeErrorKind::UnexpectedEof,
                "CONNECT variable header truncated before protocol level/flags/keepalive".into(),
            ));
        }
        let protocol_level = bytes[0];
        let flags = bytes[1];
        let keep_alive_secs = u16::from_be_bytes([bytes[2], bytes[3]]);
        bytes.advance(4);

        let version = MqttVersion::from_wire(&protocol_name, protocol_level)?;

        if flags & 0b0000_0001 != 0 {
            return Err(DecodeError::new(
                DecodeErrorKind::ProtocolError,
                "reserved CONNECT flag bit must be zero [MQTT-3.1.2-3]".into(),
            ));
        }

        let clean_session = flags & 0b0000_0010 != 0;
        let will_flag = flags & 0b0000_0100 != 0;
        let will_qos = (flags & 0b0001_1000) >> 3;
        let will_retain = flags & 0b0010_0000 != 0;
        let has_password = flags & 0b0100_0000 != 0;
        let has_username = flags & 0b1000_0000 != 0;

        let client_id = decode_utf8(bytes)?;

        let will = if will_flag {
            let topic = decode_utf8(bytes)?;
            let payload = decode_bytes(bytes)?;
            Some(Will {
                topic,
                payload,
                qos: QosLevel::try_from(will_qos)
                    .map_err(|_| DecodeError::new(DecodeErrorKind::WillQoS, "invalid will QoS".into()))?,
                retain: will_retain,
            })
        } else {
            if will_qos != 0 || will_retain {
                return Err(DecodeError::new(
                    DecodeErrorKind::Will,
                    "will QoS/retain must be zero when the will flag is unset [MQTT-3.1.2-11]".into(),
                ));
            }
            None
        };

        let username = if has_username {
            Some(decode_utf8(bytes)?)
        } else {
            None
        };
        let password = if has_password {
            Some(decode_bytes(bytes)?)
        } else {
            None
        };

        Ok(Self {
            version,
            clean_session,
            keep_alive_secs,
            client_id,
            will,
            username,
            password,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_minimal_connect() {
        let packet = ConnectPacket {
            version: MqttVersion::V3_1_1,
            clean_session: true,
            keep_alive_secs: 60,
            client_id: "client-1".into(),
            will: None,
            username: None,
            password: None,
        };

        let encoded = packet.encode().unwrap();
        let mut bytes = Bytes::from(encoded);
        let header = super::super::FixedHeader::decode(&mut bytes).unwrap();
        assert_eq!(header.type_, PacketType::Connect);
        let decoded = ConnectPacket::decode(&mut bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn round_trips_will_and_credentials() {
        let packet = ConnectPacket {
            version: MqttVersion::V3_1_1,
            clean_session: false,
            keep_alive_secs: 30,
            client_id: "client-2".into(),
            will: Some(Will {
                topic: "status/client-2".into(),
                payload: Bytes::from_static(b"offline"),
                qos: QosLevel::AtLeastOnce,
                retain: true,
            }),
            username: Some("user".into()),
            password: Some(Bytes::from_static(b"pass")),
        };

        let encoded = packet.encode().unwrap();
        let mut bytes = Bytes::from(encoded);
        super::super::FixedHeader::decode(&mut bytes).unwrap();
        let decoded = ConnectPacket::decode(&mut bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn rejects_reserved_flag_bit() {
        // protocol name "MQTT", level 4, flags with reserved bit set, keepalive 0
        let mut buf = BytesMut::new();
        encode_utf8(&mut buf, "MQTT").unwrap();
        buf.extend_from_slice(&[4, 0b0000_0001, 0, 0]);
        encode_utf8(&mut buf, "id").unwrap();
        let mut bytes = Bytes::from(buf);
        assert!(ConnectPacket::decode(&mut bytes).is_err());
    }
}
