use bytes::{Bytes, BytesMut};

use super::{write_fixed_header, PacketType};
use crate::err::{DecodeError, DecodeErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::UnacceptableProtocolVersion),
            2 => Ok(Self::IdentifierRejected),
            3 => Ok(Self::ServerUnavailable),
            4 => Ok(Self::BadUsernameOrPassword),
            5 => Ok(Self::NotAuthorized),
            _ => Err(DecodeError::new(
                DecodeErrorKind::InvalidReturnCode,
                format!("return code {value} is invalid, only 0-5 are defined"),
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAckPacket {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        write_fixed_header(&mut buf, PacketType::ConnAck, 0, 2).expect("fixed 2-byte payload never overflows");
        buf.extend_from_slice(&[self.session_present as u8, self.return_code as u8]);
        buf.freeze()
    }

    pub fn decode(bytes: &mut Bytes) -> Result<Self, DecodeError> {
        if bytes.len() < 2 {
            return Err(DecodeError::new(
                DecodeErrorKind::UnexpectedEof,
                "CONNACK requires 2 bytes of variable header".into(),
            ));
        }
        if bytes[0] & 0b1111_1110 != 0 {
            return Err(DecodeError::new(
                DecodeErrorKind::ProtocolError,
                "reserved bits of CONNACK session-present byte must be zero".into(),
            ));
        }
        let session_present = bytes[0] & 0b1 != 0;
        let return_code = ConnectReturnCode::try_from(bytes[1])?;
        Ok(Self {
            session_present,
            return_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let packet = ConnAckPacket {
            session_present: true,
            return_code: ConnectReturnCode::Accepted,
        };
        let encoded = packet.encode();
        let mut bytes = Bytes::from(encoded);
        super::super::FixedHeader::decode(&mut bytes).unwrap();
        assert_eq!(ConnAckPacket::decode(&mut bytes).unwrap(), packet);
    }
}
