use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::err::{DecodeError, DecodeErrorKind, EncodeError, EncodeErrorKind};

/// MQTT v3.1.1: the Remaining Length field on the fixed header is at most 4 bytes,
/// giving a maximum encodable value of 128^4 - 1.
pub const MAX_ENCODED_PACKET_LEN: usize = 128usize.pow(4) - 1;

pub fn encode_packet_length(bytes: &mut BytesMut, mut len: usize) -> Result<usize, EncodeError> {
    if len > MAX_ENCODED_PACKET_LEN {
        return Err(EncodeError::new(
            EncodeErrorKind::OversizedPayload,
            format!(
                "packet payload exceeded max length of 128^4 - 1, found length {len}"
            ),
        ));
    }

    let mut num_bytes = 0;
    loop {
        let mut d = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            d |= 0x80;
        }
        bytes.put_u8(d);
        num_bytes += 1;
        if len == 0 {
            break;
        }
    }

    Ok(num_bytes)
}

/// Decodes the variable-length "remaining length" field from the front of `bytes`,
/// advancing past it. Returns `(header_len, rest_len)`.
pub fn decode_packet_length(bytes: &mut Bytes) -> Result<(usize, usize), DecodeError> {
    let mut multiplier: usize = 1;
    let mut value: usize = 0;
    let mut consumed = 0;

    loop {
        if bytes.is_empty() {
            return Err(DecodeError::new(
                DecodeErrorKind::MalformedLength,
                "remaining-length field ran past the end of the buffer".into(),
            ));
        }
        let byte = bytes.get_u8();
        consumed += 1;
        value += (byte as usize & 0x7F) * multiplier;
        multiplier *= 128;

        if byte & 0x80 == 0 {
            break;
        }
        if consumed > 4 {
            return Err(DecodeError::new(
                DecodeErrorKind::MalformedLength,
                "remaining-length field exceeded 4 bytes".into(),
            ));
        }
    }

    Ok((consumed, value))
}

pub fn encode_utf8(bytes: &mut BytesMut, val: &str) -> Result<(), EncodeError> {
    encode_bytes(bytes, val.as_bytes())
}

pub fn encode_bytes(bytes: &mut BytesMut, val: &[u8]) -> Result<(), EncodeError> {
    if val.len() > u16::MAX as usize {
        return Err(EncodeError::new(
            EncodeErrorKind::OversizedPayload,
            format!("length-prefixed field exceeded u16::MAX bytes, found {}", val.len()),
        ));
    }

    bytes.put_u16(val.len() as u16);
    bytes.put_slice(val);
    Ok(())
}

pub fn decode_utf8(bytes: &mut Bytes) -> Result<String, DecodeError> {
    let slice = decode_bytes(bytes)?;
    String::from_utf8(slice.to_vec())
        .map_err(|e| DecodeError::new(DecodeErrorKind::Utf8ParseError, e.to_string()))
}

pub fn decode_bytes(bytes: &mut Bytes) -> Result<Bytes, DecodeError> {
    let len = decode_u16_len(bytes)?;
    let slice = bytes.slice(0..len as usize);
    bytes.advance(len as usize);
    Ok(slice)
}

pub fn decode_u16_len(bytes: &mut Bytes) -> Result<u16, DecodeError> {
    if bytes.len() < 2 {
        return Err(DecodeError::new(
            DecodeErrorKind::MalformedLength,
            "not enough bytes remaining to decode a length prefix".into(),
        ));
    }
    let len = bytes.get_u16();
    if len as usize > bytes.len() {
        return Err(DecodeError::new(
            DecodeErrorKind::MalformedLength,
            format!(
                "length-prefixed field claims {len} bytes but only {} remain",
                bytes.len()
            ),
        ));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::*;

    #[test]
    fn round_trips_remaining_length() {
        for len in [0usize, 127, 128, 16383, 16384, 2097151, MAX_ENCODED_PACKET_LEN] {
            let mut buf = BytesMut::new();
            encode_packet_length(&mut buf, len).unwrap();
            let mut bytes = Bytes::from(buf);
            let (_, rest_len) = decode_packet_length(&mut bytes).unwrap();
            assert_eq!(rest_len, len);
        }
    }

    #[test]
    fn rejects_oversized_length() {
        let mut buf = BytesMut::new();
        assert!(encode_packet_length(&mut buf, MAX_ENCODED_PACKET_LEN + 1).is_err());
    }

    #[test]
    fn does_not_read_past_declared_length() {
        let buf: &[u8] = &[0x7F, 0x80, 0x80];
        let mut bytes = Bytes::from(buf);
        let (header_len, rest_len) = decode_packet_length(&mut bytes).unwrap();
        assert_eq!(header_len, 1);
        assert_eq!(rest_len, 127);
    }

    #[test]
    fn utf8_round_trip() {
        let mut buf = BytesMut::new();
        encode_utf8(&mut buf, "a/b/topic").unwrap();
        let mut bytes = Bytes::from(buf);
        assert_eq!(decode_utf8(&mut bytes).unwrap(), "a/b/topic");
    }
}
