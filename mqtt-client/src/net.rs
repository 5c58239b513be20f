use bytes::{Bytes, BytesMut};
use mqtt_core::{FixedHeader, MqttPacket};
use tokio::io::AsyncReadExt;

use crate::{error::ClientError, transport::Socket};

/// Reads one complete MQTT control packet from `socket`. Returns `None` on a
/// clean EOF observed before any byte of a new packet arrived (the peer closed
/// the connection); any other truncation is a `ClientError`.
///
/// The fixed header's remaining-length field is variable (1-4 bytes); this
/// reads it a byte at a time rather than guessing a buffer size up front.
pub async fn read_packet(socket: &mut Socket) -> Result<Option<MqttPacket>, ClientError> {
    let mut type_byte = [0u8; 1];
    let n = socket.read(&mut type_byte).await?;
    if n == 0 {
        return Ok(None);
    }

    let mut length_bytes = Vec::with_capacity(4);
    loop {
        let mut b = [0u8; 1];
        socket.read_exact(&mut b).await?;
        length_bytes.push(b[0]);
        if b[0] & 0x80 == 0 || length_bytes.len() == 4 {
            break;
        }
    }

    let mut header_buf = BytesMut::with_capacity(1 + length_bytes.len());
    header_buf.extend_from_slice(&type_byte);
    header_buf.extend_from_slice(&length_bytes);
    let mut header_bytes = header_buf.freeze();
    let header = FixedHeader::decode(&mut header_bytes)?;

    let mut body = vec![0u8; header.rest_len()];
    if !body.is_empty() {
        socket.read_exact(&mut body).await?;
    }
    let mut body_bytes = Bytes::from(body);
    let packet = MqttPacket::decode(header, &mut body_bytes)?;
    Ok(Some(packet))
}
