use bytes::{Bytes, BytesMut};

use super::{write_fixed_header, PacketType};

/// A PINGRESP has no variable header or payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingRespPacket;

impl PingRespPacket {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2);
        write_fixed_header(&mut buf, PacketType::PingResp, 0, 0).expect("zero-length payload never overflows");
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_two_bytes() {
        assert_eq!(PingRespPacket.encode().as_ref(), &[0b1101_0000, 0x00]);
    }
}
