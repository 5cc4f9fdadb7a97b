//! Packet encoder and incremental decoder.
//!
//! Encoding is stateless. Decoding is stateful: sockets deliver arbitrary
//! fragments, so the [`Decoder`] keeps unread bytes and the last parsed header
//! between calls.

use crate::error::NetError;
use crate::packet::{Packet, PacketType, HEAD_LENGTH, MAX_PACKET_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encodes a packet from its raw type byte and payload.
///
/// Fails with [`NetError::InvalidPacketType`] when `kind` is not one of the
/// known packet types and with [`NetError::PacketSizeExceeded`] when the
/// payload does not fit in a single frame.
pub fn encode_raw(kind: u8, data: &[u8]) -> Result<Bytes, NetError> {
    if PacketType::try_from(kind).is_err() {
        return Err(NetError::InvalidPacketType(kind));
    }
    if data.len() > MAX_PACKET_SIZE {
        return Err(NetError::PacketSizeExceeded(data.len()));
    }

    let mut buf = BytesMut::with_capacity(HEAD_LENGTH + data.len());
    buf.put_u8(kind);
    buf.put_uint(data.len() as u64, 3);
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Encodes a packet of a known type.
pub fn encode(kind: PacketType, data: &[u8]) -> Result<Bytes, NetError> {
    encode_raw(kind.as_u8(), data)
}

/// Stateful packet decoder.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    kind: u8,
    // -1 until a header has been parsed
    size: isize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(2 * HEAD_LENGTH + MAX_PACKET_SIZE / 16),
            kind: 0,
            size: -1,
        }
    }

    /// Number of bytes buffered but not yet returned as packets.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn forward(&mut self) -> Result<(), NetError> {
        let kind = self.buf.get_u8();
        let size = self.buf.get_uint(3) as usize;

        PacketType::try_from(kind)?;
        if size > MAX_PACKET_SIZE {
            return Err(NetError::PacketSizeExceeded(size));
        }

        self.kind = kind;
        self.size = size as isize;
        Ok(())
    }

    /// Feeds a chunk of bytes and returns every packet completed by it.
    ///
    /// Partial packets stay buffered for the next call. An invalid header aborts
    /// the call with an error; the connection is expected to be closed.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Packet>, NetError> {
        self.buf.extend_from_slice(data);

        let mut packets = Vec::new();
        loop {
            if self.size < 0 {
                if self.buf.len() < HEAD_LENGTH {
                    break;
                }
                self.forward()?;
            }

            let size = self.size as usize;
            if self.buf.len() < size {
                break;
            }

            let payload = self.buf.split_to(size).freeze();
            // forward() already validated the type byte
            let kind = PacketType::try_from(self.kind)?;
            packets.push(Packet::new(kind, payload));
            self.size = -1;
        }

        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> (Vec<u8>, Vec<Packet>) {
        let expected = vec![
            Packet::new(PacketType::Handshake, Bytes::from_static(b"{\"sys\":{}}")),
            Packet::new(PacketType::HandshakeAck, Bytes::new()),
            Packet::new(PacketType::Data, Bytes::from(vec![7u8; 300])),
            Packet::new(PacketType::Heartbeat, Bytes::new()),
            Packet::new(PacketType::Kick, Bytes::from_static(b"bye")),
        ];
        let mut wire = Vec::new();
        for p in &expected {
            wire.extend_from_slice(&encode(p.kind, &p.data).expect("encode"));
        }
        (wire, expected)
    }

    #[test]
    fn test_encode_layout() {
        let frame = encode(PacketType::Data, b"hello").unwrap();
        assert_eq!(&frame[..], &[0x04, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);

        let empty = encode(PacketType::Heartbeat, &[]).unwrap();
        assert_eq!(&empty[..], &[0x03, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_decode_every_type() {
        for kind in 1u8..=5 {
            let payload = vec![kind; kind as usize * 10];
            let frame = encode_raw(kind, &payload).unwrap();
            let packets = Decoder::new().decode(&frame).unwrap();
            assert_eq!(packets.len(), 1);
            assert_eq!(packets[0].kind.as_u8(), kind);
            assert_eq!(packets[0].length, payload.len());
            assert_eq!(&packets[0].data[..], &payload[..]);
        }
    }

    #[test]
    fn test_encode_max_size() {
        let payload = vec![1u8; MAX_PACKET_SIZE];
        let frame = encode(PacketType::Data, &payload).unwrap();
        let packets = Decoder::new().decode(&frame).unwrap();
        assert_eq!(packets[0].length, MAX_PACKET_SIZE);

        let too_big = vec![1u8; MAX_PACKET_SIZE + 1];
        assert!(matches!(
            encode(PacketType::Data, &too_big),
            Err(NetError::PacketSizeExceeded(_))
        ));
    }

    #[test]
    fn test_encode_invalid_type() {
        assert!(matches!(encode_raw(0, b"x"), Err(NetError::InvalidPacketType(0))));
        assert!(matches!(encode_raw(6, b"x"), Err(NetError::InvalidPacketType(6))));
    }

    #[test]
    fn test_decode_split_at_every_boundary() {
        let (wire, expected) = stream();

        for chunk in 1..=wire.len() {
            let mut decoder = Decoder::new();
            let mut got = Vec::new();
            for piece in wire.chunks(chunk) {
                got.extend(decoder.decode(piece).unwrap());
            }
            assert_eq!(got, expected, "chunk size {}", chunk);
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn test_decode_keeps_partial_bytes() {
        let frame = encode(PacketType::Data, b"partial").unwrap();
        let mut decoder = Decoder::new();

        assert!(decoder.decode(&frame[..6]).unwrap().is_empty());
        let packets = decoder.decode(&frame[6..]).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].data[..], b"partial");
    }

    #[test]
    fn test_decode_wrong_type() {
        let mut decoder = Decoder::new();
        let err = decoder.decode(&[0x09, 0x00, 0x00, 0x01, 0x00]).unwrap_err();
        assert!(matches!(err, NetError::WrongPacketType(9)));
    }

    #[test]
    fn test_decode_size_exceeded() {
        let mut decoder = Decoder::new();
        let err = decoder.decode(&[0x04, 0x01, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, NetError::PacketSizeExceeded(65537)));
    }
}
