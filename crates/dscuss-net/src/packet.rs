//! Packet codec: fixed-layout framed messages over a byte stream, each
//! carrying a signature trailer.
//!
//! Wire format:
//! ```text
//! offset 0   : u16  type         (big-endian)
//! offset 2   : u16  total_size    (big-endian; header + payload + trailer)
//! offset 4   : payload bytes      (total_size - 4 - 2 - 64)
//! offset N-66: u16  signature_length
//! offset N-64: 64 bytes signature (DER, zero-padded)
//! ```

use bytes::{Buf, BufMut, BytesMut};
use dscuss_core::crypto::{Keypair, PublicKey, Signature, SIGNATURE_BUF_LEN};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub const HEADER_SIZE: usize = 4;
pub const TRAILER_SIZE: usize = 2 + SIGNATURE_BUF_LEN;
pub const MAX_TOTAL_SIZE: usize = 65535;
pub const MIN_TOTAL_SIZE: usize = HEADER_SIZE + TRAILER_SIZE + 1;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet too large: {0} bytes (max {MAX_TOTAL_SIZE})")]
    TooLarge(usize),

    #[error("packet too small: {0} bytes (min {MIN_TOTAL_SIZE})")]
    TooSmall(usize),

    #[error("unknown packet type: {0}")]
    UnknownType(u16),

    #[error("malformed signature")]
    MalformedSignature,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The closed set of packet types; an unknown discriminant on the wire is a
/// protocol violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketType {
    User = 1,
    Msg = 2,
    Oper = 3,
    Hello = 4,
    Announce = 5,
    Ack = 6,
    Req = 7,
}

impl TryFrom<u16> for PacketType {
    type Error = PacketError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::User),
            2 => Ok(Self::Msg),
            3 => Ok(Self::Oper),
            4 => Ok(Self::Hello),
            5 => Ok(Self::Announce),
            6 => Ok(Self::Ack),
            7 => Ok(Self::Req),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

/// A decoded packet: type, payload and signature trailer.
#[derive(Clone, Debug)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
    pub signature: Signature,
}

impl Packet {
    /// `USER` packets travel unsigned at the packet level — their payload
    /// carries a self-signature instead.
    pub fn new_user(payload: Vec<u8>) -> Self {
        Self {
            packet_type: PacketType::User,
            payload,
            signature: Signature::from_parts(&[]).expect("empty signature always fits"),
        }
    }

    /// Build and sign a packet of any non-`USER` type over `header ||
    /// payload`.
    pub fn signed(packet_type: PacketType, payload: Vec<u8>, keypair: &Keypair) -> Result<Self, PacketError> {
        let total_size = HEADER_SIZE + payload.len() + TRAILER_SIZE;
        if total_size > MAX_TOTAL_SIZE {
            return Err(PacketError::TooLarge(total_size));
        }
        let mut signed_bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        signed_bytes.put_u16(packet_type as u16);
        signed_bytes.put_u16(total_size as u16);
        signed_bytes.extend_from_slice(&payload);
        let signature = keypair.sign(&signed_bytes);
        Ok(Self {
            packet_type,
            payload,
            signature,
        })
    }

    /// Verify the signature over `header || payload` under `pub`. `USER`
    /// packets are never checked here — their authenticity is the embedded
    /// User self-signature, checked by the entity layer.
    pub fn verify(&self, pub_key: &PublicKey) -> bool {
        if self.packet_type == PacketType::User {
            return true;
        }
        let total_size = self.total_size();
        let mut signed_bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        signed_bytes.put_u16(self.packet_type as u16);
        signed_bytes.put_u16(total_size as u16);
        signed_bytes.extend_from_slice(&self.payload);
        pub_key.verify(&signed_bytes, &self.signature)
    }

    fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + TRAILER_SIZE
    }
}

/// `tokio_util::codec` implementation reading exactly one packet at a time
/// off the wire, matching the Connection read algorithm.
#[derive(Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = PacketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let packet_type_raw = u16::from_be_bytes([src[0], src[1]]);
        let total_size = u16::from_be_bytes([src[2], src[3]]) as usize;

        if total_size > MAX_TOTAL_SIZE {
            return Err(PacketError::TooLarge(total_size));
        }
        if total_size < MIN_TOTAL_SIZE {
            return Err(PacketError::TooSmall(total_size));
        }
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        let packet_type = PacketType::try_from(packet_type_raw)?;
        src.advance(HEADER_SIZE);

        let payload_len = total_size - HEADER_SIZE - TRAILER_SIZE;
        let payload = src.split_to(payload_len).to_vec();

        let sig_len = u16::from_be_bytes([src[0], src[1]]);
        src.advance(2);
        let sig_buf = src.split_to(SIGNATURE_BUF_LEN);
        if sig_len as usize > SIGNATURE_BUF_LEN {
            return Err(PacketError::MalformedSignature);
        }
        let signature = Signature::from_parts(&sig_buf[..sig_len as usize])
            .map_err(|_| PacketError::MalformedSignature)?;

        Ok(Some(Packet {
            packet_type,
            payload,
            signature,
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = PacketError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total_size = item.total_size();
        if total_size > MAX_TOTAL_SIZE {
            return Err(PacketError::TooLarge(total_size));
        }
        dst.put_u16(item.packet_type as u16);
        dst.put_u16(total_size as u16);
        dst.extend_from_slice(&item.payload);
        dst.put_u16(item.signature.len());
        dst.extend_from_slice(item.signature.wire_buf());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_packet_roundtrips_through_codec() {
        let mut codec = PacketCodec;
        let packet = Packet::new_user(vec![1, 2, 3, 4]);
        let mut buf = BytesMut::new();
        codec.encode(packet.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.packet_type, PacketType::User);
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn signed_packet_verifies() {
        let kp = Keypair::generate();
        let packet = Packet::signed(PacketType::Hello, vec![9, 9, 9], &kp).unwrap();
        assert!(packet.verify(kp.public()));
    }

    #[test]
    fn signed_packet_rejects_tampering() {
        let kp = Keypair::generate();
        let mut packet = Packet::signed(PacketType::Hello, vec![9, 9, 9], &kp).unwrap();
        packet.payload[0] ^= 0xff;
        assert!(!packet.verify(kp.public()));
    }

    #[test]
    fn decode_yields_concatenated_packets_in_order() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        codec.encode(Packet::new_user(vec![1]), &mut buf).unwrap();
        codec.encode(Packet::new_user(vec![2]), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload, vec![1]);
        assert_eq!(second.payload, vec![2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_type_outside_closed_set() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u16(99);
        buf.put_u16((HEADER_SIZE + TRAILER_SIZE + 1) as u16);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.extend_from_slice(&[0u8; SIGNATURE_BUF_LEN]);
        assert!(matches!(codec.decode(&mut buf), Err(PacketError::UnknownType(99))));
    }

    #[test]
    fn decode_waits_for_a_full_packet_before_returning() {
        let mut codec = PacketCodec;
        let mut full = BytesMut::new();
        codec.encode(Packet::new_user(vec![1, 2, 3]), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn oversize_total_size_is_rejected() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u16(PacketType::User as u16);
        buf.put_u16(u16::MAX);
        buf.resize(buf.len() + 10, 0);
        assert!(matches!(codec.decode(&mut buf), Err(PacketError::TooLarge(_)) | Ok(None)));
    }
}
