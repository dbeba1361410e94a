//! The wire envelope: the framed unit every byte of the protocol travels in.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! [u16 length]  stream transport only, covers the whole envelope incl. itself
//! [u8  0x02]    header tag
//! [u16 client]  client/version tag
//! [u16 cmd]     command id
//! [u16 seq]     sequence number
//! [u32 uid]     session-owner id
//! [...]         payload (encrypted for post-login commands)
//! [u8  0x03]    tail tag
//! ```
//!
//! The outer fields are never encrypted; only the payload region is.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::core::consts::{
    CLIENT_TAG, MAX_PACKET_SIZE, MIN_UDP_PACKET, PACKET_TAG, PACKET_TAIL, UDP_HEADER_LENGTH,
};
use crate::error::{ProtocolError, Result};

/// One parsed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub cmd: u16,
    pub seq: u16,
    pub uid: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(cmd: u16, seq: u16, uid: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            cmd,
            seq,
            uid,
            payload: payload.into(),
        }
    }

    /// Encapsulate for the datagram transport (no length prefix).
    pub fn encode_datagram(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(MIN_UDP_PACKET + self.payload.len());
        self.put_body(&mut buf);
        buf
    }

    /// Encapsulate for the stream transport. The leading length field covers
    /// the entire envelope including the field itself.
    pub fn encode_stream(&self) -> BytesMut {
        let total = MIN_UDP_PACKET + 2 + self.payload.len();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u16(total as u16);
        self.put_body(&mut buf);
        buf
    }

    fn put_body(&self, buf: &mut BytesMut) {
        buf.put_u8(PACKET_TAG);
        buf.put_u16(CLIENT_TAG);
        buf.put_u16(self.cmd);
        buf.put_u16(self.seq);
        buf.put_u32(self.uid);
        buf.put_slice(&self.payload);
        buf.put_u8(PACKET_TAIL);
    }

    /// Parse one complete datagram. Short or tagless datagrams are dropped
    /// by the caller; this returns the reason as a recoverable error.
    pub fn decode_datagram(mut buf: Bytes) -> Result<Self> {
        if buf.len() < MIN_UDP_PACKET {
            warn!(len = buf.len(), "received packet is too short");
            return Err(ProtocolError::Malformed("datagram too short".into()));
        }
        if buf.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::OversizedPacket(buf.len()));
        }
        if buf[0] != PACKET_TAG || buf[buf.len() - 1] != PACKET_TAIL {
            warn!("datagram has no header and tail tag");
            return Err(ProtocolError::Malformed("bad header or tail tag".into()));
        }

        buf.advance(1); // header tag
        let _client = buf.get_u16();
        let cmd = buf.get_u16();
        let seq = buf.get_u16();
        let uid = buf.get_u32();
        let payload = buf.split_to(buf.len() - 1); // leave the tail tag behind

        Ok(Self {
            cmd,
            seq,
            uid,
            payload,
        })
    }

    /// Parse the body of a stream envelope whose length prefix has already
    /// been stripped and whose tags have been verified by the reassembler.
    pub(crate) fn decode_verified_body(mut buf: Bytes) -> Self {
        buf.advance(1);
        let _client = buf.get_u16();
        let cmd = buf.get_u16();
        let seq = buf.get_u16();
        let uid = buf.get_u32();
        let payload = buf.split_to(buf.len() - 1);
        Self {
            cmd,
            seq,
            uid,
            payload,
        }
    }
}

/// Sanity bound shared by both transports: an envelope body must at least
/// hold its header and tail.
pub(crate) fn body_len_plausible(len: usize) -> bool {
    (UDP_HEADER_LENGTH + 1..=MAX_PACKET_SIZE).contains(&len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::consts::cmd;

    #[test]
    fn datagram_roundtrip() {
        let pkt = Packet::new(cmd::KEEP_ALIVE, 0x1234, 10001, vec![0xAA, 0xBB, 0xCC]);
        let wire = pkt.encode_datagram().freeze();
        let back = Packet::decode_datagram(wire).unwrap();
        assert_eq!(back, pkt);
    }

    #[test]
    fn datagram_roundtrip_empty_payload() {
        let pkt = Packet::new(cmd::LOGOUT, 0xFFFF, 42, Vec::new());
        let wire = pkt.encode_datagram().freeze();
        assert_eq!(wire.len(), MIN_UDP_PACKET);
        let back = Packet::decode_datagram(wire).unwrap();
        assert_eq!(back.payload.len(), 0);
        assert_eq!(back.seq, 0xFFFF);
    }

    #[test]
    fn stream_length_covers_whole_envelope() {
        let pkt = Packet::new(cmd::LOGIN, 1, 7, vec![1, 2, 3, 4]);
        let wire = pkt.encode_stream();
        let declared = u16::from_be_bytes([wire[0], wire[1]]) as usize;
        assert_eq!(declared, wire.len());
    }

    #[test]
    fn short_datagram_is_rejected_not_panicking() {
        let err = Packet::decode_datagram(Bytes::from_static(&[0x02, 0x03])).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn bad_tags_rejected() {
        let pkt = Packet::new(cmd::SEND_IM, 9, 9, vec![0u8; 4]);
        let mut wire = pkt.encode_datagram();
        wire[0] = 0x55;
        let err = Packet::decode_datagram(wire.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
