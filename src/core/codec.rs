//! Stream reassembly: length-delimited envelopes out of a TCP byte stream.
//!
//! The reassembler is restartable and purely a function of buffered bytes:
//! it never blocks and never looks at the socket. A malformed stretch of
//! stream (bad tags, impossible length) is recovered by scanning forward for
//! the next tail-tag byte and discarding everything up to and including it.
//! This mirrors how a desynchronized connection realigns on the next packet
//! boundary instead of dying.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::core::consts::{PACKET_TAG, PACKET_TAIL, TCP_HEADER_LENGTH};
use crate::core::packet::{body_len_plausible, Packet};
use crate::error::{ProtocolError, Result};

/// Try to extract exactly one envelope from the accumulator.
///
/// Returns `None` when more bytes are needed. Consumed garbage does not
/// produce an error; the stream is resynchronized silently (with a warning)
/// and extraction continues.
pub fn extract_one(acc: &mut BytesMut) -> Option<Packet> {
    loop {
        if acc.len() < TCP_HEADER_LENGTH {
            return None;
        }

        let declared = u16::from_be_bytes([acc[0], acc[1]]) as usize;

        // Length plausibility and the header tag must be checked before
        // waiting for the body: a corrupt length would otherwise stall the
        // stream forever waiting for bytes that never come.
        let header_ok = declared >= TCP_HEADER_LENGTH
            && body_len_plausible(declared - 2)
            && acc[2] == PACKET_TAG;
        if header_ok && acc.len() < declared {
            return None;
        }

        if !header_ok || acc[declared - 1] != PACKET_TAIL {
            warn!(declared, buffered = acc.len(), "packet error, failed to check header and tail tag");

            // Resynchronize: jump past the next tail tag, or give up on the
            // whole buffer if there is none.
            match acc[1..].iter().position(|&b| b == PACKET_TAIL) {
                Some(pos) => {
                    let jump = pos + 2; // skip through the tail byte itself
                    debug!(jump, "resynchronizing stream past next tail tag");
                    acc.advance(jump.min(acc.len()));
                    continue;
                }
                None => {
                    debug!("no tail tag in buffer, clearing receive queue");
                    acc.clear();
                    return None;
                }
            }
        }

        let mut envelope = acc.split_to(declared);
        envelope.advance(2); // length prefix
        return Some(Packet::decode_verified_body(envelope.freeze()));
    }
}

/// tokio-util codec over the same reassembler, for framed stream transports.
///
/// Decoding yields whole envelopes. Encoding takes pre-framed bytes rather
/// than a [`Packet`]: a resent transaction must go out byte-identical to the
/// original send, so callers frame once and keep the bytes.
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        Ok(extract_one(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        // Leftover bytes at EOF are just a torn envelope; drop them.
        Ok(extract_one(src))
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
