//! Edge cases for the wire envelope and stream reassembly.

use bytes::{BufMut, Bytes, BytesMut};

use openq::core::codec::extract_one;
use openq::core::consts::{MAX_PACKET_SIZE, PACKET_TAG, PACKET_TAIL};
use openq::core::packet::Packet;

fn packet(cmd: u16, seq: u16, payload: &[u8]) -> Packet {
    Packet {
        cmd,
        seq,
        uid: 10001,
        payload: Bytes::copy_from_slice(payload),
    }
}

#[test]
fn stream_with_three_envelopes_extracts_all() {
    let mut acc = BytesMut::new();
    let sent: Vec<Packet> = (0..3)
        .map(|i| packet(0x0016, i, format!("msg-{i}").as_bytes()))
        .collect();
    for p in &sent {
        acc.put_slice(&p.encode_stream());
    }

    let mut got = Vec::new();
    while let Some(p) = extract_one(&mut acc) {
        got.push(p);
    }
    assert_eq!(got, sent);
    assert!(acc.is_empty());
}

#[test]
fn torn_envelope_waits_for_the_rest() {
    let wire = packet(0x0002, 1, b"ka").encode_stream();
    let mut acc = BytesMut::new();

    for split in 1..wire.len() {
        acc.clear();
        acc.put_slice(&wire[..split]);
        assert!(extract_one(&mut acc).is_none(), "split at {split}");
        acc.put_slice(&wire[split..]);
        assert!(extract_one(&mut acc).is_some(), "split at {split}");
    }
}

#[test]
fn leading_garbage_is_skipped_up_to_next_tail() {
    let wire = packet(0x0017, 7, b"payload").encode_stream();
    let mut acc = BytesMut::new();
    // Garbage whose only tail byte sits right before the valid envelope.
    acc.put_slice(&[0x55, 0x44, 0x33, 0x22, PACKET_TAIL]);
    acc.put_slice(&wire);

    let got = extract_one(&mut acc).expect("should resync");
    assert_eq!(got.payload, Bytes::from_static(b"payload"));
}

#[test]
fn oversized_declared_length_does_not_stall() {
    let wire = packet(0x0016, 2, b"ok").encode_stream();
    let mut acc = BytesMut::new();
    // A bogus header declaring the maximum length would otherwise make the
    // reader wait for 64 KB that never arrives.
    acc.put_slice(&(MAX_PACKET_SIZE as u16).to_be_bytes());
    acc.put_slice(&[0x00, 0x00, PACKET_TAIL]);
    acc.put_slice(&wire);

    assert_eq!(extract_one(&mut acc), Some(packet(0x0016, 2, b"ok")));
}

#[test]
fn datagram_too_short_is_rejected() {
    assert!(Packet::decode_datagram(Bytes::from_static(&[PACKET_TAG, 0, 0])).is_err());
}

#[test]
fn datagram_with_wrong_markers_is_rejected() {
    let mut wire = packet(0x0016, 3, b"x").encode_datagram();
    wire[0] = 0x7F;
    assert!(Packet::decode_datagram(Bytes::from(wire.clone())).is_err());

    let mut wire2 = packet(0x0016, 3, b"x").encode_datagram();
    let last = wire2.len() - 1;
    wire2[last] = 0x7F;
    assert!(Packet::decode_datagram(Bytes::from(wire2)).is_err());
}

#[test]
fn stream_length_field_covers_whole_envelope() {
    let p = packet(0x0022, 9, &[0u8; 40]);
    let wire = p.encode_stream();
    let declared = u16::from_be_bytes([wire[0], wire[1]]) as usize;
    assert_eq!(declared, wire.len());
}
