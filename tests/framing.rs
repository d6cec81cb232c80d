//! Frame codec integration tests.
//!
//! Covers round-trips, partial buffers, and the length-field fuzz cases:
//! the decoder must reject negative and over-cap lengths before any
//! allocation and never allocate an attacker-chosen buffer.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{BufMut, BytesMut};
use proptest::prelude::*;
use tcpms::config::MAX_PAYLOAD_SIZE;
use tcpms::core::package::{decode_utf16le, encode_utf16le, Package, PackageType};
use tcpms::{DataType, PackageCodec, TransportError};
use tokio_util::codec::{Decoder, Encoder};

fn header(package_type: u8, data_type: u8, len: i32) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(package_type);
    buf.put_u8(data_type);
    buf.put_i32(len);
    buf
}

#[test]
fn roundtrip_through_codec() {
    let mut codec = PackageCodec;
    let packages = [
        Package::internal(PackageType::Ping),
        Package::internal_with(PackageType::AuthChallenge, vec![0xAB; 48]),
        Package::data_blob(vec![1, 2, 3, 4, 5]),
        Package::data_byte(0x7F),
        Package::data_string("hello world"),
    ];

    for pkg in packages {
        let mut buf = BytesMut::new();
        codec.encode(&pkg, &mut buf).expect("encode");
        let decoded = codec.decode(&mut buf).expect("decode").expect("complete");
        assert_eq!(decoded, pkg);
        assert!(buf.is_empty());
    }
}

#[test]
fn fuzz_length_negative_one_is_rejected() {
    let mut codec = PackageCodec;
    let mut buf = header(PackageType::Data as u8, DataType::Blob as u8, -1);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(TransportError::Frame(_))
    ));
}

#[test]
fn fuzz_length_zero_decodes_to_an_empty_package() {
    let mut codec = PackageCodec;
    let mut buf = header(PackageType::Data as u8, DataType::Empty as u8, 0);
    let pkg = codec.decode(&mut buf).expect("decode").expect("complete");
    assert!(pkg.payload.is_none());
    assert_eq!(pkg.payload_len(), 0);
}

#[test]
fn fuzz_length_at_cap_is_accepted_without_overallocation() {
    let mut codec = PackageCodec;
    let mut buf = header(PackageType::Data as u8, DataType::Blob as u8, MAX_PAYLOAD_SIZE as i32);

    // Header only: an incomplete frame, not an error. The buffer may
    // grow toward the frame size but never beyond the cap.
    let decoded = codec.decode(&mut buf).expect("decode");
    assert!(decoded.is_none());
    assert!(buf.capacity() <= MAX_PAYLOAD_SIZE * 2);
}

#[test]
fn fuzz_length_above_cap_is_rejected_before_allocating() {
    let mut codec = PackageCodec;
    let mut buf = header(
        PackageType::Data as u8,
        DataType::Blob as u8,
        MAX_PAYLOAD_SIZE as i32 + 1,
    );
    let capacity_before = buf.capacity();
    assert!(matches!(
        codec.decode(&mut buf),
        Err(TransportError::Frame(_))
    ));
    assert_eq!(buf.capacity(), capacity_before);
}

#[test]
fn random_headers_never_panic() {
    let mut codec = PackageCodec;
    for seed in 0u32..2000 {
        // Cheap xorshift over the header space.
        let mut x = seed.wrapping_mul(0x9E37_79B9) ^ 0xDEAD_BEEF;
        x ^= x << 13;
        x ^= x >> 17;
        let bytes = x.to_be_bytes();
        let mut buf = header(bytes[0], bytes[1], i32::from_be_bytes(bytes));
        let _ = codec.decode(&mut buf);
    }
}

proptest! {
    #[test]
    fn prop_frame_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
        let pkg = Package::data_blob(payload.clone());
        let decoded = Package::from_bytes(&pkg.to_bytes()).expect("roundtrip");
        prop_assert_eq!(decoded.payload.unwrap_or_default(), payload);
    }

    #[test]
    fn prop_encoding_is_deterministic(payload in prop::collection::vec(any::<u8>(), 0..1024)) {
        let pkg = Package::data_blob(payload);
        prop_assert_eq!(pkg.to_bytes(), pkg.to_bytes());
    }

    #[test]
    fn prop_utf16le_roundtrip(text in "\\PC*") {
        let bytes = encode_utf16le(&text);
        prop_assert_eq!(decode_utf16le(&bytes).expect("decode"), text);
    }

    #[test]
    fn prop_truncated_frames_never_decode(payload in prop::collection::vec(any::<u8>(), 1..256)) {
        let pkg = Package::data_blob(payload);
        let bytes = pkg.to_bytes();
        for cut in 6..bytes.len() {
            let mut buf = BytesMut::from(&bytes[..cut]);
            let decoded = PackageCodec.decode(&mut buf).expect("no error on partial");
            prop_assert!(decoded.is_none());
        }
    }
}
