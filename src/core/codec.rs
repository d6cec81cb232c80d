//! Tokio codec for framing packages over byte streams.
//!
//! Length fields are validated before any allocation: negative values and
//! values past [`MAX_PAYLOAD_SIZE`](crate::config::MAX_PAYLOAD_SIZE) are
//! framing errors, never buffer sizes.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::package::{check_payload_len, Package, HEADER_LEN};
use crate::error::TransportError;

/// Codec for the six-byte-header package frame.
pub struct PackageCodec;

impl Decoder for PackageCodec {
    type Item = Package;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Package>, TransportError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut raw_len = [0u8; 4];
        raw_len.copy_from_slice(&src[2..6]);
        let payload_len = check_payload_len(i32::from_be_bytes(raw_len))?;

        if src.len() < HEADER_LEN + payload_len {
            // Reserve what the rest of the frame needs and wait for more
            // bytes.
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }

        let header = src.split_to(HEADER_LEN);
        let payload = src.split_to(payload_len);
        Package::from_wire_parts(header[0], header[1], payload.to_vec()).map(Some)
    }
}

impl Encoder<&Package> for PackageCodec {
    type Error = TransportError;

    fn encode(&mut self, pkg: &Package, dst: &mut BytesMut) -> Result<(), TransportError> {
        dst.reserve(HEADER_LEN + pkg.payload_len());
        dst.put_slice(&pkg.header());
        if let Some(payload) = &pkg.payload {
            dst.put_slice(payload);
        }
        Ok(())
    }
}
