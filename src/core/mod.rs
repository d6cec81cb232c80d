//! # Core Protocol Components
//!
//! Low-level package handling: the value type, the codec, and the
//! byte-level stream IO policy.
//!
//! ## Wire Format
//! ```text
//! [PackageType(1)] [DataType(1)] [PayloadLength(4, i32 BE)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum payload size: 16 MiB (prevents memory exhaustion)
//! - Length validation before allocation
//! - Per-byte-class read deadlines past the first byte of a frame

pub mod codec;
pub mod package;
pub mod stream;

pub use codec::PackageCodec;
pub use package::{DataType, Package, PackageType};
