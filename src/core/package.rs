//! Package value type and its wire format.
//!
//! A package is one framed message:
//!
//! ```text
//! [package_type(1)] [data_type(1)] [payload_length(4, i32 BE)] [payload(N)]
//! ```
//!
//! The payload is absent exactly when the length field is zero, and
//! `data_type` is [`DataType::Empty`] exactly when the package carries no
//! application data. Every package other than [`PackageType::Data`] is
//! internal to the protocol.

use tokio::sync::oneshot;

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{constants, Result, TransportError};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 6;

/// Package type tag. The numeric encoding is stable wire format; do not
/// reorder variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PackageType {
    None = 0,
    Error = 1,
    DisconnectRequest = 2,
    Disconnect = 3,
    Data = 4,
    AuthInfo = 5,
    AuthRequest = 6,
    AuthSalt = 7,
    AuthIv = 8,
    AuthChallenge = 9,
    AuthResponse = 10,
    AuthSuccess = 11,
    AuthFailure = 12,
    EncrRequest = 13,
    EncrIv = 14,
    EncrSalt = 15,
    TestRequest = 16,
    Test = 17,
    TestTrySuccess = 18,
    TestTryFailure = 19,
    Ping = 20,
    Pong = 21,
    Panic = 22,
}

impl PackageType {
    /// Decode a wire tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => PackageType::None,
            1 => PackageType::Error,
            2 => PackageType::DisconnectRequest,
            3 => PackageType::Disconnect,
            4 => PackageType::Data,
            5 => PackageType::AuthInfo,
            6 => PackageType::AuthRequest,
            7 => PackageType::AuthSalt,
            8 => PackageType::AuthIv,
            9 => PackageType::AuthChallenge,
            10 => PackageType::AuthResponse,
            11 => PackageType::AuthSuccess,
            12 => PackageType::AuthFailure,
            13 => PackageType::EncrRequest,
            14 => PackageType::EncrIv,
            15 => PackageType::EncrSalt,
            16 => PackageType::TestRequest,
            17 => PackageType::Test,
            18 => PackageType::TestTrySuccess,
            19 => PackageType::TestTryFailure,
            20 => PackageType::Ping,
            21 => PackageType::Pong,
            22 => PackageType::Panic,
            _ => return None,
        })
    }

    /// Everything except `Data` is protocol-internal.
    pub fn is_internal(self) -> bool {
        self != PackageType::Data
    }
}

/// Payload interpretation tag. Stable wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Empty = 0,
    String = 1,
    Byte = 2,
    Blob = 3,
}

impl DataType {
    /// Decode a wire tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => DataType::Empty,
            1 => DataType::String,
            2 => DataType::Byte,
            3 => DataType::Blob,
            _ => return None,
        })
    }
}

/// One framed message.
///
/// Equality and `Debug` ignore the completion notifier, which is consumed
/// by the dispatch loop when the frame has been written.
pub struct Package {
    pub package_type: PackageType,
    pub data_type: DataType,
    pub payload: Option<Vec<u8>>,
    pub(crate) completion: Option<oneshot::Sender<()>>,
}

impl Package {
    /// An internal package without payload.
    pub fn internal(package_type: PackageType) -> Self {
        Self {
            package_type,
            data_type: DataType::Empty,
            payload: None,
            completion: None,
        }
    }

    /// An internal package carrying protocol bytes (salts, challenges,
    /// probes).
    pub fn internal_with(package_type: PackageType, payload: Vec<u8>) -> Self {
        Self {
            package_type,
            data_type: if payload.is_empty() {
                DataType::Empty
            } else {
                DataType::Blob
            },
            payload: if payload.is_empty() {
                None
            } else {
                Some(payload)
            },
            completion: None,
        }
    }

    /// A data package carrying an opaque byte blob.
    pub fn data_blob(payload: Vec<u8>) -> Self {
        Self {
            package_type: PackageType::Data,
            data_type: if payload.is_empty() {
                DataType::Empty
            } else {
                DataType::Blob
            },
            payload: if payload.is_empty() {
                None
            } else {
                Some(payload)
            },
            completion: None,
        }
    }

    /// A data package with an explicit payload interpretation. The
    /// payload may already be sealed; an empty one still degrades to
    /// `Empty` so the data tag never claims bytes the frame lacks.
    pub(crate) fn data_with(data_type: DataType, payload: Vec<u8>) -> Self {
        Self {
            package_type: PackageType::Data,
            data_type: if payload.is_empty() {
                DataType::Empty
            } else {
                data_type
            },
            payload: if payload.is_empty() {
                None
            } else {
                Some(payload)
            },
            completion: None,
        }
    }

    /// A data package carrying a single byte.
    pub fn data_byte(value: u8) -> Self {
        Self {
            package_type: PackageType::Data,
            data_type: DataType::Byte,
            payload: Some(vec![value]),
            completion: None,
        }
    }

    /// A data package carrying a string as UTF-16 little-endian code
    /// units.
    pub fn data_string(value: &str) -> Self {
        Self {
            package_type: PackageType::Data,
            data_type: DataType::String,
            payload: Some(encode_utf16le(value)),
            completion: None,
        }
    }

    /// Attach a single-fire completion notifier, returning its receiving
    /// end. The notifier fires when the dispatch loop has written the
    /// frame.
    pub fn with_completion(mut self) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        (self, rx)
    }

    /// Signal the completion notifier, if any. Fires at most once.
    pub(crate) fn complete(&mut self) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_internal(&self) -> bool {
        self.package_type.is_internal()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }

    /// Take the payload, leaving the package empty.
    pub fn take_payload(&mut self) -> Vec<u8> {
        self.payload.take().unwrap_or_default()
    }

    /// The six-byte frame header.
    pub fn header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = self.package_type as u8;
        header[1] = self.data_type as u8;
        header[2..6].copy_from_slice(&(self.payload_len() as i32).to_be_bytes());
        header
    }

    /// Encode header plus payload into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload_len());
        out.extend_from_slice(&self.header());
        if let Some(payload) = &self.payload {
            out.extend_from_slice(payload);
        }
        out
    }

    /// Decode a complete frame. The buffer must contain exactly one
    /// package.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(TransportError::Frame(constants::ERR_TRUNCATED_FRAME));
        }
        let mut raw_len = [0u8; 4];
        raw_len.copy_from_slice(&bytes[2..6]);
        let len = check_payload_len(i32::from_be_bytes(raw_len))?;
        if bytes.len() != HEADER_LEN + len {
            return Err(TransportError::Frame(constants::ERR_TRUNCATED_FRAME));
        }
        Self::from_wire_parts(bytes[0], bytes[1], bytes[HEADER_LEN..].to_vec())
    }

    /// Assemble a package from already-read wire fields.
    pub(crate) fn from_wire_parts(
        type_tag: u8,
        data_tag: u8,
        payload: Vec<u8>,
    ) -> Result<Self> {
        let package_type = PackageType::from_u8(type_tag)
            .ok_or(TransportError::Frame(constants::ERR_UNKNOWN_PACKAGE_TAG))?;
        let data_type = DataType::from_u8(data_tag)
            .ok_or(TransportError::Frame(constants::ERR_UNKNOWN_DATA_TAG))?;
        Ok(Self {
            package_type,
            data_type,
            payload: if payload.is_empty() {
                None
            } else {
                Some(payload)
            },
            completion: None,
        })
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.package_type == other.package_type
            && self.data_type == other.data_type
            && self.payload == other.payload
    }
}

impl Eq for Package {}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("package_type", &self.package_type)
            .field("data_type", &self.data_type)
            .field("payload_len", &self.payload_len())
            .finish()
    }
}

/// Validate a wire length field before any allocation happens.
pub(crate) fn check_payload_len(len: i32) -> Result<usize> {
    if len < 0 {
        return Err(TransportError::Frame(constants::ERR_NEGATIVE_LENGTH));
    }
    let len = len as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(TransportError::Frame(constants::ERR_OVERSIZED_PAYLOAD));
    }
    Ok(len)
}

/// Encode a string as UTF-16 code units in little-endian byte order,
/// without a BOM.
pub fn encode_utf16le(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() * 2);
    for unit in value.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Decode UTF-16 little-endian code units back into a string.
pub fn decode_utf16le(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(TransportError::Frame(constants::ERR_UTF16_LENGTH));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| TransportError::Frame(constants::ERR_UTF16_INVALID))
}
