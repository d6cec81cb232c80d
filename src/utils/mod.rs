//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, and timing.
//!
//! ## Components
//! - **Crypto**: password-derived AES-256-CBC, SHA-512, secure random bytes
//! - **Logging**: structured logging configuration
//! - **Timeout**: async deadline wrappers and shared timing constants
//!
//! ## Security
//! - Cryptographically secure RNG (`OsRng`) for all secret material
//! - Derived keys and passwords zeroized on drop (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod timeout;

pub use crypto::AesContext;
