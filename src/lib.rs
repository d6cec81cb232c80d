//! # tcpms
//!
//! A bidirectional, message-oriented TCP transport for a single-server /
//! many-client topology.
//!
//! Both sides exchange discretely framed **packages**. The server
//! optionally authenticates each client through a symmetric-key mutual
//! challenge and, once authenticated, encrypts every data payload with a
//! password-derived AES channel. The transport also probes liveness
//! (ping/pong), re-validates connections on demand (probe-and-echo test
//! rounds), and recovers from transient protocol faults with a rejoin
//! handshake ("panic") instead of dropping the client.
//!
//! The encryption authenticates *possession of the shared password*; it
//! is not a TLS replacement and does not certify endpoint identity.
//!
//! ## Layers
//! - [`core`]: the package value type, its codec, and the byte-level
//!   stream IO policy
//! - [`protocol`]: the per-connection obtain/dispatch engine, the join
//!   state machine, and the liveness monitor
//! - [`service`]: the [`Server`] and [`Client`] endpoints
//! - [`config`] / [`error`] / [`utils`]: settings, the error taxonomy,
//!   and the crypto/logging/timeout utilities
//!
//! ## Example
//! ```no_run
//! use tcpms::{Client, ClientHooks, Server, ServerHooks, ServerSettings};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> tcpms::Result<()> {
//! let server = Server::bind(
//!     "127.0.0.1:4819",
//!     ServerSettings::default().with_password("password"),
//!     ServerHooks::new()
//!         .on_string_received(|client, text| println!("{client}: {text}")),
//! )
//! .await?;
//!
//! let client = Client::new(ClientHooks::new());
//! let cancel = CancellationToken::new();
//! if client
//!     .connect("127.0.0.1:4819", Some("password"), &cancel)
//!     .await?
//! {
//!     client.send_string("hello world").await?;
//! }
//!
//! client.disconnect().await?;
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod utils;

pub use config::{ExportedSettings, ServerSettings};
pub use core::{DataType, Package, PackageCodec, PackageType};
pub use error::{Fault, Result, TransportError};
pub use protocol::{PackageHandler, PackageHooks};
pub use service::{Client, ClientHooks, ClientId, Server, ServerHooks};
pub use utils::AesContext;
