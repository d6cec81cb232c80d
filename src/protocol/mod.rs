//! # Protocol Layer
//!
//! The per-connection engine and the state machines that run on top of
//! it.
//!
//! ## Components
//! - **Handler**: concurrent obtain/dispatch loops with pause/resume,
//!   graceful stop, and direct typed reads for the handshake path
//! - **Handshake**: the join sequence (auth, encryption exchange,
//!   validation) shared by first joins and panic rejoins
//! - **Liveness**: the server-side ping/pong monitor

pub mod handler;
pub mod handshake;
pub mod liveness;

pub use handler::{PackageHandler, PackageHooks};
pub use handshake::{client_join, server_join, ClientJoin};
