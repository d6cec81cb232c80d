//! # Service Layer
//!
//! The two endpoints of the transport.
//!
//! ## Components
//! - **Server**: listener, client registry, broadcast, per-client sends
//! - **Session**: per-client server session (fault policy, panic
//!   recovery, liveness wiring)
//! - **Client**: the single-session client endpoint

pub mod client;
pub mod server;
pub(crate) mod session;

pub use client::{Client, ClientHooks};
pub use server::{ClientId, Server, ServerHooks};
