//! busfence-proxy - Filtering message-bus proxy
//!
//! This library implements a filtering proxy for D-Bus-style message
//! buses. It sits between an untrusted client (typically a sandboxed
//! process) and the real bus socket, relays the credential and SASL
//! handshake verbatim, and then enforces a per-name policy on every
//! message in both directions.
//!
//! # Policy model
//!
//! Names are granted one of four ordered levels (NONE, SEE, TALK, OWN)
//! in a [`busfence_core::policy::PolicyTable`]. Unknown names are
//! hidden. What the proxy learns at runtime (the client's unique id,
//! owners of visible names) only ever raises a unique id's level, never
//! lowers it.
//!
//! # Modules
//!
//! - [`buffer`]: Owned message buffers with attached file descriptors
//! - [`connection`]: Per-connection serial discipline and correlation
//!   maps
//! - [`error`]: Error types and connection limits
//! - [`filter`]: The message filtering and rewriting engine
//! - [`pump`]: Socket pumps bridging readiness I/O and descriptor
//!   passing
//! - [`server`]: The listener, bus dialer and per-connection driver

pub mod buffer;
pub mod connection;
pub mod error;
pub mod filter;
pub mod pump;
pub mod server;

pub use error::{ProxyError, ProxyResult};
pub use server::{Proxy, ProxyConfig};
