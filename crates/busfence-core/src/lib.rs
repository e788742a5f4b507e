//! busfence-core - D-Bus wire codec and name policy model
//!
//! This crate contains the pure, I/O-free pieces of the busfence proxy:
//! the D-Bus wire header codec, the small body-argument codec the filter
//! needs, and the per-name policy table. It is the sole consumer of
//! attacker-controlled bytes in the workspace, so every length read here
//! is bounds-checked before use.
//!
//! # Modules
//!
//! - [`wire`]: fixed preamble + header-field array decode/encode
//!   ([`wire::Header`], [`wire::MessageBuilder`])
//! - [`body`]: body argument reader/writer for the handful of signatures
//!   the proxy inspects or synthesizes (`s`, `u`, `as`, `sss`)
//! - [`policy`]: NONE/SEE/TALK/OWN policy table with exact and
//!   single-level wildcard entries ([`policy::PolicyTable`])
//!
//! # Security Considerations
//!
//! - Declared lengths are validated against the message boundary before
//!   any allocation or slice access
//! - Unknown message kinds and unknown header field codes are rejected,
//!   never skipped
//! - Messages missing the header fields their kind requires are rejected
//!   before any routing decision is made

pub mod body;
pub mod policy;
pub mod wire;

pub use policy::{PolicyLevel, PolicyTable, MAX_WILDCARD_PREFIX_LEN};
pub use wire::{
    FormatError, Header, MessageBuilder, MessageKind, BUS_INTERFACE, BUS_NAME, BUS_PATH,
    MAX_MESSAGE_SIZE, PEER_INTERFACE,
};
