//! Per-connection filtering state.
//!
//! One [`ConnectionState`] exists per accepted client and lives until
//! both sides of the connection close. It tracks three things:
//!
//! - the last serial seen from the client (serials must strictly
//!   increase; a regression is fatal)
//! - the policy level *learned* for each unique id, a one-way ratchet
//!   that starts at NONE and is only ever raised, even if the name that
//!   justified the raise is later released
//! - correlation maps keyed by serial, all with steal-on-lookup
//!   semantics so each expectation is satisfied at most once: the
//!   expected reply kind, the name whose owner the reply will disclose,
//!   any stashed synthesized reply, and the serials of bus-originated
//!   calls the client has been handed and may answer
//!
//! # Invariants
//!
//! - [INV-CONN-001] `raise_unique_policy` never lowers a stored level
//! - [INV-CONN-002] Stealing a correlation entry removes it; a second
//!   lookup for the same serial misses
//! - [INV-CONN-003] Client serials strictly increase for the lifetime
//!   of the connection

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use busfence_core::policy::{PolicyLevel, PolicyTable};
use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{ProxyError, ProxyResult, MAX_PENDING_REPLIES};

/// Leading character of bus-assigned unique names.
pub const UNIQUE_NAME_SIGIL: char = ':';

/// What the proxy expects a pending reply to contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedReply {
    /// An ordinary reply, forwarded unchanged.
    Plain,
    /// The `Hello` reply carrying the client's own unique id.
    Hello,
    /// A `GetNameOwner` reply disclosing the owner of `name`.
    GetNameOwner {
        /// The name whose owner was requested.
        name: String,
    },
    /// A `ListNames`/`ListActivatableNames` reply to be scrubbed of
    /// names the client may not see.
    NameList,
    /// A round-trip placeholder: the real reply is discarded and the
    /// stashed synthesized reply is forwarded in its place.
    Synthetic,
}

/// Mutable state for one proxied connection.
#[derive(Debug)]
pub struct ConnectionState {
    policy: Arc<PolicyTable>,
    last_serial: u32,
    client_id: Option<String>,
    unique_policy: HashMap<String, PolicyLevel>,
    expected_replies: HashMap<u32, ExpectedReply>,
    owner_queries: HashMap<u32, String>,
    synthetic_replies: HashMap<u32, Buffer>,
    incoming_calls: HashSet<u32>,
}

impl ConnectionState {
    /// Creates fresh state sharing the process-wide policy table.
    #[must_use]
    pub fn new(policy: Arc<PolicyTable>) -> Self {
        Self {
            policy,
            last_serial: 0,
            client_id: None,
            unique_policy: HashMap::new(),
            expected_replies: HashMap::new(),
            owner_queries: HashMap::new(),
            synthetic_replies: HashMap::new(),
            incoming_calls: HashSet::new(),
        }
    }

    /// The configured policy table.
    #[must_use]
    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    /// Resolves the effective level for a destination.
    ///
    /// Well-known names go to the policy table; unique ids go to the
    /// learned per-connection map, defaulting to NONE. `None` is the
    /// bus itself and always resolves to TALK.
    #[must_use]
    pub fn resolve_effective(&self, name: Option<&str>) -> PolicyLevel {
        match name {
            Some(name) if name.starts_with(UNIQUE_NAME_SIGIL) => self
                .unique_policy
                .get(name)
                .copied()
                .unwrap_or_default(),
            other => self.policy.resolve(other),
        }
    }

    /// Raises a unique id's learned level.
    ///
    /// Monotonic: a level at or below the stored one is a no-op. The
    /// ratchet is deliberate; releasing a name later must not demote
    /// the peer that owned it.
    pub fn raise_unique_policy(&mut self, id: &str, level: PolicyLevel) {
        let current = self.unique_policy.get(id).copied().unwrap_or_default();
        if level > current {
            debug!(id, from = %current, to = %level, "raising unique-id policy");
            self.unique_policy.insert(id.to_owned(), level);
        }
    }

    /// Records a client serial, enforcing strict monotonicity.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SerialOrder`] if `serial` is not strictly
    /// greater than every serial seen before it. The caller must treat
    /// this as fatal.
    pub fn note_serial(&mut self, serial: u32) -> ProxyResult<()> {
        if serial <= self.last_serial {
            return Err(ProxyError::SerialOrder {
                serial,
                last: self.last_serial,
            });
        }
        self.last_serial = serial;
        Ok(())
    }

    /// The client's bus-assigned unique id, once its `Hello` reply has
    /// been observed.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Records the client's unique id from the `Hello` reply.
    pub fn set_client_id(&mut self, id: impl Into<String>) {
        self.client_id = Some(id.into());
    }

    /// Registers what kind of reply to expect for an outgoing serial.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::TooManyPendingReplies`] once the map hits
    /// its cap; a client holding that many replies open is broken or
    /// hostile.
    pub fn expect_reply(&mut self, serial: u32, kind: ExpectedReply) -> ProxyResult<()> {
        if self.expected_replies.len() >= MAX_PENDING_REPLIES {
            return Err(ProxyError::TooManyPendingReplies {
                count: self.expected_replies.len(),
                max: MAX_PENDING_REPLIES,
            });
        }
        self.expected_replies.insert(serial, kind);
        Ok(())
    }

    /// Removes and returns the expectation for a reply serial.
    pub fn steal_expectation(&mut self, serial: u32) -> Option<ExpectedReply> {
        self.expected_replies.remove(&serial)
    }

    /// Records that the reply to `serial` will disclose the current
    /// owner of `name`.
    pub fn note_owner_query(&mut self, serial: u32, name: impl Into<String>) {
        self.owner_queries.insert(serial, name.into());
    }

    /// Removes and returns the owner-query name for a reply serial.
    pub fn steal_owner_query(&mut self, serial: u32) -> Option<String> {
        self.owner_queries.remove(&serial)
    }

    /// Records that the client was handed a bus-originated call with
    /// this serial and may answer it.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::TooManyPendingReplies`] once the set hits
    /// its cap.
    pub fn expect_client_reply(&mut self, serial: u32) -> ProxyResult<()> {
        if self.incoming_calls.len() >= MAX_PENDING_REPLIES {
            return Err(ProxyError::TooManyPendingReplies {
                count: self.incoming_calls.len(),
                max: MAX_PENDING_REPLIES,
            });
        }
        self.incoming_calls.insert(serial);
        Ok(())
    }

    /// Removes the incoming-call record for a reply serial, returning
    /// `true` if one existed.
    pub fn steal_client_reply(&mut self, serial: u32) -> bool {
        self.incoming_calls.remove(&serial)
    }

    /// Stashes a synthesized reply awaiting its round trip.
    pub fn stash_synthetic(&mut self, serial: u32, reply: Buffer) {
        self.synthetic_replies.insert(serial, reply);
    }

    /// Removes and returns the stashed synthesized reply for a serial.
    pub fn steal_synthetic(&mut self, serial: u32) -> Option<Buffer> {
        self.synthetic_replies.remove(&serial)
    }
}
