//! Per-name access policy model.
//!
//! A [`PolicyTable`] maps bus names to one of four ordered levels and is
//! configured once at startup; the proxy only ever reads it afterwards.
//! Entries come in two forms: exact names, and single-level wildcard
//! prefixes ("org.foo" matching "org.foo.bar"). Resolution takes the
//! maximum of the exact and wildcard entries, with missing entries
//! counting as [`PolicyLevel::None`] (fail-closed).
//!
//! # Invariants
//!
//! - [INV-POL-001] Resolution is deny-by-default: a name with no entry
//!   resolves to NONE
//! - [INV-POL-002] A message with no destination is addressed to the bus
//!   itself and always resolves to TALK
//! - [INV-POL-003] Wildcard matching is single-level: the name is split
//!   at its *last* dot and only that prefix is looked up

use std::collections::HashMap;
use std::fmt;

/// Longest name prefix considered for wildcard resolution.
///
/// Names whose prefix-before-last-dot is longer than this skip the
/// wildcard lookup entirely. This is a defined limit, not an accident of
/// buffer sizing.
pub const MAX_WILDCARD_PREFIX_LEN: usize = 255;

/// How much a peer may observe or act upon a given name.
///
/// The levels form a total order; everything the proxy learns about a
/// peer only ever moves up this order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PolicyLevel {
    /// The name is invisible: calls to it are swallowed and it is
    /// scrubbed from name listings.
    #[default]
    None,
    /// The name may be observed (listed, resolved, watched) but not
    /// called.
    See,
    /// The name may be called and its replies received.
    Talk,
    /// The name may additionally be owned by the peer.
    Own,
}

impl PolicyLevel {
    /// Stable lowercase form, used in CLI flags and log output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::See => "see",
            Self::Talk => "talk",
            Self::Own => "own",
        }
    }
}

impl fmt::Display for PolicyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide mapping from bus name to policy level.
///
/// Built by the embedding process before the proxy starts accepting and
/// immutable afterwards; connections share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    exact: HashMap<String, PolicyLevel>,
    wildcard: HashMap<String, PolicyLevel>,
}

impl PolicyTable {
    /// Creates an empty table (every name resolves to NONE).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `level` to an exact name.
    ///
    /// Adding the same name twice keeps the higher level; policy is
    /// never lowered by configuration order.
    pub fn add_policy(&mut self, name: impl Into<String>, level: PolicyLevel) {
        let entry = self.exact.entry(name.into()).or_default();
        *entry = (*entry).max(level);
    }

    /// Grants `level` to every direct child of `prefix`.
    ///
    /// `prefix` is the part before the wildcard: an "org.foo" entry
    /// matches any name whose prefix-before-last-dot is exactly
    /// "org.foo" ("org.foo.bar", but neither "org.foobar" nor
    /// "org.foo.bar.baz", and not "org.foo" itself).
    pub fn add_wildcard_policy(&mut self, prefix: impl Into<String>, level: PolicyLevel) {
        let entry = self.wildcard.entry(prefix.into()).or_default();
        *entry = (*entry).max(level);
    }

    /// Resolves the effective level for a destination.
    ///
    /// `None` means the message is addressed to the bus itself, which
    /// every peer may always talk to. Otherwise the result is the
    /// maximum of the exact entry and the wildcard entry for the name's
    /// prefix-before-last-dot; names whose prefix exceeds
    /// [`MAX_WILDCARD_PREFIX_LEN`] skip the wildcard lookup.
    #[must_use]
    pub fn resolve(&self, name: Option<&str>) -> PolicyLevel {
        let Some(name) = name else {
            return PolicyLevel::Talk;
        };
        let exact = self.exact.get(name).copied().unwrap_or_default();
        let wildcard = name
            .rfind('.')
            .map(|at| &name[..at])
            .filter(|prefix| prefix.len() <= MAX_WILDCARD_PREFIX_LEN)
            .and_then(|prefix| self.wildcard.get(prefix).copied())
            .unwrap_or_default();
        exact.max(wildcard)
    }

    /// Returns `true` if no entries are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }
}
