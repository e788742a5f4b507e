//! Proxy error types.
//!
//! Structured errors for everything that can go wrong on a proxied
//! connection. Most variants are connection-fatal by design: the bytes
//! come from an untrusted peer, and any structural ambiguity is treated
//! as an attack rather than tolerated.

use std::io;

use busfence_core::wire::FormatError;
use thiserror::Error;

/// Default cap on queued outgoing bytes per side (32 MiB).
///
/// The reference behavior queues unboundedly; a slow or malicious peer
/// could grow that queue without limit, so overflow closes the
/// connection instead.
pub const DEFAULT_MAX_QUEUED_BYTES: usize = 32 * 1024 * 1024;

/// Maximum length of a single authentication-phase line (16 KiB).
pub const MAX_AUTH_LINE: usize = 16 * 1024;

/// Maximum number of in-flight reply expectations per connection.
///
/// Each entry is created by a client method call awaiting its reply; a
/// client that opens this many without ever draining replies is broken
/// or hostile.
pub const MAX_PENDING_REPLIES: usize = 16 * 1024;

/// Errors raised while proxying one connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The header codec rejected a message.
    #[error("malformed message: {0}")]
    Format(#[from] FormatError),

    /// A client serial did not increase.
    ///
    /// Nothing else verifies that a client is not replaying or
    /// confusing serials, so this is enforced here and is fatal.
    #[error("non-increasing client serial {serial} (last seen {last})")]
    SerialOrder {
        /// The offending serial.
        serial: u32,
        /// The highest serial seen before it.
        last: u32,
    },

    /// A client message claimed the bus driver's private path or
    /// interface for itself.
    #[error("client message impersonates the bus driver")]
    BusImpersonation,

    /// A header declared more attached descriptors than were received.
    #[error("{declared} descriptors declared but only {available} received")]
    DescriptorShortfall {
        /// Count from the header's descriptor field.
        declared: u32,
        /// Descriptors actually queued for this side.
        available: usize,
    },

    /// The outgoing queue for one side exceeded its cap.
    #[error("outgoing queue overflow: {queued} bytes exceeds {max}")]
    QueueOverflow {
        /// Bytes that would have been queued.
        queued: usize,
        /// Configured cap.
        max: usize,
    },

    /// Too many reply expectations are outstanding.
    #[error("too many pending replies: {count} exceeds {max}")]
    TooManyPendingReplies {
        /// Outstanding expectation count.
        count: usize,
        /// Enforced limit.
        max: usize,
    },

    /// A credential byte arrived on a side that already finished the
    /// credential exchange. Only the client opens with one; the bus
    /// answers in lines.
    #[error("unexpected credential byte")]
    UnexpectedCredentialByte,

    /// An authentication-phase line never terminated.
    #[error("authentication line exceeds {max} bytes")]
    AuthLineTooLong {
        /// Enforced limit.
        max: usize,
    },

    /// The upstream bus address uses a transport this proxy does not
    /// speak.
    #[error("unsupported bus address: {address}")]
    UnsupportedAddress {
        /// The address as given.
        address: String,
    },

    /// Underlying I/O failure on either socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Returns `true` if this error is evidence of a buggy or hostile
    /// peer rather than an environmental failure.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::Format(_)
                | Self::SerialOrder { .. }
                | Self::BusImpersonation
                | Self::DescriptorShortfall { .. }
                | Self::TooManyPendingReplies { .. }
                | Self::UnexpectedCredentialByte
                | Self::AuthLineTooLong { .. }
        )
    }
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_order_is_protocol_violation() {
        let err = ProxyError::SerialOrder { serial: 3, last: 5 };
        assert!(err.is_protocol_violation());
        let msg = err.to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains('5'));
    }

    #[test]
    fn io_error_is_not_protocol_violation() {
        let err = ProxyError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(!err.is_protocol_violation());
    }

    #[test]
    fn format_error_is_protocol_violation() {
        let err = ProxyError::from(FormatError::ZeroSerial);
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn stray_credential_byte_is_protocol_violation() {
        assert!(ProxyError::UnexpectedCredentialByte.is_protocol_violation());
    }

    #[test]
    fn queue_overflow_is_environmental() {
        // Overflow closes the connection but says nothing about the
        // peer's protocol conformance.
        let err = ProxyError::QueueOverflow {
            queued: 1,
            max: 0,
        };
        assert!(!err.is_protocol_violation());
    }
}
