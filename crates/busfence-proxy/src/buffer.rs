//! Owned message buffers.
//!
//! A [`Buffer`] is one fully-framed unit of traffic: a byte region plus
//! the file descriptors that arrived out-of-band with it. Ownership is a
//! move, never a share: a buffer is held by exactly one of the reading
//! pump, the filter engine, or the writing pump's queue, and dropping it
//! closes any descriptors still attached.

use std::os::fd::OwnedFd;

/// One unit of traffic moving through the proxy.
#[derive(Debug)]
pub struct Buffer {
    bytes: Vec<u8>,
    fds: Vec<OwnedFd>,
    send_credentials: bool,
}

impl Buffer {
    /// Wraps plain bytes with no descriptors.
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            fds: Vec::new(),
            send_credentials: false,
        }
    }

    /// Wraps a framed message together with its attached descriptors.
    #[must_use]
    pub const fn with_fds(bytes: Vec<u8>, fds: Vec<OwnedFd>) -> Self {
        Self {
            bytes,
            fds,
            send_credentials: false,
        }
    }

    /// The single-byte credential exchange buffer.
    ///
    /// Written with the platform's credential-passing primitive rather
    /// than a plain write.
    #[must_use]
    pub fn credential_byte(byte: u8) -> Self {
        Self {
            bytes: vec![byte],
            fds: Vec::new(),
            send_credentials: true,
        }
    }

    /// The byte region.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable access to the byte region (serial patching).
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Byte length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the byte region is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Attached descriptors, in arrival order.
    #[must_use]
    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    /// Detaches the descriptors, leaving the bytes in place.
    ///
    /// Called by the writing pump once the descriptors have been handed
    /// to the kernel; the kernel holds its own references from that
    /// point, so ours are dropped.
    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }

    /// Returns `true` if this buffer must be written with credentials
    /// attached.
    #[must_use]
    pub const fn sends_credentials(&self) -> bool {
        self.send_credentials
    }
}
