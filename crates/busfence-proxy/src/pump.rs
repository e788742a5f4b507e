//! Socket pumps.
//!
//! Each side of a proxied connection (client socket, bus socket) is
//! split into a [`ReadPump`] and a [`WritePump`] sharing the stream
//! behind an `Arc`, so a `select!` loop can poll all four halves
//! independently. The read half turns the raw byte flow into discrete
//! units: the one-byte credential exchange, newline-terminated
//! authentication lines, and framed messages with their out-of-band
//! file descriptors attached. The write half is a bounded queue of
//! [`Buffer`]s drained as the socket becomes writable.
//!
//! Descriptor passing goes through `sendmsg`/`recvmsg` directly; tokio's
//! `try_io` bridges the readiness model so the nonblocking syscalls
//! compose with `select!`. Received descriptors are queued per side and
//! attached to the message whose header claims them. The kernel
//! delivers `SCM_RIGHTS` attached to bytes of the carrying message, so
//! once a message's final byte has been read every descriptor it claims
//! has either arrived or never will; a shortfall at that point is a
//! protocol violation.
//!
//! [`ReadPump::next_unit`] is cancel-safe: bytes are moved into the
//! internal buffer in the same poll that reads them, so a branch losing
//! a `select!` race never loses data.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use busfence_core::wire::{decode_header, required_message_len, Header, FIXED_HEADER_LEN};
use nix::cmsg_space;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, UnixCredentials,
};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::trace;

use crate::buffer::Buffer;
use crate::error::{ProxyError, ProxyResult, MAX_AUTH_LINE};

/// Read chunk size. Large enough that a typical message arrives whole.
const READ_CHUNK: usize = 16 * 1024;

/// Most descriptors one `recvmsg` is prepared to accept.
const MAX_FDS_PER_CHUNK: usize = 16;

/// What the reading half currently expects from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The single credential byte that precedes authentication.
    CredentialByte,
    /// Newline-terminated SASL lines.
    Auth,
    /// Framed messages.
    Messages,
}

/// One unit of inbound traffic.
#[derive(Debug)]
pub enum Inbound {
    /// The credential byte. The pump advances itself to [`Phase::Auth`].
    CredentialByte(u8),
    /// One authentication line, terminator included.
    AuthLine(Vec<u8>),
    /// One complete message with its claimed descriptors attached.
    Message(Header, Buffer),
    /// The peer closed its writing end.
    Closed,
}

/// Splits a connected stream into its two pump halves.
///
/// The client side starts in [`Phase::CredentialByte`]; the bus side
/// never sends a credential byte toward us and starts in
/// [`Phase::Auth`].
#[must_use]
pub fn split(
    stream: UnixStream,
    label: &'static str,
    phase: Phase,
    max_queued: usize,
) -> (ReadPump, WritePump) {
    let stream = Arc::new(stream);
    let read = ReadPump {
        stream: Arc::clone(&stream),
        label,
        phase,
        inbuf: Vec::new(),
        in_fds: VecDeque::new(),
    };
    let write = WritePump {
        stream,
        label,
        outq: VecDeque::new(),
        queued_bytes: 0,
        max_queued: max_queued.max(1),
    };
    (read, write)
}

/// The reading half of one side.
pub struct ReadPump {
    stream: Arc<UnixStream>,
    label: &'static str,
    phase: Phase,
    inbuf: Vec<u8>,
    in_fds: VecDeque<OwnedFd>,
}

impl ReadPump {
    /// The current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Switches to a new phase.
    ///
    /// Bytes already buffered carry over; the leftover after a `BEGIN`
    /// line is the start of the binary stream.
    pub fn set_phase(&mut self, phase: Phase) {
        trace!(side = self.label, ?phase, "phase change");
        self.phase = phase;
    }

    /// Awaits and returns the next inbound unit.
    ///
    /// Cancel-safe: losing a `select!` race costs nothing, the partial
    /// unit stays buffered.
    ///
    /// # Errors
    ///
    /// Fails on socket errors and on protocol violations (oversized or
    /// malformed frames, descriptor shortfall).
    pub async fn next_unit(&mut self) -> ProxyResult<Inbound> {
        loop {
            if let Some(unit) = self.extract_unit()? {
                return Ok(unit);
            }
            self.stream.readable().await?;
            match self.try_read_chunk() {
                Ok(0) => return Ok(Inbound::Closed),
                Ok(n) => trace!(side = self.label, bytes = n, "read chunk"),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Tries to carve one complete unit out of the input buffer.
    fn extract_unit(&mut self) -> ProxyResult<Option<Inbound>> {
        match self.phase {
            Phase::CredentialByte => {
                if self.inbuf.is_empty() {
                    return Ok(None);
                }
                let byte = self.inbuf.remove(0);
                self.phase = Phase::Auth;
                Ok(Some(Inbound::CredentialByte(byte)))
            }
            Phase::Auth => {
                if let Some(at) = self.inbuf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = self.inbuf.drain(..=at).collect();
                    return Ok(Some(Inbound::AuthLine(line)));
                }
                if self.inbuf.len() > MAX_AUTH_LINE {
                    return Err(ProxyError::AuthLineTooLong { max: MAX_AUTH_LINE });
                }
                Ok(None)
            }
            Phase::Messages => {
                if self.inbuf.len() < FIXED_HEADER_LEN {
                    return Ok(None);
                }
                let need = required_message_len(&self.inbuf)?;
                if self.inbuf.len() < need {
                    return Ok(None);
                }
                let bytes: Vec<u8> = self.inbuf.drain(..need).collect();
                let header = decode_header(&bytes)?;
                let claimed = header.unix_fds as usize;
                if claimed > self.in_fds.len() {
                    return Err(ProxyError::DescriptorShortfall {
                        declared: header.unix_fds,
                        available: self.in_fds.len(),
                    });
                }
                let fds: Vec<OwnedFd> = self.in_fds.drain(..claimed).collect();
                Ok(Some(Inbound::Message(header, Buffer::with_fds(bytes, fds))))
            }
        }
    }

    /// One nonblocking `recvmsg` into the input buffer.
    ///
    /// Returns the byte count; zero means the peer closed. Descriptors
    /// riding in ancillary data are queued in arrival order.
    fn try_read_chunk(&mut self) -> io::Result<usize> {
        let Self {
            stream,
            inbuf,
            in_fds,
            ..
        } = self;
        stream.try_io(Interest::READABLE, || {
            let mut space = [0u8; READ_CHUNK];
            let mut iov = [IoSliceMut::new(&mut space)];
            let mut cmsg = cmsg_space!([RawFd; MAX_FDS_PER_CHUNK]);
            let msg = recvmsg::<UnixAddr>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
            let n = msg.bytes;
            for cmsg in msg
                .cmsgs()
                .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?
            {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    for fd in fds {
                        // recvmsg installed the descriptor in our table;
                        // we are its sole owner from here.
                        in_fds.push_back(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }
            drop(msg);
            inbuf.extend_from_slice(&space[..n]);
            Ok(n)
        })
    }
}

struct Outgoing {
    buffer: Buffer,
    offset: usize,
}

/// The writing half of one side.
pub struct WritePump {
    stream: Arc<UnixStream>,
    label: &'static str,
    outq: VecDeque<Outgoing>,
    queued_bytes: usize,
    max_queued: usize,
}

impl WritePump {
    /// Queues a buffer for writing.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::QueueOverflow`] when the queued byte total
    /// would exceed the configured cap; the caller must close the
    /// connection.
    pub fn enqueue(&mut self, buffer: Buffer) -> ProxyResult<()> {
        let queued = self.queued_bytes + buffer.len();
        if queued > self.max_queued {
            return Err(ProxyError::QueueOverflow {
                queued,
                max: self.max_queued,
            });
        }
        trace!(side = self.label, bytes = buffer.len(), "enqueue");
        self.queued_bytes = queued;
        self.outq.push_back(Outgoing { buffer, offset: 0 });
        Ok(())
    }

    /// Returns `true` if queued output remains.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.outq.is_empty()
    }

    /// Waits until the socket reports writability.
    ///
    /// # Errors
    ///
    /// Propagates socket errors.
    pub async fn writable(&self) -> io::Result<()> {
        self.stream.writable().await
    }

    /// Writes as much queued output as the socket accepts right now.
    ///
    /// Descriptors and credentials ride on the first byte of their
    /// buffer; once the kernel accepts that byte it holds its own
    /// references and ours are released.
    ///
    /// # Errors
    ///
    /// Propagates socket errors. `WouldBlock` is absorbed.
    pub fn write_pending(&mut self) -> ProxyResult<()> {
        let Self {
            stream,
            outq,
            queued_bytes,
            ..
        } = self;
        while let Some(front) = outq.front_mut() {
            let creds = UnixCredentials::new();
            let raw_fds: Vec<RawFd> = front
                .buffer
                .fds()
                .iter()
                .map(AsRawFd::as_raw_fd)
                .collect();
            let result = stream.try_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(&front.buffer.bytes()[front.offset..])];
                let mut cmsgs: Vec<ControlMessage<'_>> = Vec::new();
                if front.offset == 0 {
                    if front.buffer.sends_credentials() {
                        cmsgs.push(ControlMessage::ScmCredentials(&creds));
                    }
                    if !raw_fds.is_empty() {
                        cmsgs.push(ControlMessage::ScmRights(&raw_fds));
                    }
                }
                sendmsg::<UnixAddr>(
                    stream.as_raw_fd(),
                    &iov,
                    &cmsgs,
                    MsgFlags::MSG_NOSIGNAL,
                    None,
                )
                .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
            });
            let written = match result {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            if written > 0 && front.offset == 0 {
                drop(front.buffer.take_fds());
            }
            front.offset += written;
            *queued_bytes -= written;
            if front.offset == front.buffer.len() {
                outq.pop_front();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use busfence_core::wire::{Endian, MessageBuilder, MessageKind};
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::error::DEFAULT_MAX_QUEUED_BYTES;

    fn call(serial: u32) -> Vec<u8> {
        MessageBuilder::new(Endian::Little, MessageKind::MethodCall, serial)
            .path("/org/example")
            .member("Frob")
            .destination("com.example.Service")
            .build()
    }

    fn reader(stream: UnixStream, phase: Phase) -> ReadPump {
        split(stream, "test", phase, DEFAULT_MAX_QUEUED_BYTES).0
    }

    #[tokio::test]
    async fn credential_byte_then_auth_lines() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut pump = reader(ours, Phase::CredentialByte);
        let mut theirs = theirs;
        theirs.write_all(b"\0AUTH EXTERNAL 30\r\n").await.unwrap();

        assert!(matches!(
            pump.next_unit().await.unwrap(),
            Inbound::CredentialByte(0)
        ));
        assert_eq!(pump.phase(), Phase::Auth);
        match pump.next_unit().await.unwrap() {
            Inbound::AuthLine(line) => assert_eq!(line, b"AUTH EXTERNAL 30\r\n"),
            other => panic!("unexpected unit: {other:?}"),
        }
    }

    #[tokio::test]
    async fn auth_line_split_across_writes() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut pump = reader(ours, Phase::Auth);
        let mut theirs = theirs;
        theirs.write_all(b"BEG").await.unwrap();
        theirs.flush().await.unwrap();
        tokio::task::yield_now().await;
        theirs.write_all(b"IN\r\nleftover").await.unwrap();

        match pump.next_unit().await.unwrap() {
            Inbound::AuthLine(line) => assert_eq!(line, b"BEGIN\r\n"),
            other => panic!("unexpected unit: {other:?}"),
        }
        // The leftover bytes belong to the binary stream.
        pump.set_phase(Phase::Messages);
        assert_eq!(pump.inbuf, b"leftover");
    }

    #[tokio::test]
    async fn message_reassembled_from_fragments() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut pump = reader(ours, Phase::Messages);
        let mut theirs = theirs;

        let message = call(7);
        let (a, b) = message.split_at(9);
        theirs.write_all(a).await.unwrap();
        theirs.flush().await.unwrap();
        tokio::task::yield_now().await;
        theirs.write_all(b).await.unwrap();

        match pump.next_unit().await.unwrap() {
            Inbound::Message(header, buffer) => {
                assert_eq!(header.serial, 7);
                assert_eq!(buffer.bytes(), message.as_slice());
                assert!(buffer.fds().is_empty());
            }
            other => panic!("unexpected unit: {other:?}"),
        }
    }

    #[tokio::test]
    async fn two_messages_in_one_chunk() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut pump = reader(ours, Phase::Messages);
        let mut theirs = theirs;

        let mut bytes = call(1);
        bytes.extend_from_slice(&call(2));
        theirs.write_all(&bytes).await.unwrap();

        for expected in [1u32, 2] {
            match pump.next_unit().await.unwrap() {
                Inbound::Message(header, _) => assert_eq!(header.serial, expected),
                other => panic!("unexpected unit: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn descriptor_shortfall_is_fatal() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut pump = reader(ours, Phase::Messages);
        let mut theirs = theirs;

        let message = MessageBuilder::new(Endian::Little, MessageKind::MethodCall, 3)
            .path("/org/example")
            .member("TakeFd")
            .destination("com.example.Service")
            .unix_fds(1)
            .build();
        // Plain write: the claimed descriptor never arrives.
        theirs.write_all(&message).await.unwrap();

        let err = pump.next_unit().await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::DescriptorShortfall {
                declared: 1,
                available: 0
            }
        ));
    }

    #[tokio::test]
    async fn descriptors_travel_with_their_message() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut receiver = reader(ours, Phase::Messages);
        let (_, mut sender) = split(theirs, "peer", Phase::Messages, DEFAULT_MAX_QUEUED_BYTES);

        let fd = OwnedFd::from(File::open("/dev/null").unwrap());
        let message = MessageBuilder::new(Endian::Little, MessageKind::MethodCall, 3)
            .path("/org/example")
            .member("TakeFd")
            .destination("com.example.Service")
            .unix_fds(1)
            .build();
        sender
            .enqueue(Buffer::with_fds(message.clone(), vec![fd]))
            .unwrap();
        sender.writable().await.unwrap();
        sender.write_pending().unwrap();
        assert!(!sender.has_pending());

        match receiver.next_unit().await.unwrap() {
            Inbound::Message(header, buffer) => {
                assert_eq!(header.unix_fds, 1);
                assert_eq!(header.serial, 3);
                assert_eq!(buffer.bytes(), message.as_slice());
                assert_eq!(buffer.fds().len(), 1);
            }
            other => panic!("unexpected unit: {other:?}"),
        }
    }

    #[tokio::test]
    async fn credential_buffer_reaches_peer() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let (_, mut pump) = split(ours, "bus", Phase::Auth, DEFAULT_MAX_QUEUED_BYTES);
        pump.enqueue(Buffer::credential_byte(0)).unwrap();
        pump.writable().await.unwrap();
        pump.write_pending().unwrap();

        let mut theirs = theirs;
        let mut byte = [1u8; 1];
        theirs.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte, [0]);
    }

    #[tokio::test]
    async fn queue_overflow_closes() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let (_, mut pump) = split(ours, "client", Phase::Messages, 8);
        pump.enqueue(Buffer::from_bytes(vec![0; 8])).unwrap();
        let err = pump.enqueue(Buffer::from_bytes(vec![0; 1])).unwrap_err();
        assert!(matches!(
            err,
            ProxyError::QueueOverflow { queued: 9, max: 8 }
        ));
    }

    #[tokio::test]
    async fn eof_reports_closed() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut pump = reader(ours, Phase::Messages);
        drop(theirs);
        assert!(matches!(pump.next_unit().await.unwrap(), Inbound::Closed));
    }

    #[tokio::test]
    async fn oversized_auth_line_is_rejected() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut pump = reader(ours, Phase::Auth);
        let mut theirs = theirs;
        let junk = vec![b'x'; MAX_AUTH_LINE + 1];
        theirs.write_all(&junk).await.unwrap();

        let err = pump.next_unit().await.unwrap_err();
        assert!(matches!(err, ProxyError::AuthLineTooLong { .. }));
    }
}
