//! D-Bus wire header codec.
//!
//! Decodes and encodes the D-Bus message header: a fixed 16-byte preamble
//! followed by a variable-length, 8-byte-aligned array of typed header
//! fields. Decoding happens before any routing decision is made, and this
//! module is the trust boundary for client-controlled bytes: every
//! declared length is checked against the message boundary before it is
//! used, and structural ambiguity is rejected rather than ignored.
//!
//! # Wire Format
//!
//! ```text
//! +--------+--------+--------+--------+----------------+----------------+
//! | endian | kind   | flags  | proto  | body length    | serial         |
//! | 1 byte | 1 byte | 1 byte | 1 byte | u32            | u32 (non-zero) |
//! +--------+--------+--------+--------+----------------+----------------+
//! | field array length (u32) | field entries, each 8-byte aligned ...   |
//! +--------------------------+------------------------------------------+
//! | padding to 8 bytes       | body (length from preamble)              |
//! +--------------------------+------------------------------------------+
//! ```
//!
//! Each field entry is a `(code: u8, variant)` pair; the variant carries a
//! one-byte-length signature followed by the value. Strings are u32
//! length-prefixed and NUL-terminated; signatures are u8 length-prefixed
//! and NUL-terminated.
//!
//! # Rejection Policy
//!
//! The decoder rejects (it never silently ignores):
//!
//! - unknown message kinds and unknown header field codes
//! - any declared length that would read past the message boundary
//! - duplicate header fields and field signature mismatches
//! - headers missing the fields their message kind requires

use std::fmt;

use thiserror::Error;

/// Maximum total message size in bytes (2^27, the D-Bus protocol limit).
///
/// Enforced before allocation so a hostile peer cannot make the proxy
/// buffer an absurd message.
pub const MAX_MESSAGE_SIZE: usize = 1 << 27;

/// Size of the fixed message preamble.
pub const FIXED_HEADER_LEN: usize = 16;

/// Major protocol version this codec understands.
pub const PROTOCOL_MAJOR_VERSION: u8 = 1;

/// The message bus's own well-known name.
pub const BUS_NAME: &str = "org.freedesktop.DBus";

/// The message bus's private object path.
pub const BUS_PATH: &str = "/org/freedesktop/DBus";

/// The message bus's private interface.
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// The peer interface, used for the harmless `Ping` round trip.
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// Flag bit: the sender does not expect a reply to this message.
pub const FLAG_NO_REPLY_EXPECTED: u8 = 0x1;

/// Flag bit: do not auto-start the destination service.
pub const FLAG_NO_AUTO_START: u8 = 0x2;

// Header field codes.
const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

/// Structural errors raised while decoding a message header.
///
/// Any of these is evidence of a buggy or hostile peer; the proxy treats
/// them as fatal for the connection that produced the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// A declared length would read past the message boundary.
    #[error("message truncated: wanted {wanted} bytes, {available} available")]
    Truncated {
        /// Bytes needed to satisfy the read.
        wanted: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// The endianness marker is neither `l` nor `B`.
    #[error("invalid endianness marker {0:#04x}")]
    InvalidEndianMarker(u8),

    /// The message kind byte is not one of the four defined kinds.
    #[error("unknown message kind {0}")]
    UnknownMessageKind(u8),

    /// The major protocol version is not supported.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Declared message size exceeds [`MAX_MESSAGE_SIZE`].
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge {
        /// Declared total size.
        size: usize,
        /// Enforced limit.
        max: usize,
    },

    /// The serial field is zero.
    #[error("message serial must be non-zero")]
    ZeroSerial,

    /// A header field code outside the defined set was seen.
    #[error("unknown header field code {0}")]
    UnknownHeaderField(u8),

    /// The same header field appeared twice.
    #[error("duplicate header field code {0}")]
    DuplicateHeaderField(u8),

    /// A header field carried a value of the wrong type.
    #[error("header field {code} has signature {found:?}, expected {expected:?}")]
    FieldSignatureMismatch {
        /// Field code.
        code: u8,
        /// Signature the field must carry.
        expected: &'static str,
        /// Signature actually present.
        found: String,
    },

    /// A string or signature was not NUL-terminated.
    #[error("string is not NUL-terminated")]
    MissingNulTerminator,

    /// A string was not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// A header is missing a field its message kind requires.
    #[error("{kind} message is missing required {field} header field")]
    MissingRequiredField {
        /// Kind of the offending message.
        kind: MessageKind,
        /// Name of the missing field.
        field: &'static str,
    },

    /// The body signature does not match what the operation requires.
    #[error("body signature {found:?} does not start with expected {expected:?}")]
    UnexpectedBodySignature {
        /// Signature prefix the caller requires.
        expected: &'static str,
        /// Signature actually declared.
        found: String,
    },
}

/// Byte order of a message, taken from its endianness marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// Little-endian (`l` marker).
    Little,
    /// Big-endian (`B` marker).
    Big,
}

impl Endian {
    /// Parses the on-wire endianness marker.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidEndianMarker`] for any byte other
    /// than `l` or `B`.
    pub const fn from_marker(byte: u8) -> Result<Self, FormatError> {
        match byte {
            b'l' => Ok(Self::Little),
            b'B' => Ok(Self::Big),
            other => Err(FormatError::InvalidEndianMarker(other)),
        }
    }

    /// Returns the on-wire marker byte.
    #[must_use]
    pub const fn marker(self) -> u8 {
        match self {
            Self::Little => b'l',
            Self::Big => b'B',
        }
    }

    fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        }
    }

    fn write_u32(self, value: u32) -> [u8; 4] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }
}

/// The four defined message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A method call, possibly expecting a reply.
    MethodCall,
    /// A successful reply to a method call.
    MethodReturn,
    /// An error reply to a method call.
    Error,
    /// A signal emission.
    Signal,
}

impl MessageKind {
    /// Parses the on-wire kind byte.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::UnknownMessageKind`] for anything outside
    /// the defined range. Kind 0 (invalid) is deliberately included in
    /// the rejection.
    pub const fn from_wire(byte: u8) -> Result<Self, FormatError> {
        match byte {
            1 => Ok(Self::MethodCall),
            2 => Ok(Self::MethodReturn),
            3 => Ok(Self::Error),
            4 => Ok(Self::Signal),
            other => Err(FormatError::UnknownMessageKind(other)),
        }
    }

    /// Returns the on-wire kind byte.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::MethodCall => 1,
            Self::MethodReturn => 2,
            Self::Error => 3,
            Self::Signal => 4,
        }
    }

    /// Returns `true` for method returns and errors.
    #[must_use]
    pub const fn is_reply(self) -> bool {
        matches!(self, Self::MethodReturn | Self::Error)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MethodCall => "method-call",
            Self::MethodReturn => "method-return",
            Self::Error => "error",
            Self::Signal => "signal",
        };
        f.write_str(name)
    }
}

/// A fully decoded and validated message header.
///
/// Produced only by [`decode_header`], which guarantees the invariants
/// documented on each accessor: a method call has a path and member, a
/// reply has a reply serial, an error additionally has an error name,
/// and a signal has path, interface and member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Byte order of the whole message.
    pub endian: Endian,
    /// Message kind.
    pub kind: MessageKind,
    /// Raw flag bits.
    pub flags: u8,
    /// Declared body length in bytes.
    pub body_len: u32,
    /// Sender-chosen serial, non-zero.
    pub serial: u32,
    /// Object path (method calls and signals).
    pub path: Option<String>,
    /// Interface name.
    pub interface: Option<String>,
    /// Member (method or signal) name.
    pub member: Option<String>,
    /// Error name (error replies only).
    pub error_name: Option<String>,
    /// Serial of the message this one replies to.
    pub reply_serial: Option<u32>,
    /// Destination bus name.
    pub destination: Option<String>,
    /// Sender bus name (filled in by the bus).
    pub sender: Option<String>,
    /// Body signature.
    pub signature: Option<String>,
    /// Number of file descriptors attached to the message.
    pub unix_fds: u32,
    header_len: usize,
}

impl Header {
    /// Total length of the header region, including padding to the
    /// 8-byte body boundary.
    #[must_use]
    pub const fn header_len(&self) -> usize {
        self.header_len
    }

    /// Total message length (header region plus body).
    #[must_use]
    pub const fn total_len(&self) -> usize {
        self.header_len + self.body_len as usize
    }

    /// Returns `true` if this message is a method call whose sender
    /// expects a reply.
    #[must_use]
    pub const fn expects_reply(&self) -> bool {
        matches!(self.kind, MessageKind::MethodCall)
            && self.flags & FLAG_NO_REPLY_EXPECTED == 0
    }

    /// Returns `true` if the no-auto-start flag is set.
    #[must_use]
    pub const fn no_auto_start(&self) -> bool {
        self.flags & FLAG_NO_AUTO_START != 0
    }

    /// Body region of `message`, bounds-checked against the declared
    /// body length.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Truncated`] if `message` is shorter than
    /// the header declares.
    pub fn body_region<'a>(&self, message: &'a [u8]) -> Result<&'a [u8], FormatError> {
        let end = self.total_len();
        if message.len() < end {
            return Err(FormatError::Truncated {
                wanted: end,
                available: message.len(),
            });
        }
        Ok(&message[self.header_len..end])
    }
}

const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Bounds-checked reader over a byte region.
///
/// Alignment is computed relative to the start of the region, so callers
/// must hand it regions that start on an 8-byte message boundary (the
/// field array and the body both do).
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> Cursor<'a> {
    pub(crate) const fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            data,
            pos: 0,
            endian,
        }
    }

    pub(crate) const fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) const fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        let end = self.pos.checked_add(len).ok_or(FormatError::Truncated {
            wanted: usize::MAX,
            available: self.data.len(),
        })?;
        if end > self.data.len() {
            return Err(FormatError::Truncated {
                wanted: end,
                available: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn align(&mut self, alignment: usize) -> Result<(), FormatError> {
        let aligned = align_up(self.pos, alignment);
        if aligned > self.data.len() {
            return Err(FormatError::Truncated {
                wanted: aligned,
                available: self.data.len(),
            });
        }
        self.pos = aligned;
        Ok(())
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, FormatError> {
        self.align(4)?;
        let bytes = self.take(4)?;
        Ok(self.endian.read_u32([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a u32-length-prefixed, NUL-terminated string.
    pub(crate) fn read_string(&mut self) -> Result<&'a str, FormatError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        if self.take(1)?[0] != 0 {
            return Err(FormatError::MissingNulTerminator);
        }
        std::str::from_utf8(bytes).map_err(|_| FormatError::InvalidUtf8)
    }

    /// Reads a u8-length-prefixed, NUL-terminated signature.
    pub(crate) fn read_signature(&mut self) -> Result<&'a str, FormatError> {
        let len = usize::from(self.read_u8()?);
        let bytes = self.take(len)?;
        if self.take(1)?[0] != 0 {
            return Err(FormatError::MissingNulTerminator);
        }
        std::str::from_utf8(bytes).map_err(|_| FormatError::InvalidUtf8)
    }
}

/// Endianness-aware writer used by the encoder and the body writer.
pub(crate) struct WireWriter {
    buf: Vec<u8>,
    endian: Endian,
}

impl WireWriter {
    pub(crate) const fn new(endian: Endian) -> Self {
        Self {
            buf: Vec::new(),
            endian,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn align(&mut self, alignment: usize) {
        let aligned = align_up(self.buf.len(), alignment);
        self.buf.resize(aligned, 0);
    }

    pub(crate) fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub(crate) fn put_u32(&mut self, value: u32) {
        self.align(4);
        self.buf.extend_from_slice(&self.endian.write_u32(value));
    }

    pub(crate) fn patch_u32(&mut self, at: usize, value: u32) {
        self.buf[at..at + 4].copy_from_slice(&self.endian.write_u32(value));
    }

    pub(crate) fn put_string(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
    }

    pub(crate) fn put_signature(&mut self, value: &str) {
        self.put_u8(value.len() as u8);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Computes the total message length from the fixed 16-byte preamble.
///
/// Used by the I/O layer to frame a message before the full header has
/// arrived. Only the preamble is validated here; the field array itself
/// is validated by [`decode_header`] once buffered.
///
/// # Errors
///
/// Returns a [`FormatError`] if the endianness marker is invalid or the
/// declared total exceeds [`MAX_MESSAGE_SIZE`].
pub fn required_message_len(preamble: &[u8]) -> Result<usize, FormatError> {
    if preamble.len() < FIXED_HEADER_LEN {
        return Err(FormatError::Truncated {
            wanted: FIXED_HEADER_LEN,
            available: preamble.len(),
        });
    }
    let endian = Endian::from_marker(preamble[0])?;
    let body_len = endian.read_u32([preamble[4], preamble[5], preamble[6], preamble[7]]);
    let fields_len = endian.read_u32([preamble[12], preamble[13], preamble[14], preamble[15]]);

    let total = FIXED_HEADER_LEN as u64
        + align_up(fields_len as usize, 8) as u64
        + u64::from(body_len);
    if total > MAX_MESSAGE_SIZE as u64 {
        return Err(FormatError::MessageTooLarge {
            size: total as usize,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(total as usize)
}

fn expect_signature(
    code: u8,
    expected: &'static str,
    found: &str,
) -> Result<(), FormatError> {
    if found == expected {
        Ok(())
    } else {
        Err(FormatError::FieldSignatureMismatch {
            code,
            expected,
            found: found.to_owned(),
        })
    }
}

fn set_once<T>(slot: &mut Option<T>, code: u8, value: T) -> Result<(), FormatError> {
    if slot.is_some() {
        return Err(FormatError::DuplicateHeaderField(code));
    }
    *slot = Some(value);
    Ok(())
}

/// Decodes and validates a message header.
///
/// `data` must contain at least the full header region (preamble plus
/// field array); it may or may not include the body. The caller is
/// expected to have framed the message with [`required_message_len`]
/// first.
///
/// # Errors
///
/// Returns a [`FormatError`] for any structural defect: truncated or
/// overlong lengths, unknown kinds or field codes, duplicate fields,
/// signature mismatches, or a header missing the fields its kind
/// requires.
pub fn decode_header(data: &[u8]) -> Result<Header, FormatError> {
    if data.len() < FIXED_HEADER_LEN {
        return Err(FormatError::Truncated {
            wanted: FIXED_HEADER_LEN,
            available: data.len(),
        });
    }

    let endian = Endian::from_marker(data[0])?;
    let kind = MessageKind::from_wire(data[1])?;
    let flags = data[2];
    let version = data[3];
    if version != PROTOCOL_MAJOR_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let body_len = endian.read_u32([data[4], data[5], data[6], data[7]]);
    let serial = endian.read_u32([data[8], data[9], data[10], data[11]]);
    if serial == 0 {
        return Err(FormatError::ZeroSerial);
    }
    let fields_len = endian.read_u32([data[12], data[13], data[14], data[15]]) as usize;

    let header_len = FIXED_HEADER_LEN + align_up(fields_len, 8);
    let total = header_len as u64 + u64::from(body_len);
    if total > MAX_MESSAGE_SIZE as u64 {
        return Err(FormatError::MessageTooLarge {
            size: total as usize,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let fields_end = FIXED_HEADER_LEN + fields_len;
    if data.len() < fields_end {
        return Err(FormatError::Truncated {
            wanted: fields_end,
            available: data.len(),
        });
    }

    let mut header = Header {
        endian,
        kind,
        flags,
        body_len,
        serial,
        path: None,
        interface: None,
        member: None,
        error_name: None,
        reply_serial: None,
        destination: None,
        sender: None,
        signature: None,
        unix_fds: 0,
        header_len,
    };

    // The field array starts at offset 16, which is 8-aligned, so
    // alignment relative to the slice matches alignment relative to the
    // message.
    let mut cur = Cursor::new(&data[FIXED_HEADER_LEN..fields_end], endian);
    let mut seen_unix_fds = false;
    while cur.remaining() > 0 {
        cur.align(8)?;
        if cur.remaining() == 0 {
            break;
        }
        let code = cur.read_u8()?;
        let sig = cur.read_signature()?.to_owned();
        match code {
            FIELD_PATH => {
                expect_signature(code, "o", &sig)?;
                let value = cur.read_string()?.to_owned();
                set_once(&mut header.path, code, value)?;
            }
            FIELD_INTERFACE => {
                expect_signature(code, "s", &sig)?;
                let value = cur.read_string()?.to_owned();
                set_once(&mut header.interface, code, value)?;
            }
            FIELD_MEMBER => {
                expect_signature(code, "s", &sig)?;
                let value = cur.read_string()?.to_owned();
                set_once(&mut header.member, code, value)?;
            }
            FIELD_ERROR_NAME => {
                expect_signature(code, "s", &sig)?;
                let value = cur.read_string()?.to_owned();
                set_once(&mut header.error_name, code, value)?;
            }
            FIELD_REPLY_SERIAL => {
                expect_signature(code, "u", &sig)?;
                let value = cur.read_u32()?;
                set_once(&mut header.reply_serial, code, value)?;
            }
            FIELD_DESTINATION => {
                expect_signature(code, "s", &sig)?;
                let value = cur.read_string()?.to_owned();
                set_once(&mut header.destination, code, value)?;
            }
            FIELD_SENDER => {
                expect_signature(code, "s", &sig)?;
                let value = cur.read_string()?.to_owned();
                set_once(&mut header.sender, code, value)?;
            }
            FIELD_SIGNATURE => {
                expect_signature(code, "g", &sig)?;
                let value = cur.read_signature()?.to_owned();
                set_once(&mut header.signature, code, value)?;
            }
            FIELD_UNIX_FDS => {
                expect_signature(code, "u", &sig)?;
                if seen_unix_fds {
                    return Err(FormatError::DuplicateHeaderField(code));
                }
                seen_unix_fds = true;
                header.unix_fds = cur.read_u32()?;
            }
            other => return Err(FormatError::UnknownHeaderField(other)),
        }
    }

    validate_required_fields(&header)?;
    Ok(header)
}

fn validate_required_fields(header: &Header) -> Result<(), FormatError> {
    let missing = |field: &'static str| FormatError::MissingRequiredField {
        kind: header.kind,
        field,
    };
    match header.kind {
        MessageKind::MethodCall => {
            if header.path.is_none() {
                return Err(missing("path"));
            }
            if header.member.is_none() {
                return Err(missing("member"));
            }
        }
        MessageKind::MethodReturn => {
            if header.reply_serial.is_none() {
                return Err(missing("reply-serial"));
            }
        }
        MessageKind::Error => {
            if header.error_name.is_none() {
                return Err(missing("error-name"));
            }
            if header.reply_serial.is_none() {
                return Err(missing("reply-serial"));
            }
        }
        MessageKind::Signal => {
            if header.path.is_none() {
                return Err(missing("path"));
            }
            if header.interface.is_none() {
                return Err(missing("interface"));
            }
            if header.member.is_none() {
                return Err(missing("member"));
            }
        }
    }
    if header.body_len > 0 && header.signature.is_none() {
        return Err(missing("signature"));
    }
    Ok(())
}

/// Overwrites the serial of an already-encoded message in place.
///
/// Used when a stashed synthesized reply is swapped in for a real bus
/// reply: the synthesized message takes over the real reply's serial so
/// the client observes a serial from the bus's own sequence.
///
/// # Errors
///
/// Returns a [`FormatError`] if `message` is shorter than a preamble or
/// its endianness marker is invalid.
pub fn patch_serial(message: &mut [u8], serial: u32) -> Result<(), FormatError> {
    if message.len() < FIXED_HEADER_LEN {
        return Err(FormatError::Truncated {
            wanted: FIXED_HEADER_LEN,
            available: message.len(),
        });
    }
    let endian = Endian::from_marker(message[0])?;
    message[8..12].copy_from_slice(&endian.write_u32(serial));
    Ok(())
}

/// Builder for encoded messages.
///
/// Only used for traffic the proxy originates itself: the `Ping` round
/// trip, synthesized error replies, and rewritten name-list replies. It
/// never has to handle attacker input.
#[derive(Debug)]
pub struct MessageBuilder {
    endian: Endian,
    kind: MessageKind,
    flags: u8,
    serial: u32,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<u32>,
    destination: Option<String>,
    sender: Option<String>,
    signature: Option<String>,
    unix_fds: Option<u32>,
    body: Vec<u8>,
}

impl MessageBuilder {
    /// Starts a message of the given kind and serial.
    #[must_use]
    pub const fn new(endian: Endian, kind: MessageKind, serial: u32) -> Self {
        Self {
            endian,
            kind,
            flags: 0,
            serial,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: None,
            unix_fds: None,
            body: Vec::new(),
        }
    }

    /// Sets the raw flag bits.
    #[must_use]
    pub const fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the object path field.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the interface field.
    #[must_use]
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Sets the member field.
    #[must_use]
    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Sets the error name field.
    #[must_use]
    pub fn error_name(mut self, error_name: impl Into<String>) -> Self {
        self.error_name = Some(error_name.into());
        self
    }

    /// Sets the reply serial field.
    #[must_use]
    pub const fn reply_serial(mut self, serial: u32) -> Self {
        self.reply_serial = Some(serial);
        self
    }

    /// Sets the destination field.
    #[must_use]
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Sets the sender field.
    #[must_use]
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Sets the body signature field.
    #[must_use]
    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Sets the attached descriptor count field.
    #[must_use]
    pub const fn unix_fds(mut self, count: u32) -> Self {
        self.unix_fds = Some(count);
        self
    }

    /// Attaches an already-marshaled body.
    #[must_use]
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Encodes the message.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let mut fields = WireWriter::new(self.endian);
        let mut put_string_field = |fields: &mut WireWriter, code: u8, sig: &str, value: &str| {
            fields.align(8);
            fields.put_u8(code);
            fields.put_signature(sig);
            fields.put_string(value);
        };
        if let Some(value) = &self.path {
            put_string_field(&mut fields, FIELD_PATH, "o", value);
        }
        if let Some(value) = &self.interface {
            put_string_field(&mut fields, FIELD_INTERFACE, "s", value);
        }
        if let Some(value) = &self.member {
            put_string_field(&mut fields, FIELD_MEMBER, "s", value);
        }
        if let Some(value) = &self.error_name {
            put_string_field(&mut fields, FIELD_ERROR_NAME, "s", value);
        }
        if let Some(serial) = self.reply_serial {
            fields.align(8);
            fields.put_u8(FIELD_REPLY_SERIAL);
            fields.put_signature("u");
            fields.put_u32(serial);
        }
        if let Some(value) = &self.destination {
            put_string_field(&mut fields, FIELD_DESTINATION, "s", value);
        }
        if let Some(value) = &self.sender {
            put_string_field(&mut fields, FIELD_SENDER, "s", value);
        }
        if let Some(value) = &self.signature {
            fields.align(8);
            fields.put_u8(FIELD_SIGNATURE);
            fields.put_signature("g");
            fields.put_signature(value);
        }
        if let Some(count) = self.unix_fds {
            fields.align(8);
            fields.put_u8(FIELD_UNIX_FDS);
            fields.put_signature("u");
            fields.put_u32(count);
        }
        let fields_buf = fields.into_inner();

        let mut out = Vec::with_capacity(
            FIXED_HEADER_LEN + align_up(fields_buf.len(), 8) + self.body.len(),
        );
        out.push(self.endian.marker());
        out.push(self.kind.to_wire());
        out.push(self.flags);
        out.push(PROTOCOL_MAJOR_VERSION);
        out.extend_from_slice(&self.endian.write_u32(self.body.len() as u32));
        out.extend_from_slice(&self.endian.write_u32(self.serial));
        out.extend_from_slice(&self.endian.write_u32(fields_buf.len() as u32));
        out.extend_from_slice(&fields_buf);
        out.resize(align_up(out.len(), 8), 0);
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::body::BodyWriter;

    fn hello_message() -> Vec<u8> {
        MessageBuilder::new(Endian::Little, MessageKind::MethodCall, 1)
            .path(BUS_PATH)
            .interface(BUS_INTERFACE)
            .member("Hello")
            .destination(BUS_NAME)
            .build()
    }

    #[test]
    fn hello_preamble_bytes() {
        let msg = hello_message();
        assert_eq!(msg[0], b'l');
        assert_eq!(msg[1], 1); // method call
        assert_eq!(msg[2], 0);
        assert_eq!(msg[3], PROTOCOL_MAJOR_VERSION);
        assert_eq!(&msg[4..8], &[0, 0, 0, 0]); // empty body
        assert_eq!(&msg[8..12], &[1, 0, 0, 0]); // serial
        assert_eq!(msg.len() % 8, 0);
    }

    #[test]
    fn hello_round_trips() {
        let msg = hello_message();
        let header = decode_header(&msg).unwrap();
        assert_eq!(header.kind, MessageKind::MethodCall);
        assert_eq!(header.serial, 1);
        assert_eq!(header.path.as_deref(), Some(BUS_PATH));
        assert_eq!(header.member.as_deref(), Some("Hello"));
        assert_eq!(header.destination.as_deref(), Some(BUS_NAME));
        assert_eq!(header.body_len, 0);
        assert_eq!(header.total_len(), msg.len());
        assert!(header.expects_reply());
    }

    #[test]
    fn big_endian_round_trips() {
        let msg = MessageBuilder::new(Endian::Big, MessageKind::MethodCall, 7)
            .path("/org/example")
            .member("Frob")
            .destination("org.example.Target")
            .build();
        let header = decode_header(&msg).unwrap();
        assert_eq!(header.endian, Endian::Big);
        assert_eq!(header.serial, 7);
        assert_eq!(header.destination.as_deref(), Some("org.example.Target"));
    }

    #[test]
    fn error_reply_round_trips() {
        let mut body = BodyWriter::new(Endian::Little);
        body.put_string("no such name");
        let msg = MessageBuilder::new(Endian::Little, MessageKind::Error, 99)
            .error_name("org.freedesktop.DBus.Error.ServiceUnknown")
            .reply_serial(42)
            .destination(":1.7")
            .signature("s")
            .body(body.finish())
            .build();
        let header = decode_header(&msg).unwrap();
        assert_eq!(header.kind, MessageKind::Error);
        assert_eq!(header.reply_serial, Some(42));
        assert_eq!(
            header.error_name.as_deref(),
            Some("org.freedesktop.DBus.Error.ServiceUnknown")
        );
        assert_eq!(header.signature.as_deref(), Some("s"));
        assert!(header.body_len > 0);
    }

    #[test]
    fn required_len_accounts_for_field_padding() {
        let msg = hello_message();
        assert_eq!(required_message_len(&msg[..16]).unwrap(), msg.len());
    }

    #[test]
    fn required_len_rejects_oversize() {
        let mut msg = hello_message();
        // Declare a body that pushes the total over the cap.
        msg[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            required_message_len(&msg[..16]),
            Err(FormatError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_bad_endian_marker() {
        let mut msg = hello_message();
        msg[0] = b'x';
        assert_eq!(
            decode_header(&msg),
            Err(FormatError::InvalidEndianMarker(b'x'))
        );
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut msg = hello_message();
        msg[1] = 9;
        assert_eq!(decode_header(&msg), Err(FormatError::UnknownMessageKind(9)));
        msg[1] = 0;
        assert_eq!(decode_header(&msg), Err(FormatError::UnknownMessageKind(0)));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut msg = hello_message();
        msg[3] = 2;
        assert_eq!(decode_header(&msg), Err(FormatError::UnsupportedVersion(2)));
    }

    #[test]
    fn rejects_zero_serial() {
        let mut msg = hello_message();
        msg[8..12].copy_from_slice(&[0, 0, 0, 0]);
        assert_eq!(decode_header(&msg), Err(FormatError::ZeroSerial));
    }

    #[test]
    fn rejects_string_length_overrun() {
        let mut msg = hello_message();
        // The first field is the path; its length prefix sits right after
        // the field code and one-byte signature "o".
        let len_at = 16 + 4;
        msg[len_at..len_at + 4].copy_from_slice(&0xffff_u32.to_le_bytes());
        assert!(matches!(
            decode_header(&msg),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_method_call_without_member() {
        let msg = MessageBuilder::new(Endian::Little, MessageKind::MethodCall, 3)
            .path("/org/example")
            .build();
        assert_eq!(
            decode_header(&msg),
            Err(FormatError::MissingRequiredField {
                kind: MessageKind::MethodCall,
                field: "member",
            })
        );
    }

    #[test]
    fn rejects_error_without_error_name() {
        let msg = MessageBuilder::new(Endian::Little, MessageKind::Error, 3)
            .reply_serial(1)
            .build();
        assert!(matches!(
            decode_header(&msg),
            Err(FormatError::MissingRequiredField { field: "error-name", .. })
        ));
    }

    #[test]
    fn rejects_reply_without_reply_serial() {
        let msg = MessageBuilder::new(Endian::Little, MessageKind::MethodReturn, 3).build();
        assert!(matches!(
            decode_header(&msg),
            Err(FormatError::MissingRequiredField { field: "reply-serial", .. })
        ));
    }

    #[test]
    fn rejects_signal_without_interface() {
        let msg = MessageBuilder::new(Endian::Little, MessageKind::Signal, 3)
            .path("/org/example")
            .member("Changed")
            .build();
        assert!(matches!(
            decode_header(&msg),
            Err(FormatError::MissingRequiredField { field: "interface", .. })
        ));
    }

    #[test]
    fn rejects_body_without_signature() {
        let mut msg = MessageBuilder::new(Endian::Little, MessageKind::MethodCall, 3)
            .path("/org/example")
            .member("Frob")
            .build();
        // Claim a body without declaring a signature.
        msg[4..8].copy_from_slice(&8u32.to_le_bytes());
        assert!(matches!(
            decode_header(&msg),
            Err(FormatError::MissingRequiredField { field: "signature", .. })
        ));
    }

    #[test]
    fn rejects_unknown_field_code() {
        // Hand-build a message with field code 12.
        let mut fields = WireWriter::new(Endian::Little);
        fields.put_u8(12);
        fields.put_signature("s");
        fields.put_string("whatever");
        let fields_buf = fields.into_inner();

        let mut msg = vec![b'l', 4, 0, 1];
        msg.extend_from_slice(&0u32.to_le_bytes());
        msg.extend_from_slice(&5u32.to_le_bytes());
        msg.extend_from_slice(&(fields_buf.len() as u32).to_le_bytes());
        msg.extend_from_slice(&fields_buf);
        msg.resize(align_up(msg.len(), 8), 0);

        assert_eq!(decode_header(&msg), Err(FormatError::UnknownHeaderField(12)));
    }

    #[test]
    fn rejects_duplicate_destination() {
        let mut fields = WireWriter::new(Endian::Little);
        for _ in 0..2 {
            fields.align(8);
            fields.put_u8(6); // destination
            fields.put_signature("s");
            fields.put_string("org.example.Target");
        }
        let fields_buf = fields.into_inner();

        let mut msg = vec![b'l', 1, 0, 1];
        msg.extend_from_slice(&0u32.to_le_bytes());
        msg.extend_from_slice(&5u32.to_le_bytes());
        msg.extend_from_slice(&(fields_buf.len() as u32).to_le_bytes());
        msg.extend_from_slice(&fields_buf);
        msg.resize(align_up(msg.len(), 8), 0);

        assert_eq!(decode_header(&msg), Err(FormatError::DuplicateHeaderField(6)));
    }

    #[test]
    fn rejects_field_signature_mismatch() {
        let mut fields = WireWriter::new(Endian::Little);
        fields.put_u8(1); // path, must be "o"
        fields.put_signature("s");
        fields.put_string("/org/example");
        let fields_buf = fields.into_inner();

        let mut msg = vec![b'l', 1, 0, 1];
        msg.extend_from_slice(&0u32.to_le_bytes());
        msg.extend_from_slice(&5u32.to_le_bytes());
        msg.extend_from_slice(&(fields_buf.len() as u32).to_le_bytes());
        msg.extend_from_slice(&fields_buf);
        msg.resize(align_up(msg.len(), 8), 0);

        assert!(matches!(
            decode_header(&msg),
            Err(FormatError::FieldSignatureMismatch { code: 1, .. })
        ));
    }

    #[test]
    fn patch_serial_rewrites_in_place() {
        let mut msg = hello_message();
        patch_serial(&mut msg, 77).unwrap();
        assert_eq!(decode_header(&msg).unwrap().serial, 77);
    }

    proptest! {
        /// Single-byte corruption of a valid message must never panic;
        /// it either still decodes or fails cleanly.
        #[test]
        fn decode_survives_single_byte_corruption(at in 0usize..80, value: u8) {
            let mut msg = hello_message();
            let at = at % msg.len();
            msg[at] = value;
            let _ = decode_header(&msg);
            let _ = required_message_len(&msg[..16.min(msg.len())]);
        }

        /// Arbitrary byte soup must never panic the decoder.
        #[test]
        fn decode_survives_arbitrary_input(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = decode_header(&data);
            let _ = required_message_len(&data);
        }
    }
}
