//! Body argument codec.
//!
//! The filter only ever inspects a handful of body layouts: the first
//! string argument of a bus method call (`s...`), the string returned by
//! `Hello`/`GetNameOwner`, the string array returned by the `ListNames`
//! family (`as`), and the three strings of `NameOwnerChanged` (`sss`).
//! This module reads and writes exactly those shapes, with the same
//! bounds discipline as the header codec; it is not a general D-Bus
//! marshaler.

use crate::wire::{Cursor, Endian, FormatError, Header, WireWriter};

/// Bounds-checked reader over a message body.
///
/// The body region always starts on an 8-byte message boundary, so
/// alignment relative to the region matches alignment on the wire.
pub struct BodyReader<'a> {
    cur: Cursor<'a>,
}

impl<'a> BodyReader<'a> {
    /// Creates a reader over a body region.
    #[must_use]
    pub const fn new(endian: Endian, body: &'a [u8]) -> Self {
        Self {
            cur: Cursor::new(body, endian),
        }
    }

    /// Reads one `u32` argument.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Truncated`] if the body ends early.
    pub fn read_u32(&mut self) -> Result<u32, FormatError> {
        self.cur.read_u32()
    }

    /// Reads one string argument.
    ///
    /// # Errors
    ///
    /// Returns a [`FormatError`] if the declared length overruns the
    /// body, the terminator is missing, or the bytes are not UTF-8.
    pub fn read_string(&mut self) -> Result<&'a str, FormatError> {
        self.cur.read_string()
    }

    /// Reads one `as` (array of string) argument.
    ///
    /// # Errors
    ///
    /// Returns a [`FormatError`] if the declared array length or any
    /// element overruns the body.
    pub fn read_string_array(&mut self) -> Result<Vec<&'a str>, FormatError> {
        let byte_len = self.cur.read_u32()? as usize;
        let start = self.cur.pos();
        if byte_len > self.cur.remaining() {
            return Err(FormatError::Truncated {
                wanted: start + byte_len,
                available: start + self.cur.remaining(),
            });
        }
        let mut out = Vec::new();
        while self.cur.pos() < start + byte_len {
            out.push(self.cur.read_string()?);
        }
        // An element whose declared length straddles the array boundary
        // would have left pos past the end; the cursor bounds above make
        // that impossible within the body, but the array boundary itself
        // still has to hold.
        if self.cur.pos() != start + byte_len {
            return Err(FormatError::Truncated {
                wanted: start + byte_len,
                available: self.cur.pos(),
            });
        }
        Ok(out)
    }
}

/// Reads the first body argument of a message as a string.
///
/// Used for the bus methods whose access decision keys on their first
/// argument (`RequestName`, `GetNameOwner`, ...).
///
/// # Errors
///
/// Returns [`FormatError::UnexpectedBodySignature`] if the declared body
/// signature does not start with `s`, or a decoding error if the body is
/// malformed.
pub fn first_string_arg(header: &Header, message: &[u8]) -> Result<String, FormatError> {
    let signature = header.signature.as_deref().unwrap_or("");
    if !signature.starts_with('s') {
        return Err(FormatError::UnexpectedBodySignature {
            expected: "s",
            found: signature.to_owned(),
        });
    }
    let body = header.body_region(message)?;
    let mut reader = BodyReader::new(header.endian, body);
    Ok(reader.read_string()?.to_owned())
}

/// Writer for the body layouts the proxy synthesizes.
pub struct BodyWriter {
    w: WireWriter,
}

impl BodyWriter {
    /// Creates a writer producing the given byte order.
    #[must_use]
    pub const fn new(endian: Endian) -> Self {
        Self {
            w: WireWriter::new(endian),
        }
    }

    /// Appends one string argument.
    pub fn put_string(&mut self, value: &str) {
        self.w.put_string(value);
    }

    /// Appends one `u32` argument.
    pub fn put_u32(&mut self, value: u32) {
        self.w.put_u32(value);
    }

    /// Appends one `as` (array of string) argument.
    pub fn put_string_array<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.w.put_u32(0); // placeholder for the array byte length
        let len_at = self.w.len() - 4;
        let start = self.w.len();
        for value in values {
            self.w.put_string(value.as_ref());
        }
        let byte_len = (self.w.len() - start) as u32;
        self.w.patch_u32(len_at, byte_len);
    }

    /// Finishes the body.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.w.into_inner()
    }
}
