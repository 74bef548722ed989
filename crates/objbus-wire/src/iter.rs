//! Aligned readers and writers over wire bytes.
//!
//! Offsets are relative to the start of the buffer. Message bodies and the
//! header field array both start on an 8-byte boundary of the message, so
//! aligning relative to either is the same as aligning relative to the
//! message start.

use crate::error::{WireError, WireResult};
use objbus_types::signature::{complete_type_len, validate};

/// Byte order of a message, named by the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'l' => Some(Endianness::Little),
            b'B' => Some(Endianness::Big),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Endianness::Little => b'l',
            Endianness::Big => b'B',
        }
    }
}

fn padding_for(pos: usize, align: usize) -> usize {
    (align - pos % align) % align
}

/// Little-endian writer. All multi-byte writes pad to their alignment.
#[derive(Debug, Default)]
pub struct BodyWriter {
    buf: Vec<u8>,
}

impl BodyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn pad(&mut self, align: usize) {
        let n = padding_for(self.buf.len(), align);
        self.buf.resize(self.buf.len() + n, 0);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u32(u32::from(v));
    }

    pub fn write_i16(&mut self, v: i16) {
        self.pad(2);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u16(&mut self, v: u16) {
        self.pad(2);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.pad(4);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.pad(4);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.pad(8);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.pad(8);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_u64(v.to_bits());
    }

    /// `s` / `o`: u32 length, bytes, NUL.
    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// `g`: u8 length, bytes, NUL.
    pub fn write_signature(&mut self, sig: &str) {
        self.buf.push(sig.len() as u8);
        self.buf.extend_from_slice(sig.as_bytes());
        self.buf.push(0);
    }

    /// Overwrite a previously written u32 (array length placeholders).
    pub fn patch_u32(&mut self, pos: usize, v: u32) {
        self.buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reader that honours alignment, checks padding and handles both byte
/// orders. Never panics on malformed input.
#[derive(Debug, Clone)]
pub struct BodyReader<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endianness,
}

macro_rules! read_int {
    ($name:ident, $ty:ty, $n:literal) => {
        pub fn $name(&mut self) -> WireResult<$ty> {
            self.align($n)?;
            let bytes: [u8; $n] = self
                .take($n)?
                .try_into()
                .map_err(|_| WireError::UnexpectedEof(self.pos))?;
            Ok(match self.endian {
                Endianness::Little => <$ty>::from_le_bytes(bytes),
                Endianness::Big => <$ty>::from_be_bytes(bytes),
            })
        }
    };
}

impl<'a> BodyReader<'a> {
    pub fn new(data: &'a [u8], endian: Endianness) -> Self {
        Self {
            data,
            pos: 0,
            endian,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn endian(&self) -> Endianness {
        self.endian
    }

    /// Skip padding up to `align`, requiring every pad byte to be zero.
    pub fn align(&mut self, align: usize) -> WireResult<()> {
        let n = padding_for(self.pos, align);
        if n == 0 {
            return Ok(());
        }
        let start = self.pos;
        let pad = self.take(n)?;
        if pad.iter().any(|&b| b != 0) {
            return Err(WireError::InvalidPadding(start));
        }
        Ok(())
    }

    pub fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(WireError::UnexpectedEof(self.pos))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    read_int!(read_i16, i16, 2);
    read_int!(read_u16, u16, 2);
    read_int!(read_i32, i32, 4);
    read_int!(read_u32, u32, 4);
    read_int!(read_i64, i64, 8);
    read_int!(read_u64, u64, 8);

    pub fn read_f64(&mut self) -> WireResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_bool(&mut self) -> WireResult<bool> {
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidBool(other)),
        }
    }

    fn text(&mut self, len: usize) -> WireResult<&'a str> {
        let start = self.pos;
        let bytes = self.take(len)?;
        if self.read_u8()? != 0 || bytes.contains(&0) {
            return Err(WireError::InvalidString(start));
        }
        std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8(start))
    }

    /// `s` / `o` payload.
    pub fn read_str(&mut self) -> WireResult<&'a str> {
        let len = self.read_u32()? as usize;
        self.text(len)
    }

    /// `g` payload, validated against the signature grammar.
    pub fn read_signature(&mut self) -> WireResult<&'a str> {
        let len = self.read_u8()? as usize;
        let sig = self.text(len)?;
        validate(sig)?;
        Ok(sig)
    }
}

/// Cursor over a message body and its signature.
///
/// Each [`decode`](crate::marshal::decode) call consumes the next complete
/// type of the signature.
#[derive(Debug, Clone)]
pub struct WireIter<'a> {
    reader: BodyReader<'a>,
    signature: String,
    sig_pos: usize,
}

impl<'a> WireIter<'a> {
    pub fn new(body: &'a [u8], signature: &str, endian: Endianness) -> Self {
        Self {
            reader: BodyReader::new(body, endian),
            signature: signature.to_string(),
            sig_pos: 0,
        }
    }

    /// The complete type the next decode will read.
    pub fn current_signature(&self) -> WireResult<Option<&str>> {
        let rest = &self.signature[self.sig_pos..];
        if rest.is_empty() {
            return Ok(None);
        }
        let len = complete_type_len(rest)?;
        Ok(Some(&rest[..len]))
    }

    /// Whether both the signature and the body are exhausted.
    pub fn at_end(&self) -> bool {
        self.sig_pos >= self.signature.len() && self.reader.at_end()
    }

    pub fn signature_exhausted(&self) -> bool {
        self.sig_pos >= self.signature.len()
    }

    pub(crate) fn parts(&mut self) -> (&mut BodyReader<'a>, &str) {
        (&mut self.reader, &self.signature[self.sig_pos..])
    }

    pub(crate) fn advance(&mut self, sig_len: usize) {
        self.sig_pos += sig_len;
    }

    pub fn reader(&self) -> &BodyReader<'a> {
        &self.reader
    }
}
