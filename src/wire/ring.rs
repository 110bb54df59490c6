//! Dual-segment ring views.
//!
//! A connection's circular allocation wraps, so the bytes it holds are
//! logically contiguous but physically live in two regions: the tail of the
//! allocation followed by its head. `RingReader` and `RingWriter` present
//! those two regions as one span of length `first.len() + second.len()` with
//! a cursor, splitting any access that straddles the boundary.
//!
//! ## Invariants
//! - `position <= len()` at all times.
//! - An access that would cross `len()` fails with [`BoundaryViolation`] and
//!   leaves the cursor where it was. Nothing is clamped.
//! - Views only borrow. Primitive access copies through a stack array; the
//!   one allocation is joining a string that straddles the boundary.

use crate::error::BoundaryViolation;
use crate::wire::codec::{ReadLimit, Termination, TextEncoding, WirePrimitive};
use std::borrow::Cow;
use std::io::SeekFrom;

/// Resolve a seek against a span of `len` bytes.
fn resolve_seek(position: usize, len: usize, target: SeekFrom) -> Result<usize, BoundaryViolation> {
    let target = match target {
        SeekFrom::Start(offset) => i128::from(offset),
        SeekFrom::Current(delta) => position as i128 + i128::from(delta),
        SeekFrom::End(delta) => len as i128 + i128::from(delta),
    };

    if target < 0 || target > len as i128 {
        return Err(BoundaryViolation {
            position,
            requested: target.unsigned_abs().min(usize::MAX as u128) as usize,
            len,
        });
    }
    Ok(target as usize)
}

/// Read half of a dual-segment view.
#[derive(Debug, Clone)]
pub struct RingReader<'a> {
    first: &'a [u8],
    second: &'a [u8],
    position: usize,
}

impl<'a> RingReader<'a> {
    /// View `first` followed by `second`, cursor at the start.
    pub fn new(first: &'a [u8], second: &'a [u8]) -> Self {
        Self {
            first,
            second,
            position: 0,
        }
    }

    /// View over a single contiguous region.
    pub fn contiguous(data: &'a [u8]) -> Self {
        Self::new(data, &[])
    }

    /// Logical length of the view.
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes between the cursor and the end of the view.
    pub fn remaining(&self) -> usize {
        self.len() - self.position
    }

    /// Move the cursor. Returns the new absolute position.
    pub fn seek(&mut self, target: SeekFrom) -> Result<usize, BoundaryViolation> {
        self.position = resolve_seek(self.position, self.len(), target)?;
        Ok(self.position)
    }

    fn check(&self, offset: usize, n: usize) -> Result<usize, BoundaryViolation> {
        let start = self.position + offset;
        match start.checked_add(n) {
            Some(end) if end <= self.len() => Ok(start),
            _ => Err(BoundaryViolation {
                position: start,
                requested: n,
                len: self.len(),
            }),
        }
    }

    /// The bytes in `[start, start + n)` as at most two borrowed pieces.
    fn pieces(&self, start: usize, n: usize) -> (&'a [u8], &'a [u8]) {
        let empty: &'a [u8] = &[];
        let split = self.first.len();
        let end = start + n;
        if end <= split {
            (&self.first[start..end], empty)
        } else if start >= split {
            (&self.second[start - split..end - split], empty)
        } else {
            (&self.first[start..], &self.second[..end - split])
        }
    }

    fn copy_out(&self, start: usize, out: &mut [u8]) {
        let (head, tail) = self.pieces(start, out.len());
        out[..head.len()].copy_from_slice(head);
        out[head.len()..].copy_from_slice(tail);
    }

    /// The bytes in `[start, start + n)`, borrowed when they sit in one
    /// segment and copied only when they straddle the boundary.
    fn span(&self, start: usize, n: usize) -> Cow<'a, [u8]> {
        let (head, tail) = self.pieces(start, n);
        if tail.is_empty() {
            Cow::Borrowed(head)
        } else {
            let mut joined = Vec::with_capacity(n);
            joined.extend_from_slice(head);
            joined.extend_from_slice(tail);
            Cow::Owned(joined)
        }
    }

    fn byte_at(&self, index: usize) -> u8 {
        let split = self.first.len();
        if index < split {
            self.first[index]
        } else {
            self.second[index - split]
        }
    }

    /// Fill `out` from the cursor and advance past it.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<(), BoundaryViolation> {
        let start = self.check(0, out.len())?;
        self.copy_out(start, out);
        self.position += out.len();
        Ok(())
    }

    /// A reader over exactly the next `len` bytes. The parent cursor does not
    /// move.
    pub fn frame(&self, len: usize) -> Result<RingReader<'a>, BoundaryViolation> {
        let start = self.check(0, len)?;
        let (first, second) = self.pieces(start, len);
        Ok(RingReader::new(first, second))
    }

    /// Read a big-endian primitive.
    pub fn read<T: WirePrimitive>(&mut self) -> Result<T, BoundaryViolation> {
        let value = self.peek_at::<T>(0)?;
        self.position += T::SIZE;
        Ok(value)
    }

    /// Read a little-endian primitive.
    pub fn read_le<T: WirePrimitive>(&mut self) -> Result<T, BoundaryViolation> {
        let start = self.check(0, T::SIZE)?;
        let mut bytes = T::Bytes::default();
        self.copy_out(start, bytes.as_mut());
        self.position += T::SIZE;
        Ok(T::decode_le(bytes))
    }

    /// Decode a big-endian primitive `offset` bytes past the cursor without
    /// consuming anything.
    pub fn peek_at<T: WirePrimitive>(&self, offset: usize) -> Result<T, BoundaryViolation> {
        let start = self.check(offset, T::SIZE)?;
        let mut bytes = T::Bytes::default();
        self.copy_out(start, bytes.as_mut());
        Ok(T::decode_be(bytes))
    }

    pub fn read_u8(&mut self) -> Result<u8, BoundaryViolation> {
        self.read()
    }

    pub fn read_i8(&mut self) -> Result<i8, BoundaryViolation> {
        self.read()
    }

    pub fn read_bool(&mut self) -> Result<bool, BoundaryViolation> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, BoundaryViolation> {
        self.read()
    }

    pub fn read_i16(&mut self) -> Result<i16, BoundaryViolation> {
        self.read()
    }

    pub fn read_u32(&mut self) -> Result<u32, BoundaryViolation> {
        self.read()
    }

    pub fn read_i32(&mut self) -> Result<i32, BoundaryViolation> {
        self.read()
    }

    pub fn read_u64(&mut self) -> Result<u64, BoundaryViolation> {
        self.read()
    }

    pub fn read_i64(&mut self) -> Result<i64, BoundaryViolation> {
        self.read()
    }

    /// Read a string in `encoding`, consuming bytes according to `limit`.
    pub fn read_string(
        &mut self,
        encoding: TextEncoding,
        limit: ReadLimit,
    ) -> Result<String, BoundaryViolation> {
        let unit = encoding.unit_size();
        let start = self.position;

        let (text_len, consumed) = match limit {
            ReadLimit::Fixed(count) => {
                self.check(0, count * unit)?;
                (count * unit, count * unit)
            }
            ReadLimit::Unbounded => self.scan_terminator(start, self.remaining(), unit),
            ReadLimit::NullTerminated(max_bytes) => {
                self.scan_terminator(start, max_bytes.min(self.remaining()), unit)
            }
        };

        let text = encoding.decode(&self.span(start, text_len));
        self.position += consumed;
        Ok(text)
    }

    /// Find the first zero unit within `window` bytes of `start`. Returns the
    /// text length and the bytes to consume (terminator included).
    fn scan_terminator(&self, start: usize, window: usize, unit: usize) -> (usize, usize) {
        let mut offset = 0;
        while offset + unit <= window {
            if (0..unit).all(|i| self.byte_at(start + offset + i) == 0) {
                return (offset, offset + unit);
            }
            offset += unit;
        }
        (offset, window)
    }

    /// ASCII up to the first zero or the end of the view.
    pub fn read_ascii(&mut self) -> Result<String, BoundaryViolation> {
        self.read_string(TextEncoding::Ascii, ReadLimit::Unbounded)
    }

    /// ASCII occupying exactly `count` bytes.
    pub fn read_ascii_fixed(&mut self, count: usize) -> Result<String, BoundaryViolation> {
        self.read_string(TextEncoding::Ascii, ReadLimit::Fixed(count))
    }

    pub fn read_big_uni(&mut self) -> Result<String, BoundaryViolation> {
        self.read_string(TextEncoding::Utf16Be, ReadLimit::Unbounded)
    }

    pub fn read_little_uni(&mut self) -> Result<String, BoundaryViolation> {
        self.read_string(TextEncoding::Utf16Le, ReadLimit::Unbounded)
    }
}

/// Write half of a dual-segment view.
#[derive(Debug)]
pub struct RingWriter<'a> {
    first: &'a mut [u8],
    second: &'a mut [u8],
    position: usize,
}

impl<'a> RingWriter<'a> {
    /// View `first` followed by `second`, cursor at the start.
    pub fn new(first: &'a mut [u8], second: &'a mut [u8]) -> Self {
        Self {
            first,
            second,
            position: 0,
        }
    }

    /// View over a single contiguous region.
    pub fn contiguous(data: &'a mut [u8]) -> Self {
        Self::new(data, &mut [])
    }

    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.len() - self.position
    }

    pub fn seek(&mut self, target: SeekFrom) -> Result<usize, BoundaryViolation> {
        self.position = resolve_seek(self.position, self.len(), target)?;
        Ok(self.position)
    }

    fn check(&self, n: usize) -> Result<(), BoundaryViolation> {
        match self.position.checked_add(n) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(BoundaryViolation {
                position: self.position,
                requested: n,
                len: self.len(),
            }),
        }
    }

    /// Place already-checked bytes at the cursor, splitting across segments.
    fn put(&mut self, data: &[u8]) {
        let split = self.first.len();
        let start = self.position;
        let end = start + data.len();

        if end <= split {
            self.first[start..end].copy_from_slice(data);
        } else if start >= split {
            self.second[start - split..end - split].copy_from_slice(data);
        } else {
            let head = split - start;
            self.first[start..].copy_from_slice(&data[..head]);
            self.second[..data.len() - head].copy_from_slice(&data[head..]);
        }
        self.position = end;
    }

    fn put_zeros(&mut self, mut n: usize) {
        const ZEROS: [u8; 32] = [0; 32];
        while n > 0 {
            let step = n.min(ZEROS.len());
            self.put(&ZEROS[..step]);
            n -= step;
        }
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), BoundaryViolation> {
        self.check(data.len())?;
        self.put(data);
        Ok(())
    }

    /// Write `n` zero bytes.
    pub fn write_zeros(&mut self, n: usize) -> Result<(), BoundaryViolation> {
        self.check(n)?;
        self.put_zeros(n);
        Ok(())
    }

    /// Write a big-endian primitive.
    pub fn write<T: WirePrimitive>(&mut self, value: T) -> Result<(), BoundaryViolation> {
        self.write_bytes(value.encode_be().as_ref())
    }

    /// Write a little-endian primitive.
    pub fn write_le<T: WirePrimitive>(&mut self, value: T) -> Result<(), BoundaryViolation> {
        self.write_bytes(value.encode_le().as_ref())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), BoundaryViolation> {
        self.write(value)
    }

    pub fn write_i8(&mut self, value: i8) -> Result<(), BoundaryViolation> {
        self.write(value)
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), BoundaryViolation> {
        self.write_u8(u8::from(value))
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), BoundaryViolation> {
        self.write(value)
    }

    pub fn write_i16(&mut self, value: i16) -> Result<(), BoundaryViolation> {
        self.write(value)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), BoundaryViolation> {
        self.write(value)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), BoundaryViolation> {
        self.write(value)
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), BoundaryViolation> {
        self.write(value)
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), BoundaryViolation> {
        self.write(value)
    }

    /// Encode `text` and place it at the cursor.
    ///
    /// The span is checked up front, so a failing write leaves the buffer and
    /// cursor untouched. Characters are encoded before placement, which means
    /// a segment split only ever falls between already-encoded bytes.
    pub fn write_string(
        &mut self,
        encoding: TextEncoding,
        text: &str,
        termination: Termination,
    ) -> Result<(), BoundaryViolation> {
        let (kept, encoded_len, total) = termination.layout(encoding, text);
        self.check(total)?;

        let mut chunk = [0u8; 64];
        let mut used = 0;
        for c in kept.chars() {
            let mut encoded = [0u8; 4];
            let n = encoding.encode_char(c, &mut encoded);
            if used + n > chunk.len() {
                self.put(&chunk[..used]);
                used = 0;
            }
            chunk[used..used + n].copy_from_slice(&encoded[..n]);
            used += n;
        }
        self.put(&chunk[..used]);
        self.put_zeros(total - encoded_len);
        Ok(())
    }

    pub fn write_ascii(&mut self, text: &str) -> Result<(), BoundaryViolation> {
        self.write_string(TextEncoding::Ascii, text, Termination::Unterminated)
    }

    pub fn write_ascii_null(&mut self, text: &str) -> Result<(), BoundaryViolation> {
        self.write_string(TextEncoding::Ascii, text, Termination::NullTerminated)
    }

    /// ASCII occupying exactly `count` bytes, zero padded.
    pub fn write_ascii_fixed(&mut self, text: &str, count: usize) -> Result<(), BoundaryViolation> {
        self.write_string(TextEncoding::Ascii, text, Termination::Fixed(count))
    }

    pub fn write_big_uni_null(&mut self, text: &str) -> Result<(), BoundaryViolation> {
        self.write_string(TextEncoding::Utf16Be, text, Termination::NullTerminated)
    }

    pub fn write_little_uni_null(&mut self, text: &str) -> Result<(), BoundaryViolation> {
        self.write_string(TextEncoding::Utf16Le, text, Termination::NullTerminated)
    }
}
