//! Entity serialization contract.
//!
//! The persistence layer is not part of this crate; it only needs entities to
//! read and write themselves through the same primitives the wire uses. An
//! entity writes a leading integer version tag and branches on it when
//! reading back.

use crate::error::BoundaryViolation;
use crate::wire::codec::WirePrimitive;
use crate::wire::ring::RingReader;
use bytes::{BufMut, Bytes, BytesMut};

/// Sink for serialized entity data.
pub trait GenericWriter {
    fn write_raw(&mut self, data: &[u8]);

    fn write<T: WirePrimitive>(&mut self, value: T) {
        self.write_raw(value.encode_be().as_ref());
    }

    fn write_bool(&mut self, value: bool) {
        self.write(u8::from(value));
    }

    /// 7-bit groups, low group first, high bit set on every byte but the last.
    fn write_encoded_int(&mut self, value: i32) {
        let mut v = value as u32;
        while v >= 0x80 {
            self.write((v as u8) | 0x80);
            v >>= 7;
        }
        self.write(v as u8);
    }

    /// Presence flag, then encoded byte length and UTF-8 bytes when present.
    fn write_string(&mut self, value: Option<&str>) {
        match value {
            Some(s) => {
                self.write_bool(true);
                self.write_encoded_int(s.len() as i32);
                self.write_raw(s.as_bytes());
            }
            None => self.write_bool(false),
        }
    }
}

/// Source of serialized entity data.
pub trait GenericReader {
    fn read_raw(&mut self, out: &mut [u8]) -> Result<(), BoundaryViolation>;

    fn remaining(&self) -> usize;

    fn read<T: WirePrimitive>(&mut self) -> Result<T, BoundaryViolation> {
        let mut bytes = T::Bytes::default();
        self.read_raw(bytes.as_mut())?;
        Ok(T::decode_be(bytes))
    }

    fn read_bool(&mut self) -> Result<bool, BoundaryViolation> {
        Ok(self.read::<u8>()? != 0)
    }

    fn read_encoded_int(&mut self) -> Result<i32, BoundaryViolation> {
        let mut value = 0u32;
        let mut shift = 0;
        loop {
            let byte = self.read::<u8>()?;
            value |= u32::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 || shift >= 35 {
                return Ok(value as i32);
            }
        }
    }

    fn read_string(&mut self) -> Result<Option<String>, BoundaryViolation> {
        if !self.read_bool()? {
            return Ok(None);
        }
        let len = self.read_encoded_int()?.max(0) as usize;
        if len > self.remaining() {
            return Err(BoundaryViolation {
                position: 0,
                requested: len,
                len: self.remaining(),
            });
        }
        let mut bytes = vec![0u8; len];
        self.read_raw(&mut bytes)?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// Something the persistence layer can save and restore.
pub trait Serializable {
    fn serialize<W: GenericWriter>(&self, writer: &mut W);
    fn deserialize<R: GenericReader>(&mut self, reader: &mut R) -> Result<(), BoundaryViolation>;
}

/// Growable writer backed by `BytesMut`.
#[derive(Debug, Default)]
pub struct PersistWriter {
    buf: BytesMut,
}

impl PersistWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

impl GenericWriter for PersistWriter {
    fn write_raw(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }
}

impl GenericReader for RingReader<'_> {
    fn read_raw(&mut self, out: &mut [u8]) -> Result<(), BoundaryViolation> {
        self.read_bytes(out)
    }

    fn remaining(&self) -> usize {
        RingReader::remaining(self)
    }
}
