//! Stateless primitive encoding.
//!
//! Integers are big-endian on the wire except for a handful of legacy fields
//! that use the little-endian variants. Text is carried in one of four
//! encodings; the string layout rules (termination, fixed widths) live here
//! so the ring reader and writer only ever move already-encoded bytes.

/// A fixed-size integer that can be placed on the wire.
pub trait WirePrimitive: Copy {
    /// Encoded size in bytes.
    const SIZE: usize;
    /// Byte array of exactly `SIZE` bytes.
    type Bytes: AsRef<[u8]> + AsMut<[u8]> + Default;

    fn encode_be(self) -> Self::Bytes;
    fn encode_le(self) -> Self::Bytes;
    fn decode_be(bytes: Self::Bytes) -> Self;
    fn decode_le(bytes: Self::Bytes) -> Self;
}

macro_rules! wire_primitive {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WirePrimitive for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                #[inline]
                fn encode_be(self) -> Self::Bytes {
                    self.to_be_bytes()
                }

                #[inline]
                fn encode_le(self) -> Self::Bytes {
                    self.to_le_bytes()
                }

                #[inline]
                fn decode_be(bytes: Self::Bytes) -> Self {
                    <$ty>::from_be_bytes(bytes)
                }

                #[inline]
                fn decode_le(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }
            }
        )*
    };
}

wire_primitive!(u8, i8, u16, i16, u32, i32, u64, i64);

/// Text encodings used by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    /// 7-bit ASCII. Characters outside the range encode as `?`.
    Ascii,
    /// UTF-8, the only variable-width 8-bit encoding on the wire.
    Utf8,
    /// UTF-16, big-endian code units.
    Utf16Be,
    /// UTF-16, little-endian code units.
    Utf16Le,
}

impl TextEncoding {
    /// Size of one code unit, and therefore of the zero terminator.
    pub fn unit_size(self) -> usize {
        match self {
            TextEncoding::Ascii | TextEncoding::Utf8 => 1,
            TextEncoding::Utf16Be | TextEncoding::Utf16Le => 2,
        }
    }

    /// Number of bytes `c` occupies once encoded.
    pub fn char_len(self, c: char) -> usize {
        match self {
            TextEncoding::Ascii => 1,
            TextEncoding::Utf8 => c.len_utf8(),
            TextEncoding::Utf16Be | TextEncoding::Utf16Le => c.len_utf16() * 2,
        }
    }

    /// Encode a single character into `out`, returning the bytes used.
    pub fn encode_char(self, c: char, out: &mut [u8; 4]) -> usize {
        match self {
            TextEncoding::Ascii => {
                out[0] = if c.is_ascii() { c as u8 } else { b'?' };
                1
            }
            TextEncoding::Utf8 => c.encode_utf8(out).len(),
            TextEncoding::Utf16Be | TextEncoding::Utf16Le => {
                let mut units = [0u16; 2];
                let units = c.encode_utf16(&mut units);
                for (i, unit) in units.iter().enumerate() {
                    let bytes = if self == TextEncoding::Utf16Be {
                        unit.to_be_bytes()
                    } else {
                        unit.to_le_bytes()
                    };
                    out[i * 2..i * 2 + 2].copy_from_slice(&bytes);
                }
                units.len() * 2
            }
        }
    }

    /// Longest prefix of `text` whose encoding fits in `max_bytes`.
    ///
    /// Truncation happens on character boundaries, never inside an encoded
    /// character. Returns the prefix and its encoded length.
    pub fn fit(self, text: &str, max_bytes: usize) -> (&str, usize) {
        let mut used = 0;
        for (idx, c) in text.char_indices() {
            let len = self.char_len(c);
            if used + len > max_bytes {
                return (&text[..idx], used);
            }
            used += len;
        }
        (text, used)
    }

    /// Encoded length of the whole of `text`.
    pub fn encoded_len(self, text: &str) -> usize {
        text.chars().map(|c| self.char_len(c)).sum()
    }

    /// Decode `bytes`, stopping at the first zero code unit.
    ///
    /// Malformed input decodes lossily; a trailing odd byte in a 16-bit
    /// encoding is ignored.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Ascii => bytes
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| if b.is_ascii() { b as char } else { '?' })
                .collect(),
            TextEncoding::Utf8 => {
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                String::from_utf8_lossy(&bytes[..end]).into_owned()
            }
            TextEncoding::Utf16Be | TextEncoding::Utf16Le => {
                let units = bytes
                    .chunks_exact(2)
                    .map(|pair| {
                        let pair = [pair[0], pair[1]];
                        if self == TextEncoding::Utf16Be {
                            u16::from_be_bytes(pair)
                        } else {
                            u16::from_le_bytes(pair)
                        }
                    })
                    .take_while(|&unit| unit != 0);
                char::decode_utf16(units)
                    .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect()
            }
        }
    }
}

/// How a written string is terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Just the encoded characters.
    Unterminated,
    /// Encoded characters followed by one zero code unit.
    NullTerminated,
    /// Exactly `n` code units: truncated to fit, zero padded when shorter.
    Fixed(usize),
    /// Exactly `n` code units, the last of which is always zero.
    FixedNull(usize),
}

impl Termination {
    /// Work out what gets written for `text`: the character prefix kept, its
    /// encoded length, and the total span including terminator and padding.
    pub fn layout(self, encoding: TextEncoding, text: &str) -> (&str, usize, usize) {
        let unit = encoding.unit_size();
        match self {
            Termination::Unterminated => {
                let len = encoding.encoded_len(text);
                (text, len, len)
            }
            Termination::NullTerminated => {
                let len = encoding.encoded_len(text);
                (text, len, len + unit)
            }
            Termination::Fixed(n) => {
                let (kept, len) = encoding.fit(text, n * unit);
                (kept, len, n * unit)
            }
            Termination::FixedNull(n) => {
                let (kept, len) = encoding.fit(text, n.saturating_sub(1) * unit);
                (kept, len, n * unit)
            }
        }
    }
}

/// How much a string read consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadLimit {
    /// Up to and including the first zero unit, or to the end of the view.
    Unbounded,
    /// Exactly `n` code units; text ends at the first zero among them.
    Fixed(usize),
    /// Up to and including the first zero unit, never more than `max_bytes`.
    NullTerminated(usize),
}
