//! Wire-level encoding.
//!
//! - `codec`: stateless primitive and text encoding
//! - `ring`: dual-segment reader/writer views over a wrapped allocation
//! - `persist`: the entity serialization contract built on the same codec

pub mod codec;
pub mod persist;
pub mod ring;

pub use codec::{ReadLimit, Termination, TextEncoding, WirePrimitive};
pub use ring::{RingReader, RingWriter};
