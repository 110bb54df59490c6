//! Opcode-indexed packet dispatch.
//!
//! Every frame starts with a one-byte opcode. The table maps each of the 256
//! opcodes to a length rule, a pre-login flag and a handler function. Dispatch
//! works directly against the receive buffer's ring view: it peeks the header,
//! waits until the whole frame is buffered, then hands the handler a reader
//! bounded to that frame.

use crate::error::NetError;
use crate::wire::RingReader;
use std::io::SeekFrom;
use tracing::trace;

/// Handler for one packet type. The reader is positioned just past the
/// frame header and ends at the end of the frame.
pub type PacketHandler<C> = fn(&mut C, &mut RingReader<'_>) -> Result<(), NetError>;

/// How a frame's total length is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLength {
    /// Exactly `n` bytes, opcode included.
    Fixed(usize),
    /// A big-endian u16 after the opcode holds the total length.
    Variable,
}

impl FrameLength {
    /// Bytes before the payload.
    fn header_len(self) -> usize {
        match self {
            FrameLength::Fixed(_) => 1,
            FrameLength::Variable => 3,
        }
    }
}

/// Per-connection state the dispatcher consults before running a handler.
pub trait DispatchContext {
    /// True while only pre-login packets may be handled. Other frames are
    /// consumed and discarded.
    fn pre_login_restricted(&self) -> bool;

    /// True if frames with `opcode` must stay buffered for now.
    fn incoming_blocked(&self, opcode: u8) -> bool;
}

/// One registered packet type.
pub struct PacketDescriptor<C> {
    pub opcode: u8,
    pub length: FrameLength,
    pub pre_login: bool,
    pub handler: PacketHandler<C>,
}

// Manual impls: derive would demand `C: Clone`.
impl<C> Clone for PacketDescriptor<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for PacketDescriptor<C> {}

impl<C> std::fmt::Debug for PacketDescriptor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDescriptor")
            .field("opcode", &format_args!("0x{:02X}", self.opcode))
            .field("length", &self.length)
            .field("pre_login", &self.pre_login)
            .finish()
    }
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The next frame is not fully buffered. Nothing was consumed.
    NeedData,
    /// The next frame is held back by the connection. Nothing was consumed.
    Blocked { opcode: u8 },
    /// A handler ran and the frame was consumed.
    Handled { opcode: u8, consumed: usize },
    /// A frame not allowed before login was consumed and discarded.
    Dropped { opcode: u8, consumed: usize },
}

/// Fixed 256-slot table of packet handlers.
pub struct PacketTable<C> {
    slots: [Option<PacketDescriptor<C>>; 256],
}

impl<C: DispatchContext> PacketTable<C> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Register `handler` for `opcode`. A second registration for the same
    /// opcode replaces the first.
    ///
    /// # Panics
    /// Panics if a fixed length is zero; a frame always holds its opcode.
    pub fn register(
        &mut self,
        opcode: u8,
        length: FrameLength,
        pre_login: bool,
        handler: PacketHandler<C>,
    ) {
        if let FrameLength::Fixed(n) = length {
            assert!(n >= 1, "fixed frame length must include the opcode");
        }
        self.slots[opcode as usize] = Some(PacketDescriptor {
            opcode,
            length,
            pre_login,
            handler,
        });
    }

    pub fn descriptor(&self, opcode: u8) -> Option<&PacketDescriptor<C>> {
        self.slots[opcode as usize].as_ref()
    }

    /// Number of registered opcodes.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch the frame at the reader's cursor.
    ///
    /// On `Handled` and `Dropped` the cursor sits exactly at the end of the
    /// frame, whatever the handler read. On `NeedData` and `Blocked` it has
    /// not moved.
    pub fn dispatch(&self, ctx: &mut C, reader: &mut RingReader<'_>) -> Result<DispatchOutcome, NetError> {
        if reader.remaining() == 0 {
            return Ok(DispatchOutcome::NeedData);
        }

        let opcode: u8 = reader.peek_at(0)?;
        let descriptor = self.slots[opcode as usize].ok_or(NetError::UnknownOpcode(opcode))?;

        if ctx.incoming_blocked(opcode) {
            return Ok(DispatchOutcome::Blocked { opcode });
        }

        let length = match descriptor.length {
            FrameLength::Fixed(n) => n,
            FrameLength::Variable => {
                if reader.remaining() < 3 {
                    return Ok(DispatchOutcome::NeedData);
                }
                let declared = usize::from(reader.peek_at::<u16>(1)?);
                if declared < 3 {
                    return Err(NetError::InvalidFrameLength {
                        opcode,
                        length: declared,
                    });
                }
                declared
            }
        };

        if reader.remaining() < length {
            return Ok(DispatchOutcome::NeedData);
        }

        let start = reader.position();

        if ctx.pre_login_restricted() && !descriptor.pre_login {
            reader.seek(SeekFrom::Current(length as i64))?;
            trace!(opcode, length, "dropped packet before login");
            return Ok(DispatchOutcome::Dropped {
                opcode,
                consumed: length,
            });
        }

        let mut frame = reader.frame(length)?;
        frame.seek(SeekFrom::Start(descriptor.length.header_len() as u64))?;
        (descriptor.handler)(ctx, &mut frame)?;

        reader.seek(SeekFrom::Start((start + length) as u64))?;
        Ok(DispatchOutcome::Handled {
            opcode,
            consumed: length,
        })
    }
}

impl<C: DispatchContext> Default for PacketTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Probe {
        restricted: bool,
        blocked: Option<u8>,
        seen: Vec<(u8, u32)>,
    }

    impl DispatchContext for Probe {
        fn pre_login_restricted(&self) -> bool {
            self.restricted
        }

        fn incoming_blocked(&self, opcode: u8) -> bool {
            self.blocked == Some(opcode)
        }
    }

    fn read_word(probe: &mut Probe, reader: &mut RingReader<'_>) -> Result<(), NetError> {
        let value = reader.read_u32()?;
        probe.seen.push((0x10, value));
        Ok(())
    }

    /// Reads one byte of a longer frame and leaves the rest.
    fn read_short(probe: &mut Probe, reader: &mut RingReader<'_>) -> Result<(), NetError> {
        let value = reader.read_u8()?;
        probe.seen.push((0x20, u32::from(value)));
        Ok(())
    }

    fn read_var(probe: &mut Probe, reader: &mut RingReader<'_>) -> Result<(), NetError> {
        let text = reader.read_ascii()?;
        probe.seen.push((0x30, text.len() as u32));
        Ok(())
    }

    fn overread(_: &mut Probe, reader: &mut RingReader<'_>) -> Result<(), NetError> {
        reader.read_u64()?;
        Ok(())
    }

    fn table() -> PacketTable<Probe> {
        let mut table = PacketTable::new();
        table.register(0x10, FrameLength::Fixed(5), true, read_word);
        table.register(0x20, FrameLength::Fixed(8), true, read_short);
        table.register(0x30, FrameLength::Variable, false, read_var);
        table.register(0x40, FrameLength::Fixed(3), true, overread);
        table
    }

    #[test]
    fn test_fixed_frame_needs_data_then_dispatches() {
        let table = table();
        let mut probe = Probe::default();

        let partial = [0x10, 0xde, 0xad];
        let mut reader = RingReader::contiguous(&partial);
        assert_eq!(
            table.dispatch(&mut probe, &mut reader).unwrap(),
            DispatchOutcome::NeedData
        );
        assert_eq!(reader.position(), 0);
        assert!(probe.seen.is_empty());

        // Whole frame plus the start of the next one, split mid-frame
        let data = [0x10, 0xde, 0xad, 0xbe, 0xef, 0x10];
        let mut reader = RingReader::new(&data[..2], &data[2..]);
        assert_eq!(
            table.dispatch(&mut probe, &mut reader).unwrap(),
            DispatchOutcome::Handled {
                opcode: 0x10,
                consumed: 5
            }
        );
        assert_eq!(reader.position(), 5);
        assert_eq!(probe.seen, vec![(0x10, 0xdead_beef)]);
    }

    #[test]
    fn test_short_handler_read_is_corrected() {
        let table = table();
        let mut probe = Probe::default();
        let data = [0x20, 7, 0, 0, 0, 0, 0, 0, 0x20, 9, 0, 0, 0, 0, 0, 0];
        let mut reader = RingReader::contiguous(&data);

        table.dispatch(&mut probe, &mut reader).unwrap();
        assert_eq!(reader.position(), 8);
        table.dispatch(&mut probe, &mut reader).unwrap();
        assert_eq!(reader.position(), 16);
        assert_eq!(probe.seen, vec![(0x20, 7), (0x20, 9)]);
    }

    #[test]
    fn test_handler_cannot_read_past_frame() {
        let table = table();
        let mut probe = Probe::default();
        let data = [0x40, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let mut reader = RingReader::contiguous(&data);
        assert!(matches!(
            table.dispatch(&mut probe, &mut reader),
            Err(NetError::Boundary(_))
        ));
    }

    #[test]
    fn test_unknown_opcode() {
        let table = table();
        let mut probe = Probe::default();
        let data = [0x7f, 0, 0];
        let mut reader = RingReader::contiguous(&data);
        assert!(matches!(
            table.dispatch(&mut probe, &mut reader),
            Err(NetError::UnknownOpcode(0x7f))
        ));
    }

    #[test]
    fn test_variable_frame() {
        let table = table();
        let mut probe = Probe::default();

        let header_only = [0x30, 0x00];
        let mut reader = RingReader::contiguous(&header_only);
        assert_eq!(
            table.dispatch(&mut probe, &mut reader).unwrap(),
            DispatchOutcome::NeedData
        );

        let data = [0x30, 0x00, 0x07, b'a', b'b', b'c', b'd', 0xff];
        let mut reader = RingReader::new(&data[..1], &data[1..]);
        assert_eq!(
            table.dispatch(&mut probe, &mut reader).unwrap(),
            DispatchOutcome::Handled {
                opcode: 0x30,
                consumed: 7
            }
        );
        assert_eq!(probe.seen, vec![(0x30, 4)]);
        assert_eq!(reader.remaining(), 1);
    }

    #[test]
    fn test_variable_length_below_header_rejected() {
        let table = table();
        let mut probe = Probe::default();
        let data = [0x30, 0x00, 0x02, 0x00];
        let mut reader = RingReader::contiguous(&data);
        assert!(matches!(
            table.dispatch(&mut probe, &mut reader),
            Err(NetError::InvalidFrameLength {
                opcode: 0x30,
                length: 2
            })
        ));
    }

    #[test]
    fn test_pre_login_restricted_frame_dropped() {
        let table = table();
        let mut probe = Probe {
            restricted: true,
            ..Probe::default()
        };
        let data = [0x30, 0x00, 0x04, b'x', 0x10, 0, 0, 0, 1];
        let mut reader = RingReader::contiguous(&data);

        assert_eq!(
            table.dispatch(&mut probe, &mut reader).unwrap(),
            DispatchOutcome::Dropped {
                opcode: 0x30,
                consumed: 4
            }
        );
        assert!(probe.seen.is_empty());

        // Pre-login packets still go through
        assert_eq!(
            table.dispatch(&mut probe, &mut reader).unwrap(),
            DispatchOutcome::Handled {
                opcode: 0x10,
                consumed: 5
            }
        );
        assert_eq!(probe.seen, vec![(0x10, 1)]);
    }

    #[test]
    fn test_blocked_frame_stays_buffered() {
        let table = table();
        let mut probe = Probe {
            blocked: Some(0x10),
            ..Probe::default()
        };
        let data = [0x10, 0, 0, 0, 1];
        let mut reader = RingReader::contiguous(&data);
        assert_eq!(
            table.dispatch(&mut probe, &mut reader).unwrap(),
            DispatchOutcome::Blocked { opcode: 0x10 }
        );
        assert_eq!(reader.position(), 0);

        probe.blocked = None;
        assert!(matches!(
            table.dispatch(&mut probe, &mut reader).unwrap(),
            DispatchOutcome::Handled { .. }
        ));
    }

    #[test]
    fn test_reregister_last_wins() {
        let mut table = table();
        assert_eq!(table.len(), 4);
        table.register(0x10, FrameLength::Fixed(2), false, read_short);
        assert_eq!(table.len(), 4);
        let descriptor = table.descriptor(0x10).unwrap();
        assert_eq!(descriptor.length, FrameLength::Fixed(2));
        assert!(!descriptor.pre_login);
    }
}
