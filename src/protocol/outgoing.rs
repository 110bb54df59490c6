//! Outgoing packets and the per-connection outbox.
//!
//! A packet knows its encoded length and writes itself through a
//! [`RingWriter`]. The outbox encodes each packet once into a reusable
//! scratch region, runs the bytes through the connection's
//! [`PacketEncoder`] (compression, when the game connection enables it) and
//! appends the result to the send buffer.

use crate::error::{BoundaryViolation, NetError};
use crate::protocol::hooks::{CityInfo, ServerInfo, WorldEntry, MAX_CHARACTERS};
use crate::runtime::buffer::CircularBuffer;
use crate::wire::RingWriter;
use std::net::SocketAddrV4;

/// A server-to-client packet.
pub trait OutgoingPacket {
    /// Total encoded length, opcode included.
    fn length(&self) -> usize;

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation>;
}

/// Length and count fields. [`Outbox::send`] refuses packets whose length
/// does not fit in 16 bits, so every field derived from it fits too.
fn field_u16(n: usize) -> u16 {
    u16::try_from(n).unwrap_or(u16::MAX)
}

/// Byte transform applied to each fully encoded frame.
pub trait PacketEncoder: Send {
    /// Transform `frame`. The result may borrow either the input or the
    /// encoder's own output buffer.
    fn encode<'a>(&'a mut self, frame: &'a [u8]) -> &'a [u8];
}

/// Leaves frames untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl PacketEncoder for Passthrough {
    fn encode<'a>(&'a mut self, frame: &'a [u8]) -> &'a [u8] {
        frame
    }
}

/// Encodes packets into a connection's send buffer.
pub struct Outbox {
    send: CircularBuffer,
    scratch: Vec<u8>,
    encoder: Box<dyn PacketEncoder>,
}

impl Outbox {
    pub fn new(send: CircularBuffer) -> Self {
        Self {
            send,
            scratch: Vec::with_capacity(256),
            encoder: Box::new(Passthrough),
        }
    }

    /// Replace the frame transform for every later packet.
    pub fn set_encoder(&mut self, encoder: Box<dyn PacketEncoder>) {
        self.encoder = encoder;
    }

    /// Encode `packet` and queue it for sending.
    pub fn send(&mut self, packet: &dyn OutgoingPacket) -> Result<(), NetError> {
        let length = packet.length();
        if u16::try_from(length).is_err() {
            return Err(NetError::PacketTooLong { length });
        }
        self.scratch.clear();
        self.scratch.resize(length, 0);

        let mut writer = RingWriter::contiguous(&mut self.scratch);
        packet.write(&mut writer)?;
        debug_assert_eq!(writer.position(), length, "packet wrote fewer bytes than its length");

        let bytes = self.encoder.encode(&self.scratch);
        if !self.send.push(bytes) {
            return Err(NetError::SendOverflow);
        }
        Ok(())
    }

    /// Queued bytes.
    pub fn buffer(&self) -> &CircularBuffer {
        &self.send
    }

    pub fn buffer_mut(&mut self) -> &mut CircularBuffer {
        &mut self.send
    }

    pub fn into_buffer(self) -> CircularBuffer {
        self.send
    }
}

/// 0x82: account login refused.
#[derive(Debug, Clone, Copy)]
pub struct LoginRejection {
    pub reason: u8,
}

impl OutgoingPacket for LoginRejection {
    fn length(&self) -> usize {
        2
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        writer.write_u8(0x82)?;
        writer.write_u8(self.reason)
    }
}

/// 0xA8: shards the account may pick from.
#[derive(Debug, Clone, Copy)]
pub struct ServerList<'a> {
    pub servers: &'a [ServerInfo],
}

impl OutgoingPacket for ServerList<'_> {
    fn length(&self) -> usize {
        6 + self.servers.len() * 40
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        writer.write_u8(0xA8)?;
        writer.write_u16(field_u16(self.length()))?;
        writer.write_u8(0x5D)?;
        writer.write_u16(field_u16(self.servers.len()))?;

        for (index, server) in (0u16..).zip(self.servers) {
            writer.write_u16(index)?;
            writer.write_ascii_fixed(&server.name, 32)?;
            writer.write_u8(server.full_percent)?;
            writer.write_i8(server.timezone)?;
            // Clients expect the octets reversed here
            writer.write_le(u32::from(*server.address.ip()))?;
        }
        Ok(())
    }
}

/// 0x8C: where to connect for the game session, and the token to present.
#[derive(Debug, Clone, Copy)]
pub struct PlayServerAck {
    pub address: SocketAddrV4,
    pub token: u32,
}

impl OutgoingPacket for PlayServerAck {
    fn length(&self) -> usize {
        11
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        writer.write_u8(0x8C)?;
        writer.write_bytes(&self.address.ip().octets())?;
        writer.write_u16(self.address.port())?;
        writer.write_u32(self.token)
    }
}

/// 0xB9: feature flags. Older clients only understand the low 16 bits.
#[derive(Debug, Clone, Copy)]
pub struct SupportedFeatures {
    pub flags: u32,
    pub extended: bool,
}

impl OutgoingPacket for SupportedFeatures {
    fn length(&self) -> usize {
        if self.extended {
            5
        } else {
            3
        }
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        writer.write_u8(0xB9)?;
        if self.extended {
            writer.write_u32(self.flags)
        } else {
            writer.write_u16(self.flags as u16)
        }
    }
}

/// At most [`MAX_CHARACTERS`] slots go on the wire.
fn character_slots(names: &[String]) -> &[String] {
    &names[..names.len().min(MAX_CHARACTERS)]
}

/// 0xA9: character slots on the account and the starting cities.
#[derive(Debug, Clone, Copy)]
pub struct CharacterList<'a> {
    pub names: &'a [String],
    pub cities: &'a [CityInfo],
    pub flags: u32,
    /// Newer clients take city coordinates and a description.
    pub extended: bool,
}

impl CharacterList<'_> {
    fn cities(&self) -> &[CityInfo] {
        &self.cities[..self.cities.len().min(usize::from(u8::MAX))]
    }

    fn city_size(&self) -> usize {
        if self.extended {
            89
        } else {
            63
        }
    }
}

impl OutgoingPacket for CharacterList<'_> {
    fn length(&self) -> usize {
        let names = character_slots(self.names).len() * 60;
        let cities = self.cities().len() * self.city_size();
        3 + 1 + names + 1 + cities + 4
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        let names = character_slots(self.names);
        let cities = self.cities();

        writer.write_u8(0xA9)?;
        writer.write_u16(field_u16(self.length()))?;
        writer.write_u8(names.len() as u8)?;
        for name in names {
            writer.write_ascii_fixed(name, 30)?;
            writer.write_zeros(30)?;
        }

        writer.write_u8(cities.len() as u8)?;
        for (index, city) in (0u8..).zip(cities) {
            writer.write_u8(index)?;
            if self.extended {
                writer.write_ascii_fixed(&city.name, 32)?;
                writer.write_ascii_fixed(&city.building, 32)?;
                writer.write_i32(i32::from(city.x))?;
                writer.write_i32(i32::from(city.y))?;
                writer.write_i32(i32::from(city.z))?;
                writer.write_u32(u32::from(city.map))?;
                writer.write_u32(city.description)?;
                writer.write_i32(0)?;
            } else {
                writer.write_ascii_fixed(&city.name, 31)?;
                writer.write_ascii_fixed(&city.building, 31)?;
            }
        }
        writer.write_u32(self.flags)
    }
}

/// 0x86: character slots after a deletion.
#[derive(Debug, Clone, Copy)]
pub struct CharacterListUpdate<'a> {
    pub names: &'a [String],
}

impl OutgoingPacket for CharacterListUpdate<'_> {
    fn length(&self) -> usize {
        4 + character_slots(self.names).len() * 60
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        let names = character_slots(self.names);
        writer.write_u8(0x86)?;
        writer.write_u16(field_u16(self.length()))?;
        writer.write_u8(names.len() as u8)?;
        for name in names {
            writer.write_ascii_fixed(name, 30)?;
            writer.write_zeros(30)?;
        }
        Ok(())
    }
}

/// 0x85: character deletion refused.
#[derive(Debug, Clone, Copy)]
pub struct DeleteResult {
    pub reason: u8,
}

impl DeleteResult {
    /// The slot does not hold a character.
    pub const CHARACTER_NOT_FOUND: u8 = 0x01;
}

impl OutgoingPacket for DeleteResult {
    fn length(&self) -> usize {
        2
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        writer.write_u8(0x85)?;
        writer.write_u8(self.reason)
    }
}

/// 0x53: canned message box shown by the client.
#[derive(Debug, Clone, Copy)]
pub struct PopupMessage {
    pub message: u8,
}

impl PopupMessage {
    /// Another character on the account is already in the world.
    pub const CHARACTER_IN_WORLD: u8 = 0x05;
}

impl OutgoingPacket for PopupMessage {
    fn length(&self) -> usize {
        2
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        writer.write_u8(0x53)?;
        writer.write_u8(self.message)
    }
}

/// 0xBD: ask the client for its version string.
#[derive(Debug, Clone, Copy)]
pub struct ClientVersionRequest;

impl OutgoingPacket for ClientVersionRequest {
    fn length(&self) -> usize {
        3
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        writer.write_u8(0xBD)?;
        writer.write_u16(3)
    }
}

/// 0x1B: the player's mobile and the map bounds.
#[derive(Debug, Clone, Copy)]
pub struct LoginConfirm<'a> {
    pub entry: &'a WorldEntry,
}

impl OutgoingPacket for LoginConfirm<'_> {
    fn length(&self) -> usize {
        37
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        let e = self.entry;
        writer.write_u8(0x1B)?;
        writer.write_u32(e.serial)?;
        writer.write_i32(0)?;
        writer.write_u16(e.body)?;
        writer.write_u16(e.x)?;
        writer.write_u16(e.y)?;
        writer.write_i16(i16::from(e.z))?;
        writer.write_u8(e.direction)?;
        writer.write_u8(0)?;
        writer.write_i32(-1)?;
        writer.write_i32(0)?;
        writer.write_u16(e.map_width)?;
        writer.write_u16(e.map_height)?;
        writer.write_zeros(6)
    }
}

/// 0x20: initial snapshot of the player's mobile.
#[derive(Debug, Clone, Copy)]
pub struct MobileUpdate<'a> {
    pub entry: &'a WorldEntry,
}

impl OutgoingPacket for MobileUpdate<'_> {
    fn length(&self) -> usize {
        19
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        let e = self.entry;
        writer.write_u8(0x20)?;
        writer.write_u32(e.serial)?;
        writer.write_u16(e.body)?;
        writer.write_u8(0)?;
        writer.write_u16(e.hue)?;
        writer.write_u8(0)?;
        writer.write_u16(e.x)?;
        writer.write_u16(e.y)?;
        writer.write_u16(0)?;
        writer.write_u8(e.direction)?;
        writer.write_i8(e.z)
    }
}

/// 0xBF subcommand 0x08: active map.
#[derive(Debug, Clone, Copy)]
pub struct MapChange {
    pub map: u8,
}

impl OutgoingPacket for MapChange {
    fn length(&self) -> usize {
        6
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        writer.write_u8(0xBF)?;
        writer.write_u16(6)?;
        writer.write_u16(0x08)?;
        writer.write_u8(self.map)
    }
}

/// 0xBC: season, with the transition sound.
#[derive(Debug, Clone, Copy)]
pub struct SeasonChange {
    pub season: u8,
}

impl OutgoingPacket for SeasonChange {
    fn length(&self) -> usize {
        3
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        writer.write_u8(0xBC)?;
        writer.write_u8(self.season)?;
        writer.write_u8(1)
    }
}

/// 0x11: compact status bar.
#[derive(Debug, Clone, Copy)]
pub struct MobileStatus<'a> {
    pub entry: &'a WorldEntry,
}

impl OutgoingPacket for MobileStatus<'_> {
    fn length(&self) -> usize {
        43
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        let e = self.entry;
        writer.write_u8(0x11)?;
        writer.write_u16(43)?;
        writer.write_u32(e.serial)?;
        writer.write_ascii_fixed(&e.name, 30)?;
        writer.write_u16(e.hits)?;
        writer.write_u16(e.hits_max)?;
        writer.write_bool(false)?;
        writer.write_u8(0)
    }
}

/// 0x55: world entry finished.
#[derive(Debug, Clone, Copy)]
pub struct LoginComplete;

impl OutgoingPacket for LoginComplete {
    fn length(&self) -> usize {
        1
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        writer.write_u8(0x55)
    }
}

/// 0x5B: server wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct CurrentTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl CurrentTime {
    pub fn now() -> Self {
        use chrono::Timelike;
        let now = chrono::Local::now();
        Self {
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            second: now.second() as u8,
        }
    }
}

impl OutgoingPacket for CurrentTime {
    fn length(&self) -> usize {
        4
    }

    fn write(&self, writer: &mut RingWriter<'_>) -> Result<(), BoundaryViolation> {
        writer.write_u8(0x5B)?;
        writer.write_u8(self.hour)?;
        writer.write_u8(self.minute)?;
        writer.write_u8(self.second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn encode(packet: &dyn OutgoingPacket) -> Vec<u8> {
        let mut outbox = Outbox::new(CircularBuffer::new(4096));
        outbox.send(packet).unwrap();
        let (first, second) = outbox.buffer().segments();
        [first, second].concat()
    }

    fn entry() -> WorldEntry {
        WorldEntry {
            serial: 0x0000_1234,
            name: "Shamino".to_string(),
            body: 0x190,
            hue: 0x83EA,
            x: 1495,
            y: 1629,
            z: 10,
            direction: 2,
            map: 1,
            map_width: 7168,
            map_height: 4096,
            season: 0,
            hits: 50,
            hits_max: 60,
        }
    }

    /// Prefixes each frame with its length byte.
    #[derive(Default)]
    struct Framed {
        out: Vec<u8>,
    }

    impl PacketEncoder for Framed {
        fn encode<'a>(&'a mut self, frame: &'a [u8]) -> &'a [u8] {
            self.out.clear();
            self.out.push(frame.len() as u8);
            self.out.extend_from_slice(frame);
            &self.out
        }
    }

    #[test]
    fn test_fixed_lengths_match_encoding() {
        let e = entry();
        let packets: Vec<Box<dyn OutgoingPacket + '_>> = vec![
            Box::new(LoginRejection { reason: 3 }),
            Box::new(PopupMessage {
                message: PopupMessage::CHARACTER_IN_WORLD,
            }),
            Box::new(ClientVersionRequest),
            Box::new(LoginConfirm { entry: &e }),
            Box::new(MobileUpdate { entry: &e }),
            Box::new(MapChange { map: 1 }),
            Box::new(SeasonChange { season: 0 }),
            Box::new(MobileStatus { entry: &e }),
            Box::new(LoginComplete),
            Box::new(CurrentTime::now()),
        ];
        let expected = [2, 2, 3, 37, 19, 6, 3, 43, 1, 4];
        for (packet, len) in packets.iter().zip(expected) {
            assert_eq!(packet.length(), len);
            assert_eq!(encode(packet.as_ref()).len(), len);
        }
    }

    #[test]
    fn test_server_list_layout() {
        let servers = [ServerInfo {
            name: "Britannia".to_string(),
            address: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 2593),
            full_percent: 0,
            timezone: -5,
        }];
        let bytes = encode(&ServerList { servers: &servers });
        assert_eq!(bytes.len(), 46);
        assert_eq!(&bytes[..6], &[0xA8, 0x00, 46, 0x5D, 0x00, 0x01]);
        assert_eq!(&bytes[6..8], &[0, 0]);
        assert_eq!(&bytes[8..17], b"Britannia");
        assert!(bytes[17..40].iter().all(|&b| b == 0));
        assert_eq!(bytes[41] as i8, -5);
        assert_eq!(&bytes[42..46], &[5, 0, 0, 10]);
    }

    #[test]
    fn test_play_server_ack_layout() {
        let bytes = encode(&PlayServerAck {
            address: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 2593),
            token: 0x8000_0007,
        });
        assert_eq!(
            bytes,
            vec![0x8C, 127, 0, 0, 1, 0x0A, 0x21, 0x80, 0x00, 0x00, 0x07]
        );
    }

    #[test]
    fn test_supported_features_width() {
        let flags = 0x0001_92DB;
        assert_eq!(
            encode(&SupportedFeatures { flags, extended: true }),
            vec![0xB9, 0x00, 0x01, 0x92, 0xDB]
        );
        assert_eq!(
            encode(&SupportedFeatures { flags, extended: false }),
            vec![0xB9, 0x92, 0xDB]
        );
    }

    fn yew() -> CityInfo {
        CityInfo {
            name: "Yew".to_string(),
            building: "The Empath Abbey".to_string(),
            x: 633,
            y: 858,
            z: 0,
            map: 1,
            description: 0x0010_6782,
        }
    }

    #[test]
    fn test_character_list_layout() {
        let names = vec!["Iolo".to_string(), String::new()];
        let bytes = encode(&CharacterList {
            names: &names,
            cities: &[],
            flags: 0x14,
            extended: false,
        });
        assert_eq!(bytes.len(), 3 + 1 + 120 + 1 + 4);
        assert_eq!(&bytes[..4], &[0xA9, 0x00, 129, 2]);
        assert_eq!(&bytes[4..8], b"Iolo");
        assert_eq!(bytes[124], 0);
        assert_eq!(&bytes[125..], &[0, 0, 0, 0x14]);
    }

    #[test]
    fn test_character_list_cities() {
        let cities = [yew()];

        let bytes = encode(&CharacterList {
            names: &[],
            cities: &cities,
            flags: 0,
            extended: false,
        });
        assert_eq!(bytes.len(), 3 + 1 + 1 + 63 + 4);
        assert_eq!(&bytes[3..6], &[0, 1, 0]);
        assert_eq!(&bytes[6..9], b"Yew");
        assert_eq!(&bytes[37..53], b"The Empath Abbey");

        let bytes = encode(&CharacterList {
            names: &[],
            cities: &cities,
            flags: 0,
            extended: true,
        });
        assert_eq!(bytes.len(), 3 + 1 + 1 + 89 + 4);
        assert_eq!(&bytes[38..54], b"The Empath Abbey");
        // x, y, z, map, description
        assert_eq!(&bytes[70..74], &633i32.to_be_bytes());
        assert_eq!(&bytes[74..78], &858i32.to_be_bytes());
        assert_eq!(&bytes[82..86], &1u32.to_be_bytes());
        assert_eq!(&bytes[86..90], &0x0010_6782u32.to_be_bytes());
    }

    #[test]
    fn test_lists_capped_to_character_slots() {
        let names: Vec<String> = (0..9).map(|i| format!("c{i}")).collect();

        let bytes = encode(&CharacterList {
            names: &names,
            cities: &[],
            flags: 0,
            extended: false,
        });
        assert_eq!(bytes.len(), 3 + 1 + 7 * 60 + 1 + 4);
        assert_eq!(bytes[3], 7);

        let bytes = encode(&CharacterListUpdate { names: &names });
        assert_eq!(bytes.len(), 4 + 7 * 60);
        assert_eq!(&bytes[..4], &[0x86, 0x01, 0xA8, 7]);
    }

    #[test]
    fn test_oversized_packet_refused() {
        let server = ServerInfo {
            name: "Shard".to_string(),
            address: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2593),
            full_percent: 0,
            timezone: 0,
        };
        let servers = vec![server; 2000];
        let mut outbox = Outbox::new(CircularBuffer::new(1 << 17));
        assert!(matches!(
            outbox.send(&ServerList { servers: &servers }),
            Err(NetError::PacketTooLong { length: 80_006 })
        ));
        assert!(outbox.buffer().is_empty());
    }

    #[test]
    fn test_encoder_applies_to_each_frame() {
        let mut outbox = Outbox::new(CircularBuffer::new(64));
        outbox.send(&LoginComplete).unwrap();
        outbox.set_encoder(Box::new(Framed::default()));
        outbox.send(&LoginComplete).unwrap();
        outbox.send(&ClientVersionRequest).unwrap();

        let (first, second) = outbox.buffer().segments();
        assert_eq!(
            [first, second].concat(),
            vec![0x55, 1, 0x55, 3, 0xBD, 0x00, 0x03]
        );
    }

    #[test]
    fn test_send_overflow() {
        let mut outbox = Outbox::new(CircularBuffer::new(4));
        outbox.send(&ClientVersionRequest).unwrap();
        assert!(matches!(
            outbox.send(&ClientVersionRequest),
            Err(NetError::SendOverflow)
        ));
        assert_eq!(outbox.buffer().len(), 3);
    }
}
