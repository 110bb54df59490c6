//! Account and world policy hooks.
//!
//! The handshake decides when a question gets asked; [`AccountHooks`]
//! decides the answer. [`OpenShard`] is the development policy the binary
//! runs with: every login is accepted and characters live in memory.

use crate::protocol::outgoing::PacketEncoder;
use crate::protocol::version::ClientVersion;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

/// Why an account or game login was refused. The discriminant is the wire
/// code carried by the rejection packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    Invalid = 0x00,
    InUse = 0x01,
    Blocked = 0x02,
    BadPassword = 0x03,
    Idle = 0xFE,
    BadCommunication = 0xFF,
}

/// One entry of the shard list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub address: SocketAddrV4,
    pub full_percent: u8,
    pub timezone: i8,
}

/// A starting location offered to new characters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CityInfo {
    pub name: String,
    pub building: String,
    pub x: u16,
    pub y: u16,
    pub z: i8,
    pub map: u8,
    /// Localized description shown by newer clients.
    pub description: u32,
}

impl CityInfo {
    fn new(name: &str, building: &str, x: u16, y: u16, z: i8) -> Self {
        Self {
            name: name.to_string(),
            building: building.to_string(),
            x,
            y,
            z,
            map: 1,
            description: 0,
        }
    }
}

/// Where and as what a character enters the world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldEntry {
    pub serial: u32,
    pub name: String,
    pub body: u16,
    pub hue: u16,
    pub x: u16,
    pub y: u16,
    pub z: i8,
    pub direction: u8,
    pub map: u8,
    pub map_width: u16,
    pub map_height: u16,
    pub season: u8,
    pub hits: u16,
    pub hits_max: u16,
}

/// Fields of a character creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacterCreation {
    pub name: String,
    pub slot: i32,
    pub flags: i32,
    pub profession: u8,
    pub female: bool,
    pub race: u8,
    pub strength: u8,
    pub dexterity: u8,
    pub intelligence: u8,
    /// `(skill id, value)`; three or four pairs depending on the client.
    pub skills: Vec<(u8, u8)>,
    pub hue: u16,
    pub hair: (i16, i16),
    pub facial_hair: (i16, i16),
    pub city: CityInfo,
    pub shirt_hue: i16,
    pub pants_hue: i16,
}

/// Policy consulted by the login handlers.
pub trait AccountHooks: Send + Sync {
    /// Credentials on the login connection.
    fn account_login(&self, username: &str, password: &str) -> Result<(), RejectReason>;

    /// Shards offered to `username`. `None` refuses the login.
    fn server_list(&self, username: &str) -> Option<Vec<ServerInfo>>;

    /// Credentials on the game connection. Returns the account's character
    /// names, one per slot.
    fn game_login(&self, username: &str, password: &str) -> Result<Vec<String>, RejectReason>;

    /// Starting locations offered in the character list. Creation with an
    /// index outside this list closes the connection.
    fn starting_cities(&self, username: &str) -> Vec<CityInfo>;

    /// Name of the account's character currently in the world, if any.
    /// Only that character may enter while it is there.
    fn character_in_world(&self, _username: &str) -> Option<String> {
        None
    }

    /// The character in `slot` is entering the world.
    fn play_character(&self, username: &str, slot: usize, name: &str) -> Option<WorldEntry>;

    fn create_character(&self, username: &str, creation: &CharacterCreation) -> Option<WorldEntry>;

    /// Remove the character in `slot`. Returns the remaining names.
    fn delete_character(&self, username: &str, slot: usize) -> Option<Vec<String>>;

    fn client_version_received(&self, _version: ClientVersion) {}

    fn entered_world(&self, _username: &str, _entry: &WorldEntry) {}

    /// The connection of a character in the world closed.
    fn left_world(&self, _username: &str, _entry: &WorldEntry) {}

    /// Frame transform for the game connection, e.g. compression.
    fn packet_encoder(&self) -> Option<Box<dyn PacketEncoder>> {
        None
    }
}

/// Character slots per account.
pub const MAX_CHARACTERS: usize = 7;

/// Where characters without a chosen city appear.
const HOME: (u16, u16, i8, u8) = (1495, 1629, 10, 1);

/// Accepts every account and keeps characters in memory.
#[derive(Debug)]
pub struct OpenShard {
    servers: Vec<ServerInfo>,
    cities: Vec<CityInfo>,
    characters: Mutex<HashMap<String, Vec<String>>>,
    /// Account to the name of its character in the world.
    in_world: Mutex<HashMap<String, String>>,
    next_serial: AtomicU32,
}

impl OpenShard {
    pub fn new(servers: Vec<ServerInfo>) -> Self {
        Self {
            servers,
            cities: default_cities(),
            characters: Mutex::new(HashMap::new()),
            in_world: Mutex::new(HashMap::new()),
            next_serial: AtomicU32::new(1),
        }
    }

    /// Replace the starting cities.
    pub fn with_cities(mut self, cities: Vec<CityInfo>) -> Self {
        self.cities = cities;
        self
    }

    fn spawn(&self, name: &str, female: bool, hue: u16, at: (u16, u16, i8, u8)) -> WorldEntry {
        let (x, y, z, map) = at;
        WorldEntry {
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            body: if female { 0x191 } else { 0x190 },
            hue,
            x,
            y,
            z,
            direction: 0,
            map,
            map_width: 7168,
            map_height: 4096,
            season: 0,
            hits: 50,
            hits_max: 50,
        }
    }
}

fn default_cities() -> Vec<CityInfo> {
    vec![
        CityInfo::new("Yew", "The Empath Abbey", 633, 858, 0),
        CityInfo::new("Minoc", "The Barnacle", 2476, 413, 15),
        CityInfo::new("Britain", "The Wayfarer's Inn", 1495, 1629, 10),
        CityInfo::new("Moonglow", "The Scholars Inn", 4408, 1168, 0),
        CityInfo::new("Trinsic", "The Traveler's Inn", 1845, 2745, 0),
        CityInfo::new("Magincia", "The Great Horns Tavern", 3734, 2222, 20),
        CityInfo::new("Jhelom", "The Mercenary Inn", 1374, 3826, 0),
        CityInfo::new("Skara Brae", "The Falconer's Inn", 618, 2234, 0),
        CityInfo::new("Vesper", "The Ironwood Inn", 2771, 976, 0),
    ]
}

impl AccountHooks for OpenShard {
    fn account_login(&self, username: &str, _password: &str) -> Result<(), RejectReason> {
        if username.is_empty() {
            return Err(RejectReason::Invalid);
        }
        Ok(())
    }

    fn server_list(&self, _username: &str) -> Option<Vec<ServerInfo>> {
        if self.servers.is_empty() {
            return None;
        }
        Some(self.servers.clone())
    }

    fn game_login(&self, username: &str, _password: &str) -> Result<Vec<String>, RejectReason> {
        if username.is_empty() {
            return Err(RejectReason::Invalid);
        }
        let characters = self.characters.lock();
        Ok(characters.get(username).cloned().unwrap_or_default())
    }

    fn starting_cities(&self, _username: &str) -> Vec<CityInfo> {
        self.cities.clone()
    }

    fn character_in_world(&self, username: &str) -> Option<String> {
        self.in_world.lock().get(username).cloned()
    }

    fn play_character(&self, username: &str, slot: usize, _name: &str) -> Option<WorldEntry> {
        let name = self.characters.lock().get(username)?.get(slot)?.clone();
        Some(self.spawn(&name, false, 0x83EA, HOME))
    }

    fn create_character(&self, username: &str, creation: &CharacterCreation) -> Option<WorldEntry> {
        let name = creation.name.trim();
        if name.is_empty() {
            return None;
        }

        let mut characters = self.characters.lock();
        let slots = characters.entry(username.to_string()).or_default();
        if slots.len() >= MAX_CHARACTERS {
            return None;
        }
        slots.push(name.to_string());
        drop(characters);

        let city = &creation.city;
        Some(self.spawn(
            name,
            creation.female,
            creation.hue,
            (city.x, city.y, city.z, city.map),
        ))
    }

    fn delete_character(&self, username: &str, slot: usize) -> Option<Vec<String>> {
        let mut characters = self.characters.lock();
        let slots = characters.get_mut(username)?;
        if slot >= slots.len() {
            return None;
        }
        slots.remove(slot);
        Some(slots.clone())
    }

    fn entered_world(&self, username: &str, entry: &WorldEntry) {
        info!(serial = entry.serial, name = %entry.name, "character entered the world");
        self.in_world
            .lock()
            .insert(username.to_string(), entry.name.clone());
    }

    fn left_world(&self, username: &str, entry: &WorldEntry) {
        let mut in_world = self.in_world.lock();
        if in_world.get(username) == Some(&entry.name) {
            in_world.remove(username);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn shard() -> OpenShard {
        OpenShard::new(vec![ServerInfo {
            name: "Test".to_string(),
            address: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2593),
            full_percent: 0,
            timezone: 0,
        }])
    }

    fn creation(name: &str) -> CharacterCreation {
        CharacterCreation {
            name: name.to_string(),
            female: true,
            ..CharacterCreation::default()
        }
    }

    #[test]
    fn test_character_lifecycle() {
        let shard = shard();
        assert_eq!(shard.game_login("avatar", "pw").unwrap(), Vec::<String>::new());

        let created = shard.create_character("avatar", &creation("Dupre")).unwrap();
        assert_eq!(created.body, 0x191);
        shard.create_character("avatar", &creation("Iolo")).unwrap();
        assert_eq!(shard.game_login("avatar", "pw").unwrap(), vec!["Dupre", "Iolo"]);

        let played = shard.play_character("avatar", 1, "Iolo").unwrap();
        assert_eq!(played.name, "Iolo");
        assert_ne!(played.serial, created.serial);
        assert!(shard.play_character("avatar", 2, "").is_none());

        assert_eq!(shard.delete_character("avatar", 0).unwrap(), vec!["Iolo"]);
        assert!(shard.delete_character("avatar", 5).is_none());
        assert!(shard.delete_character("nobody", 0).is_none());
    }

    #[test]
    fn test_slot_limit() {
        let shard = shard();
        for i in 0..MAX_CHARACTERS {
            assert!(shard.create_character("a", &creation(&format!("c{i}"))).is_some());
        }
        assert!(shard.create_character("a", &creation("extra")).is_none());
        assert!(shard.create_character("a", &creation("   ")).is_none());
    }

    #[test]
    fn test_login_policy() {
        let shard = shard();
        assert_eq!(shard.account_login("", "x"), Err(RejectReason::Invalid));
        assert!(shard.account_login("avatar", "x").is_ok());
        assert_eq!(shard.server_list("avatar").unwrap().len(), 1);
        assert!(OpenShard::new(Vec::new()).server_list("avatar").is_none());
    }

    #[test]
    fn test_created_character_starts_in_city() {
        let moonglow = CityInfo::new("Moonglow", "The Scholars Inn", 4408, 1168, 0);
        let shard = shard().with_cities(vec![moonglow.clone()]);
        assert_eq!(shard.starting_cities("avatar"), vec![moonglow.clone()]);

        let entry = shard
            .create_character(
                "avatar",
                &CharacterCreation {
                    city: moonglow,
                    ..creation("Mariah")
                },
            )
            .unwrap();
        assert_eq!((entry.x, entry.y, entry.map), (4408, 1168, 1));
    }

    #[test]
    fn test_world_presence() {
        let shard = shard();
        let entry = shard.create_character("avatar", &creation("Dupre")).unwrap();
        assert_eq!(shard.character_in_world("avatar"), None);

        shard.entered_world("avatar", &entry);
        assert_eq!(shard.character_in_world("avatar").as_deref(), Some("Dupre"));
        assert_eq!(shard.character_in_world("other"), None);

        shard.left_world("avatar", &entry);
        assert_eq!(shard.character_in_world("avatar"), None);
    }
}
