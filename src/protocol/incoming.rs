//! Handshake packet handlers.
//!
//! Each handler runs against a reader bounded to one frame and positioned
//! past its header. Handshake faults are returned as errors and end the
//! connection; policy refusals send a rejection and dispose it.

use crate::error::{HandshakeFault, NetError};
use crate::protocol::dispatch::{FrameLength, PacketTable};
use crate::protocol::hooks::{CharacterCreation, RejectReason};
use crate::protocol::outgoing::{
    CharacterList, CharacterListUpdate, DeleteResult, LoginRejection, PlayServerAck, PopupMessage,
    ServerList,
};
use crate::protocol::session::{LoginPhase, Session};
use crate::protocol::version::ClientVersion;
use crate::wire::RingReader;
use std::io::SeekFrom;
use tracing::{debug, info, warn};

const CLIENT_VERSION: u8 = 0xBD;
const CLIENT_TYPE: u8 = 0xE1;

/// First client build with the post-gargoyle race numbering.
const STYGIAN_ABYSS: ClientVersion = ClientVersion::new(7, 0, 0, 0);

/// First client build that takes coordinates in the city list.
const CITY_COORDINATES: ClientVersion = ClientVersion::new(7, 0, 13, 0);

/// Packets that are still handled while incoming packets are blocked.
pub fn is_version_packet(opcode: u8) -> bool {
    opcode == CLIENT_VERSION || opcode == CLIENT_TYPE
}

/// Table of every packet the handshake understands.
pub fn packet_table() -> PacketTable<Session> {
    use FrameLength::{Fixed, Variable};

    let mut table = PacketTable::new();
    table.register(0x00, Fixed(104), true, create_character);
    table.register(0x5D, Fixed(73), true, play_character);
    table.register(0x80, Fixed(62), false, account_login);
    table.register(0x83, Fixed(39), false, delete_character);
    table.register(0x91, Fixed(65), true, game_login);
    table.register(0xA0, Fixed(3), false, play_server);
    table.register(0xBB, Fixed(9), false, account_id);
    table.register(CLIENT_VERSION, Variable, false, client_version);
    table.register(0xBE, Variable, true, assist_version);
    table.register(0xCF, Variable, false, account_login);
    table.register(CLIENT_TYPE, Variable, false, client_type);
    table.register(0xEF, Fixed(21), true, login_seed);
    table.register(0xF8, Fixed(106), true, create_character);
    table
}

fn skip(reader: &mut RingReader<'_>, n: i64) -> Result<(), NetError> {
    reader.seek(SeekFrom::Current(n))?;
    Ok(())
}

/// Version components are sent signed; negatives mean nothing useful.
fn read_component(reader: &mut RingReader<'_>) -> Result<u32, NetError> {
    Ok(reader.read_i32()?.max(0) as u32)
}

fn reject(session: &mut Session, reason: RejectReason) -> Result<(), NetError> {
    info!(conn_id = %session.id(), ?reason, "login rejected");
    session.send(&LoginRejection {
        reason: reason as u8,
    })?;
    session.dispose();
    Ok(())
}

fn username(session: &Session) -> String {
    session.state.username.clone().unwrap_or_default()
}

/// 0xEF: seed plus the client's version.
fn login_seed(session: &mut Session, reader: &mut RingReader<'_>) -> Result<(), NetError> {
    session.require_phase(&[LoginPhase::Connected])?;

    let seed = reader.read_u32()?;
    if seed == 0 {
        return Err(HandshakeFault::ZeroSeed.into());
    }

    let version = ClientVersion::new(
        read_component(reader)?,
        read_component(reader)?,
        read_component(reader)?,
        read_component(reader)?,
    );
    debug!(conn_id = %session.id(), seed, %version, "login seed");

    session.state.seed = Some(seed);
    session.state.version = Some(version);
    session.set_phase(LoginPhase::AwaitingCredentials);
    Ok(())
}

/// 0x80 and 0xCF: credentials on the login connection.
fn account_login(session: &mut Session, reader: &mut RingReader<'_>) -> Result<(), NetError> {
    session.claim_first_packet()?;
    session.require_phase(&[LoginPhase::AwaitingCredentials, LoginPhase::SeedReceived])?;

    let username = reader.read_ascii_fixed(30)?;
    let password = reader.read_ascii_fixed(30)?;
    let shard = session.shard();

    if let Err(reason) = shard.hooks.account_login(&username, &password) {
        return reject(session, reason);
    }
    let Some(servers) = shard.hooks.server_list(&username) else {
        return reject(session, RejectReason::BadCommunication);
    };

    debug!(conn_id = %session.id(), %username, servers = servers.len(), "account login accepted");
    session.send(&ServerList { servers: &servers })?;
    session.state.servers = servers;
    session.state.username = Some(username);
    session.set_phase(LoginPhase::AwaitingServerSelection);
    Ok(())
}

/// 0xA0: shard chosen. Issues the token for the game connection.
fn play_server(session: &mut Session, reader: &mut RingReader<'_>) -> Result<(), NetError> {
    session.require_phase(&[LoginPhase::AwaitingServerSelection])?;

    let index = usize::from(reader.read_u16()?);
    let address = session
        .state
        .servers
        .get(index)
        .map(|server| server.address)
        .ok_or(HandshakeFault::UnknownServer)?;

    let token = session.shard().auth.issue(session.state.version);
    session.state.auth_token = Some(token);
    session.state.sent_first_packet = false;
    session.send(&PlayServerAck { address, token })?;

    debug!(conn_id = %session.id(), index, token, "play server");
    session.set_phase(LoginPhase::AwaitingGameLogin);
    Ok(())
}

/// 0x91: credentials on the game connection, with the token.
fn game_login(session: &mut Session, reader: &mut RingReader<'_>) -> Result<(), NetError> {
    session.claim_first_packet()?;
    session.require_phase(&[LoginPhase::SeedReceived, LoginPhase::AwaitingGameLogin])?;

    let token = reader.read_u32()?;
    let expected = session.state.auth_token.or(session.state.seed);
    if expected != Some(token) {
        return Err(HandshakeFault::InvalidAuthToken.into());
    }

    let shard = session.shard();
    let restored = shard
        .auth
        .consume(token)
        .ok_or(HandshakeFault::InvalidAuthToken)?;
    if let Some(version) = restored {
        session.state.version = Some(version);
    }

    let username = reader.read_ascii_fixed(30)?;
    let password = reader.read_ascii_fixed(30)?;

    let characters = match shard.hooks.game_login(&username, &password) {
        Ok(characters) => characters,
        Err(reason) => return reject(session, reason),
    };

    if let Some(encoder) = shard.hooks.packet_encoder() {
        session.outbox.set_encoder(encoder);
    }
    let cities = shard.hooks.starting_cities(&username);
    let extended = session
        .state
        .version
        .is_some_and(|v| v >= CITY_COORDINATES);

    let features = session.supported_features();
    session.send(&features)?;
    session.send(&CharacterList {
        names: &characters,
        cities: &cities,
        flags: shard.settings.character_flags,
        extended,
    })?;

    debug!(
        conn_id = %session.id(),
        %username,
        characters = characters.len(),
        cities = cities.len(),
        "game login accepted"
    );
    session.state.characters = characters;
    session.state.cities = cities;
    session.state.username = Some(username);
    session.set_phase(LoginPhase::CharacterSelect);
    Ok(())
}

/// 0x5D: enter the world as an existing character.
fn play_character(session: &mut Session, reader: &mut RingReader<'_>) -> Result<(), NetError> {
    session.require_phase(&[LoginPhase::CharacterSelect])?;

    skip(reader, 4)?; // 0xEDEDEDED
    let name = reader.read_ascii_fixed(30)?;
    skip(reader, 2)?;
    let flags = reader.read_i32()?;
    skip(reader, 24)?;
    let slot = reader.read_i32()?;
    let _client_ip = reader.read_i32()?;

    session.state.client_flags = flags;
    let slot = usize::try_from(slot)
        .ok()
        .filter(|slot| *slot < session.state.characters.len())
        .ok_or(HandshakeFault::UnknownCharacter)?;

    if let Some(active) = session.shard().hooks.character_in_world(&username(session)) {
        if active != session.state.characters[slot] {
            return character_in_world(session, &active);
        }
    }

    let entry = session
        .shard()
        .hooks
        .play_character(&username(session), slot, &name)
        .ok_or(HandshakeFault::UnknownCharacter)?;

    debug!(conn_id = %session.id(), slot, name = %entry.name, "play character");
    session.begin_world_entry(entry)
}

/// 0x00 and 0xF8: create a character and enter the world with it. The
/// longer frame carries a fourth skill pair.
fn create_character(session: &mut Session, reader: &mut RingReader<'_>) -> Result<(), NetError> {
    session.require_phase(&[LoginPhase::CharacterSelect])?;

    let skill_pairs = if reader.len() >= 106 { 4 } else { 3 };

    skip(reader, 9)?;
    let name = reader.read_ascii_fixed(30)?;
    skip(reader, 2)?;
    let flags = reader.read_i32()?;
    skip(reader, 8)?;
    let profession = reader.read_u8()?;
    skip(reader, 15)?;

    let gender_race = reader.read_u8()?;
    let strength = reader.read_u8()?;
    let dexterity = reader.read_u8()?;
    let intelligence = reader.read_u8()?;

    let mut skills = Vec::with_capacity(skill_pairs);
    for _ in 0..skill_pairs {
        skills.push((reader.read_u8()?, reader.read_u8()?));
    }

    let hue = reader.read_u16()?;
    let hair = (reader.read_i16()?, reader.read_i16()?);
    let facial_hair = (reader.read_i16()?, reader.read_i16()?);
    skip(reader, 1)?;
    let city = reader.read_u8()?;
    let slot = reader.read_i32()?;
    let _client_ip = reader.read_i32()?;
    let shirt_hue = reader.read_i16()?;
    let pants_hue = reader.read_i16()?;

    session.state.client_flags = flags;
    let Some(city) = session.state.cities.get(usize::from(city)).cloned() else {
        info!(conn_id = %session.id(), city, "invalid starting city");
        session.dispose();
        return Ok(());
    };

    if let Some(active) = session.shard().hooks.character_in_world(&username(session)) {
        return character_in_world(session, &active);
    }

    let modern = session.state.version.is_some_and(|v| v >= STYGIAN_ABYSS);
    let race = match (modern, gender_race) {
        (true, g) if g < 4 => 0,
        (true, g) => g / 2 - 1,
        (false, g) => g / 2,
    };

    let creation = CharacterCreation {
        name,
        slot,
        flags,
        profession,
        female: gender_race % 2 != 0,
        race,
        strength,
        dexterity,
        intelligence,
        skills,
        hue,
        hair,
        facial_hair,
        city,
        shirt_hue,
        pants_hue,
    };

    let Some(entry) = session
        .shard()
        .hooks
        .create_character(&username(session), &creation)
    else {
        info!(conn_id = %session.id(), name = %creation.name, "character creation refused");
        session.dispose();
        return Ok(());
    };

    debug!(conn_id = %session.id(), name = %entry.name, race, "character created");
    session.begin_world_entry(entry)
}

/// Another character on the account is still in the world. The client stays
/// on the character list.
fn character_in_world(session: &mut Session, active: &str) -> Result<(), NetError> {
    info!(conn_id = %session.id(), %active, "character already in world");
    session.send(&PopupMessage {
        message: PopupMessage::CHARACTER_IN_WORLD,
    })
}

/// 0x83: delete the character in a slot.
fn delete_character(session: &mut Session, reader: &mut RingReader<'_>) -> Result<(), NetError> {
    session.require_phase(&[LoginPhase::CharacterSelect])?;

    skip(reader, 30)?; // password
    let index = reader.read_i32()?;

    let remaining = usize::try_from(index).ok().and_then(|slot| {
        session
            .shard()
            .hooks
            .delete_character(&username(session), slot)
    });

    match remaining {
        Some(names) => {
            debug!(conn_id = %session.id(), index, "character deleted");
            session.send(&CharacterListUpdate { names: &names })?;
            session.state.characters = names;
        }
        None => session.send(&DeleteResult {
            reason: DeleteResult::CHARACTER_NOT_FOUND,
        })?,
    }
    Ok(())
}

fn record_version(session: &mut Session, text: &str) {
    let version = text.parse::<ClientVersion>().unwrap_or_else(|err| {
        warn!(conn_id = %session.id(), %err, "unparsable client version");
        ClientVersion::default()
    });
    debug!(conn_id = %session.id(), %version, "client version");
    session.state.version = Some(version);
    session.shard().hooks.client_version_received(version);
}

/// 0xBD: version string.
fn client_version(session: &mut Session, reader: &mut RingReader<'_>) -> Result<(), NetError> {
    let text = reader.read_ascii()?;
    record_version(session, &text);
    Ok(())
}

/// 0xE1: client type and version string.
fn client_type(session: &mut Session, reader: &mut RingReader<'_>) -> Result<(), NetError> {
    reader.read_u16()?;
    let kind = reader.read_u16()?;
    let text = reader.read_ascii()?;
    debug!(conn_id = %session.id(), kind, "client type");
    record_version(session, &text);
    Ok(())
}

/// 0xBE: assistant tool version. Read and ignored.
fn assist_version(_session: &mut Session, reader: &mut RingReader<'_>) -> Result<(), NetError> {
    reader.read_i32()?;
    reader.read_ascii()?;
    Ok(())
}

/// 0xBB: account id. Ignored.
fn account_id(_session: &mut Session, _reader: &mut RingReader<'_>) -> Result<(), NetError> {
    Ok(())
}
