//! Frame builders and fixtures shared by the protocol tests.

use crate::protocol::hooks::{AccountHooks, OpenShard, ServerInfo};
use crate::protocol::session::{Session, Shard, ShardSettings};
use crate::runtime::buffer::CircularBuffer;
use crate::runtime::connection::ConnectionId;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

pub fn servers() -> Vec<ServerInfo> {
    vec![ServerInfo {
        name: "Test Shard".to_string(),
        address: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2593),
        full_percent: 0,
        timezone: 0,
    }]
}

pub fn shard() -> Arc<Shard> {
    with_hooks(OpenShard::new(servers()))
}

pub fn with_hooks(hooks: impl AccountHooks + 'static) -> Arc<Shard> {
    Arc::new(Shard::new(Box::new(hooks), ShardSettings::default()))
}

/// A fresh session and its receive buffer.
pub fn session(shard: Arc<Shard>) -> (Session, CircularBuffer) {
    let session = Session::new(ConnectionId::new(0, 0), shard, CircularBuffer::new(4096));
    (session, CircularBuffer::new(4096))
}

pub fn feed(recv: &mut CircularBuffer, bytes: &[u8]) {
    assert!(recv.push(bytes), "receive buffer full");
}

/// Everything queued for sending.
pub fn sent(session: &Session) -> Vec<u8> {
    let (first, second) = session.outbox().buffer().segments();
    [first, second].concat()
}

fn ascii(out: &mut Vec<u8>, text: &str, width: usize) {
    let mut field = vec![0u8; width];
    let n = text.len().min(width);
    field[..n].copy_from_slice(&text.as_bytes()[..n]);
    out.extend_from_slice(&field);
}

fn variable(opcode: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![opcode];
    out.extend_from_slice(&((body.len() + 3) as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn seed_packet(seed: u32, version: (i32, i32, i32, i32)) -> Vec<u8> {
    let mut out = vec![0xEF];
    out.extend_from_slice(&seed.to_be_bytes());
    for part in [version.0, version.1, version.2, version.3] {
        out.extend_from_slice(&part.to_be_bytes());
    }
    out
}

pub fn account_login(username: &str, password: &str) -> Vec<u8> {
    let mut out = vec![0x80];
    ascii(&mut out, username, 30);
    ascii(&mut out, password, 30);
    out.push(0xFF);
    out
}

pub fn play_server(index: u16) -> Vec<u8> {
    let mut out = vec![0xA0];
    out.extend_from_slice(&index.to_be_bytes());
    out
}

pub fn game_login(token: u32, username: &str, password: &str) -> Vec<u8> {
    let mut out = vec![0x91];
    out.extend_from_slice(&token.to_be_bytes());
    ascii(&mut out, username, 30);
    ascii(&mut out, password, 30);
    out
}

/// 0x00 with three skill pairs, or 0xF8 with four.
pub fn create_character(name: &str, extended: bool) -> Vec<u8> {
    create_character_at(name, extended, 3)
}

pub fn create_character_at(name: &str, extended: bool, city: u8) -> Vec<u8> {
    let mut out = vec![if extended { 0xF8 } else { 0x00 }];
    out.extend_from_slice(&0xEDED_EDEDu32.to_be_bytes());
    out.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
    out.push(0);
    ascii(&mut out, name, 30);
    out.extend_from_slice(&[0; 2]);
    out.extend_from_slice(&0x1Fi32.to_be_bytes());
    out.extend_from_slice(&[0; 8]);
    out.push(2); // profession
    out.extend_from_slice(&[0; 15]);
    out.push(5); // female elf on a modern client
    out.extend_from_slice(&[60, 10, 10]);
    out.extend_from_slice(&[25, 50, 3, 30, 17, 20]);
    if extended {
        out.extend_from_slice(&[46, 0]);
    }
    out.extend_from_slice(&0x83EAu16.to_be_bytes());
    out.extend_from_slice(&0x203Bi16.to_be_bytes());
    out.extend_from_slice(&0x044Ei16.to_be_bytes());
    out.extend_from_slice(&0i16.to_be_bytes());
    out.extend_from_slice(&0i16.to_be_bytes());
    out.push(0);
    out.push(city);
    out.extend_from_slice(&0i32.to_be_bytes());
    out.extend_from_slice(&0x7F00_0001i32.to_be_bytes());
    out.extend_from_slice(&0x0386i16.to_be_bytes());
    out.extend_from_slice(&0x0387i16.to_be_bytes());
    out
}

pub fn play_character(name: &str, slot: i32) -> Vec<u8> {
    let mut out = vec![0x5D];
    out.extend_from_slice(&0xEDED_EDEDu32.to_be_bytes());
    ascii(&mut out, name, 30);
    out.extend_from_slice(&[0; 2]);
    out.extend_from_slice(&0x1Fi32.to_be_bytes());
    out.extend_from_slice(&[0; 24]);
    out.extend_from_slice(&slot.to_be_bytes());
    out.extend_from_slice(&0x7F00_0001i32.to_be_bytes());
    out
}

pub fn delete_character(index: i32) -> Vec<u8> {
    let mut out = vec![0x83];
    ascii(&mut out, "", 30);
    out.extend_from_slice(&index.to_be_bytes());
    out.extend_from_slice(&0x7F00_0001i32.to_be_bytes());
    out
}

pub fn account_id(id: u32) -> Vec<u8> {
    let mut out = vec![0xBB];
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&[0; 4]);
    out
}

pub fn client_version(version: &str) -> Vec<u8> {
    let mut body = version.as_bytes().to_vec();
    body.push(0);
    variable(0xBD, &body)
}

pub fn client_type(version: &str) -> Vec<u8> {
    let mut body = vec![0x00, 0x03, 0x00, 0x02];
    body.extend_from_slice(version.as_bytes());
    body.push(0);
    variable(0xE1, &body)
}

pub fn assist_version(text: &str) -> Vec<u8> {
    let mut body = 0x0102_0304i32.to_be_bytes().to_vec();
    body.extend_from_slice(text.as_bytes());
    body.push(0);
    variable(0xBE, &body)
}
