//! Login handshake protocol.
//!
//! - `dispatch`: opcode table and frame validation
//! - `incoming`: handshake packet handlers
//! - `outgoing`: server packets and the per-connection outbox
//! - `session`: per-connection login state machine
//! - `auth`: session token window shared across connections
//! - `hooks`: account and world policy

pub mod auth;
pub mod dispatch;
pub mod hooks;
pub mod incoming;
pub mod outgoing;
pub mod session;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

pub use hooks::{AccountHooks, CityInfo, OpenShard, ServerInfo};
pub use session::{LoginPoll, Session, Shard, ShardSettings};
pub use version::ClientVersion;
