//! shardgate: login server for a persistent-world game shard
//!
//! Accepts client connections, runs the two-connection login handshake
//! (seed, account login, shard selection, game login, character selection,
//! version negotiation) and hands the client off into the world.
//!
//! - `wire`: primitive codec, dual-segment ring views, entity serialization
//! - `protocol`: opcode dispatch, token window, login state machine, hooks
//! - `runtime`: circular buffers, connection registry, timers, mio workers
//! - `config`: CLI arguments and TOML file

pub mod config;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod wire;
