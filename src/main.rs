//! shardgate server binary.
//!
//! Features:
//! - Dual-segment ring buffers over circular receive/send allocations
//! - Opcode dispatch with fixed and length-prefixed frames
//! - Bounded session token window shared across connections
//! - Configuration via CLI arguments or TOML file

use shardgate::config::Config;
use shardgate::protocol::{OpenShard, Shard};
use shardgate::runtime;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        shards = config.servers.len(),
        auth_window = config.auth_window,
        version_poll_ms = config.version_poll.as_millis() as u64,
        receive_kb = config.receive_size / 1024,
        send_kb = config.send_size / 1024,
        "starting shardgate"
    );

    let hooks = OpenShard::new(config.servers.clone());
    let shard = Arc::new(Shard::new(Box::new(hooks), config.shard_settings()));

    runtime::run(config, shard)?;
    Ok(())
}
