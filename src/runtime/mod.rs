//! Networking runtime.
//!
//! - `buffer`: circular per-connection buffers and the pool that recycles them
//! - `connection`: connection identity and the per-worker registry
//! - `timer`: deadline scheduler for login timers
//! - `event_loop`: mio workers (epoll on Linux, kqueue on macOS)

pub mod buffer;
pub mod connection;
mod event_loop;
pub mod timer;

pub use event_loop::run;
