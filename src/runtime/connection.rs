//! Connection identity and the per-worker connection registry.
//!
//! Slab keys are reused as soon as a connection closes, so anything that
//! outlives a connection (a pending timer, a log line) refers to it by a
//! [`ConnectionId`]: the slab key plus the generation it was inserted under.
//! A stale id simply fails to resolve.

use crate::protocol::session::Session;
use crate::runtime::buffer::CircularBuffer;
use mio::net::TcpStream;
use slab::Slab;
use std::fmt;
use std::net::SocketAddr;

/// Generation-checked handle to a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    key: usize,
    generation: u32,
}

impl ConnectionId {
    pub fn new(key: usize, generation: u32) -> Self {
        Self { key, generation }
    }

    /// Slab key, also used as the mio token.
    pub fn key(&self) -> usize {
        self.key
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.key, self.generation)
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading frames and writing replies.
    Open,
    /// Disposed by the handshake; close once the send buffer drains.
    Draining,
}

/// A single client connection.
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub state: ConnState,
    /// Registered for write readiness as well as read.
    pub writable: bool,
    pub recv: CircularBuffer,
    pub session: Session,
}

/// Registry of live values keyed by [`ConnectionId`].
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<T> {
    entries: Slab<(u32, T)>,
    next_generation: u32,
    max_connections: usize,
}

impl<T> ConnectionRegistry<T> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            entries: Slab::with_capacity(max_connections),
            next_generation: 0,
            max_connections,
        }
    }

    /// Insert the value built by `make`, which receives the id it will be
    /// stored under.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert_with(&mut self, make: impl FnOnce(ConnectionId) -> T) -> Option<ConnectionId> {
        if self.entries.len() >= self.max_connections {
            return None;
        }
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let entry = self.entries.vacant_entry();
        let id = ConnectionId::new(entry.key(), generation);
        entry.insert((generation, make(id)));
        Some(id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&T> {
        match self.entries.get(id.key) {
            Some((generation, value)) if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut T> {
        match self.entries.get_mut(id.key) {
            Some((generation, value)) if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    /// Resolve a bare slab key, as carried by a mio token.
    pub fn id_for_key(&self, key: usize) -> Option<ConnectionId> {
        self.entries
            .get(key)
            .map(|(generation, _)| ConnectionId::new(key, *generation))
    }

    /// Remove a connection. Stale ids remove nothing.
    pub fn remove(&mut self, id: ConnectionId) -> Option<T> {
        self.get(id)?;
        Some(self.entries.remove(id.key).1)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
