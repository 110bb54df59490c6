//! Session token window.
//!
//! A login connection that picks a shard is handed a token; the client then
//! opens a second connection to the game server and presents it. The window
//! correlates the two and carries the negotiated client version across.
//!
//! Tokens are single-use. The window holds at most `capacity` entries and
//! evicts the oldest-issued one to make room; there is no other expiry.

use crate::protocol::version::ClientVersion;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::trace;

/// Entries held by default.
pub const DEFAULT_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy)]
struct AuthEntry {
    issued_at: Instant,
    /// Monotonic issue order; breaks ties between equal `issued_at`.
    seq: u64,
    version: Option<ClientVersion>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<u32, AuthEntry>,
    /// Issue order to token, oldest first.
    order: BTreeMap<u64, u32>,
    next_seq: u64,
}

/// Bounded, process-wide token table.
#[derive(Debug)]
pub struct AuthWindow {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl AuthWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Issue a token for a client that negotiated `version`.
    pub fn issue(&self, version: Option<ClientVersion>) -> u32 {
        self.issue_with(version, &mut rand::thread_rng())
    }

    /// Issue a token drawing randomness from `rng`.
    ///
    /// The low 31 bits are uniformly random and never all zero; the high bit
    /// is a separate coin flip. A token already in the window is redrawn.
    pub fn issue_with<R: RngCore + ?Sized>(&self, version: Option<ClientVersion>, rng: &mut R) -> u32 {
        let mut inner = self.inner.lock();

        let token = loop {
            let low = rng.next_u32() & 0x7FFF_FFFF;
            if low == 0 {
                continue;
            }
            let token = if rng.next_u32() & 1 == 1 {
                low | 0x8000_0000
            } else {
                low
            };
            if !inner.entries.contains_key(&token) {
                break token;
            }
            trace!(token, "auth token collision, redrawing");
        };

        while inner.entries.len() >= self.capacity {
            let Some((_, oldest)) = inner.order.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
            trace!(token = oldest, "evicted oldest auth token");
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, token);
        inner.entries.insert(
            token,
            AuthEntry {
                issued_at: Instant::now(),
                seq,
                version,
            },
        );
        token
    }

    /// True if `token` is live. Does not consume it.
    pub fn contains(&self, token: u32) -> bool {
        self.inner.lock().entries.contains_key(&token)
    }

    /// Remove and return the entry for `token`.
    ///
    /// The outer `None` means the token is unknown or was already used. The
    /// inner option is the version recorded at issue time.
    pub fn consume(&self, token: u32) -> Option<Option<ClientVersion>> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(&token)?;
        inner.order.remove(&entry.seq);
        trace!(
            token,
            age_ms = entry.issued_at.elapsed().as_millis() as u64,
            "consumed auth token"
        );
        Some(entry.version)
    }
}

impl Default for AuthWindow {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out a fixed script of values, then counts up from 1000.
    struct ScriptedRng {
        script: VecDeque<u32>,
        fallback: u32,
    }

    impl ScriptedRng {
        fn new(script: &[u32]) -> Self {
            Self {
                script: script.iter().copied().collect(),
                fallback: 1000,
            }
        }
    }

    impl RngCore for ScriptedRng {
        fn next_u32(&mut self) -> u32 {
            self.script.pop_front().unwrap_or_else(|| {
                self.fallback += 1;
                self.fallback
            })
        }

        fn next_u64(&mut self) -> u64 {
            u64::from(self.next_u32())
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for chunk in dest.chunks_mut(4) {
                let bytes = self.next_u32().to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn test_issue_then_consume_once() {
        let window = AuthWindow::default();
        let version = ClientVersion::new(7, 0, 15, 1);
        let token = window.issue(Some(version));
        assert_ne!(token, 0);
        assert_eq!(window.len(), 1);

        assert_eq!(window.consume(token), Some(Some(version)));
        assert_eq!(window.consume(token), None);
        assert_eq!(window.consume(token ^ 1), None);
        assert!(window.is_empty());
    }

    #[test]
    fn test_collision_redraws() {
        let window = AuthWindow::default();
        // First issue: 5, low coin. Second issue: 5 again (collides), then 9
        // with the high bit.
        let mut rng = ScriptedRng::new(&[5, 0, 5, 0, 9, 1]);
        let first = window.issue_with(None, &mut rng);
        let second = window.issue_with(None, &mut rng);
        assert_eq!(first, 5);
        assert_eq!(second, 9 | 0x8000_0000);
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_zero_low_bits_redrawn() {
        let window = AuthWindow::default();
        let mut rng = ScriptedRng::new(&[0x8000_0000, 0, 7, 0]);
        assert_eq!(window.issue_with(None, &mut rng), 7);
    }

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let window = AuthWindow::new(128);
        let tokens: Vec<u32> = (0..129).map(|_| window.issue(None)).collect();

        assert_eq!(window.len(), 128);
        assert_eq!(window.consume(tokens[0]), None);
        for token in &tokens[1..] {
            assert!(window.consume(*token).is_some());
        }
        assert!(window.is_empty());
    }

    #[test]
    fn test_consume_frees_capacity() {
        let window = AuthWindow::new(2);
        let a = window.issue(None);
        let b = window.issue(None);
        assert!(window.consume(a).is_some());
        let c = window.issue(None);
        // Nothing evicted: consuming `a` made room
        assert!(window.consume(b).is_some());
        assert!(window.consume(c).is_some());
    }
}
