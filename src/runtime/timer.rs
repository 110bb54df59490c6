//! Per-worker timers.
//!
//! Deadlines are kept in a `BTreeMap` ordered by `(deadline, id)`. The event
//! loop uses [`Scheduler::timeout`] as its poll timeout and fires whatever
//! [`Scheduler::poll_due`] returns. Recurring timers are re-queued by the
//! scheduler itself and keep their id until cancelled.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Entry<T> {
    payload: T,
    interval: Option<Duration>,
}

/// Deadline-ordered set of pending timers.
#[derive(Debug)]
pub struct Scheduler<T> {
    queue: BTreeMap<(Instant, TimerId), Entry<T>>,
    /// Current deadline of every pending timer.
    deadlines: HashMap<TimerId, Instant>,
    next_id: u64,
}

impl<T: Clone> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_id: 0,
        }
    }

    fn insert(&mut self, deadline: Instant, payload: T, interval: Option<Duration>) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.queue.insert((deadline, id), Entry { payload, interval });
        self.deadlines.insert(id, deadline);
        id
    }

    /// Fire `payload` once at `deadline`.
    pub fn schedule_at(&mut self, deadline: Instant, payload: T) -> TimerId {
        self.insert(deadline, payload, None)
    }

    /// Fire `payload` every `interval`, first at `now + interval`.
    pub fn schedule_every(&mut self, now: Instant, interval: Duration, payload: T) -> TimerId {
        self.insert(now + interval, payload, Some(interval))
    }

    /// Stop a timer. Cancelling a timer that already fired or was already
    /// cancelled is a no-op returning `None`.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let deadline = self.deadlines.remove(&id)?;
        self.queue.remove(&(deadline, id)).map(|entry| entry.payload)
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// How long the event loop may block before the next timer is due.
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Remove and return every timer due at `now`. Recurring timers are
    /// re-queued one interval after their previous deadline.
    pub fn poll_due(&mut self, now: Instant) -> Vec<(TimerId, T)> {
        let mut fired = Vec::new();

        while let Some(entry) = self.queue.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                break;
            }
            let entry = entry.remove();

            match entry.interval {
                Some(interval) => {
                    // Skip missed periods rather than firing a burst
                    let mut next = deadline + interval;
                    while next <= now {
                        next += interval;
                    }
                    fired.push((id, entry.payload.clone()));
                    self.queue.insert((next, id), entry);
                    self.deadlines.insert(id, next);
                }
                None => {
                    self.deadlines.remove(&id);
                    fired.push((id, entry.payload));
                }
            }
        }

        fired
    }
}

impl<T: Clone> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}
