//! Connection timers.
//!
//! Each connection carries three one-shot deadlines ([`Timers`]). A network
//! thread keeps a single [`TimerHeap`] over all of its connections, keyed by
//! slab index and generation. Rescheduling never removes heap entries;
//! stale entries are recognised when they pop and discarded.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use super::ConnRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Idle between requests on a persistent connection.
    KeepAlive,
    /// Waiting for request bytes.
    Read,
    /// Waiting for the peer to accept response bytes.
    Write,
}

const KINDS: [TimerKind; 3] = [TimerKind::KeepAlive, TimerKind::Read, TimerKind::Write];

/// The three deadlines of one connection.
///
/// Arming an already-armed timer restarts it. Disarming an idle timer is a
/// no-op.
#[derive(Debug, Clone, Default)]
pub struct Timers {
    deadlines: [Option<Instant>; 3],
}

fn slot(kind: TimerKind) -> usize {
    match kind {
        TimerKind::KeepAlive => 0,
        TimerKind::Read => 1,
        TimerKind::Write => 2,
    }
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) `kind` to fire `after` from `now`.
    pub fn arm(&mut self, kind: TimerKind, now: Instant, after: Duration) {
        self.deadlines[slot(kind)] = Some(now + after);
    }

    /// Restart `kind` only if it is currently armed. Used on progress.
    pub fn again(&mut self, kind: TimerKind, now: Instant, after: Duration) {
        if self.is_armed(kind) {
            self.arm(kind, now, after);
        }
    }

    pub fn disarm(&mut self, kind: TimerKind) {
        self.deadlines[slot(kind)] = None;
    }

    pub fn disarm_all(&mut self) {
        self.deadlines = [None; 3];
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines[slot(kind)].is_some()
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines[slot(kind)]
    }

    /// Earliest armed deadline.
    pub fn earliest(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Disarm and return the first timer whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Option<TimerKind> {
        let kind = KINDS
            .into_iter()
            .filter(|k| matches!(self.deadline(*k), Some(d) if d <= now))
            .min_by_key(|k| self.deadline(*k))?;
        self.disarm(kind);
        Some(kind)
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    deadline: Instant,
    key: ConnRef,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap (a max-heap) yields the earliest deadline.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.key.index.cmp(&self.key.index))
            .then_with(|| other.key.generation.cmp(&self.key.generation))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of connection deadlines with lazy deletion.
#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: BinaryHeap<Entry>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, key: ConnRef, deadline: Instant) {
        self.heap.push(Entry { deadline, key });
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pop every entry due at `now`.
    ///
    /// Callers compare each key's deadline against the connection's current
    /// timers; entries that no longer match are stale and ignored.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(ConnRef, Instant)> {
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                due.push((entry.key, entry.deadline));
            }
        }
        due
    }

    /// How long the event loop may sleep before the next deadline.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(now))
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(index: usize) -> ConnRef {
        ConnRef {
            index,
            generation: 0,
        }
    }

    #[test]
    fn test_arm_again_disarm() {
        let now = Instant::now();
        let mut timers = Timers::new();

        // `again` does nothing on an idle timer.
        timers.again(TimerKind::Read, now, Duration::from_secs(1));
        assert!(!timers.is_armed(TimerKind::Read));

        timers.arm(TimerKind::Read, now, Duration::from_secs(1));
        timers.again(TimerKind::Read, now + Duration::from_millis(500), Duration::from_secs(1));
        assert_eq!(
            timers.deadline(TimerKind::Read),
            Some(now + Duration::from_millis(1500))
        );

        timers.disarm(TimerKind::Read);
        timers.disarm(TimerKind::Read);
        assert_eq!(timers.earliest(), None);
    }

    #[test]
    fn test_take_expired_returns_earliest_first() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.arm(TimerKind::Write, now, Duration::from_millis(10));
        timers.arm(TimerKind::KeepAlive, now, Duration::from_millis(20));

        assert_eq!(timers.take_expired(now), None);

        let later = now + Duration::from_millis(30);
        assert_eq!(timers.take_expired(later), Some(TimerKind::Write));
        assert_eq!(timers.take_expired(later), Some(TimerKind::KeepAlive));
        assert_eq!(timers.take_expired(later), None);
    }

    #[test]
    fn test_heap_orders_by_deadline() {
        let now = Instant::now();
        let mut heap = TimerHeap::new();
        heap.schedule(key(1), now + Duration::from_millis(30));
        heap.schedule(key(2), now + Duration::from_millis(10));
        heap.schedule(key(3), now + Duration::from_millis(20));

        assert_eq!(
            heap.next_timeout(now),
            Some(Duration::from_millis(10))
        );

        let due = heap.pop_expired(now + Duration::from_millis(25));
        let indices: Vec<usize> = due.iter().map(|(k, _)| k.index).collect();
        assert_eq!(indices, vec![2, 3]);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_heap_overdue_timeout_is_zero() {
        let now = Instant::now();
        let mut heap = TimerHeap::new();
        heap.schedule(key(0), now);
        assert_eq!(
            heap.next_timeout(now + Duration::from_secs(1)),
            Some(Duration::ZERO)
        );
    }
}
