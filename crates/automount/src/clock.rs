//! Software callout clock.
//!
//! Deferred actions are queued with [`Clock::timeout`] and handed back by
//! [`Clock::softclock`] once their deadline has passed. The daemon keeps a
//! single clock; its notion of "now" only moves when the event loop calls
//! [`Clock::tick`], so every subsystem observes the same time within one
//! iteration.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Identifies a scheduled callout so it can be cancelled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CalloutId(u64);

#[derive(Debug)]
pub struct Clock<T> {
    now: Instant,
    seq: u64,
    // Keyed by (deadline, id) so equal deadlines fire in insertion order
    callouts: BTreeMap<(Instant, CalloutId), T>,
}

impl<T> Clock<T> {
    pub fn new(now: Instant) -> Clock<T> {
        Clock {
            now,
            seq: 0,
            callouts: BTreeMap::new(),
        }
    }

    /// The time of the current loop iteration.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Advance the clock. Time never runs backwards.
    pub fn tick(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Schedule `what` to fire `after` from now.
    pub fn timeout(&mut self, after: Duration, what: T) -> CalloutId {
        self.seq += 1;
        let id = CalloutId(self.seq);
        self.callouts.insert((self.now + after, id), what);
        id
    }

    /// Cancel a pending callout, returning its payload if it had not fired.
    pub fn untimeout(&mut self, id: CalloutId) -> Option<T> {
        let key = self
            .callouts
            .keys()
            .find(|(_, cid)| *cid == id)
            .copied()?;
        self.callouts.remove(&key)
    }

    /// Remove and return every callout whose deadline has passed, earliest first.
    pub fn softclock(&mut self) -> Vec<(CalloutId, T)> {
        let mut fired = Vec::new();
        while let Some(entry) = self.callouts.first_entry() {
            if entry.key().0 > self.now {
                break;
            }
            let ((_, id), what) = entry.remove_entry();
            fired.push((id, what));
        }
        fired
    }

    /// Deadline of the earliest pending callout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.callouts.keys().next().map(|(when, _)| *when)
    }

    pub fn pending(&self) -> usize {
        self.callouts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callouts_fire_in_deadline_order() {
        let mut clock = Clock::new(Instant::now());
        clock.timeout(Duration::from_secs(20), "late");
        clock.timeout(Duration::from_secs(5), "early");
        clock.timeout(Duration::from_secs(5), "early-second");

        assert!(clock.softclock().is_empty());
        clock.advance(Duration::from_secs(10));
        let fired: Vec<_> = clock.softclock().into_iter().map(|(_, w)| w).collect();
        assert_eq!(fired, vec!["early", "early-second"]);
        assert_eq!(clock.pending(), 1);
    }

    #[test]
    fn untimeout_cancels() {
        let mut clock = Clock::new(Instant::now());
        let id = clock.timeout(Duration::from_secs(1), 7u32);
        assert_eq!(clock.untimeout(id), Some(7));
        assert_eq!(clock.untimeout(id), None);
        clock.advance(Duration::from_secs(2));
        assert!(clock.softclock().is_empty());
        assert!(clock.next_deadline().is_none());
    }
}
