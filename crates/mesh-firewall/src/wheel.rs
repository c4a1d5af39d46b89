//! Coarse expiry wheel for conntrack entries.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Hashed timer wheel. Keys are scheduled into coarse slots and surface
/// through [`purge`](TimerWheel::purge) once [`advance`](TimerWheel::advance)
/// has moved past their slot. Keys are never cancelled: a ticket that fires
/// for an entry refreshed in the meantime is simply re-scheduled by the
/// caller with the remaining lifetime.
#[derive(Debug)]
pub struct TimerWheel<K> {
    /// Duration of one slot.
    tick: Duration,
    /// Largest schedulable timeout.
    span: Duration,
    current: usize,
    last_tick: Option<Instant>,
    slots: Vec<VecDeque<K>>,
    expired: VecDeque<K>,
}

impl<K> TimerWheel<K> {
    /// `min` becomes the tick and `max` the span. Two extra slots absorb
    /// the partially elapsed current tick and a full-span timeout.
    pub fn new(min: Duration, max: Duration) -> Self {
        let ticks = (max.as_nanos() / min.as_nanos().max(1)) as usize + 2;
        Self {
            tick: min,
            span: max,
            current: 0,
            last_tick: None,
            slots: (0..ticks).map(|_| VecDeque::new()).collect(),
            expired: VecDeque::new(),
        }
    }

    /// Schedule a key. Timeouts clamp to `[tick, span]`.
    pub fn add(&mut self, key: K, timeout: Duration) {
        let slot = self.slot_for(timeout);
        self.slots[slot].push_back(key);
    }

    fn slot_for(&self, timeout: Duration) -> usize {
        let timeout = timeout.clamp(self.tick, self.span);
        let ticks = (timeout.as_nanos() / self.tick.as_nanos().max(1)) as usize;
        // +1 skips the partially elapsed current slot so nothing can fire
        // before its timeout.
        (self.current + ticks + 1) % self.slots.len()
    }

    /// Move the wheel forward to `now`, queueing every passed slot's keys
    /// for [`purge`](TimerWheel::purge). The first call only anchors the
    /// tick origin.
    pub fn advance(&mut self, now: Instant) {
        let Some(last) = self.last_tick else {
            self.last_tick = Some(now);
            return;
        };

        let elapsed = now.saturating_duration_since(last);
        let ticks = (elapsed.as_nanos() / self.tick.as_nanos().max(1)) as u64;
        for _ in 0..ticks {
            self.current = (self.current + 1) % self.slots.len();
            let slot = std::mem::take(&mut self.slots[self.current]);
            self.expired.extend(slot);
        }

        if ticks > 0 {
            self.last_tick = Some(last + self.tick * ticks as u32);
        }
    }

    /// Pop one expired key, if any.
    pub fn purge(&mut self) -> Option<K> {
        self.expired.pop_front()
    }
}
