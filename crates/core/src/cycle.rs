//! Cycle manager: the global clock plus a schedule of cycle-exact timers.
//!
//! Timers are identified by a [`TimerId`] handed out by [`CycleManager::allocate`].
//! The manager only tracks *when* a timer is due; what happens when it fires
//! is decided by the caller of [`CycleManager::process`] (the device routes
//! the call to the peripheral owning the timer).
//!
//! ## Ordering
//!
//! The schedule is keyed by `(due cycle, sequence number)`. The sequence
//! number is taken from a counter incremented on every insertion, so timers
//! due on the same cycle fire in the order they were scheduled.
//!
//! A single `process` call only fires entries that existed when it started.
//! Anything scheduled from a handler (including a periodic reschedule) waits
//! for the next call, even when already due.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::CycleCount;

/// Handle to one timer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(pub(crate) usize);

impl TimerId {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Slot {
    Idle,
    Scheduled { when: CycleCount, seq: u64 },
    Paused { remaining: CycleCount },
}

/// Serialisable image of the cycle manager, used by device snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleState {
    cycle: CycleCount,
    seq: u64,
    slots: Vec<Slot>,
}

impl CycleState {
    /// Number of allocated timers.
    pub fn timer_count(&self) -> usize {
        self.slots.len()
    }
}

#[derive(Debug, Default)]
pub struct CycleManager {
    cycle: CycleCount,
    seq: u64,
    queue: BTreeMap<(CycleCount, u64), TimerId>,
    slots: Vec<Slot>,
}

impl CycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a new timer slot. Slots are never released.
    pub fn allocate(&mut self) -> TimerId {
        self.slots.push(Slot::Idle);
        TimerId(self.slots.len() - 1)
    }

    pub fn timer_count(&self) -> usize {
        self.slots.len()
    }

    #[inline(always)]
    pub fn cycle(&self) -> CycleCount {
        self.cycle
    }

    /// Advance the clock by `n` cycles. Never goes backwards.
    #[inline(always)]
    pub fn increment_cycle(&mut self, n: CycleCount) {
        self.cycle += n;
    }

    /// Schedule `id` to fire `delay` cycles from now, replacing any pending entry.
    pub fn schedule(&mut self, id: TimerId, delay: CycleCount) {
        let when = self.cycle.saturating_add(delay);
        self.schedule_at(id, when);
    }

    /// Schedule `id` at an absolute cycle. A past cycle is clamped to the
    /// current one, so the timer fires on the next `process`.
    pub fn schedule_at(&mut self, id: TimerId, when: CycleCount) {
        let Some(slot) = self.slots.get(id.0).copied() else {
            tracing::warn!(timer = id.0, "schedule on unallocated timer");
            return;
        };
        if let Slot::Scheduled { when, seq } = slot {
            self.queue.remove(&(when, seq));
        }
        let when = when.max(self.cycle);
        let seq = self.seq;
        self.seq += 1;
        self.queue.insert((when, seq), id);
        self.slots[id.0] = Slot::Scheduled { when, seq };
    }

    /// Remove `id` from the schedule. Paused timers lose their remaining delay.
    pub fn cancel(&mut self, id: TimerId) {
        match self.slots.get(id.0).copied() {
            Some(Slot::Scheduled { when, seq }) => {
                self.queue.remove(&(when, seq));
                self.slots[id.0] = Slot::Idle;
            }
            Some(Slot::Paused { .. }) => self.slots[id.0] = Slot::Idle,
            _ => {}
        }
    }

    /// Drop every pending and paused timer.
    pub fn cancel_all(&mut self) {
        self.queue.clear();
        for slot in &mut self.slots {
            *slot = Slot::Idle;
        }
    }

    /// Take `id` out of the schedule but remember how far it was from firing.
    pub fn pause(&mut self, id: TimerId) {
        if let Some(Slot::Scheduled { when, seq }) = self.slots.get(id.0).copied() {
            self.queue.remove(&(when, seq));
            self.slots[id.0] = Slot::Paused { remaining: when.saturating_sub(self.cycle) };
        }
    }

    /// Reschedule a paused timer with its remaining delay.
    pub fn resume(&mut self, id: TimerId) {
        if let Some(Slot::Paused { remaining }) = self.slots.get(id.0).copied() {
            self.schedule(id, remaining);
        }
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        matches!(self.slots.get(id.0), Some(Slot::Scheduled { .. }))
    }

    pub fn is_paused(&self, id: TimerId) -> bool {
        matches!(self.slots.get(id.0), Some(Slot::Paused { .. }))
    }

    /// Due cycle of `id`, if scheduled.
    pub fn when(&self, id: TimerId) -> Option<CycleCount> {
        match self.slots.get(id.0) {
            Some(Slot::Scheduled { when, .. }) => Some(*when),
            _ => None,
        }
    }

    /// Soonest due cycle in the schedule.
    pub fn next_when(&self) -> Option<CycleCount> {
        self.queue.keys().next().map(|&(when, _)| when)
    }

    /// Start a processing pass at cycle `now`. Returns the sequence limit to
    /// pass to [`pop_due`](Self::pop_due).
    pub fn begin(&mut self, now: CycleCount) -> u64 {
        self.cycle = self.cycle.max(now);
        self.seq
    }

    /// Remove and return the next due timer scheduled before `limit`.
    pub fn pop_due(&mut self, limit: u64) -> Option<(TimerId, CycleCount)> {
        let key = self
            .queue
            .range(..=(self.cycle, u64::MAX))
            .map(|(k, _)| *k)
            .find(|&(_, seq)| seq < limit)?;
        let id = self.queue.remove(&key)?;
        self.slots[id.0] = Slot::Idle;
        Some((id, key.0))
    }

    /// Finish a firing started with [`pop_due`](Self::pop_due).
    ///
    /// `Some(delay)` reschedules relative to the cycle the timer was due at
    /// (minimum one cycle), replacing anything the handler scheduled for it.
    /// `None` leaves the timer as the handler left it.
    pub fn complete(&mut self, id: TimerId, when: CycleCount, next: Option<CycleCount>) {
        if let Some(delay) = next {
            self.schedule_at(id, when.saturating_add(delay.max(1)));
        }
    }

    /// Fire every timer due at or before `now`.
    ///
    /// The handler receives the manager (so it may schedule or cancel any
    /// timer), the firing timer and its due cycle.
    pub fn process<F>(&mut self, now: CycleCount, mut handler: F)
    where
        F: FnMut(&mut CycleManager, TimerId, CycleCount) -> Option<CycleCount>,
    {
        let limit = self.begin(now);
        while let Some((id, when)) = self.pop_due(limit) {
            let next = handler(self, id, when);
            self.complete(id, when, next);
        }
    }

    pub fn state(&self) -> CycleState {
        CycleState { cycle: self.cycle, seq: self.seq, slots: self.slots.clone() }
    }

    /// Restore a schedule captured by [`state`](Self::state). The slot count
    /// must match the current allocation.
    pub fn restore(&mut self, state: &CycleState) -> bool {
        if state.slots.len() != self.slots.len() {
            return false;
        }
        self.cycle = state.cycle;
        self.seq = state.seq;
        self.slots = state.slots.clone();
        self.queue.clear();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Slot::Scheduled { when, seq } = *slot {
                self.queue.insert((when, seq), TimerId(i));
            }
        }
        true
    }
}
