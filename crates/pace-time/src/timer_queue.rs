//! Per-clock deadline lists.
//!
//! The queue does not run callbacks itself. Each timer carries an event payload of type `T`;
//! the owner asks for the expired events of a clock and dispatches them. This keeps the queue
//! free of borrows into the machine state that the callbacks need to mutate.

use serde::{Deserialize, Serialize};

/// Which clock a timer's deadline is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClockKind {
    /// Host monotonic time, runs even while the VM is stopped.
    Realtime,
    /// Guest virtual time (instruction-derived when icount is on). Stops while paused.
    Virtual,
    /// VM runtime clock: host time excluding periods where the VM was stopped.
    VirtualRt,
}

impl ClockKind {
    pub const ALL: [ClockKind; 3] = [ClockKind::Realtime, ClockKind::Virtual, ClockKind::VirtualRt];

    fn slot(self) -> usize {
        match self {
            ClockKind::Realtime => 0,
            ClockKind::Virtual => 1,
            ClockKind::VirtualRt => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Clone)]
struct TimerEntry<T> {
    id: TimerId,
    clock: ClockKind,
    deadline: Option<i64>,
    event: T,
}

#[derive(Debug, Clone)]
pub struct TimerQueue<T> {
    timers: Vec<TimerEntry<T>>,
    enabled: [bool; 3],
    next_id: u64,
}

impl<T: Clone> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            timers: Vec::new(),
            enabled: [true; 3],
            next_id: 1,
        }
    }

    /// Allocate an (unarmed) timer on `clock`.
    pub fn new_timer(&mut self, clock: ClockKind, event: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.timers.push(TimerEntry {
            id,
            clock,
            deadline: None,
            event,
        });
        id
    }

    /// Arm (or re-arm) `id` to fire at the absolute `deadline_ns`.
    ///
    /// Returns `true` if the timer became the earliest pending one on its clock, which is
    /// when a sleeping loop needs to be notified.
    pub fn modify(&mut self, id: TimerId, deadline_ns: i64) -> bool {
        let Some(clock) = self.clock_of(id) else {
            return false;
        };
        let earliest_before = self.earliest(clock);
        if let Some(entry) = self.timers.iter_mut().find(|t| t.id == id) {
            entry.deadline = Some(deadline_ns);
        }
        earliest_before.map_or(true, |prev| deadline_ns < prev)
    }

    /// Like [`modify`](Self::modify), but only ever moves an armed timer earlier.
    pub fn modify_anticipate(&mut self, id: TimerId, deadline_ns: i64) -> bool {
        match self.timers.iter().find(|t| t.id == id).and_then(|t| t.deadline) {
            Some(current) if current <= deadline_ns => false,
            _ => self.modify(id, deadline_ns),
        }
    }

    /// Disarm `id`. The timer stays allocated and can be re-armed.
    pub fn delete(&mut self, id: TimerId) {
        if let Some(entry) = self.timers.iter_mut().find(|t| t.id == id) {
            entry.deadline = None;
        }
    }

    /// Free `id` entirely.
    pub fn free(&mut self, id: TimerId) {
        self.timers.retain(|t| t.id != id);
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.timers
            .iter()
            .any(|t| t.id == id && t.deadline.is_some())
    }

    pub fn expire_time(&self, id: TimerId) -> Option<i64> {
        self.timers.iter().find(|t| t.id == id).and_then(|t| t.deadline)
    }

    pub fn set_enabled(&mut self, clock: ClockKind, enabled: bool) {
        self.enabled[clock.slot()] = enabled;
    }

    pub fn is_enabled(&self, clock: ClockKind) -> bool {
        self.enabled[clock.slot()]
    }

    /// Earliest armed deadline on `clock`, regardless of whether the clock is enabled.
    pub fn earliest(&self, clock: ClockKind) -> Option<i64> {
        self.timers
            .iter()
            .filter(|t| t.clock == clock)
            .filter_map(|t| t.deadline)
            .min()
    }

    /// Nanoseconds from `now_ns` until the earliest deadline on `clock`.
    ///
    /// `None` means "no deadline" (no armed timer, or the clock is disabled); an overdue timer
    /// reports `Some(0)`.
    pub fn deadline_ns(&self, clock: ClockKind, now_ns: i64) -> Option<i64> {
        if !self.is_enabled(clock) {
            return None;
        }
        self.earliest(clock)
            .map(|deadline| deadline.saturating_sub(now_ns).max(0))
    }

    pub fn has_expired(&self, clock: ClockKind, now_ns: i64) -> bool {
        self.deadline_ns(clock, now_ns) == Some(0)
    }

    /// Disarm and return every timer on `clock` whose deadline is at or before `now_ns`, in
    /// deadline order.
    pub fn expired(&mut self, clock: ClockKind, now_ns: i64) -> Vec<(TimerId, T)> {
        if !self.is_enabled(clock) {
            return Vec::new();
        }
        let mut fired: Vec<(i64, TimerId, T)> = Vec::new();
        for entry in self.timers.iter_mut().filter(|t| t.clock == clock) {
            match entry.deadline {
                Some(deadline) if deadline <= now_ns => {
                    entry.deadline = None;
                    fired.push((deadline, entry.id, entry.event.clone()));
                }
                _ => {}
            }
        }
        fired.sort_by_key(|(deadline, id, _)| (*deadline, *id));
        fired.into_iter().map(|(_, id, event)| (id, event)).collect()
    }

    pub fn clock_of(&self, id: TimerId) -> Option<ClockKind> {
        self.timers.iter().find(|t| t.id == id).map(|t| t.clock)
    }
}

impl<T: Clone> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
