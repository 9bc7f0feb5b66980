//! Virtual time for the vCPU scheduler.
//!
//! The machine keeps two notions of elapsed guest time:
//!
//! - a **host tick** clock, derived from a monotonic host source and paused while the VM is
//!   stopped, used when instruction counting is off;
//! - an **icount** clock, derived from the number of retired guest instructions scaled by a
//!   power-of-two shift, used for deterministic execution and record/replay.
//!
//! Multi-field clock state is published through a [`SeqLock`] so that readers on any thread
//! never block a writer and never observe a torn `(bias, icount, shift)` triple. Unit tests
//! drive everything through [`FakeHostClock`].

mod clock;
mod seqlock;
mod timer_queue;
mod virtual_clock;

pub use clock::{FakeHostClock, HostClock, StdHostClock};
pub use seqlock::SeqLock;
pub use timer_queue::{ClockKind, TimerId, TimerQueue};
pub use virtual_clock::{
    ClockSnapshot, IcountMode, TickAccount, VirtualClock, WarpDecision, ICOUNT_WOBBLE_NS,
    MAX_ICOUNT_SHIFT,
};

/// Nanoseconds per second, as a signed quantity (clock values are `i64` nanoseconds).
pub const NANOSECONDS_PER_SECOND: i64 = 1_000_000_000;

/// Nanoseconds per millisecond.
pub const SCALE_MS: i64 = 1_000_000;
