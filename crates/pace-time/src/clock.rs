use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Monotonic host time source.
///
/// `now_ns` feeds the VM runtime clock (`get_clock`). `ticks` is the raw host cycle counter
/// used by `get_ticks` when instruction counting is off; it is allowed to jump backwards
/// (e.g. across a host suspend) and the virtual clock compensates for that.
pub trait HostClock: Send + Sync {
    fn now_ns(&self) -> i64;

    fn ticks(&self) -> i64 {
        self.now_ns()
    }
}

/// Host clock backed by [`Instant`].
#[derive(Debug)]
pub struct StdHostClock {
    origin: Instant,
}

impl StdHostClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdHostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for StdHostClock {
    fn now_ns(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

/// Manually driven host clock for tests.
///
/// Ticks and nanoseconds move together unless a test rewinds ticks explicitly to simulate a
/// non-monotonic host cycle counter.
#[derive(Debug, Default)]
pub struct FakeHostClock {
    now_ns: AtomicI64,
    ticks: AtomicI64,
}

impl FakeHostClock {
    pub fn new(start_ns: i64) -> Self {
        Self {
            now_ns: AtomicI64::new(start_ns),
            ticks: AtomicI64::new(start_ns),
        }
    }

    pub fn advance_ns(&self, delta_ns: i64) {
        self.now_ns.fetch_add(delta_ns, Ordering::SeqCst);
        self.ticks.fetch_add(delta_ns, Ordering::SeqCst);
    }

    pub fn set_ticks(&self, ticks: i64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> i64 {
        self.now_ns.load(Ordering::SeqCst)
    }

    fn ticks(&self) -> i64 {
        self.ticks.load(Ordering::SeqCst)
    }
}
