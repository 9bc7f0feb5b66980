//! CPU throttling: caps guest execution to a share of host time by periodically making every
//! vCPU thread sleep.
//!
//! With a throttle of `p` percent and a timeslice `T`, each period of `T / (1 - p)` queues a
//! sleep of `p / (1 - p) * T` on every vCPU, so a vCPU runs for `T` out of every period.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pace_time::ClockKind;
use serde::Serialize;

use crate::{Locked, Machine, Vcpu};

pub const CPU_THROTTLE_PCT_MIN: u32 = 1;
pub const CPU_THROTTLE_PCT_MAX: u32 = 99;

#[derive(Debug)]
pub(crate) struct Throttle {
    percentage: AtomicU32,
    timeslice_ns: i64,
    scheduled_sleeps: AtomicU64,
    slept_ns: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThrottleStats {
    pub percentage: u32,
    /// Sleep work items queued onto vCPUs.
    pub scheduled_sleeps: u64,
    pub slept_ns: u64,
}

impl Throttle {
    pub(crate) fn new(timeslice_ns: i64) -> Self {
        Self {
            percentage: AtomicU32::new(0),
            timeslice_ns,
            scheduled_sleeps: AtomicU64::new(0),
            slept_ns: AtomicU64::new(0),
        }
    }

    pub(crate) fn percentage(&self) -> u32 {
        self.percentage.load(Ordering::SeqCst)
    }

    fn ratio(pct: u32) -> f64 {
        f64::from(pct) / 100.0
    }

    /// Length of one throttle period at `pct`.
    pub(crate) fn period_ns(&self, pct: u32) -> i64 {
        (self.timeslice_ns as f64 / (1.0 - Self::ratio(pct))) as i64
    }

    /// Time each vCPU sleeps per period at `pct`.
    pub(crate) fn sleep_ns(&self, pct: u32) -> i64 {
        let pct = Self::ratio(pct);
        (pct / (1.0 - pct) * self.timeslice_ns as f64) as i64
    }

    pub(crate) fn stats(&self) -> ThrottleStats {
        ThrottleStats {
            percentage: self.percentage(),
            scheduled_sleeps: self.scheduled_sleeps.load(Ordering::Relaxed),
            slept_ns: self.slept_ns.load(Ordering::Relaxed),
        }
    }
}

impl Locked<'_> {
    /// Throttle every vCPU to `pct` percent, clamped to [1, 99]. Zero stops throttling.
    pub fn cpu_throttle_set(&mut self, pct: u32) {
        if pct == 0 {
            self.cpu_throttle_stop();
            return;
        }
        let pct = pct.clamp(CPU_THROTTLE_PCT_MIN, CPU_THROTTLE_PCT_MAX);
        self.shared.throttle.percentage.store(pct, Ordering::SeqCst);
        tracing::info!(pct, "cpu throttle set");

        let timer = self.state.internal.throttle;
        let next = self.clock_now(ClockKind::VirtualRt) + self.shared.throttle.timeslice_ns;
        self.timer_mod(timer, next);
    }

    /// The timer keeps firing once more and then stays disarmed.
    pub fn cpu_throttle_stop(&mut self) {
        self.shared.throttle.percentage.store(0, Ordering::SeqCst);
        tracing::info!("cpu throttle stopped");
    }

    pub fn cpu_throttle_active(&self) -> bool {
        self.shared.throttle.percentage() != 0
    }

    pub fn cpu_throttle_get_percentage(&self) -> u32 {
        self.shared.throttle.percentage()
    }

    pub(crate) fn throttle_tick(&mut self) {
        let pct = self.shared.throttle.percentage();
        if pct == 0 {
            return;
        }
        for vcpu in self.live_vcpus() {
            if vcpu.throttle_scheduled.swap(true, Ordering::SeqCst) {
                continue;
            }
            self.shared
                .throttle
                .scheduled_sleeps
                .fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.async_run_on_cpu(vcpu.index(), throttle_sleep) {
                vcpu.throttle_scheduled.store(false, Ordering::SeqCst);
                tracing::debug!(%err, "throttle sleep not queued");
            }
        }

        let timer = self.state.internal.throttle;
        let next = self.clock_now(ClockKind::VirtualRt) + self.shared.throttle.period_ns(pct);
        self.timer_mod(timer, next);
    }
}

/// Runs on the throttled vCPU's own thread.
fn throttle_sleep(bql: &mut Locked<'_>, vcpu: &Arc<Vcpu>) {
    let pct = bql.shared.throttle.percentage();
    if pct != 0 {
        let sleep_ns = bql.shared.throttle.sleep_ns(pct).max(0);
        let sleep = Duration::from_nanos(sleep_ns.unsigned_abs());
        bql.unlocked(|| std::thread::sleep(sleep));
        bql.shared
            .throttle
            .slept_ns
            .fetch_add(sleep_ns.unsigned_abs(), Ordering::Relaxed);
    }
    vcpu.throttle_scheduled.store(false, Ordering::SeqCst);
}

impl Machine {
    pub fn cpu_throttle_set(&self, pct: u32) {
        self.lock().cpu_throttle_set(pct);
    }

    pub fn cpu_throttle_stop(&self) {
        self.lock().cpu_throttle_stop();
    }

    pub fn cpu_throttle_active(&self) -> bool {
        self.shared.throttle.percentage() != 0
    }

    pub fn cpu_throttle_get_percentage(&self) -> u32 {
        self.shared.throttle.percentage()
    }

    pub fn throttle_stats(&self) -> ThrottleStats {
        self.shared.throttle.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_THROTTLE_TIMESLICE_NS;
    use crate::{CpusConfig, MachineBuilder};
    use pretty_assertions::assert_eq;

    #[test]
    fn set_clamps_and_zero_stops() {
        let machine = MachineBuilder::new(CpusConfig::default()).build().unwrap();
        machine.cpu_throttle_set(50);
        assert_eq!(machine.cpu_throttle_get_percentage(), 50);
        assert!(machine.cpu_throttle_active());

        machine.cpu_throttle_set(150);
        assert_eq!(machine.cpu_throttle_get_percentage(), CPU_THROTTLE_PCT_MAX);

        machine.cpu_throttle_set(0);
        assert!(!machine.cpu_throttle_active());
    }

    #[test]
    fn half_throttle_sleeps_one_timeslice_per_period() {
        let throttle = Throttle::new(DEFAULT_THROTTLE_TIMESLICE_NS);
        assert_eq!(throttle.sleep_ns(50), DEFAULT_THROTTLE_TIMESLICE_NS);
        assert_eq!(throttle.period_ns(50), 2 * DEFAULT_THROTTLE_TIMESLICE_NS);
    }

    proptest::proptest! {
        #[test]
        fn running_share_is_one_minus_pct(pct in CPU_THROTTLE_PCT_MIN..=CPU_THROTTLE_PCT_MAX) {
            let throttle = Throttle::new(DEFAULT_THROTTLE_TIMESLICE_NS);
            let period = throttle.period_ns(pct) as f64;
            let sleep = throttle.sleep_ns(pct) as f64;
            let running = (period - sleep) / period;
            let expected = 1.0 - f64::from(pct) / 100.0;
            proptest::prop_assert!((running - expected).abs() < 1e-3, "{running} vs {expected}");
        }
    }
}
