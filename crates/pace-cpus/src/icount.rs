//! Glue between the virtual clock and the vCPU loops: slice budgets, deadline handling,
//! warping while idle, host/guest alignment and drift reporting.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use pace_time::{ClockKind, WarpDecision, SCALE_MS};
use serde::Serialize;

use crate::vcpu::{current_cpu, set_current_cpu};
use crate::{Engine, IcountBudget, Locked, MachineError, Vcpu};

/// Guest may run this far ahead of the host before the executing thread sleeps.
const VM_CLOCK_ADVANCE_NS: i64 = 3 * SCALE_MS;

/// Extremes of host/guest drift seen while aligning.
#[derive(Debug, Default)]
pub(crate) struct AlignStats {
    max_delay: AtomicI64,
    max_advance: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriftInfo {
    /// VM runtime minus instruction time.
    pub host_minus_guest_ms: i64,
    /// Only tracked with `align=on`.
    pub max_delay_ms: Option<i64>,
    pub max_advance_ms: Option<i64>,
}

impl Locked<'_> {
    /// Elapsed VM time in ticks. See [`VirtualClock::get_ticks`](pace_time::VirtualClock::get_ticks).
    pub fn get_ticks(&mut self) -> i64 {
        self.shared.clock.get_ticks(&mut self.state.ticks)
    }

    pub fn enable_ticks(&mut self) {
        self.shared.clock.enable_ticks(&mut self.state.ticks);
    }

    pub fn disable_ticks(&mut self) {
        self.shared.clock.disable_ticks(&mut self.state.ticks);
    }

    /// Budget for the next software slice: up to the next virtual deadline under icount,
    /// capped by the configured instruction quantum.
    pub(crate) fn slice_budget(&self) -> Option<IcountBudget> {
        let quantum = self
            .shared
            .config
            .quantum
            .as_ref()
            .map_or(0, |q| q.core)
            .min(i64::MAX as u64) as i64;

        let icount_limit = self.shared.clock.icount_enabled().then(|| {
            let deadline = match self.clock_deadline_ns(ClockKind::Virtual) {
                Some(deadline) if deadline <= i64::from(i32::MAX) => deadline,
                _ => i64::from(i32::MAX),
            };
            self.shared.clock.icount_round(deadline)
        });

        match (icount_limit, quantum) {
            (Some(limit), q) if q > 0 => Some(IcountBudget::new(limit.min(q))),
            (Some(limit), _) => Some(IcountBudget::new(limit)),
            (None, q) if q > 0 => Some(IcountBudget::new(q)),
            (None, _) => None,
        }
    }

    /// A virtual timer is due: run it here, before the next slice. The slice budget stays zero
    /// until it fires.
    ///
    /// Callbacks see the first round-robin vCPU as current, so a stop they request is deferred
    /// to the main loop.
    pub(crate) fn handle_icount_deadline(&mut self) {
        if !self.shared.clock.icount_enabled()
            || self.clock_deadline_ns(ClockKind::Virtual) != Some(0)
        {
            return;
        }
        let id = self.shared.id;
        let previous = current_cpu(id);
        if previous.is_none() {
            set_current_cpu(id, self.rr_first());
        }
        self.run_timers(ClockKind::Virtual);
        set_current_cpu(id, previous);
    }

    /// Begin warping virtual time while every vCPU is idle.
    pub(crate) fn start_warp_timer(&mut self) {
        if !self.shared.clock.icount_enabled()
            || !self.runstate_is_running()
            || !self.all_cpu_threads_idle()
            || matches!(self.shared.engine, Engine::Qtest)
        {
            return;
        }

        let rt_now = self.clock_now(ClockKind::VirtualRt);
        let deadline = self.clock_deadline_ns(ClockKind::Virtual);
        match self.shared.clock.start_warp(rt_now, deadline) {
            WarpDecision::Nothing => {}
            WarpDecision::NotifyVirtual => self.timer_notify(ClockKind::Virtual),
            WarpDecision::ArmWarpTimer { at_ns } => {
                if let Some(warp) = self.state.internal.warp {
                    self.timer_mod_anticipate(warp, at_ns);
                }
            }
        }
    }

    /// A vCPU woke up: settle any warp in progress.
    pub(crate) fn account_warp_timer(&mut self) {
        if !self.shared.clock.icount_enabled()
            || !self.shared.clock.sleep_enabled()
            || !self.runstate_is_running()
        {
            return;
        }
        if let Some(warp) = self.state.internal.warp {
            self.timer_del(warp);
        }
        self.icount_warp_rt();
    }

    pub(crate) fn icount_warp_rt(&mut self) {
        let running = self.runstate_is_running();
        if !self.shared.clock.warp_rt(running) {
            return;
        }
        let now = self.clock_now(ClockKind::Virtual);
        if self.state.timers.has_expired(ClockKind::Virtual, now) {
            self.timer_notify(ClockKind::Virtual);
        }
    }

    /// Move virtual time to `dest_ns` without executing instructions, firing virtual timers on
    /// the way. Only meaningful when nothing executes guest code.
    pub fn qtest_clock_warp(&mut self, dest_ns: i64) -> Result<(), MachineError> {
        if !matches!(self.shared.engine, Engine::Qtest) || !self.shared.clock.icount_enabled() {
            return Err(MachineError::QtestUnavailable);
        }

        let mut clock = self.clock_now(ClockKind::Virtual);
        while clock < dest_ns {
            let remaining = dest_ns - clock;
            let warp = match self.clock_deadline_ns(ClockKind::Virtual) {
                Some(deadline) => remaining.min(deadline),
                None => remaining,
            };
            self.shared.clock.advance_bias(warp);
            self.run_timers(ClockKind::Virtual);
            clock = self.clock_now(ClockKind::Virtual);
        }
        self.timer_notify(ClockKind::Virtual);
        Ok(())
    }

    pub fn dump_drift_info(&self) -> Option<DriftInfo> {
        let clock = &self.shared.clock;
        if !clock.icount_enabled() {
            return None;
        }
        let align = self.shared.config.icount.align;
        let stats = &self.shared.align;
        Some(DriftInfo {
            host_minus_guest_ms: (clock.get_clock() - clock.get_icount()) / SCALE_MS,
            max_delay_ms: align.then(|| stats.max_delay.load(Ordering::Relaxed) / SCALE_MS),
            max_advance_ms: align.then(|| stats.max_advance.load(Ordering::Relaxed) / SCALE_MS),
        })
    }

    /// Bookkeeping after a software slice retired `executed` instructions.
    pub(crate) fn account_slice(&mut self, vcpu: &Vcpu, executed: u64) {
        let retired = i64::try_from(executed).unwrap_or(i64::MAX);
        if self.shared.clock.icount_enabled() {
            self.shared.clock.add_icount(retired);
        }
        vcpu.note_slice(executed);
        self.shared.quantum.record(vcpu.index(), executed);
        if let crate::ExternalSimulator::Loaded(sim) = &self.shared.simulator {
            sim.on_slice(vcpu.index(), executed);
        }
        if self.shared.config.icount.align {
            self.align_clocks();
        }
    }

    /// Keep guest time from running ahead of the host by sleeping the executing thread.
    fn align_clocks(&mut self) {
        let diff = self.shared.clock.get_icount() - self.shared.clock.get_clock();
        let stats = &self.shared.align;
        stats.max_advance.fetch_max(diff, Ordering::Relaxed);
        stats.max_delay.fetch_max(-diff, Ordering::Relaxed);
        if diff > VM_CLOCK_ADVANCE_NS {
            let pause = Duration::from_nanos(diff.unsigned_abs());
            tracing::trace!(diff, "guest ahead of host, sleeping");
            self.unlocked(|| std::thread::sleep(pause));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pace_time::{FakeHostClock, IcountMode};
    use pretty_assertions::assert_eq;

    use crate::{CpusConfig, IcountSettings, MachineBuilder, QuantumSettings};

    fn icount_config(mode: IcountMode, sleep: bool) -> CpusConfig {
        CpusConfig {
            icount: IcountSettings {
                mode,
                sleep,
                align: false,
            },
            ..CpusConfig::default()
        }
    }

    #[test]
    fn budget_follows_next_virtual_deadline() {
        let host = Arc::new(FakeHostClock::new(0));
        let machine = MachineBuilder::new(icount_config(IcountMode::Fixed { shift: 3 }, true))
            .host_clock(host)
            .build()
            .unwrap();
        let mut bql = machine.lock();
        // Nothing armed: the slice is bounded by i32::MAX ns, rounded up to whole instructions.
        assert_eq!(bql.slice_budget().map(|b| b.budget()), Some(268_435_456));

        let timer = bql.new_timer(pace_time::ClockKind::Virtual, |_| {});
        bql.timer_mod(timer, 8_000);
        assert_eq!(bql.slice_budget().map(|b| b.budget()), Some(1_000));
    }

    #[test]
    fn quantum_caps_slices_without_icount() {
        let config = CpusConfig {
            quantum: Some(QuantumSettings {
                core: 500,
                record: 0,
                step: 0,
                file: None,
                node: 0,
            }),
            ..CpusConfig::default()
        };
        let machine = MachineBuilder::new(config).build().unwrap();
        let bql = machine.lock();
        assert_eq!(bql.slice_budget().map(|b| b.budget()), Some(500));
    }

    #[test]
    fn no_budget_without_icount_or_quantum() {
        let machine = MachineBuilder::new(CpusConfig::default()).build().unwrap();
        assert!(machine.lock().slice_budget().is_none());
        assert_eq!(machine.lock().dump_drift_info(), None);
    }

    #[test]
    fn drift_info_reports_alignment_only_when_enabled() {
        let host = Arc::new(FakeHostClock::new(0));
        let machine = MachineBuilder::new(icount_config(IcountMode::Fixed { shift: 0 }, true))
            .host_clock(host.clone())
            .build()
            .unwrap();
        let mut bql = machine.lock();
        bql.enable_ticks();
        host.advance_ns(5 * pace_time::SCALE_MS);
        let info = bql.dump_drift_info().unwrap();
        assert_eq!(info.host_minus_guest_ms, 5);
        assert_eq!(info.max_delay_ms, None);
        assert_eq!(info.max_advance_ms, None);
    }

    #[test]
    fn qtest_warp_fires_virtual_timers_in_order() {
        let host = Arc::new(FakeHostClock::new(0));
        let machine = MachineBuilder::new(icount_config(IcountMode::Fixed { shift: 0 }, false))
            .host_clock(host)
            .build()
            .unwrap();
        let fired = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut bql = machine.lock();
        for deadline in [300_i64, 100, 200] {
            let fired = Arc::clone(&fired);
            let timer = bql.new_timer(pace_time::ClockKind::Virtual, move |bql| {
                fired
                    .lock()
                    .push((deadline, bql.clock_now(pace_time::ClockKind::Virtual)));
            });
            bql.timer_mod(timer, deadline);
        }

        bql.qtest_clock_warp(250).unwrap();
        assert_eq!(bql.clock_now(pace_time::ClockKind::Virtual), 250);
        assert_eq!(*fired.lock(), vec![(100, 100), (200, 200)]);
    }

    #[test]
    fn qtest_warp_requires_qtest_and_icount() {
        let machine = MachineBuilder::new(CpusConfig::default()).build().unwrap();
        assert!(machine.lock().qtest_clock_warp(10).is_err());
    }
}
