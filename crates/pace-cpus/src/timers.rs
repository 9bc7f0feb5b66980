//! Machine timers on top of [`TimerQueue`](pace_time::TimerQueue): arming, dispatch of the
//! scheduler's own periodic timers, and wakeups when a deadline moves earlier.

use std::sync::Arc;

use pace_time::{ClockKind, TimerId, NANOSECONDS_PER_SECOND};

use crate::machine::{MachineTimer, Shared};
use crate::vcpu::current_cpu;
use crate::{BackendKind, Engine, Locked};

const ICOUNT_ADJUST_RT_PERIOD_NS: i64 = NANOSECONDS_PER_SECOND;
const ICOUNT_ADJUST_VM_PERIOD_NS: i64 = NANOSECONDS_PER_SECOND / 10;

impl Shared {
    /// Current value of `clock`.
    ///
    /// `Virtual` follows instruction time when icount is on and VM runtime otherwise.
    /// `VirtualRt` is VM runtime with icount and host time without.
    pub(crate) fn clock_now(&self, clock: ClockKind) -> i64 {
        let icount = self.clock.icount_enabled();
        match clock {
            ClockKind::Realtime => self.clock.host().now_ns(),
            ClockKind::Virtual if icount => self.clock.get_icount(),
            ClockKind::Virtual => self.clock.get_clock(),
            ClockKind::VirtualRt if icount => self.clock.get_clock(),
            ClockKind::VirtualRt => self.clock.host().now_ns(),
        }
    }
}

impl Locked<'_> {
    pub fn clock_now(&self, clock: ClockKind) -> i64 {
        self.shared.clock_now(clock)
    }

    /// Allocate a timer on `clock` whose callback runs with the lock held, on the main loop or,
    /// for a due virtual timer under icount, on the vCPU thread that reached the deadline.
    pub fn new_timer(
        &mut self,
        clock: ClockKind,
        callback: impl Fn(&mut Locked<'_>) + Send + Sync + 'static,
    ) -> TimerId {
        self.state
            .timers
            .new_timer(clock, MachineTimer::Callback(Arc::new(callback)))
    }

    pub fn timer_mod(&mut self, id: TimerId, deadline_ns: i64) {
        if self.state.timers.modify(id, deadline_ns) {
            self.notify_timer_clock(id);
        }
    }

    /// Move `id` earlier to `deadline_ns`; never postpones it.
    pub fn timer_mod_anticipate(&mut self, id: TimerId, deadline_ns: i64) {
        if self.state.timers.modify_anticipate(id, deadline_ns) {
            self.notify_timer_clock(id);
        }
    }

    pub fn timer_del(&mut self, id: TimerId) {
        self.state.timers.delete(id);
    }

    pub fn timer_free(&mut self, id: TimerId) {
        self.state.timers.free(id);
    }

    pub fn timer_pending(&self, id: TimerId) -> bool {
        self.state.timers.is_pending(id)
    }

    pub fn timer_expire_time(&self, id: TimerId) -> Option<i64> {
        self.state.timers.expire_time(id)
    }

    /// Nanoseconds until the next timer on `clock` fires; `None` when nothing is armed.
    pub fn clock_deadline_ns(&self, clock: ClockKind) -> Option<i64> {
        self.state.timers.deadline_ns(clock, self.clock_now(clock))
    }

    fn notify_timer_clock(&mut self, id: TimerId) {
        if let Some(clock) = self.state.timers.clock_of(id) {
            self.timer_notify(clock);
        }
    }

    /// A deadline on `clock` moved earlier: wake whoever computes sleeps or budgets from it.
    pub(crate) fn timer_notify(&mut self, clock: ClockKind) {
        if !self.shared.clock.icount_enabled() || clock != ClockKind::Virtual {
            self.shared.notify_event();
            return;
        }

        // With icount the running vCPU sized its budget from the old deadline.
        if let Some(index) = current_cpu(self.shared.id) {
            if let Some(vcpu) = self.vcpu(index) {
                self.shared.kick(&vcpu);
            }
        } else if let Some(first) = self.live_vcpus().first() {
            let index = first.index();
            if let Err(err) = self.async_run_on_cpu(index, |_, _| {}) {
                tracing::trace!(%err, "timer notify found no vCPU");
            }
        }
        self.shared.notify_event();
    }

    /// Fire every expired timer of `clock` once. Returns whether anything ran.
    pub fn run_timers(&mut self, clock: ClockKind) -> bool {
        let now = self.clock_now(clock);
        let fired = self.state.timers.expired(clock, now);
        let ran = !fired.is_empty();
        for (_, event) in fired {
            self.dispatch_timer(event);
        }
        ran
    }

    fn dispatch_timer(&mut self, event: MachineTimer) {
        match event {
            MachineTimer::Throttle => self.throttle_tick(),
            MachineTimer::KickRoundRobin => {
                let next = self.clock_now(ClockKind::Virtual) + self.shared.config.kick_period_ns;
                let kick = self.state.internal.kick;
                self.timer_mod(kick, next);
                self.shared.kick_rr_cpu();
            }
            MachineTimer::IcountAdjustRt => {
                self.shared.clock.adjust(self.runstate_is_running());
                if let Some(id) = self.state.internal.adjust_rt {
                    let next = self.clock_now(ClockKind::VirtualRt) + ICOUNT_ADJUST_RT_PERIOD_NS;
                    self.timer_mod(id, next);
                }
            }
            MachineTimer::IcountAdjustVm => {
                self.shared.clock.adjust(self.runstate_is_running());
                if let Some(id) = self.state.internal.adjust_vm {
                    let next = self.clock_now(ClockKind::Virtual) + ICOUNT_ADJUST_VM_PERIOD_NS;
                    self.timer_mod(id, next);
                }
            }
            MachineTimer::IcountWarp => self.icount_warp_rt(),
            MachineTimer::Callback(callback) => callback(self),
        }
    }

    /// Arm the round-robin kick timer when at least two vCPUs share the thread.
    pub(crate) fn start_kick_timer(&mut self) {
        if !matches!(self.shared.engine, Engine::Tcg(_)) || self.shared.mttcg {
            return;
        }
        let kick = self.state.internal.kick;
        if self.state.timers.is_pending(kick) {
            return;
        }
        let members = self
            .state
            .cpus
            .iter()
            .filter(|e| e.vcpu.kind() == BackendKind::RoundRobin && e.flags.created)
            .count();
        if members > 1 {
            let next = self.clock_now(ClockKind::Virtual) + self.shared.config.kick_period_ns;
            self.timer_mod(kick, next);
        }
    }

    pub(crate) fn stop_kick_timer(&mut self) {
        let kick = self.state.internal.kick;
        self.state.timers.delete(kick);
    }
}
