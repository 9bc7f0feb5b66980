//! Seams to the execution engines and the per-slice instruction budget.

use std::sync::Arc;

use pace_time::VirtualClock;
use serde::Serialize;

use crate::{AccelError, Vcpu};

/// Why an engine returned control to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitReason {
    /// Breakpoint or single-step trap; the vCPU stops for the debugger.
    Debug,
    /// The guest halted and has no pending work.
    Halted,
    /// An atomic instruction must be re-run outside parallel execution.
    AtomicRetry,
    /// Budget exhausted, exit requested, interrupt, ...; the loop simply continues.
    Other,
}

/// Software (translating) execution engine.
///
/// `exec` runs with the global lock released and must return promptly once
/// [`ExecContext::should_exit`] reports true.
pub trait TcgExecutor: Send + Sync {
    fn exec(&self, ctx: &mut ExecContext<'_>) -> ExitReason;

    /// Execute exactly one instruction with every other vCPU excluded.
    fn exec_step_atomic(&self, _vcpu: &Vcpu) {}

    /// A halted vCPU has something to do (pending interrupt). Called with the global lock held.
    fn has_work(&self, _vcpu: &Vcpu) -> bool {
        false
    }
}

/// Hardware acceleration layer.
pub trait Accelerator: Send + Sync {
    fn init_vcpu(&self, vcpu: &Vcpu) -> Result<(), AccelError>;

    /// Enter guest mode until the next exit. Must return promptly after
    /// [`kick`](Accelerator::kick) or once [`Vcpu::take_ipi`] reports a pending interrupt.
    fn run(&self, vcpu: &Vcpu) -> ExitReason;

    fn destroy_vcpu(&self, _vcpu: &Vcpu) {}

    /// Force an in-progress [`run`](Accelerator::run) to return.
    fn kick(&self, _vcpu: &Vcpu) {}

    /// Halts are handled inside the accelerator; a halted vCPU is never idle here.
    fn halt_in_kernel(&self) -> bool {
        false
    }

    fn has_work(&self, _vcpu: &Vcpu) -> bool {
        false
    }
}

/// Which engine executes guest code.
#[derive(Clone)]
pub enum Engine {
    Tcg(Arc<dyn TcgExecutor>),
    Accel(Arc<dyn Accelerator>),
    /// No execution at all (protocol testing); vCPU threads only service queued work.
    Qtest,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Engine::Tcg(_) => "Engine::Tcg",
            Engine::Accel(_) => "Engine::Accel",
            Engine::Qtest => "Engine::Qtest",
        })
    }
}

impl Engine {
    pub fn is_tcg(&self) -> bool {
        matches!(self, Engine::Tcg(_))
    }

    pub(crate) fn has_work(&self, vcpu: &Vcpu) -> bool {
        match self {
            Engine::Tcg(exec) => exec.has_work(vcpu),
            Engine::Accel(accel) => accel.has_work(vcpu),
            Engine::Qtest => false,
        }
    }

    pub(crate) fn halt_in_kernel(&self) -> bool {
        match self {
            Engine::Accel(accel) => accel.halt_in_kernel(),
            _ => false,
        }
    }
}

/// Instruction budget of one scheduling slice.
///
/// The engine decrements a 16-bit counter; `extra` refills it whenever it runs dry so a slice
/// can cover more than `u16::MAX` instructions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IcountBudget {
    budget: i64,
    low: u16,
    extra: i64,
}

impl IcountBudget {
    pub fn new(limit: i64) -> Self {
        let limit = limit.max(0);
        let low = limit.min(i64::from(u16::MAX));
        Self {
            budget: limit,
            low: low as u16,
            extra: limit - low,
        }
    }

    pub fn budget(&self) -> i64 {
        self.budget
    }

    pub fn low(&self) -> u16 {
        self.low
    }

    pub fn extra(&self) -> i64 {
        self.extra
    }

    pub fn remaining(&self) -> i64 {
        i64::from(self.low) + self.extra
    }

    pub fn executed(&self) -> i64 {
        self.budget - self.remaining()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Retire up to `count` instructions; returns how many fit in the budget.
    pub fn consume(&mut self, count: i64) -> i64 {
        let granted = count.clamp(0, self.remaining());
        let mut left = granted;
        while left > 0 {
            if self.low == 0 {
                let refill = self.extra.min(i64::from(u16::MAX));
                self.low = refill as u16;
                self.extra -= refill;
            }
            let take = left.min(i64::from(self.low));
            self.low -= take as u16;
            left -= take;
        }
        granted
    }
}

/// View of a vCPU handed to [`TcgExecutor::exec`] for one slice.
pub struct ExecContext<'a> {
    vcpu: &'a Vcpu,
    clock: &'a VirtualClock,
    budget: Option<IcountBudget>,
    executed: u64,
}

impl<'a> ExecContext<'a> {
    pub(crate) fn new(vcpu: &'a Vcpu, clock: &'a VirtualClock, budget: Option<IcountBudget>) -> Self {
        Self {
            vcpu,
            clock,
            budget,
            executed: 0,
        }
    }

    pub fn vcpu(&self) -> &Vcpu {
        self.vcpu
    }

    pub fn index(&self) -> usize {
        self.vcpu.index()
    }

    /// Exit requested by a kick, or the budget is spent.
    pub fn should_exit(&self) -> bool {
        self.vcpu.exit_requested() || self.budget.is_some_and(|b| b.is_exhausted())
    }

    /// Instructions left in this slice, `None` when unbounded.
    pub fn remaining(&self) -> Option<u64> {
        self.budget.map(|b| b.remaining().max(0) as u64)
    }

    pub fn budget(&self) -> Option<IcountBudget> {
        self.budget
    }

    /// Account `count` retired instructions; returns how many fit in the budget.
    pub fn retire(&mut self, count: u64) -> u64 {
        let granted = match self.budget.as_mut() {
            Some(budget) => budget.consume(i64::try_from(count).unwrap_or(i64::MAX)) as u64,
            None => count,
        };
        self.executed += granted;
        granted
    }

    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Mark the current instruction as allowed (or not) to perform I/O and read virtual time.
    pub fn set_can_do_io(&self, can_do_io: bool) {
        self.vcpu.set_can_do_io(can_do_io);
    }

    /// Guest virtual time including the instructions retired so far in this slice.
    ///
    /// With icount on, reading it from an instruction that may not do I/O is a logic error in
    /// the engine and aborts the process.
    pub fn virtual_ns(&self) -> i64 {
        if !self.clock.icount_enabled() {
            return self.clock.get_clock();
        }
        if self.vcpu.is_running() && !self.vcpu.can_do_io() {
            tracing::error!(cpu = self.vcpu.index(), "Bad icount read");
            std::process::abort();
        }
        let in_flight = i64::try_from(self.executed).unwrap_or(i64::MAX);
        self.clock.get_icount() + self.clock.icount_to_ns(in_flight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn budget_splits_into_low_and_extra() {
        let budget = IcountBudget::new(100_000);
        assert_eq!(budget.low(), u16::MAX);
        assert_eq!(budget.extra(), 100_000 - 65_535);
        assert_eq!(budget.remaining(), 100_000);
        assert_eq!(budget.executed(), 0);

        let small = IcountBudget::new(10);
        assert_eq!((small.low(), small.extra()), (10, 0));
        assert_eq!(IcountBudget::new(-5), IcountBudget::default());
    }

    #[test]
    fn consume_refills_low_from_extra() {
        let mut budget = IcountBudget::new(70_000);
        assert_eq!(budget.consume(65_535), 65_535);
        assert_eq!(budget.low(), 0);
        assert_eq!(budget.consume(1), 1);
        assert_eq!(budget.extra(), 0);
        assert_eq!(budget.low(), (70_000_i32 - 65_536) as u16);
        assert_eq!(budget.executed(), 65_536);

        assert_eq!(budget.consume(1_000_000), 70_000 - 65_536);
        assert!(budget.is_exhausted());
        assert_eq!(budget.executed(), 70_000);
        assert_eq!(budget.consume(1), 0);
    }

    proptest::proptest! {
        #[test]
        fn executed_plus_remaining_is_budget(limit in 0i64..1_000_000, steps in proptest::collection::vec(0i64..100_000, 0..20)) {
            let mut budget = IcountBudget::new(limit);
            let mut total = 0;
            for step in steps {
                total += budget.consume(step);
                proptest::prop_assert_eq!(budget.executed() + budget.remaining(), limit);
            }
            proptest::prop_assert_eq!(budget.executed(), total);
        }
    }
}
