//! Pluggable external simulator.
//!
//! A trace-mode simulator only observes retired instruction counts. A timing-mode simulator
//! takes over the round-robin thread once the machine starts and decides itself which vCPU
//! advances and when, through a [`TimingDriver`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::lifecycle::can_run;
use crate::vcpu::set_current_cpu;
use crate::{ExitReason, Locked, Machine, TcgExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimulatorMode {
    Trace,
    Timing,
}

pub trait Simulator: Send + Sync {
    fn mode(&self) -> SimulatorMode;

    fn name(&self) -> &str;

    /// Drive execution until done. Returning hands the thread back to the normal
    /// round-robin loop.
    fn run_timing(&self, _driver: &mut TimingDriver<'_, '_>) {}

    /// A slice on `cpu` retired `executed` instructions.
    fn on_slice(&self, _cpu: usize, _executed: u64) {}
}

#[derive(Clone, Default)]
pub enum ExternalSimulator {
    #[default]
    Absent,
    Loaded(Arc<dyn Simulator>),
}

impl std::fmt::Debug for ExternalSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExternalSimulator::Absent => f.write_str("Absent"),
            ExternalSimulator::Loaded(sim) => f
                .debug_tuple("Loaded")
                .field(&sim.name())
                .field(&sim.mode())
                .finish(),
        }
    }
}

impl ExternalSimulator {
    pub fn is_loaded(&self) -> bool {
        matches!(self, ExternalSimulator::Loaded(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The selected vCPU ran one slice.
    Executed(ExitReason),
    /// The selected vCPU is stopped, or the VM is not running.
    NotRunnable,
    /// The selected vCPU was unplugged and has been torn down (or is gone).
    Unplugged,
}

/// Handle a timing simulator uses to step vCPUs on the round-robin thread. The global lock is
/// held except while a slice executes.
pub struct TimingDriver<'l, 'a> {
    bql: &'l mut Locked<'a>,
    exec: Arc<dyn TcgExecutor>,
    current: Option<usize>,
}

impl<'l, 'a> TimingDriver<'l, 'a> {
    pub(crate) fn new(bql: &'l mut Locked<'a>, exec: Arc<dyn TcgExecutor>) -> Self {
        let current = bql.rr_first();
        Self { bql, exec, current }
    }

    pub fn machine(&self) -> Machine {
        self.bql.machine()
    }

    pub fn cpus(&self) -> Vec<usize> {
        self.bql.rr_members()
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Make `index` the vCPU the next [`advance`](Self::advance) runs.
    pub fn select(&mut self, index: usize) -> bool {
        if !self.bql.rr_members().contains(&index) {
            return false;
        }
        self.current = Some(index);
        true
    }

    /// Run one slice of the selected vCPU.
    pub fn advance(&mut self) -> AdvanceOutcome {
        self.bql.account_warp_timer();
        self.bql.handle_icount_deadline();

        let Some(index) = self.current.or_else(|| self.bql.rr_first()) else {
            return AdvanceOutcome::Unplugged;
        };
        self.current = Some(index);
        let Some(vcpu) = self.bql.vcpu(index) else {
            self.current = None;
            return AdvanceOutcome::Unplugged;
        };
        let running = self.bql.runstate_is_running();
        let Some(flags) = self.bql.cpu_flags(index) else {
            return AdvanceOutcome::Unplugged;
        };

        if can_run(&flags, running) {
            let reason = self.bql.rr_exec(&vcpu, &self.exec);
            return AdvanceOutcome::Executed(reason);
        }
        if flags.unplug {
            self.bql.rr_deal_with_unplugged();
            self.current = None;
            return AdvanceOutcome::Unplugged;
        }
        AdvanceOutcome::NotRunnable
    }

    /// Block until some vCPU has work, servicing stop requests and queued work.
    pub fn wait(&mut self) {
        set_current_cpu(self.bql.shared.id, None);
        self.bql.rr_wait_io_event();
        self.bql.rr_deal_with_unplugged();
    }

    /// The group is gone or the machine is shutting down; `run_timing` should return.
    pub fn shutdown_requested(&self) -> bool {
        self.bql.state.shutdown || self.bql.rr_group_empty()
    }

    pub fn lock(&mut self) -> &mut Locked<'a> {
        &mut *self.bql
    }
}
