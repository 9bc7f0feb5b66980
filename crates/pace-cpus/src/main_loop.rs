//! The central event loop: fires expired timers, turns deferred stop requests into VM stops and
//! starts icount warping while every vCPU is idle.

use std::time::Duration;

use pace_time::ClockKind;

use crate::{Locked, Machine, MachineError, RunState};

/// Upper bound on how long the loop sleeps without re-checking deadlines.
const MAX_WAIT: Duration = Duration::from_millis(10);

impl Locked<'_> {
    /// Handle requests left by vCPU threads. Returns `true` if a stop was carried out.
    fn handle_requests(&mut self) -> bool {
        if std::mem::take(&mut self.state.debug_requested) {
            self.vm_stop(RunState::Debug);
            return true;
        }
        if let Some(state) = self.take_vmstop_request() {
            self.vm_stop(state);
            return true;
        }
        false
    }

    /// One iteration of the main loop, without sleeping.
    pub fn main_loop_iteration(&mut self) {
        self.start_warp_timer();
        self.handle_requests();
        for clock in ClockKind::ALL {
            self.run_timers(clock);
        }
    }

    /// How long the main loop may sleep before the next timer is due.
    fn main_loop_timeout(&self) -> Duration {
        ClockKind::ALL
            .into_iter()
            .filter_map(|clock| self.clock_deadline_ns(clock))
            .min()
            .map_or(MAX_WAIT, |ns| Duration::from_nanos(ns.unsigned_abs()).min(MAX_WAIT))
    }
}

impl Machine {
    /// Spawn the main loop thread. It runs until [`Machine::shutdown`].
    pub fn start_main_loop(&self) -> Result<(), MachineError> {
        let mut slot = self.shared.main_loop.lock();
        if slot.is_some() {
            return Ok(());
        }
        let machine = self.clone();
        let handle = std::thread::Builder::new()
            .name("pace-main-loop".to_string())
            .spawn(move || machine.run_main_loop())?;
        *slot = Some(handle);
        Ok(())
    }

    fn run_main_loop(&self) {
        tracing::debug!(machine = self.id(), "main loop started");
        let mut bql = self.lock();
        while !bql.state.shutdown {
            bql.main_loop_iteration();
            let timeout = bql.main_loop_timeout();
            if !timeout.is_zero() {
                let event_cond = &self.shared.event_cond;
                event_cond.wait_for(&mut bql.state, timeout);
            }
        }
        tracing::debug!(machine = self.id(), "main loop exiting");
    }
}
