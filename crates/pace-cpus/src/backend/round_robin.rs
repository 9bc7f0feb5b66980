//! A single thread time-slicing every software vCPU.
//!
//! The thread walks the vCPU list giving each runnable vCPU one slice. A vCPU that never
//! yields is forced out by the kick timer, which the main loop fires every kick period while
//! at least two vCPUs share the thread.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::simulator::{SimulatorMode, TimingDriver};
use crate::vcpu::set_current_cpu;
use crate::{BackendKind, Engine, ExitReason, ExternalSimulator, Locked, Machine, Vcpu};

pub(crate) fn spawn(machine: Machine) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(BackendKind::RoundRobin.thread_name(0))
        .spawn(move || thread_fn(machine))
}

impl Locked<'_> {
    /// Members of the round-robin group that have not been torn down, in list order.
    pub(crate) fn rr_members(&self) -> Vec<usize> {
        self.state
            .cpus
            .iter()
            .filter(|e| e.vcpu.kind() == BackendKind::RoundRobin && !e.flags.destroyed())
            .map(|e| e.vcpu.index())
            .collect()
    }

    pub(crate) fn rr_first(&self) -> Option<usize> {
        self.rr_members().first().copied()
    }

    pub(crate) fn rr_next(&self, index: usize) -> Option<usize> {
        let members = self.rr_members();
        let position = members.iter().position(|&i| i == index)?;
        members.get(position + 1).copied()
    }

    /// Some member was asked to stop and has not acknowledged yet.
    fn rr_stop_pending(&self) -> bool {
        self.state
            .cpus
            .iter()
            .any(|e| e.vcpu.kind() == BackendKind::RoundRobin && e.flags.created && e.flags.stop)
    }

    pub(crate) fn rr_group_empty(&self) -> bool {
        self.rr_members().is_empty()
    }

    fn rr_register_members(&mut self) {
        for index in self.rr_members() {
            let Some(entry) = self.entry_mut(index) else {
                continue;
            };
            if entry.flags.created {
                continue;
            }
            entry.flags.created = true;
            let vcpu = Arc::clone(&entry.vcpu);
            self.bind_vcpu_thread(&vcpu);
        }
        set_current_cpu(self.shared.id, None);
        self.shared.cpu_cond.notify_all();
    }

    /// Common wake-up bookkeeping for every member.
    fn rr_wait_io_event_common(&mut self) {
        for index in self.rr_members() {
            if let Some(vcpu) = self.vcpu(index) {
                if vcpu.thread_name().is_none() {
                    vcpu.bind_thread(BackendKind::RoundRobin.thread_name(index));
                }
            }
            set_current_cpu(self.shared.id, Some(index));
            self.wait_io_event_common(index);
        }
        set_current_cpu(self.shared.id, None);
    }

    pub(crate) fn rr_wait_io_event(&mut self) {
        let halt_cond = Arc::clone(&self.shared.rr_halt_cond);
        while self.rr_group_idle() && !self.rr_group_empty() {
            self.stop_kick_timer();
            self.wait(&halt_cond);
        }
        self.start_kick_timer();
        self.rr_wait_io_event_common();
    }

    /// Tear down at most one unplugged member per pass.
    pub(crate) fn rr_deal_with_unplugged(&mut self) {
        let running = self.runstate_is_running();
        let target = self
            .state
            .cpus
            .iter()
            .filter(|e| e.vcpu.kind() == BackendKind::RoundRobin && e.flags.created)
            .find(|e| e.flags.unplug && !crate::lifecycle::can_run(&e.flags, running))
            .map(|e| Arc::clone(&e.vcpu));
        if let Some(vcpu) = target {
            self.destroy_vcpu(&vcpu);
        }
    }

    /// Give `vcpu` one slice as the round-robin current vCPU.
    pub(crate) fn rr_exec(
        &mut self,
        vcpu: &Arc<Vcpu>,
        exec: &Arc<dyn crate::TcgExecutor>,
    ) -> ExitReason {
        self.shared.set_rr_current(Some(Arc::clone(vcpu)));
        set_current_cpu(self.shared.id, Some(vcpu.index()));
        let reason = self.tcg_exec(vcpu, exec);
        self.handle_tcg_exit(vcpu, exec, reason);
        set_current_cpu(self.shared.id, None);
        self.shared.set_rr_current(None);
        reason
    }
}

fn thread_fn(machine: Machine) {
    let Engine::Tcg(exec) = machine.engine().clone() else {
        return;
    };
    let mut bql = machine.lock();
    bql.rr_register_members();
    tracing::debug!(members = bql.rr_members().len(), "round-robin thread started");

    // Wait for the machine to start.
    let halt_cond = Arc::clone(&bql.shared.rr_halt_cond);
    loop {
        let Some(first) = bql.rr_first() else {
            rr_exit(&mut bql);
            return;
        };
        if !bql.cpu_flags(first).is_some_and(|f| f.stopped) {
            break;
        }
        bql.wait(&halt_cond);
        bql.rr_wait_io_event_common();
        bql.rr_deal_with_unplugged();
    }

    if let ExternalSimulator::Loaded(simulator) = machine.simulator() {
        if simulator.mode() == SimulatorMode::Timing {
            let simulator = Arc::clone(simulator);
            tracing::info!(name = simulator.name(), "external timing simulator takes over");
            simulator.run_timing(&mut TimingDriver::new(&mut bql, Arc::clone(&exec)));
            tracing::info!(name = simulator.name(), "external timing simulator returned");
        }
    }

    bql.start_kick_timer();
    // The first pass goes straight to the wait so queued work is serviced first.
    if let Some(vcpu) = bql.rr_first().and_then(|i| bql.vcpu(i)) {
        vcpu.request_exit();
    }

    let mut cursor: Option<usize> = None;
    loop {
        if bql.rr_group_empty() {
            break;
        }
        bql.account_warp_timer();
        bql.handle_icount_deadline();

        let members = bql.rr_members();
        if !cursor.is_some_and(|i| members.contains(&i)) {
            cursor = members.first().copied();
        }

        while let Some(index) = cursor {
            let Some(vcpu) = bql.vcpu(index) else {
                cursor = None;
                break;
            };
            if bql.cpu_work_pending(index) || vcpu.exit_requested() {
                break;
            }
            // A stop aimed at another member is acknowledged in the wait step, not after a
            // full pass.
            if bql.rr_stop_pending() && !bql.cpu_flags(index).is_some_and(|f| f.stop) {
                break;
            }
            if bql.cpu_can_run(index) {
                match bql.rr_exec(&vcpu, &exec) {
                    ExitReason::Debug | ExitReason::AtomicRetry => break,
                    ExitReason::Halted | ExitReason::Other => {}
                }
            } else if bql.cpu_flags(index).is_some_and(|f| f.stop) {
                if bql.unplug_pending(index) {
                    cursor = bql.rr_next(index);
                }
                break;
            }
            cursor = bql.rr_next(index);
        }

        if let Some(vcpu) = cursor.and_then(|i| bql.vcpu(i)) {
            vcpu.clear_exit_request();
        }
        if bql.shared.clock.icount_enabled() && bql.all_cpu_threads_idle() {
            // Let the main loop start warping.
            bql.shared.notify_event();
        }
        bql.rr_wait_io_event();
        bql.rr_deal_with_unplugged();
    }

    rr_exit(&mut bql);
}

fn rr_exit(bql: &mut Locked<'_>) {
    bql.state.rr_active = false;
    bql.stop_kick_timer();
    bql.shared.set_rr_current(None);
    set_current_cpu(bql.shared.id, None);
    tracing::debug!("round-robin thread exiting");
}
