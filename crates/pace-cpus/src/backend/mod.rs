//! vCPU thread bodies.
//!
//! Every backend follows the same shape: finish the start-up handshake, then alternate between
//! executing (lock released) and waiting for something to do (lock held), until the vCPU is
//! unplugged and can no longer run.

pub(crate) mod accel;
pub(crate) mod dummy;
pub(crate) mod per_cpu;
pub(crate) mod round_robin;

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::exec::ExecContext;
use crate::vcpu::set_current_cpu;
use crate::{BackendKind, Engine, ExitReason, Locked, Machine, TcgExecutor, Vcpu};

/// Spawn the dedicated thread of a per-vCPU backend.
pub(crate) fn spawn(machine: Machine, vcpu: Arc<Vcpu>) -> io::Result<JoinHandle<()>> {
    let kind = vcpu.kind();
    std::thread::Builder::new()
        .name(kind.thread_name(vcpu.index()))
        .spawn(move || match kind {
            BackendKind::PerCpu => per_cpu::thread_fn(machine, vcpu),
            BackendKind::Accelerated => accel::thread_fn(machine, vcpu),
            BackendKind::Dummy => dummy::thread_fn(machine, vcpu),
            BackendKind::RoundRobin => {
                tracing::error!(index = vcpu.index(), "round-robin vCPU given its own thread");
                std::process::abort();
            }
        })
}

impl Locked<'_> {
    /// Bind the calling thread to `vcpu` without publishing `created`.
    pub(crate) fn bind_vcpu_thread(&self, vcpu: &Vcpu) {
        let name = vcpu.kind().thread_name(vcpu.index());
        vcpu.bind_thread(name);
        vcpu.set_can_do_io(true);
        set_current_cpu(self.shared.id, Some(vcpu.index()));
    }

    /// Publish `created` and release the creator blocked in `init_vcpu`.
    pub(crate) fn signal_created(&mut self, index: usize) {
        if let Some(entry) = self.entry_mut(index) {
            entry.flags.created = true;
        }
        self.shared.cpu_cond.notify_all();
    }

    /// Tear down after an unplug and release anyone blocked in `cpu_remove_sync`.
    pub(crate) fn destroy_vcpu(&mut self, vcpu: &Vcpu) {
        if let Engine::Accel(accel) = &self.shared.engine {
            accel.destroy_vcpu(vcpu);
        }
        if let Some(entry) = self.entry_mut(vcpu.index()) {
            entry.flags.created = false;
        }
        self.shared.cpu_cond.notify_all();
        self.shared.work_cond.notify_all();
        tracing::debug!(index = vcpu.index(), "vCPU destroyed");
    }

    pub(crate) fn unplug_pending(&self, index: usize) -> bool {
        self.entry(index).map_or(true, |e| e.flags.unplug)
    }

    /// One software slice with the lock released.
    pub(crate) fn tcg_exec(&mut self, vcpu: &Arc<Vcpu>, exec: &Arc<dyn TcgExecutor>) -> ExitReason {
        let index = vcpu.index();
        if self.entry(index).is_some_and(|e| e.flags.halted) {
            if !exec.has_work(vcpu) {
                return ExitReason::Halted;
            }
            if let Some(entry) = self.entry_mut(index) {
                entry.flags.halted = false;
            }
        }

        let budget = self.slice_budget();
        let shared = Arc::clone(self.shared);
        vcpu.set_running(true);
        let (reason, executed) = self.unlocked(|| {
            let _shared_exec = shared.exclusive.read();
            let mut ctx = ExecContext::new(vcpu, &shared.clock, budget);
            let reason = exec.exec(&mut ctx);
            (reason, ctx.executed())
        });
        vcpu.set_running(false);
        vcpu.clear_exit_request();

        if reason == ExitReason::Halted {
            if let Some(entry) = self.entry_mut(index) {
                entry.flags.halted = true;
            }
        }
        self.account_slice(vcpu, executed);
        reason
    }

    /// Re-run one instruction with every other software vCPU out of its slice.
    pub(crate) fn step_atomic(&mut self, vcpu: &Arc<Vcpu>, exec: &Arc<dyn TcgExecutor>) {
        let others: Vec<Arc<Vcpu>> = self
            .live_vcpus()
            .into_iter()
            .filter(|other| !Arc::ptr_eq(other, vcpu))
            .collect();
        let shared = Arc::clone(self.shared);
        self.unlocked(|| {
            for other in &others {
                other.request_exit();
            }
            let _exclusive = shared.exclusive.write();
            exec.exec_step_atomic(vcpu);
        });
    }

    /// Sleep until `index` has something to do, then run the common wake-up bookkeeping.
    pub(crate) fn wait_io_event(&mut self, vcpu: &Vcpu) {
        let index = vcpu.index();
        while self.cpu_thread_is_idle(index) {
            if self.entry(index).is_none() {
                return;
            }
            self.stop_kick_timer();
            self.wait(&vcpu.halt_cond);
        }
        self.start_kick_timer();
        self.wait_io_event_common(index);
    }

    /// Report exit reasons every software backend handles the same way.
    pub(crate) fn handle_tcg_exit(
        &mut self,
        vcpu: &Arc<Vcpu>,
        exec: &Arc<dyn TcgExecutor>,
        reason: ExitReason,
    ) {
        match reason {
            ExitReason::Debug => self.cpu_handle_guest_debug(vcpu.index()),
            ExitReason::AtomicRetry => self.step_atomic(vcpu, exec),
            ExitReason::Halted | ExitReason::Other => {}
        }
    }
}
