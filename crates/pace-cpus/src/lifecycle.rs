//! Per-vCPU lifecycle predicates and the machine-wide pause/resume/remove orchestration.

use std::sync::Arc;

use crate::machine::CpuEntry;
use crate::vcpu::current_cpu;
use crate::{BackendKind, CpuFlags, CpuInfo, Engine, Locked, MachineError, RunState, Vcpu};

/// A vCPU may enter its execution engine.
pub(crate) fn can_run(flags: &CpuFlags, vm_running: bool) -> bool {
    !flags.stop && !flags.stopped && vm_running
}

impl Locked<'_> {
    pub(crate) fn entry(&self, index: usize) -> Option<&CpuEntry> {
        self.state.cpus.iter().find(|e| e.vcpu.index() == index)
    }

    pub(crate) fn entry_mut(&mut self, index: usize) -> Option<&mut CpuEntry> {
        self.state.cpus.iter_mut().find(|e| e.vcpu.index() == index)
    }

    pub fn vcpu(&self, index: usize) -> Option<Arc<Vcpu>> {
        self.entry(index).map(|e| Arc::clone(&e.vcpu))
    }

    /// Indices of every vCPU in creation order, destroyed ones included until they are reaped.
    pub fn cpu_indices(&self) -> Vec<usize> {
        self.state.cpus.iter().map(|e| e.vcpu.index()).collect()
    }

    pub fn cpu_flags(&self, index: usize) -> Option<CpuFlags> {
        self.entry(index).map(|e| e.flags)
    }

    pub fn run_state(&self) -> RunState {
        self.state.run_state
    }

    pub fn runstate_is_running(&self) -> bool {
        self.state.run_state.is_running()
    }

    pub fn cpu_can_run(&self, index: usize) -> bool {
        let running = self.runstate_is_running();
        self.entry(index).is_some_and(|e| can_run(&e.flags, running))
    }

    /// Mark a vCPU halted (guest idle instruction) or wake it. Waking kicks its thread.
    pub fn cpu_set_halted(&mut self, index: usize, halted: bool) {
        let Some(entry) = self.entry_mut(index) else {
            return;
        };
        entry.flags.halted = halted;
        let vcpu = Arc::clone(&entry.vcpu);
        if !halted {
            self.shared.kick(&vcpu);
        }
    }

    pub(crate) fn entry_is_idle(&self, entry: &CpuEntry) -> bool {
        let flags = &entry.flags;
        if flags.stop || !entry.work.is_empty() {
            return false;
        }
        if flags.stopped || !self.runstate_is_running() {
            return true;
        }
        let engine: &Engine = &self.shared.engine;
        flags.halted && !engine.has_work(&entry.vcpu) && !engine.halt_in_kernel()
    }

    /// The thread servicing `index` has nothing to do.
    pub fn cpu_thread_is_idle(&self, index: usize) -> bool {
        self.entry(index).map_or(true, |e| self.entry_is_idle(e))
    }

    /// Every live vCPU is idle. Destroyed vCPUs are ignored.
    pub fn all_cpu_threads_idle(&self) -> bool {
        self.state
            .cpus
            .iter()
            .filter(|e| !e.flags.destroyed())
            .all(|e| self.entry_is_idle(e))
    }

    pub(crate) fn rr_group_idle(&self) -> bool {
        self.state
            .cpus
            .iter()
            .filter(|e| e.vcpu.kind() == BackendKind::RoundRobin && !e.flags.destroyed())
            .all(|e| self.entry_is_idle(e))
    }

    /// Bookkeeping every backend performs after waking: acknowledge a stop request and drain
    /// queued work.
    pub(crate) fn wait_io_event_common(&mut self, index: usize) {
        let Some(entry) = self.entry_mut(index) else {
            return;
        };
        entry
            .vcpu
            .thread_kicked
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let acknowledged = std::mem::take(&mut entry.flags.stop);
        if acknowledged {
            entry.flags.stopped = true;
            self.shared.pause_cond.notify_all();
        }
        self.process_queued_work(index);
    }

    fn all_vcpus_paused(&self) -> bool {
        self.state
            .cpus
            .iter()
            .filter(|e| e.flags.created)
            .all(|e| e.flags.stopped)
    }

    /// Stop every vCPU and wait until each one has acknowledged.
    ///
    /// Called from a vCPU thread, the caller stops itself immediately instead of waiting for
    /// itself.
    pub fn pause_all_vcpus(&mut self) {
        self.state
            .timers
            .set_enabled(pace_time::ClockKind::Virtual, false);
        self.request_stop_all();

        if current_cpu(self.shared.id).is_some() {
            self.cpu_stop_current();
            if !matches!(self.shared.engine, Engine::Accel(_)) {
                for entry in &mut self.state.cpus {
                    entry.flags.stop = false;
                    entry.flags.stopped = true;
                }
                return;
            }
        }

        while !self.all_vcpus_paused() {
            let pause_cond = &self.shared.pause_cond;
            pause_cond.wait(&mut self.state);
            for vcpu in self.live_vcpus() {
                self.shared.kick(&vcpu);
            }
        }
        tracing::debug!(machine = self.shared.id, "all vCPUs paused");
    }

    fn request_stop_all(&mut self) {
        let mut kicked = Vec::with_capacity(self.state.cpus.len());
        for entry in &mut self.state.cpus {
            entry.flags.stop = true;
            kicked.push(Arc::clone(&entry.vcpu));
        }
        for vcpu in kicked {
            self.shared.kick(&vcpu);
        }
    }

    pub(crate) fn live_vcpus(&self) -> Vec<Arc<Vcpu>> {
        self.state
            .cpus
            .iter()
            .filter(|e| e.flags.created && !e.flags.unplug)
            .map(|e| Arc::clone(&e.vcpu))
            .collect()
    }

    pub fn cpu_resume(&mut self, index: usize) {
        let Some(entry) = self.entry_mut(index) else {
            return;
        };
        entry.flags.stop = false;
        entry.flags.stopped = false;
        let vcpu = Arc::clone(&entry.vcpu);
        self.shared.kick(&vcpu);
    }

    pub fn resume_all_vcpus(&mut self) {
        self.state
            .timers
            .set_enabled(pace_time::ClockKind::Virtual, true);
        for index in self.cpu_indices() {
            self.cpu_resume(index);
        }
        tracing::debug!(machine = self.shared.id, "all vCPUs resumed");
    }

    /// Stop the vCPU whose thread is calling, without waiting for anything.
    pub fn cpu_stop_current(&mut self) {
        let Some(index) = current_cpu(self.shared.id) else {
            return;
        };
        if let Some(entry) = self.entry_mut(index) {
            entry.flags.stop = false;
            entry.flags.stopped = true;
            entry.vcpu.request_exit();
        }
        self.shared.pause_cond.notify_all();
    }

    /// Request an unplug. The owning thread tears the vCPU down at its next checkpoint.
    pub fn cpu_remove(&mut self, index: usize) -> Result<(), MachineError> {
        let entry = self
            .entry_mut(index)
            .ok_or(MachineError::UnknownCpu(index))?;
        entry.flags.stop = true;
        entry.flags.unplug = true;
        let vcpu = Arc::clone(&entry.vcpu);
        tracing::debug!(index, "vCPU unplug requested");
        self.shared.kick(&vcpu);
        Ok(())
    }

    /// Unplug and wait until the vCPU is torn down and its thread joined.
    ///
    /// Removing a vCPU that is already gone is a no-op. Called from the vCPU's own thread this
    /// only requests the unplug.
    pub fn cpu_remove_sync(&mut self, index: usize) -> Result<(), MachineError> {
        let Some(entry) = self.entry(index) else {
            return Ok(());
        };
        if entry.vcpu.is_self() {
            return self.cpu_remove(index);
        }
        self.cpu_remove(index)?;

        loop {
            match self.entry(index) {
                Some(entry) if entry.flags.created => {}
                _ => break,
            }
            let cpu_cond = &self.shared.cpu_cond;
            cpu_cond.wait(&mut self.state);
        }

        let position = self.state.cpus.iter().position(|e| e.vcpu.index() == index);
        let Some(position) = position else {
            return Ok(());
        };
        let mut entry = self.state.cpus.remove(position);
        if let Some(thread) = entry.thread.take() {
            if self.unlocked(|| thread.join()).is_err() {
                tracing::warn!(index, "vCPU thread panicked");
            }
        }
        // Wake anyone waiting on work the removed vCPU will never run.
        self.shared.work_cond.notify_all();
        tracing::debug!(index, "vCPU removed");
        Ok(())
    }

    pub fn query_cpus(&self) -> Vec<CpuInfo> {
        let first = self
            .state
            .cpus
            .iter()
            .find(|e| !e.flags.destroyed())
            .map(|e| e.vcpu.index());
        self.state
            .cpus
            .iter()
            .map(|e| CpuInfo {
                index: e.vcpu.index(),
                current: Some(e.vcpu.index()) == first,
                halted: e.flags.halted,
                state: e.flags.lifecycle(),
                backend: e.vcpu.kind(),
                thread: e.vcpu.thread_name(),
                executed: e.vcpu.executed(),
                kicks: e.vcpu.kicks(),
            })
            .collect()
    }
}
