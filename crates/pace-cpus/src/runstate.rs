use serde::{Deserialize, Serialize};

use crate::vcpu::current_cpu;
use crate::Locked;

/// Machine-wide run state.
///
/// Only [`RunState::Running`] lets vCPU threads out of their wait loops and keeps the virtual
/// clock ticking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Prelaunch,
    Running,
    Paused,
    Debug,
    SaveVm,
    RestoreVm,
    Suspended,
    InternalError,
    IoError,
    Shutdown,
}

impl RunState {
    pub fn is_running(self) -> bool {
        self == RunState::Running
    }
}

/// Receives run-state transitions and the stop/resume events that accompany them.
///
/// Called with the global lock held; implementations must not block on the machine.
pub trait RunStateObserver: Send + Sync {
    fn state_changed(&self, _running: bool, _state: RunState) {}

    /// The VM stopped executing guest code.
    fn stop_event(&self) {}

    /// The VM is about to resume.
    fn resume_event(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunStateObserver for NoopObserver {}

impl Locked<'_> {
    fn runstate_set(&mut self, state: RunState) {
        let old = std::mem::replace(&mut self.state.run_state, state);
        if old != state {
            tracing::debug!(?old, new = ?state, "run state changed");
        }
    }

    fn do_vm_stop(&mut self, state: RunState, send_stop: bool) {
        if !self.runstate_is_running() {
            return;
        }
        self.disable_ticks();
        self.pause_all_vcpus();
        self.runstate_set(state);
        self.shared.observer.state_changed(false, state);
        if send_stop {
            self.shared.observer.stop_event();
        }
    }

    /// Stop the VM. From a vCPU thread the stop is deferred to the main loop and only the
    /// calling vCPU stops immediately.
    pub fn vm_stop(&mut self, state: RunState) {
        if current_cpu(self.shared.id).is_some() {
            self.state.vmstop_request = Some(state);
            self.shared.notify_event();
            self.cpu_stop_current();
            return;
        }
        self.do_vm_stop(state, true);
    }

    /// Move to `state` whether or not the VM is running.
    pub fn vm_stop_force_state(&mut self, state: RunState) {
        if self.runstate_is_running() {
            self.vm_stop(state);
        } else {
            self.runstate_set(state);
        }
    }

    /// Enter the running state. Returns `false` when already running, in which case a pending
    /// stop request is reported as a stop/resume event pair.
    pub fn vm_prepare_start(&mut self) -> bool {
        let requested = self.state.vmstop_request.take();
        if self.runstate_is_running() {
            if requested.is_some() {
                self.shared.observer.stop_event();
                self.shared.observer.resume_event();
            }
            return false;
        }

        self.shared.observer.resume_event();
        self.enable_ticks();
        self.runstate_set(RunState::Running);
        self.shared.observer.state_changed(true, RunState::Running);
        true
    }

    pub fn vm_start(&mut self) {
        if self.vm_prepare_start() {
            self.resume_all_vcpus();
        }
    }

    /// Stop request left by a vCPU thread, consumed by the main loop.
    pub(crate) fn take_vmstop_request(&mut self) -> Option<RunState> {
        self.state.vmstop_request.take()
    }

    /// A vCPU hit a breakpoint: stop it and ask the main loop for a debug stop.
    pub(crate) fn cpu_handle_guest_debug(&mut self, index: usize) {
        self.state.debug_stop_cpu = Some(index);
        self.state.debug_requested = true;
        self.shared.notify_event();
        if let Some(entry) = self.entry_mut(index) {
            entry.flags.stopped = true;
        }
        tracing::debug!(index, "guest debug stop");
    }

    /// vCPU that last stopped for the debugger.
    pub fn debug_stop_cpu(&self) -> Option<usize> {
        self.state.debug_stop_cpu
    }
}
