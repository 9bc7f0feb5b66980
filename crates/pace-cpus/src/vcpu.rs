use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Execution strategy servicing a vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Software execution on the shared round-robin thread.
    RoundRobin,
    /// Software execution on a dedicated thread.
    PerCpu,
    /// Hardware-accelerated execution on a dedicated thread.
    Accelerated,
    /// No execution engine; the thread only services queued work.
    Dummy,
}

impl BackendKind {
    pub(crate) fn thread_name(self, index: usize) -> String {
        match self {
            BackendKind::RoundRobin => "ALL CPUs/TCG".to_string(),
            BackendKind::PerCpu => format!("CPU {index}/TCG"),
            BackendKind::Accelerated => format!("CPU {index}/ACCEL"),
            BackendKind::Dummy => format!("CPU {index}/DUMMY"),
        }
    }

    pub fn is_software(self) -> bool {
        matches!(self, BackendKind::RoundRobin | BackendKind::PerCpu)
    }
}

/// Lifecycle flags of a vCPU. Only read or written with the global lock held.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuFlags {
    pub created: bool,
    pub stop: bool,
    pub stopped: bool,
    pub unplug: bool,
    pub halted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    NotCreated,
    Running,
    Halted,
    Stopped,
    UnplugRequested,
    Destroyed,
}

impl CpuFlags {
    /// Torn down after an unplug; never runs again.
    pub fn destroyed(&self) -> bool {
        self.unplug && !self.created
    }

    pub fn lifecycle(&self) -> LifecycleState {
        if self.destroyed() {
            LifecycleState::Destroyed
        } else if !self.created {
            LifecycleState::NotCreated
        } else if self.unplug {
            LifecycleState::UnplugRequested
        } else if self.stopped {
            LifecycleState::Stopped
        } else if self.halted {
            LifecycleState::Halted
        } else {
            LifecycleState::Running
        }
    }
}

/// Shared handle to one emulated processor.
///
/// Lifecycle flags live with the machine state under the global lock; this handle carries the
/// part that other threads touch without it: the kick path, the wake condition and counters.
pub struct Vcpu {
    index: usize,
    kind: BackendKind,
    /// Shared by every vCPU of the round-robin group.
    pub(crate) halt_cond: Arc<Condvar>,
    exit_request: AtomicBool,
    pub(crate) thread_kicked: AtomicBool,
    pub(crate) throttle_scheduled: AtomicBool,
    running: AtomicBool,
    can_do_io: AtomicBool,
    ipi: Mutex<bool>,
    ipi_cond: Condvar,
    thread: Mutex<Option<(ThreadId, String)>>,
    kicks: AtomicU64,
    slices: AtomicU64,
    executed: AtomicU64,
}

impl std::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vcpu")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("exit_request", &self.exit_requested())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Vcpu {
    pub(crate) fn new(index: usize, kind: BackendKind, halt_cond: Arc<Condvar>) -> Self {
        Self {
            index,
            kind,
            halt_cond,
            exit_request: AtomicBool::new(false),
            thread_kicked: AtomicBool::new(false),
            throttle_scheduled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            can_do_io: AtomicBool::new(true),
            ipi: Mutex::new(false),
            ipi_cond: Condvar::new(),
            thread: Mutex::new(None),
            kicks: AtomicU64::new(0),
            slices: AtomicU64::new(0),
            executed: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Ask the executing engine to return to the scheduler at the next instruction boundary.
    pub fn request_exit(&self) {
        self.exit_request.store(true, Ordering::SeqCst);
        self.kicks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_request.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_exit_request(&self) {
        self.exit_request.store(false, Ordering::SeqCst);
    }

    /// Currently inside native execution (global lock released).
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn can_do_io(&self) -> bool {
        self.can_do_io.load(Ordering::SeqCst)
    }

    pub(crate) fn set_can_do_io(&self, can_do_io: bool) {
        self.can_do_io.store(can_do_io, Ordering::SeqCst);
    }

    /// Deliver the inter-thread interrupt used in place of a host signal.
    pub(crate) fn raise_ipi(&self) {
        let mut pending = self.ipi.lock();
        *pending = true;
        self.kicks.fetch_add(1, Ordering::Relaxed);
        self.ipi_cond.notify_all();
    }

    /// Consume a pending interrupt. Acceleration backends poll this to leave their run loop.
    pub fn take_ipi(&self) -> bool {
        std::mem::take(&mut *self.ipi.lock())
    }

    /// Block until an interrupt arrives (consuming it) or `timeout` elapses.
    pub fn wait_ipi(&self, timeout: Option<Duration>) -> bool {
        let mut pending = self.ipi.lock();
        while !*pending {
            match timeout {
                Some(timeout) => {
                    if self.ipi_cond.wait_for(&mut pending, timeout).timed_out() {
                        break;
                    }
                }
                None => self.ipi_cond.wait(&mut pending),
            }
        }
        std::mem::take(&mut *pending)
    }

    pub(crate) fn bind_thread(&self, name: String) {
        *self.thread.lock() = Some((std::thread::current().id(), name));
    }

    /// Share `other`'s native thread (round-robin group members).
    pub(crate) fn adopt_thread(&self, other: &Vcpu) {
        let bound = other.thread.lock().clone();
        *self.thread.lock() = bound;
    }

    /// Running on the native thread that services this vCPU.
    pub fn is_self(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|(id, _)| *id == std::thread::current().id())
    }

    pub fn thread_name(&self) -> Option<String> {
        self.thread.lock().as_ref().map(|(_, name)| name.clone())
    }

    pub(crate) fn note_slice(&self, executed: u64) {
        self.slices.fetch_add(1, Ordering::Relaxed);
        self.executed.fetch_add(executed, Ordering::Relaxed);
    }

    pub fn kicks(&self) -> u64 {
        self.kicks.load(Ordering::Relaxed)
    }

    pub fn slices(&self) -> u64 {
        self.slices.load(Ordering::Relaxed)
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

thread_local! {
    static CURRENT_CPU: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

pub(crate) fn set_current_cpu(machine: u64, index: Option<usize>) {
    CURRENT_CPU.with(|current| current.set(index.map(|index| (machine, index))));
}

/// Index of the vCPU the calling thread is executing for `machine`, if any.
pub(crate) fn current_cpu(machine: u64) -> Option<usize> {
    CURRENT_CPU.with(|current| match current.get() {
        Some((owner, index)) if owner == machine => Some(index),
        _ => None,
    })
}

/// Snapshot of one vCPU for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuInfo {
    pub index: usize,
    /// First vCPU in the list.
    pub current: bool,
    pub halted: bool,
    pub state: LifecycleState,
    pub backend: BackendKind,
    pub thread: Option<String>,
    pub executed: u64,
    pub kicks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lifecycle_reflects_flag_priority() {
        let mut flags = CpuFlags::default();
        assert_eq!(flags.lifecycle(), LifecycleState::NotCreated);

        flags.created = true;
        flags.stopped = true;
        assert_eq!(flags.lifecycle(), LifecycleState::Stopped);

        flags.stopped = false;
        flags.halted = true;
        assert_eq!(flags.lifecycle(), LifecycleState::Halted);

        flags.unplug = true;
        assert_eq!(flags.lifecycle(), LifecycleState::UnplugRequested);

        flags.created = false;
        assert!(flags.destroyed());
        assert_eq!(flags.lifecycle(), LifecycleState::Destroyed);
    }

    #[test]
    fn ipi_is_consumed_once() {
        let vcpu = Vcpu::new(0, BackendKind::Dummy, Arc::new(Condvar::new()));
        assert!(!vcpu.take_ipi());
        vcpu.raise_ipi();
        vcpu.raise_ipi();
        assert!(vcpu.wait_ipi(Some(Duration::from_millis(1))));
        assert!(!vcpu.take_ipi());
        assert!(!vcpu.wait_ipi(Some(Duration::from_millis(1))));
    }

    #[test]
    fn current_cpu_is_scoped_by_machine() {
        set_current_cpu(7, Some(2));
        assert_eq!(current_cpu(7), Some(2));
        assert_eq!(current_cpu(8), None);
        set_current_cpu(7, None);
        assert_eq!(current_cpu(7), None);
    }
}
