#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pace_cpus::{
    AccelError, Accelerator, CpusConfig, ExecContext, ExitReason, Machine, MachineBuilder,
    RunState, RunStateObserver, TcgExecutor, ThreadMode, Vcpu,
};
use parking_lot::Mutex;

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn config(thread: ThreadMode) -> CpusConfig {
    CpusConfig {
        thread: Some(thread),
        ..CpusConfig::default()
    }
}

/// Retires instructions in small chunks until told to leave. Never yields on its own.
#[derive(Default)]
pub struct SpinExecutor {
    pub chunk: u64,
    pub slices: Mutex<Vec<usize>>,
    debug_once: Mutex<HashSet<usize>>,
}

impl SpinExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            chunk: 100,
            ..Self::default()
        })
    }

    /// `index` reports a debug trap on its first slice.
    pub fn with_debug_trap(index: usize) -> Arc<Self> {
        let exec = Self {
            chunk: 100,
            ..Self::default()
        };
        exec.debug_once.lock().insert(index);
        Arc::new(exec)
    }

    pub fn slices_of(&self, index: usize) -> usize {
        self.slices.lock().iter().filter(|&&i| i == index).count()
    }
}

impl TcgExecutor for SpinExecutor {
    fn exec(&self, ctx: &mut ExecContext<'_>) -> ExitReason {
        self.slices.lock().push(ctx.index());
        if self.debug_once.lock().remove(&ctx.index()) {
            return ExitReason::Debug;
        }
        while !ctx.should_exit() {
            if ctx.retire(self.chunk.max(1)) == 0 {
                break;
            }
            std::thread::sleep(Duration::from_micros(50));
        }
        ExitReason::Other
    }
}

/// Halts immediately unless an interrupt is pending for the vCPU.
#[derive(Default)]
pub struct HaltingExecutor {
    pending: Mutex<HashSet<usize>>,
    pub runs: AtomicUsize,
}

impl HaltingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn raise(&self, index: usize) {
        self.pending.lock().insert(index);
    }
}

impl TcgExecutor for HaltingExecutor {
    fn exec(&self, ctx: &mut ExecContext<'_>) -> ExitReason {
        if self.pending.lock().remove(&ctx.index()) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.retire(10);
        }
        ExitReason::Halted
    }

    fn has_work(&self, vcpu: &Vcpu) -> bool {
        self.pending.lock().contains(&vcpu.index())
    }
}

/// Stands in for a hypervisor: `run` blocks until kicked or a short timeout.
#[derive(Default)]
pub struct FakeAccelerator {
    pub fail_init: HashSet<usize>,
    pub runs: AtomicU64,
    pub kicks: AtomicU64,
    pub destroyed: Mutex<Vec<usize>>,
}

impl FakeAccelerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(index: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_init: HashSet::from([index]),
            ..Self::default()
        })
    }
}

impl Accelerator for FakeAccelerator {
    fn init_vcpu(&self, vcpu: &Vcpu) -> Result<(), AccelError> {
        if self.fail_init.contains(&vcpu.index()) {
            return Err(AccelError::new("vcpu creation rejected"));
        }
        Ok(())
    }

    fn run(&self, vcpu: &Vcpu) -> ExitReason {
        self.runs.fetch_add(1, Ordering::SeqCst);
        vcpu.wait_ipi(Some(Duration::from_millis(5)));
        ExitReason::Other
    }

    fn destroy_vcpu(&self, vcpu: &Vcpu) {
        self.destroyed.lock().push(vcpu.index());
    }

    fn kick(&self, _vcpu: &Vcpu) {
        self.kicks.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    State(bool, RunState),
    Stop,
    Resume,
}

#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<Event>>,
    pub muted: AtomicBool,
}

impl RecordingObserver {
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl RunStateObserver for RecordingObserver {
    fn state_changed(&self, running: bool, state: RunState) {
        self.events.lock().push(Event::State(running, state));
    }

    fn stop_event(&self) {
        self.events.lock().push(Event::Stop);
    }

    fn resume_event(&self) {
        self.events.lock().push(Event::Resume);
    }
}

pub fn tcg_machine(config: CpusConfig, exec: Arc<dyn TcgExecutor>, cpus: usize) -> Machine {
    let machine = MachineBuilder::new(config).tcg(exec).build().unwrap();
    for _ in 0..cpus {
        machine.init_vcpu().unwrap();
    }
    machine
}

pub fn all_stopped(machine: &Machine) -> bool {
    let bql = machine.lock();
    bql.cpu_indices()
        .into_iter()
        .all(|i| bql.cpu_flags(i).is_some_and(|f| f.stopped))
}
