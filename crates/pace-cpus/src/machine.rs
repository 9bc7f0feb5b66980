use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use pace_time::{
    ClockKind, HostClock, StdHostClock, TickAccount, TimerId, TimerQueue, VirtualClock,
    NANOSECONDS_PER_SECOND,
};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::backend;
use crate::quantum::QuantumState;
use crate::throttle::Throttle;
use crate::work::WorkItem;
use crate::{
    AccelError, Accelerator, BackendKind, ConfigError, CpuFlags, CpusConfig, Engine,
    ExternalSimulator, Locked, MachineError, NoopObserver, RunState, RunStateObserver,
    TcgExecutor, Vcpu,
};

static NEXT_MACHINE_ID: AtomicU64 = AtomicU64::new(1);

/// Callback of a timer armed through [`Locked::new_timer`]. Runs with the global lock held.
pub type TimerCallback = Arc<dyn Fn(&mut Locked<'_>) + Send + Sync>;

#[derive(Clone)]
pub(crate) enum MachineTimer {
    Throttle,
    KickRoundRobin,
    IcountAdjustRt,
    IcountAdjustVm,
    IcountWarp,
    Callback(TimerCallback),
}

pub(crate) struct InternalTimers {
    pub(crate) throttle: TimerId,
    pub(crate) kick: TimerId,
    pub(crate) adjust_rt: Option<TimerId>,
    pub(crate) adjust_vm: Option<TimerId>,
    pub(crate) warp: Option<TimerId>,
}

pub(crate) struct CpuEntry {
    pub(crate) vcpu: Arc<Vcpu>,
    pub(crate) flags: CpuFlags,
    pub(crate) work: VecDeque<WorkItem>,
    pub(crate) thread: Option<JoinHandle<()>>,
    pub(crate) init_error: Option<AccelError>,
}

/// Everything protected by the global lock.
pub struct MachineState {
    pub(crate) run_state: RunState,
    pub(crate) cpus: Vec<CpuEntry>,
    pub(crate) next_index: usize,
    pub(crate) timers: TimerQueue<MachineTimer>,
    pub(crate) ticks: TickAccount,
    pub(crate) internal: InternalTimers,
    pub(crate) vmstop_request: Option<RunState>,
    pub(crate) debug_requested: bool,
    pub(crate) debug_stop_cpu: Option<usize>,
    pub(crate) rr_thread: Option<JoinHandle<()>>,
    pub(crate) rr_active: bool,
    pub(crate) shutdown: bool,
}

pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) bql: Mutex<MachineState>,
    /// vCPU creation and destruction handshakes.
    pub(crate) cpu_cond: Condvar,
    /// A vCPU reached `stopped`.
    pub(crate) pause_cond: Condvar,
    /// Synchronous cross-CPU work completed.
    pub(crate) work_cond: Condvar,
    /// Wakes the main loop.
    pub(crate) event_cond: Condvar,
    pub(crate) clock: VirtualClock,
    pub(crate) throttle: Throttle,
    pub(crate) quantum: QuantumState,
    pub(crate) config: CpusConfig,
    pub(crate) mttcg: bool,
    pub(crate) engine: Engine,
    pub(crate) simulator: ExternalSimulator,
    pub(crate) observer: Arc<dyn RunStateObserver>,
    pub(crate) rr_current: Mutex<Option<Arc<Vcpu>>>,
    pub(crate) rr_halt_cond: Arc<Condvar>,
    pub(crate) align: crate::icount::AlignStats,
    pub(crate) main_loop: Mutex<Option<JoinHandle<()>>>,
    /// Held shared while software vCPUs execute, exclusively for an atomic step.
    pub(crate) exclusive: RwLock<()>,
}

impl Shared {
    /// Wake the main loop.
    pub(crate) fn notify_event(&self) {
        self.event_cond.notify_all();
    }
}

/// Handle to one emulated machine's scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Machine {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.shared.id)
            .field("engine", &self.shared.engine)
            .field("mttcg", &self.shared.mttcg)
            .finish_non_exhaustive()
    }
}

pub struct MachineBuilder {
    config: CpusConfig,
    engine: Engine,
    host: Option<Arc<dyn HostClock>>,
    observer: Arc<dyn RunStateObserver>,
    simulator: ExternalSimulator,
}

impl MachineBuilder {
    /// Defaults to the qtest engine (no execution) on the host monotonic clock.
    pub fn new(config: CpusConfig) -> Self {
        Self {
            config,
            engine: Engine::Qtest,
            host: None,
            observer: Arc::new(NoopObserver),
            simulator: ExternalSimulator::Absent,
        }
    }

    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    pub fn tcg(self, executor: Arc<dyn TcgExecutor>) -> Self {
        self.engine(Engine::Tcg(executor))
    }

    pub fn accel(self, accelerator: Arc<dyn Accelerator>) -> Self {
        self.engine(Engine::Accel(accelerator))
    }

    pub fn host_clock(mut self, host: Arc<dyn HostClock>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn RunStateObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn simulator(mut self, simulator: ExternalSimulator) -> Self {
        self.simulator = simulator;
        self
    }

    pub fn build(self) -> Result<Machine, ConfigError> {
        self.config.validate()?;
        let mttcg = self.engine.is_tcg() && self.config.mttcg_enabled()?;

        let host = self.host.unwrap_or_else(|| Arc::new(StdHostClock::new()));
        let icount = self.config.icount;
        let clock = VirtualClock::new(host, icount.mode, icount.sleep);

        let mut timers = TimerQueue::new();
        let throttle = timers.new_timer(ClockKind::VirtualRt, MachineTimer::Throttle);
        let kick = timers.new_timer(ClockKind::Virtual, MachineTimer::KickRoundRobin);

        let mut adjust_rt = None;
        let mut adjust_vm = None;
        if icount.mode.is_adaptive() {
            // The realtime trigger catches virtual time passing too slowly, the virtual trigger
            // catches it passing too fast. Realtime triggers also fire while idle, so they run
            // less often.
            let rt = timers.new_timer(ClockKind::VirtualRt, MachineTimer::IcountAdjustRt);
            timers.modify(rt, clock.get_clock() + NANOSECONDS_PER_SECOND);
            let vm = timers.new_timer(ClockKind::Virtual, MachineTimer::IcountAdjustVm);
            timers.modify(vm, clock.get_icount() + NANOSECONDS_PER_SECOND / 10);
            adjust_rt = Some(rt);
            adjust_vm = Some(vm);
        }
        let warp = (icount.mode.is_enabled() && icount.sleep)
            .then(|| timers.new_timer(ClockKind::VirtualRt, MachineTimer::IcountWarp));

        let state = MachineState {
            run_state: RunState::Prelaunch,
            cpus: Vec::new(),
            next_index: 0,
            timers,
            ticks: TickAccount::default(),
            internal: InternalTimers {
                throttle,
                kick,
                adjust_rt,
                adjust_vm,
                warp,
            },
            vmstop_request: None,
            debug_requested: false,
            debug_stop_cpu: None,
            rr_thread: None,
            rr_active: false,
            shutdown: false,
        };

        let id = NEXT_MACHINE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            machine = id,
            engine = ?self.engine,
            mttcg,
            icount = ?icount.mode,
            "machine created"
        );

        Ok(Machine {
            shared: Arc::new(Shared {
                id,
                bql: Mutex::new(state),
                cpu_cond: Condvar::new(),
                pause_cond: Condvar::new(),
                work_cond: Condvar::new(),
                event_cond: Condvar::new(),
                clock,
                throttle: Throttle::new(self.config.throttle_timeslice_ns),
                quantum: QuantumState::new(self.config.quantum.clone()),
                config: self.config,
                mttcg,
                engine: self.engine,
                simulator: self.simulator,
                observer: self.observer,
                rr_current: Mutex::new(None),
                rr_halt_cond: Arc::new(Condvar::new()),
                align: Default::default(),
                main_loop: Mutex::new(None),
                exclusive: RwLock::new(()),
            }),
        })
    }
}

impl Machine {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &CpusConfig {
        &self.shared.config
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.shared.clock
    }

    pub fn engine(&self) -> &Engine {
        &self.shared.engine
    }

    pub fn mttcg_enabled(&self) -> bool {
        self.shared.mttcg
    }

    pub fn simulator(&self) -> &ExternalSimulator {
        &self.shared.simulator
    }

    /// Force `vcpu` out of native execution and out of its idle wait. Safe with or without the
    /// global lock.
    pub fn kick(&self, vcpu: &Vcpu) {
        self.shared.kick(vcpu);
    }

    pub fn notify_event(&self) {
        self.shared.notify_event();
    }

    pub fn init_vcpu(&self) -> Result<Arc<Vcpu>, MachineError> {
        self.lock().init_vcpu()
    }

    pub fn vcpu(&self, index: usize) -> Option<Arc<Vcpu>> {
        self.lock().vcpu(index)
    }

    pub fn vm_start(&self) {
        self.lock().vm_start();
    }

    pub fn vm_stop(&self, state: RunState) {
        self.lock().vm_stop(state);
    }

    pub fn pause_all(&self) {
        self.lock().pause_all_vcpus();
    }

    pub fn resume_all(&self) {
        self.lock().resume_all_vcpus();
    }

    pub fn cpu_remove_sync(&self, index: usize) -> Result<(), MachineError> {
        self.lock().cpu_remove_sync(index)
    }

    pub fn query_cpus(&self) -> Vec<crate::CpuInfo> {
        self.lock().query_cpus()
    }

    pub fn run_state(&self) -> RunState {
        self.lock().run_state()
    }

    /// Unplug every vCPU synchronously and stop the main loop.
    pub fn shutdown(&self) {
        let rr_thread = {
            let mut bql = self.lock();
            let indices: Vec<usize> = bql.state.cpus.iter().map(|e| e.vcpu.index()).collect();
            for index in indices {
                if let Err(err) = bql.cpu_remove_sync(index) {
                    tracing::warn!(index, %err, "vCPU removal during shutdown failed");
                }
            }
            // The main loop keeps firing the kick timer until every vCPU is gone.
            bql.state.shutdown = true;
            bql.state.rr_active = false;
            bql.state.rr_thread.take()
        };
        self.shared.notify_event();

        let main_loop = self.shared.main_loop.lock().take();
        for handle in rr_thread.into_iter().chain(main_loop) {
            if handle.join().is_err() {
                tracing::warn!("scheduler thread panicked");
            }
        }
        tracing::debug!(machine = self.shared.id, "machine shut down");
    }
}

impl Locked<'_> {
    /// Create a vCPU and its execution thread, blocking until the thread has finished its
    /// start-up handshake. The new vCPU is stopped until the VM is (re)started.
    pub fn init_vcpu(&mut self) -> Result<Arc<Vcpu>, MachineError> {
        let index = self.state.next_index;
        self.state.next_index += 1;

        let kind = match &self.shared.engine {
            Engine::Tcg(_) if self.shared.mttcg => BackendKind::PerCpu,
            Engine::Tcg(_) => BackendKind::RoundRobin,
            Engine::Accel(_) => BackendKind::Accelerated,
            Engine::Qtest => BackendKind::Dummy,
        };
        let halt_cond = match kind {
            BackendKind::RoundRobin => Arc::clone(&self.shared.rr_halt_cond),
            _ => Arc::new(Condvar::new()),
        };
        let vcpu = Arc::new(Vcpu::new(index, kind, halt_cond));

        self.state.cpus.push(CpuEntry {
            vcpu: Arc::clone(&vcpu),
            flags: CpuFlags {
                stopped: true,
                ..CpuFlags::default()
            },
            work: VecDeque::new(),
            thread: None,
            init_error: None,
        });

        if kind == BackendKind::RoundRobin && self.state.rr_active {
            // Joins the running round-robin thread.
            let sibling = self
                .state
                .cpus
                .iter()
                .find(|e| e.vcpu.kind() == BackendKind::RoundRobin && e.flags.created)
                .map(|e| Arc::clone(&e.vcpu));
            if let Some(sibling) = sibling {
                vcpu.adopt_thread(&sibling);
            }
            if let Some(entry) = self.entry_mut(index) {
                entry.flags.created = true;
            }
            vcpu.halt_cond.notify_all();
            tracing::debug!(index, "vCPU joined round-robin thread");
            return Ok(vcpu);
        }

        let spawned = match kind {
            BackendKind::RoundRobin => {
                if let Some(previous) = self.state.rr_thread.take() {
                    self.unlocked(|| previous.join().ok());
                }
                backend::round_robin::spawn(self.machine()).map(|handle| {
                    self.state.rr_thread = Some(handle);
                    self.state.rr_active = true;
                })
            }
            _ => backend::spawn(self.machine(), Arc::clone(&vcpu)).map(|handle| {
                if let Some(entry) = self.entry_mut(index) {
                    entry.thread = Some(handle);
                }
            }),
        };
        if let Err(err) = spawned {
            self.state.cpus.retain(|e| e.vcpu.index() != index);
            return Err(MachineError::Spawn(err));
        }

        loop {
            let Some(entry) = self.entry_mut(index) else {
                return Err(MachineError::UnknownCpu(index));
            };
            if entry.flags.created {
                break;
            }
            if let Some(source) = entry.init_error.take() {
                let thread = entry.thread.take();
                self.state.cpus.retain(|e| e.vcpu.index() != index);
                if let Some(thread) = thread {
                    self.unlocked(|| thread.join().ok());
                }
                return Err(MachineError::VcpuInit { index, source });
            }
            let cpu_cond = &self.shared.cpu_cond;
            cpu_cond.wait(&mut self.state);
        }

        tracing::debug!(index, ?kind, "vCPU created");
        Ok(vcpu)
    }
}
