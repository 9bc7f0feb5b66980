mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::{config, tcg_machine, wait_until, SpinExecutor, TIMEOUT};
use pace_cpus::{
    AdvanceOutcome, ExecContext, ExitReason, ExternalSimulator, MachineBuilder, Simulator,
    SimulatorMode, TcgExecutor, ThreadMode, TimingDriver,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

/// Retires a fixed block per slice and returns.
struct BlockExecutor;

impl TcgExecutor for BlockExecutor {
    fn exec(&self, ctx: &mut ExecContext<'_>) -> ExitReason {
        ctx.retire(250);
        ExitReason::Other
    }
}

#[derive(Default)]
struct Lockstep {
    steps: Mutex<Vec<(usize, AdvanceOutcome)>>,
}

impl Simulator for Lockstep {
    fn mode(&self) -> SimulatorMode {
        SimulatorMode::Timing
    }

    fn name(&self) -> &str {
        "lockstep"
    }

    fn run_timing(&self, driver: &mut TimingDriver<'_, '_>) {
        let cpus = driver.cpus();
        for round in 0..6 {
            let index = cpus[round % cpus.len()];
            assert!(driver.select(index));
            let outcome = driver.advance();
            self.steps.lock().push((index, outcome));
        }
        assert!(!driver.select(99));
    }
}

#[test]
fn timing_simulator_drives_the_round_robin_thread() {
    let sim = Arc::new(Lockstep::default());
    let machine = MachineBuilder::new(config(ThreadMode::Single))
        .tcg(Arc::new(BlockExecutor))
        .simulator(ExternalSimulator::Loaded(sim.clone()))
        .build()
        .unwrap();
    machine.init_vcpu().unwrap();
    machine.init_vcpu().unwrap();
    machine.vm_start();

    assert!(wait_until(TIMEOUT, || sim.steps.lock().len() == 6));
    let steps = sim.steps.lock().clone();
    let expected: Vec<(usize, AdvanceOutcome)> = (0..6)
        .map(|round| (round % 2, AdvanceOutcome::Executed(ExitReason::Other)))
        .collect();
    assert_eq!(steps, expected);

    // Once the simulator returns, the normal loop takes over.
    assert!(wait_until(TIMEOUT, || machine.total_instructions() > 1_500));
    machine.shutdown();
}

#[derive(Default)]
struct Tracer {
    retired: AtomicU64,
}

impl Simulator for Tracer {
    fn mode(&self) -> SimulatorMode {
        SimulatorMode::Trace
    }

    fn name(&self) -> &str {
        "tracer"
    }

    fn on_slice(&self, _cpu: usize, executed: u64) {
        self.retired.fetch_add(executed, Ordering::SeqCst);
    }
}

#[test]
fn trace_simulator_sees_every_slice() {
    let tracer = Arc::new(Tracer::default());
    let exec = SpinExecutor::new();
    let machine = MachineBuilder::new(config(ThreadMode::Multi))
        .tcg(exec.clone())
        .simulator(ExternalSimulator::Loaded(tracer.clone()))
        .build()
        .unwrap();
    machine.init_vcpu().unwrap();
    assert!(machine.simulator().is_loaded());
    machine.vm_start();

    assert!(wait_until(TIMEOUT, || exec.slices_of(0) > 0));
    machine.pause_all();
    assert_eq!(tracer.retired.load(Ordering::SeqCst), machine.total_instructions());
    machine.shutdown();
}

#[test]
fn absent_simulator_is_not_loaded() {
    let machine = tcg_machine(config(ThreadMode::Single), SpinExecutor::new(), 1);
    assert!(!machine.simulator().is_loaded());
    assert_eq!(format!("{:?}", machine.simulator()), "Absent");
    machine.shutdown();
}
