mod common;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use common::{config, tcg_machine, wait_until, SpinExecutor, TIMEOUT};
use pace_cpus::{
    ClockKind, ExecContext, ExitReason, IcountMode, IcountSettings, TcgExecutor, ThreadMode,
};
use pretty_assertions::assert_eq;

#[test]
fn kick_timer_shares_the_thread() {
    let exec = SpinExecutor::new();
    let mut cfg = config(ThreadMode::Single);
    cfg.kick_period_ns = 2_000_000;
    let machine = tcg_machine(cfg, exec.clone(), 3);
    machine.start_main_loop().unwrap();
    machine.vm_start();

    // None of the vCPUs ever yields; only the kick timer moves the thread on.
    assert!(wait_until(TIMEOUT, || (0..3).all(|i| exec.slices_of(i) >= 2)));
    assert!(machine.vcpu(0).unwrap().kicks() > 0);

    let threads: Vec<Option<String>> = machine.query_cpus().into_iter().map(|c| c.thread).collect();
    assert_eq!(threads, vec![Some("ALL CPUs/TCG".to_string()); 3]);
    machine.shutdown();
}

/// Runs a fixed chunk per slice and traps on an atomic section every third slice.
#[derive(Default)]
struct AtomicStepper {
    slices: parking_lot::Mutex<u64>,
    atomic_steps: std::sync::atomic::AtomicU64,
}

impl TcgExecutor for AtomicStepper {
    fn exec(&self, ctx: &mut ExecContext<'_>) -> ExitReason {
        let mut slices = self.slices.lock();
        *slices += 1;
        ctx.retire(1_000);
        if *slices % 3 == 0 {
            ExitReason::AtomicRetry
        } else {
            ExitReason::Other
        }
    }

    fn exec_step_atomic(&self, _vcpu: &pace_cpus::Vcpu) {
        self.atomic_steps
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[test]
fn atomic_retry_steps_exclusively() {
    let exec = Arc::new(AtomicStepper::default());
    let machine = tcg_machine(config(ThreadMode::Single), exec.clone(), 2);
    machine.vm_start();

    assert!(wait_until(TIMEOUT, || {
        exec.atomic_steps.load(std::sync::atomic::Ordering::SeqCst) >= 3
    }));
    assert!(machine.total_instructions() >= 3_000);
    machine.shutdown();
}

#[test]
fn counters_accumulate_per_cpu() {
    let exec = SpinExecutor::new();
    let mut cfg = config(ThreadMode::Single);
    cfg.kick_period_ns = 1_000_000;
    let machine = tcg_machine(cfg, exec.clone(), 2);
    machine.start_main_loop().unwrap();
    machine.vm_start();

    assert!(wait_until(TIMEOUT, || {
        machine.query_cpus().iter().all(|c| c.executed > 0)
    }));
    machine.pause_all();
    let executed: u64 = machine.query_cpus().iter().map(|c| c.executed).sum();
    assert_eq!(executed, machine.total_instructions());
    machine.shutdown();
}

#[test]
fn shutdown_with_main_loop_unplugs_spinning_cpus() {
    let exec = SpinExecutor::new();
    let mut cfg = config(ThreadMode::Single);
    cfg.kick_period_ns = 2_000_000;
    let machine = tcg_machine(cfg, exec.clone(), 3);
    machine.start_main_loop().unwrap();
    machine.vm_start();
    assert!(wait_until(TIMEOUT, || (0..3).all(|i| exec.slices_of(i) >= 1)));

    machine.shutdown();
    assert!(machine.query_cpus().is_empty());
}

#[test]
fn virtual_deadline_fires_on_the_vcpu_thread() {
    let mut cfg = config(ThreadMode::Single);
    cfg.icount = IcountSettings {
        mode: IcountMode::Fixed { shift: 3 },
        sleep: true,
        align: false,
    };
    let exec = SpinExecutor::new();
    // No main loop: the round-robin thread has to run the timer itself.
    let machine = tcg_machine(cfg, exec, 1);
    let fired_at = Arc::new(AtomicI64::new(-1));
    {
        let fired_at = Arc::clone(&fired_at);
        let mut bql = machine.lock();
        let timer = bql.new_timer(ClockKind::Virtual, move |bql| {
            fired_at.store(bql.clock_now(ClockKind::Virtual), Ordering::SeqCst);
        });
        bql.timer_mod(timer, 1_000_000);
    }
    machine.vm_start();

    assert!(wait_until(TIMEOUT, || fired_at.load(Ordering::SeqCst) >= 0));
    assert!(fired_at.load(Ordering::SeqCst) >= 1_000_000);
    // Execution continues past the deadline once the timer is gone.
    assert!(wait_until(TIMEOUT, || machine.clock().get_icount() > 1_000_000));
    machine.shutdown();
}
