mod common;

use std::sync::Arc;

use common::{config, tcg_machine, wait_until, Event, RecordingObserver, SpinExecutor, TIMEOUT};
use pace_cpus::{CpusConfig, LifecycleState, MachineBuilder, RunState, ThreadMode};
use pretty_assertions::assert_eq;

#[test]
fn start_and_stop_report_events() {
    let observer = Arc::new(RecordingObserver::default());
    let machine = MachineBuilder::new(CpusConfig::default())
        .observer(observer.clone())
        .build()
        .unwrap();
    machine.init_vcpu().unwrap();
    assert_eq!(machine.run_state(), RunState::Prelaunch);

    machine.vm_start();
    assert_eq!(
        observer.take(),
        vec![Event::Resume, Event::State(true, RunState::Running)]
    );

    // Already running without a pending request: nothing to report.
    machine.vm_start();
    assert_eq!(observer.take(), vec![]);

    machine.vm_stop(RunState::Paused);
    assert_eq!(machine.run_state(), RunState::Paused);
    assert_eq!(
        observer.take(),
        vec![Event::State(false, RunState::Paused), Event::Stop]
    );

    // Stopping a stopped VM is silent.
    machine.vm_stop(RunState::Paused);
    assert_eq!(observer.take(), vec![]);

    machine.lock().vm_stop_force_state(RunState::SaveVm);
    assert_eq!(machine.run_state(), RunState::SaveVm);
    assert_eq!(observer.take(), vec![]);

    machine.shutdown();
}

#[test]
fn stopped_vm_freezes_virtual_time() {
    let machine = MachineBuilder::new(CpusConfig::default()).build().unwrap();
    machine.vm_start();
    std::thread::sleep(std::time::Duration::from_millis(5));
    machine.vm_stop(RunState::Paused);

    let frozen = machine.lock().get_ticks();
    std::thread::sleep(std::time::Duration::from_millis(5));
    assert_eq!(machine.lock().get_ticks(), frozen);
    assert!(machine.clock().get_clock() > 0);
    machine.shutdown();
}

#[test]
fn guest_breakpoint_stops_the_vm() {
    let observer = Arc::new(RecordingObserver::default());
    let exec = SpinExecutor::with_debug_trap(1);
    let machine = MachineBuilder::new(config(ThreadMode::Multi))
        .tcg(exec)
        .observer(observer.clone())
        .build()
        .unwrap();
    machine.init_vcpu().unwrap();
    machine.init_vcpu().unwrap();
    machine.start_main_loop().unwrap();
    machine.vm_start();

    assert!(wait_until(TIMEOUT, || machine.run_state() == RunState::Debug));
    assert_eq!(machine.lock().debug_stop_cpu(), Some(1));
    assert!(observer
        .take()
        .contains(&Event::State(false, RunState::Debug)));

    let states: Vec<LifecycleState> = machine.query_cpus().iter().map(|c| c.state).collect();
    assert_eq!(states, vec![LifecycleState::Stopped; 2]);

    machine.vm_start();
    assert_eq!(machine.run_state(), RunState::Running);
    machine.shutdown();
}

#[test]
fn query_reports_every_cpu() {
    let machine = tcg_machine(config(ThreadMode::Multi), SpinExecutor::new(), 3);
    let cpus = machine.query_cpus();
    let summary: Vec<(usize, bool, LifecycleState)> =
        cpus.iter().map(|c| (c.index, c.current, c.state)).collect();
    assert_eq!(
        summary,
        vec![
            (0, true, LifecycleState::Stopped),
            (1, false, LifecycleState::Stopped),
            (2, false, LifecycleState::Stopped),
        ]
    );

    let json = serde_json::to_value(&cpus[2]).unwrap();
    assert_eq!(json["backend"], "per-cpu");
    assert_eq!(json["thread"], "CPU 2/TCG");
    machine.shutdown();
}

#[test]
fn timer_callbacks_run_on_the_main_loop() {
    let machine = MachineBuilder::new(CpusConfig::default()).build().unwrap();
    machine.start_main_loop().unwrap();

    let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    {
        let fired = Arc::clone(&fired);
        let mut bql = machine.lock();
        let id = bql.new_timer(pace_cpus::ClockKind::Realtime, move |_| {
            fired.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let now = bql.clock_now(pace_cpus::ClockKind::Realtime);
        bql.timer_mod(id, now + 1_000_000);
        assert!(bql.timer_pending(id));
    }
    machine.notify_event();

    assert!(wait_until(TIMEOUT, || {
        fired.load(std::sync::atomic::Ordering::SeqCst) == 1
    }));
    machine.shutdown();
}
