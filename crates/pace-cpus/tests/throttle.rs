mod common;

use std::time::Duration;

use common::{config, tcg_machine, wait_until, SpinExecutor, TIMEOUT};
use pace_cpus::ThreadMode;
use pretty_assertions::assert_eq;

#[test]
fn throttled_cpus_sleep_every_period() {
    let machine = tcg_machine(config(ThreadMode::Multi), SpinExecutor::new(), 2);
    machine.start_main_loop().unwrap();
    machine.vm_start();

    machine.cpu_throttle_set(50);
    assert!(machine.cpu_throttle_active());
    assert_eq!(machine.cpu_throttle_get_percentage(), 50);

    assert!(wait_until(TIMEOUT, || {
        let stats = machine.throttle_stats();
        stats.scheduled_sleeps >= 4 && stats.slept_ns > 0
    }));

    machine.cpu_throttle_stop();
    assert!(!machine.cpu_throttle_active());
    machine.shutdown();
}

#[test]
fn no_sleeps_without_throttle() {
    let exec = SpinExecutor::new();
    let machine = tcg_machine(config(ThreadMode::Multi), exec.clone(), 2);
    machine.start_main_loop().unwrap();
    machine.vm_start();

    assert!(wait_until(TIMEOUT, || exec.slices_of(1) > 0));
    std::thread::sleep(Duration::from_millis(50));
    let stats = machine.throttle_stats();
    assert_eq!(stats.percentage, 0);
    assert_eq!(stats.scheduled_sleeps, 0);
    assert_eq!(stats.slept_ns, 0);
    machine.shutdown();
}

#[test]
fn zero_percent_stops_throttling() {
    let machine = tcg_machine(config(ThreadMode::Single), SpinExecutor::new(), 1);
    machine.cpu_throttle_set(30);
    assert!(machine.cpu_throttle_active());
    machine.cpu_throttle_set(0);
    assert!(!machine.cpu_throttle_active());
    machine.shutdown();
}
