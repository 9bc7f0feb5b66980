//! One thread per hardware-accelerated vCPU.

use std::sync::Arc;

use crate::vcpu::set_current_cpu;
use crate::{Engine, ExitReason, Machine, Vcpu};

pub(crate) fn thread_fn(machine: Machine, vcpu: Arc<Vcpu>) {
    let Engine::Accel(accel) = machine.engine().clone() else {
        return;
    };
    let index = vcpu.index();
    let mut bql = machine.lock();
    bql.bind_vcpu_thread(&vcpu);

    if let Err(err) = accel.init_vcpu(&vcpu) {
        tracing::error!(index, %err, "accelerator vCPU init failed");
        if let Some(entry) = bql.entry_mut(index) {
            entry.init_error = Some(err);
        }
        set_current_cpu(machine.id(), None);
        bql.shared.cpu_cond.notify_all();
        return;
    }
    bql.signal_created(index);
    tracing::debug!(index, "accelerated vCPU thread started");

    loop {
        if bql.cpu_can_run(index) {
            vcpu.set_running(true);
            let reason = bql.unlocked(|| accel.run(&vcpu));
            vcpu.set_running(false);
            match reason {
                ExitReason::Debug => bql.cpu_handle_guest_debug(index),
                ExitReason::Halted => {
                    if let Some(entry) = bql.entry_mut(index) {
                        entry.flags.halted = true;
                    }
                }
                ExitReason::AtomicRetry | ExitReason::Other => {}
            }
        }
        bql.wait_io_event(&vcpu);

        if bql.unplug_pending(index) && !bql.cpu_can_run(index) {
            break;
        }
    }

    bql.destroy_vcpu(&vcpu);
    set_current_cpu(machine.id(), None);
    tracing::debug!(index, "accelerated vCPU thread exiting");
}
