//! One thread per software vCPU.

use std::sync::Arc;

use crate::vcpu::set_current_cpu;
use crate::{Engine, Machine, Vcpu};

pub(crate) fn thread_fn(machine: Machine, vcpu: Arc<Vcpu>) {
    let Engine::Tcg(exec) = machine.engine().clone() else {
        return;
    };
    let index = vcpu.index();
    let mut bql = machine.lock();
    bql.bind_vcpu_thread(&vcpu);
    bql.signal_created(index);
    tracing::debug!(index, "per-vCPU software thread started");

    // Service any work queued before the first kick.
    vcpu.request_exit();

    loop {
        if bql.cpu_can_run(index) {
            let reason = bql.tcg_exec(&vcpu, &exec);
            bql.handle_tcg_exit(&vcpu, &exec, reason);
        }
        vcpu.clear_exit_request();
        bql.wait_io_event(&vcpu);

        if bql.unplug_pending(index) && !bql.cpu_can_run(index) {
            break;
        }
    }

    bql.destroy_vcpu(&vcpu);
    set_current_cpu(machine.id(), None);
    tracing::debug!(index, "per-vCPU software thread exiting");
}
