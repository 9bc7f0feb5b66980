//! Thread for a vCPU that never executes: it only wakes on interrupts to service queued work.

use std::sync::Arc;

use crate::vcpu::set_current_cpu;
use crate::{Machine, Vcpu};

pub(crate) fn thread_fn(machine: Machine, vcpu: Arc<Vcpu>) {
    let index = vcpu.index();
    let mut bql = machine.lock();
    bql.bind_vcpu_thread(&vcpu);
    bql.signal_created(index);
    tracing::debug!(index, "dummy vCPU thread started");

    loop {
        bql.unlocked(|| vcpu.wait_ipi(None));
        bql.wait_io_event_common(index);

        if bql.unplug_pending(index) {
            break;
        }
    }

    bql.destroy_vcpu(&vcpu);
    set_current_cpu(machine.id(), None);
    tracing::debug!(index, "dummy vCPU thread exiting");
}
