use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::machine::Shared;
use crate::{Engine, Vcpu};

impl Shared {
    /// Force `vcpu` to re-evaluate whether it can run: wake it from its idle wait and make any
    /// in-progress execution return. Does not need the global lock.
    pub(crate) fn kick(&self, vcpu: &Vcpu) {
        vcpu.halt_cond.notify_all();
        if self.engine.is_tcg() {
            vcpu.request_exit();
            if !self.mttcg {
                self.kick_rr_cpu();
            }
        } else {
            self.kick_thread(vcpu);
        }
    }

    /// Interrupt the native thread. Repeated kicks coalesce until the thread acknowledges.
    fn kick_thread(&self, vcpu: &Vcpu) {
        if vcpu.thread_kicked.swap(true, Ordering::SeqCst) {
            return;
        }
        vcpu.raise_ipi();
        if let Engine::Accel(accel) = &self.engine {
            accel.kick(vcpu);
        }
    }

    /// Make whichever vCPU the round-robin thread is executing give up its slice.
    ///
    /// The current vCPU may change between reading it and requesting the exit, so retry until
    /// it is stable.
    pub(crate) fn kick_rr_cpu(&self) {
        loop {
            let cpu = self.rr_current.lock().clone();
            if let Some(cpu) = &cpu {
                cpu.request_exit();
            }
            let now = self.rr_current.lock().clone();
            let stable = match (&cpu, &now) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if stable {
                break;
            }
        }
    }

    pub(crate) fn set_rr_current(&self, vcpu: Option<Arc<Vcpu>>) {
        *self.rr_current.lock() = vcpu;
    }
}
