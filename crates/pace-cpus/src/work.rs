//! Work queued onto a vCPU's own thread.
//!
//! Items run with the global lock held, from the common wait step of whichever backend owns
//! the vCPU. Queued work makes a vCPU non-idle, so queueing plus a kick is enough to get it
//! executed promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Locked, MachineError, Vcpu};

pub type WorkFn = Box<dyn FnOnce(&mut Locked<'_>, &Arc<Vcpu>) + Send>;

pub(crate) struct WorkItem {
    func: WorkFn,
    done: Option<Arc<AtomicBool>>,
}

impl Locked<'_> {
    /// Run `f` on the thread of vCPU `index` and wait for its result.
    ///
    /// Runs inline when the caller already is that thread.
    pub fn run_on_cpu<R, F>(&mut self, index: usize, f: F) -> Result<R, MachineError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Locked<'_>, &Arc<Vcpu>) -> R + Send + 'static,
    {
        let vcpu = self.vcpu(index).ok_or(MachineError::UnknownCpu(index))?;
        if vcpu.is_self() {
            return Ok(f(self, &vcpu));
        }

        let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
        let done = Arc::new(AtomicBool::new(false));
        let result = Arc::clone(&slot);
        self.queue_work(
            index,
            WorkItem {
                func: Box::new(move |bql, vcpu| {
                    *result.lock() = Some(f(bql, vcpu));
                }),
                done: Some(Arc::clone(&done)),
            },
        )?;

        while !done.load(Ordering::SeqCst) {
            match self.entry(index) {
                Some(entry) if !entry.flags.destroyed() => {}
                _ => return Err(MachineError::UnknownCpu(index)),
            }
            let work_cond = &self.shared.work_cond;
            work_cond.wait(&mut self.state);
        }
        let out = slot.lock().take();
        out.ok_or(MachineError::UnknownCpu(index))
    }

    /// Queue `f` on vCPU `index` without waiting.
    pub fn async_run_on_cpu(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut Locked<'_>, &Arc<Vcpu>) + Send + 'static,
    ) -> Result<(), MachineError> {
        self.queue_work(
            index,
            WorkItem {
                func: Box::new(f),
                done: None,
            },
        )
    }

    fn queue_work(&mut self, index: usize, item: WorkItem) -> Result<(), MachineError> {
        let entry = self
            .entry_mut(index)
            .ok_or(MachineError::UnknownCpu(index))?;
        entry.work.push_back(item);
        let vcpu = Arc::clone(&entry.vcpu);
        self.shared.kick(&vcpu);
        Ok(())
    }

    pub fn cpu_work_pending(&self, index: usize) -> bool {
        self.entry(index).is_some_and(|e| !e.work.is_empty())
    }

    pub(crate) fn process_queued_work(&mut self, index: usize) {
        let mut ran = false;
        loop {
            let Some(entry) = self.entry_mut(index) else {
                break;
            };
            let Some(item) = entry.work.pop_front() else {
                break;
            };
            let vcpu = Arc::clone(&entry.vcpu);
            (item.func)(self, &vcpu);
            if let Some(done) = item.done {
                done.store(true, Ordering::SeqCst);
            }
            ran = true;
        }
        if ran {
            self.shared.work_cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{CpusConfig, MachineBuilder};
    use pretty_assertions::assert_eq;

    #[test]
    fn run_on_cpu_executes_on_the_vcpu_thread() {
        let machine = MachineBuilder::new(CpusConfig::default()).build().unwrap();
        let vcpu = machine.init_vcpu().unwrap();
        let mut bql = machine.lock();
        let name = bql
            .run_on_cpu(vcpu.index(), |_, vcpu| {
                assert!(vcpu.is_self());
                std::thread::current().name().map(str::to_owned)
            })
            .unwrap();
        assert_eq!(name.as_deref(), Some("CPU 0/DUMMY"));
        drop(bql);
        machine.shutdown();
    }

    #[test]
    fn work_on_unknown_cpu_is_rejected() {
        let machine = MachineBuilder::new(CpusConfig::default()).build().unwrap();
        let mut bql = machine.lock();
        assert!(bql.async_run_on_cpu(3, |_, _| {}).is_err());
    }
}
