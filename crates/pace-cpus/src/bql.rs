//! The global lock.
//!
//! All lifecycle flags, the CPU list, the timer lists and the run state live in one
//! [`MachineState`] behind a single non-recursive mutex. [`Locked`] is the guard; every
//! orchestration operation is a method on it so that holding the lock is a type-level
//! precondition rather than a convention.

use std::cell::Cell;
use std::sync::Arc;

use parking_lot::{Condvar, MutexGuard};

use crate::machine::{MachineState, Shared};
use crate::Machine;

thread_local! {
    /// Id of the machine whose global lock this thread holds (0: none).
    static BQL_HOLDER: Cell<u64> = const { Cell::new(0) };
}

fn set_holder(id: u64) {
    BQL_HOLDER.with(|holder| holder.set(id));
}

fn holder() -> u64 {
    BQL_HOLDER.with(Cell::get)
}

/// Guard proving the global lock of one machine is held by the current thread.
pub struct Locked<'a> {
    pub(crate) shared: &'a Arc<Shared>,
    pub(crate) state: MutexGuard<'a, MachineState>,
}

impl Machine {
    /// Acquire the global lock.
    ///
    /// The lock is not recursive: acquiring it twice on one thread is a logic error and aborts.
    pub fn lock(&self) -> Locked<'_> {
        if holder() == self.shared.id {
            tracing::error!(machine = self.shared.id, "global lock acquired recursively");
            std::process::abort();
        }
        let state = self.shared.bql.lock();
        set_holder(self.shared.id);
        Locked {
            shared: &self.shared,
            state,
        }
    }

    /// Whether the calling thread holds this machine's global lock.
    pub fn lock_held(&self) -> bool {
        holder() == self.shared.id
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        if holder() == self.shared.id {
            set_holder(0);
        }
    }
}

impl<'a> Locked<'a> {
    pub fn machine(&self) -> Machine {
        Machine {
            shared: Arc::clone(self.shared),
        }
    }

    /// Run `f` with the lock released, re-acquiring it afterwards.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let id = self.shared.id;
        set_holder(0);
        let out = MutexGuard::unlocked(&mut self.state, f);
        set_holder(id);
        out
    }

    /// Block on `cond`, releasing the lock while waiting.
    pub(crate) fn wait(&mut self, cond: &Condvar) {
        cond.wait(&mut self.state);
    }
}
