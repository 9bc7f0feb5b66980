//! Virtual CPU scheduling and instruction-counted virtual time.
//!
//! This crate bundles the workspace members:
//!
//! - [`time`]: host clocks, the icount virtual clock and timer queues.
//! - [`cpus`]: the machine, its vCPU threads and run-state control.

pub use pace_cpus as cpus;
pub use pace_time as time;

pub use pace_cpus::{
    CpusConfig, Engine, ExitReason, Machine, MachineBuilder, MachineError, RunState, ThreadMode,
};
