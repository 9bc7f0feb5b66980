//! vCPU scheduling for a machine emulator.
//!
//! A [`Machine`] owns the global lock, the vCPU list, the timers and the run state. vCPUs are
//! serviced by one of four thread bodies chosen from the configured [`Engine`]:
//!
//! - software execution on a single round-robin thread, time-sliced by a kick timer;
//! - software execution with one thread per vCPU;
//! - hardware acceleration with one thread per vCPU;
//! - a dummy thread that never executes and only services queued work.
//!
//! Everything that mutates shared state goes through [`Locked`], the guard of the global lock.
//! Execution engines run with the lock released and are interrupted by kicks.

mod backend;
mod bql;
pub mod config;
mod error;
mod exec;
mod icount;
mod kick;
mod lifecycle;
mod machine;
mod main_loop;
mod quantum;
mod runstate;
mod simulator;
mod throttle;
mod timers;
mod vcpu;
mod work;

pub use bql::Locked;
pub use config::{
    CpusConfig, GuestTraits, IcountOptions, IcountSettings, QuantumOptions, QuantumSettings,
    ThreadMode,
};
pub use error::{AccelError, ConfigError, MachineError};
pub use exec::{Accelerator, Engine, ExecContext, ExitReason, IcountBudget, TcgExecutor};
pub use icount::DriftInfo;
pub use machine::{Machine, MachineBuilder, TimerCallback};
pub use quantum::{QuantumCpuStats, QuantumSample};
pub use runstate::{NoopObserver, RunState, RunStateObserver};
pub use simulator::{AdvanceOutcome, ExternalSimulator, Simulator, SimulatorMode, TimingDriver};
pub use throttle::{ThrottleStats, CPU_THROTTLE_PCT_MAX, CPU_THROTTLE_PCT_MIN};
pub use vcpu::{BackendKind, CpuFlags, CpuInfo, LifecycleState, Vcpu};
pub use work::WorkFn;

pub use pace_time::{ClockKind, IcountMode, TimerId};
