//! Instruction-count based virtual time with drift correction and idle warping.
//!
//! With icount on, guest time is
//!
//! ```text
//! virtual_ns = icount_bias + (icount << shift)
//! ```
//!
//! `icount` only grows as vCPUs retire instructions. `shift` is either fixed by configuration
//! or tuned by [`VirtualClock::adjust`] so that virtual time loosely tracks the VM runtime
//! clock. `icount_bias` absorbs every discontinuity: shift changes, and warps that advance
//! virtual time while every vCPU is idle.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{HostClock, SeqLock, NANOSECONDS_PER_SECOND};

/// Largest shift the adaptive loop will reach (1 instruction == 1024ns, i.e. ~1 MIPS).
pub const MAX_ICOUNT_SHIFT: u32 = 10;

/// Virtual/real drift the adaptive loop ignores.
///
/// Correlation between real and virtual time is approximate; small variation is expected.
pub const ICOUNT_WOBBLE_NS: i64 = NANOSECONDS_PER_SECOND / 10;

/// Initial guess for `shift=auto` (~125 MIPS).
const ADAPTIVE_INITIAL_SHIFT: u32 = 3;

const NO_WARP: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IcountMode {
    /// Guest time follows the VM runtime clock.
    Off,
    /// Each instruction advances virtual time by exactly `1 << shift` ns.
    Fixed { shift: u32 },
    /// `shift` is retuned periodically to follow real time.
    Adaptive,
}

impl IcountMode {
    pub fn is_enabled(self) -> bool {
        !matches!(self, IcountMode::Off)
    }

    pub fn is_adaptive(self) -> bool {
        matches!(self, IcountMode::Adaptive)
    }

    fn initial_shift(self) -> u32 {
        match self {
            IcountMode::Off => 0,
            IcountMode::Fixed { shift } => shift,
            IcountMode::Adaptive => ADAPTIVE_INITIAL_SHIFT,
        }
    }
}

/// Host tick bookkeeping owned by the global lock.
///
/// Only [`VirtualClock::get_ticks`], [`VirtualClock::enable_ticks`] and
/// [`VirtualClock::disable_ticks`] touch it; taking it by `&mut` is how those methods require
/// the caller to hold the lock that owns it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickAccount {
    prev: i64,
    offset: i64,
}

/// What the caller must do after [`VirtualClock::start_warp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarpDecision {
    Nothing,
    /// Virtual time moved (or a timer is already due): wake whoever waits on virtual timers.
    NotifyVirtual,
    /// Arm the warp timer on the VM runtime clock; the bias is moved when it fires or when a
    /// vCPU wakes up first.
    ArmWarpTimer { at_ns: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockSnapshot {
    pub icount: i64,
    pub icount_bias: i64,
    pub shift: u32,
    pub clock_offset: i64,
    pub ticks_enabled: bool,
    pub warp_start: Option<i64>,
}

pub struct VirtualClock {
    host: Arc<dyn HostClock>,
    mode: IcountMode,
    sleep: bool,

    seqlock: SeqLock,
    clock_offset: AtomicI64,
    ticks_enabled: AtomicBool,
    icount_bias: AtomicI64,
    /// Written by the executing software vCPU thread after each slice.
    icount: AtomicI64,
    shift: AtomicU32,
    warp_start: AtomicI64,
    /// Drift observed by the previous adjustment; only touched inside the write side.
    last_delta: AtomicI64,
    warned_no_timers: AtomicBool,
}

impl std::fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualClock")
            .field("mode", &self.mode)
            .field("sleep", &self.sleep)
            .field("state", &self.snapshot())
            .finish()
    }
}

impl VirtualClock {
    /// `sleep` selects the warp policy: `true` lets idle vCPUs genuinely wait for the next
    /// deadline, `false` jumps virtual time forward immediately.
    pub fn new(host: Arc<dyn HostClock>, mode: IcountMode, sleep: bool) -> Self {
        Self {
            host,
            mode,
            sleep,
            seqlock: SeqLock::new(),
            clock_offset: AtomicI64::new(0),
            ticks_enabled: AtomicBool::new(false),
            icount_bias: AtomicI64::new(0),
            icount: AtomicI64::new(0),
            shift: AtomicU32::new(mode.initial_shift()),
            warp_start: AtomicI64::new(NO_WARP),
            last_delta: AtomicI64::new(0),
            warned_no_timers: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> IcountMode {
        self.mode
    }

    pub fn icount_enabled(&self) -> bool {
        self.mode.is_enabled()
    }

    pub fn sleep_enabled(&self) -> bool {
        self.sleep
    }

    pub fn host(&self) -> &dyn HostClock {
        self.host.as_ref()
    }

    pub fn ticks_enabled(&self) -> bool {
        self.ticks_enabled.load(Ordering::SeqCst)
    }

    /// Elapsed VM time in host ticks, or icount time when icount is on.
    ///
    /// A host tick source that moved backwards is folded into the offset so the result never
    /// decreases.
    pub fn get_ticks(&self, account: &mut TickAccount) -> i64 {
        if self.mode.is_enabled() {
            return self.get_icount();
        }

        let mut ticks = account.offset;
        if self.ticks_enabled() {
            ticks += self.host.ticks();
        }

        if account.prev > ticks {
            account.offset += account.prev - ticks;
            ticks = account.prev;
        }

        account.prev = ticks;
        ticks
    }

    fn clock_locked(&self) -> i64 {
        let mut time = self.clock_offset.load(Ordering::SeqCst);
        if self.ticks_enabled.load(Ordering::SeqCst) {
            time += self.host.now_ns();
        }
        time
    }

    /// VM runtime in nanoseconds (host time minus stopped periods). Safe from any thread.
    pub fn get_clock(&self) -> i64 {
        self.seqlock.read(|| self.clock_locked())
    }

    pub fn enable_ticks(&self, account: &mut TickAccount) {
        self.seqlock.write(|| {
            if !self.ticks_enabled.load(Ordering::SeqCst) {
                account.offset -= self.host.ticks();
                self.clock_offset
                    .fetch_sub(self.host.now_ns(), Ordering::SeqCst);
                self.ticks_enabled.store(true, Ordering::SeqCst);
            }
        });
    }

    pub fn disable_ticks(&self, account: &mut TickAccount) {
        self.seqlock.write(|| {
            if self.ticks_enabled.load(Ordering::SeqCst) {
                account.offset += self.host.ticks();
                let frozen = self.clock_locked();
                self.clock_offset.store(frozen, Ordering::SeqCst);
                self.ticks_enabled.store(false, Ordering::SeqCst);
            }
        });
    }

    pub fn shift(&self) -> u32 {
        self.shift.load(Ordering::SeqCst)
    }

    /// Force `shift`, re-basing the bias so virtual time does not jump.
    pub fn set_shift(&self, shift: u32) {
        self.seqlock.write(|| {
            let now = self.icount_locked();
            self.shift.store(shift, Ordering::SeqCst);
            let icount = self.icount.load(Ordering::SeqCst);
            self.icount_bias
                .store(now - (icount << shift), Ordering::SeqCst);
        });
    }

    pub fn icount_to_ns(&self, count: i64) -> i64 {
        count << self.shift()
    }

    /// Instructions needed to cover `ns` of virtual time, rounded up.
    pub fn icount_round(&self, ns: i64) -> i64 {
        let shift = self.shift();
        (ns + (1i64 << shift) - 1) >> shift
    }

    /// Fold instructions retired by a vCPU into the global counter.
    pub fn add_icount(&self, executed: i64) {
        self.icount.fetch_add(executed, Ordering::SeqCst);
    }

    pub fn icount_raw(&self) -> i64 {
        self.icount.load(Ordering::SeqCst)
    }

    fn icount_locked(&self) -> i64 {
        let icount = self.icount.load(Ordering::SeqCst);
        self.icount_bias.load(Ordering::SeqCst) + (icount << self.shift.load(Ordering::SeqCst))
    }

    /// Instruction-derived virtual time in nanoseconds.
    pub fn get_icount(&self) -> i64 {
        self.seqlock.read(|| self.icount_locked())
    }

    /// Drift correction step (adaptive icount).
    ///
    /// Compares icount time with VM runtime. When the guest is pulling ahead by more than the
    /// wobble, virtual time is slowed by decrementing `shift`; when it is falling behind,
    /// `shift` is incremented. The comparison against the previous delta damps oscillation
    /// instead of correcting instantly. Returns the shift in effect afterwards.
    pub fn adjust(&self, running: bool) -> u32 {
        if !running {
            return self.shift();
        }

        self.seqlock.write(|| {
            let cur_time = self.clock_locked();
            let cur_icount = self.icount_locked();
            let delta = cur_icount - cur_time;
            let last_delta = self.last_delta.load(Ordering::SeqCst);
            let mut shift = self.shift.load(Ordering::SeqCst);

            if delta > 0 && last_delta + ICOUNT_WOBBLE_NS < delta * 2 && shift > 0 {
                // Guest is getting too far ahead.
                shift -= 1;
                tracing::debug!(delta, shift, "icount ahead of real time, slowing virtual time");
            }
            if delta < 0 && last_delta - ICOUNT_WOBBLE_NS > delta * 2 && shift < MAX_ICOUNT_SHIFT
            {
                // Guest is getting too far behind.
                shift += 1;
                tracing::debug!(delta, shift, "icount behind real time, speeding virtual time");
            }

            self.last_delta.store(delta, Ordering::SeqCst);
            self.shift.store(shift, Ordering::SeqCst);
            let icount = self.icount.load(Ordering::SeqCst);
            self.icount_bias
                .store(cur_icount - (icount << shift), Ordering::SeqCst);
            shift
        })
    }

    /// Begin an idle warp. The caller has already checked that icount is on, the VM is
    /// running and every vCPU is idle.
    ///
    /// `rt_now_ns` is the VM runtime clock; `deadline_ns` is the time until the next virtual
    /// timer (`None` if nothing is armed).
    pub fn start_warp(&self, rt_now_ns: i64, deadline_ns: Option<i64>) -> WarpDecision {
        let Some(deadline) = deadline_ns else {
            if !self.sleep && !self.warned_no_timers.swap(true, Ordering::SeqCst) {
                tracing::warn!("icount sleep disabled and no active timers");
            }
            return WarpDecision::Nothing;
        };

        if deadline == 0 {
            return WarpDecision::NotifyVirtual;
        }

        if !self.sleep {
            // Never let idle vCPUs sleep: jump straight to the next virtual event so execution
            // time is isolated from host latencies.
            self.advance_bias(deadline);
            return WarpDecision::NotifyVirtual;
        }

        // Only advance virtual time after the matching amount of real time has passed, so the
        // warp is not externally visible (e.g. packets still go out every 100ms, not in bursts).
        self.seqlock.write(|| {
            let start = self.warp_start.load(Ordering::SeqCst);
            if start == NO_WARP || start > rt_now_ns {
                self.warp_start.store(rt_now_ns, Ordering::SeqCst);
            }
        });
        WarpDecision::ArmWarpTimer {
            at_ns: rt_now_ns + deadline,
        }
    }

    /// Settle an outstanding warp: move the bias by the VM runtime that elapsed since the warp
    /// started. Returns `true` if a warp was outstanding.
    ///
    /// In adaptive mode the bias never moves virtual time past real time; a warp never moves
    /// it backwards.
    pub fn warp_rt(&self, running: bool) -> bool {
        let warp_start = self.seqlock.read(|| self.warp_start.load(Ordering::SeqCst));
        if warp_start == NO_WARP {
            return false;
        }

        self.seqlock.write(|| {
            if running {
                let clock = self.clock_locked();
                let start = self.warp_start.load(Ordering::SeqCst);
                let mut warp_delta = clock - start;
                if self.mode.is_adaptive() {
                    let cur_icount = self.icount_locked();
                    warp_delta = warp_delta.min(clock - cur_icount);
                }
                let warp_delta = warp_delta.max(0);
                self.icount_bias.fetch_add(warp_delta, Ordering::SeqCst);
                tracing::trace!(warp_delta, "accounted icount warp");
            }
            self.warp_start.store(NO_WARP, Ordering::SeqCst);
        });
        true
    }

    pub fn warp_pending(&self) -> bool {
        self.seqlock.read(|| self.warp_start.load(Ordering::SeqCst)) != NO_WARP
    }

    /// Move virtual time forward by `delta_ns` without executing instructions.
    pub fn advance_bias(&self, delta_ns: i64) {
        self.seqlock.write(|| {
            self.icount_bias.fetch_add(delta_ns, Ordering::SeqCst);
        });
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        self.seqlock.read(|| {
            let warp_start = self.warp_start.load(Ordering::SeqCst);
            ClockSnapshot {
                icount: self.icount.load(Ordering::SeqCst),
                icount_bias: self.icount_bias.load(Ordering::SeqCst),
                shift: self.shift.load(Ordering::SeqCst),
                clock_offset: self.clock_offset.load(Ordering::SeqCst),
                ticks_enabled: self.ticks_enabled.load(Ordering::SeqCst),
                warp_start: (warp_start != NO_WARP).then_some(warp_start),
            }
        })
    }
}
