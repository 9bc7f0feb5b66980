//! Configuration entry points.
//!
//! Options arrive as `key=value,key=value` strings (the shape used on the command line) and are
//! validated into typed settings. Every rejection is a [`ConfigError`]; nothing here touches a
//! running machine.

use std::path::PathBuf;
use std::str::FromStr;

use pace_time::{IcountMode, SCALE_MS};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Fixed shifts above this overflow the `i64` nanosecond clock almost immediately.
pub const MAX_FIXED_SHIFT: u32 = 62;

/// Throttle timeslice: the amount of guest execution between two throttle sleeps.
pub const DEFAULT_THROTTLE_TIMESLICE_NS: i64 = 10 * SCALE_MS;

/// Period of the round-robin kick timer, in virtual nanoseconds.
pub const DEFAULT_KICK_PERIOD_NS: i64 = 100 * SCALE_MS;

const DEFAULT_QUANTUM_FILE: &str = "quantum_file.dat";
const DEFAULT_QUANTUM_STEP: u64 = 100_000_000;

/// Split `key=value,key=value`. A bare `key` means `key=on`.
pub fn parse_opts(opts: &str) -> Result<Vec<(String, String)>, ConfigError> {
    opts.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, _)) if key.trim().is_empty() => {
                Err(ConfigError::MalformedOption(part.to_string()))
            }
            Some((key, value)) => Ok((key.trim().to_string(), value.trim().to_string())),
            None => Ok((part.to_string(), "on".to_string())),
        })
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "on" | "yes" | "true" => Ok(true),
        "off" | "no" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Parse an instruction count with an optional `K`/`M`/`B` magnitude suffix (`"10K"` is
/// `10_000`, `"2b"` is `2_000_000_000`).
pub fn parse_magnitude(value: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidMagnitude(value.to_string());
    let value = value.trim();
    let last = value.chars().last().ok_or_else(invalid)?;

    if !last.is_ascii_alphabetic() {
        return value.parse().map_err(|_| invalid());
    }

    let digits = &value[..value.len() - 1];
    let base: u64 = digits.parse().map_err(|_| invalid())?;
    let scale: u64 = match last {
        'K' | 'k' => 1_000,
        'M' | 'm' => 1_000_000,
        'B' | 'b' => 1_000_000_000,
        _ => return Err(invalid()),
    };
    base.checked_mul(scale).ok_or_else(invalid)
}

/// Software execution thread model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadMode {
    /// All software vCPUs share one round-robin thread.
    Single,
    /// One thread per software vCPU.
    Multi,
}

impl FromStr for ThreadMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(ThreadMode::Single),
            "multi" => Ok(ThreadMode::Multi),
            other => Err(ConfigError::InvalidThreadMode(other.to_string())),
        }
    }
}

/// Properties of the emulated architecture relevant to multi-threaded execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestTraits {
    /// Guest word size exceeds the host's.
    pub oversized: bool,
    /// Guest front-end has been converted to parallel execution.
    pub supports_mttcg: bool,
    /// Host memory ordering is at least as strong as the guest's.
    pub memory_order_compatible: bool,
}

impl Default for GuestTraits {
    fn default() -> Self {
        Self {
            oversized: false,
            supports_mttcg: true,
            memory_order_compatible: true,
        }
    }
}

/// Raw `-icount` options before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcountOptions {
    pub shift: Option<String>,
    pub align: Option<bool>,
    pub sleep: Option<bool>,
}

impl IcountOptions {
    /// Parse `shift=N|auto,align=on|off,sleep=on|off`. A lone value without a key is taken as
    /// the shift (`-icount 3`).
    pub fn parse(opts: &str) -> Result<Self, ConfigError> {
        let mut out = IcountOptions::default();
        for (key, value) in parse_opts(opts)? {
            match key.as_str() {
                "shift" => out.shift = Some(value),
                "align" => out.align = Some(parse_bool(&key, &value)?),
                "sleep" => out.sleep = Some(parse_bool(&key, &value)?),
                _ if value == "on" && out.shift.is_none() => out.shift = Some(key),
                _ => {
                    return Err(ConfigError::UnknownOption {
                        group: "icount",
                        key,
                    })
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcountSettings {
    pub mode: IcountMode,
    /// Let idle vCPUs sleep until the next deadline instead of jumping virtual time.
    pub sleep: bool,
    /// Throttle the guest so virtual time does not run ahead of host time.
    pub align: bool,
}

impl Default for IcountSettings {
    fn default() -> Self {
        Self {
            mode: IcountMode::Off,
            sleep: true,
            align: false,
        }
    }
}

impl IcountSettings {
    pub fn configure(opts: &IcountOptions) -> Result<Self, ConfigError> {
        let Some(shift) = opts.shift.as_deref() else {
            if opts.align.is_some() {
                return Err(ConfigError::AlignWithoutShift);
            }
            return Ok(Self::default());
        };

        let sleep = opts.sleep.unwrap_or(true);
        let align = opts.align.unwrap_or(false);

        if align && !sleep {
            return Err(ConfigError::AlignWithoutSleep);
        }

        if shift != "auto" {
            let shift = parse_shift(shift)?;
            return Ok(Self {
                mode: IcountMode::Fixed { shift },
                sleep,
                align,
            });
        }

        if align {
            return Err(ConfigError::AutoShiftWithAlign);
        }
        if !sleep {
            return Err(ConfigError::AutoShiftWithoutSleep);
        }

        Ok(Self {
            mode: IcountMode::Adaptive,
            sleep,
            align,
        })
    }
}

fn parse_shift(value: &str) -> Result<u32, ConfigError> {
    let invalid = || ConfigError::InvalidShift(value.to_string());
    let parsed = if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else {
        value.parse::<u32>()
    }
    .map_err(|_| invalid())?;

    if parsed > MAX_FIXED_SHIFT {
        return Err(invalid());
    }
    Ok(parsed)
}

/// Raw `-quantum` options before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantumOptions {
    pub core: Option<String>,
    pub record: Option<String>,
    pub step: Option<String>,
    pub file: Option<String>,
    pub node: Option<String>,
}

impl QuantumOptions {
    pub fn parse(opts: &str) -> Result<Self, ConfigError> {
        let mut out = QuantumOptions::default();
        for (key, value) in parse_opts(opts)? {
            let slot = match key.as_str() {
                "core" => &mut out.core,
                "record" => &mut out.record,
                "step" => &mut out.step,
                "file" => &mut out.file,
                "node" => &mut out.node,
                _ => {
                    return Err(ConfigError::UnknownOption {
                        group: "quantum",
                        key,
                    })
                }
            };
            *slot = Some(value);
        }
        Ok(out)
    }
}

/// Instruction quantum settings.
///
/// `core` caps every scheduling slice of a vCPU. `record` asks for per-vCPU instruction counts
/// to be sampled every `step` retired instructions until `record` instructions have run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantumSettings {
    pub core: u64,
    pub record: u64,
    pub step: u64,
    pub file: Option<PathBuf>,
    pub node: u64,
}

impl QuantumSettings {
    pub fn configure(opts: &QuantumOptions) -> Result<Self, ConfigError> {
        let recording = opts.record.is_some();

        if opts.file.is_some() && !recording {
            return Err(ConfigError::QuantumNeedsRecord("file"));
        }
        if opts.step.is_some() && !recording {
            return Err(ConfigError::QuantumNeedsRecord("step"));
        }
        if opts.core.is_none() && !recording && opts.node.is_none() {
            return Err(ConfigError::EmptyQuantum);
        }

        let file = match (&opts.file, recording) {
            (Some(file), _) => Some(PathBuf::from(file)),
            (None, true) => {
                tracing::warn!(
                    "no file defined for quantum record output, saving to {DEFAULT_QUANTUM_FILE}"
                );
                Some(PathBuf::from(DEFAULT_QUANTUM_FILE))
            }
            (None, false) => None,
        };

        let step = match (&opts.step, recording) {
            (Some(step), _) => parse_magnitude(step)?,
            (None, true) => {
                tracing::warn!(
                    step = DEFAULT_QUANTUM_STEP,
                    "no quantum step defined for quantum record, using default"
                );
                DEFAULT_QUANTUM_STEP
            }
            (None, false) => 0,
        };

        let parse_or_zero = |value: &Option<String>| -> Result<u64, ConfigError> {
            value.as_deref().map(parse_magnitude).transpose().map(Option::unwrap_or_default)
        };

        Ok(Self {
            core: parse_or_zero(&opts.core)?,
            record: parse_or_zero(&opts.record)?,
            step,
            file,
            node: parse_or_zero(&opts.node)?,
        })
    }
}

/// Scheduler-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpusConfig {
    /// `None` picks the default policy for the guest.
    pub thread: Option<ThreadMode>,
    pub icount: IcountSettings,
    pub guest: GuestTraits,
    pub throttle_timeslice_ns: i64,
    pub kick_period_ns: i64,
    pub quantum: Option<QuantumSettings>,
}

impl Default for CpusConfig {
    fn default() -> Self {
        Self {
            thread: None,
            icount: IcountSettings::default(),
            guest: GuestTraits::default(),
            throttle_timeslice_ns: DEFAULT_THROTTLE_TIMESLICE_NS,
            kick_period_ns: DEFAULT_KICK_PERIOD_NS,
            quantum: None,
        }
    }
}

impl CpusConfig {
    /// Whether software vCPUs get one thread each.
    pub fn mttcg_enabled(&self) -> Result<bool, ConfigError> {
        let icount = self.icount.mode.is_enabled();
        match self.thread {
            Some(ThreadMode::Multi) => {
                if self.guest.oversized {
                    return Err(ConfigError::OversizedGuest);
                }
                if icount {
                    return Err(ConfigError::MttcgWithIcount);
                }
                if !self.guest.supports_mttcg {
                    tracing::warn!("guest not yet converted to MTTCG, you may get unexpected results");
                }
                if !self.guest.memory_order_compatible {
                    tracing::warn!(
                        "guest expects a stronger memory ordering than the host provides; \
                         this may cause strange/hard to debug errors"
                    );
                }
                Ok(true)
            }
            Some(ThreadMode::Single) => Ok(false),
            None => Ok(!icount
                && !self.guest.oversized
                && self.guest.supports_mttcg
                && self.guest.memory_order_compatible),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mttcg_enabled()?;
        if self.throttle_timeslice_ns <= 0 {
            return Err(ConfigError::NonPositive {
                name: "throttle_timeslice_ns",
                value: self.throttle_timeslice_ns,
            });
        }
        if self.kick_period_ns <= 0 {
            return Err(ConfigError::NonPositive {
                name: "kick_period_ns",
                value: self.kick_period_ns,
            });
        }
        Ok(())
    }
}
