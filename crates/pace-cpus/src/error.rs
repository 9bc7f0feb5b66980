use thiserror::Error;

/// Fatal configuration errors. The process is expected to report these and exit before any
/// vCPU is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("No MTTCG when guest word size > hosts")]
    OversizedGuest,
    #[error("No MTTCG when icount is enabled")]
    MttcgWithIcount,
    #[error("Invalid 'thread' setting {0}")]
    InvalidThreadMode(String),
    #[error("Please specify shift option when using align")]
    AlignWithoutShift,
    #[error("align=on and sleep=off are incompatible")]
    AlignWithoutSleep,
    #[error("shift=auto and align=on are incompatible")]
    AutoShiftWithAlign,
    #[error("shift=auto and sleep=off are incompatible")]
    AutoShiftWithoutSleep,
    #[error("icount: Invalid shift value {0:?}")]
    InvalidShift(String),
    #[error("quantum {0} can only be used with record")]
    QuantumNeedsRecord(&'static str),
    #[error("quantum option is not valid")]
    EmptyQuantum,
    #[error("invalid quantum value {0:?}: valid suffixes are K,k,M,m,B,b")]
    InvalidMagnitude(String),
    #[error("malformed option {0:?}; expected key=value")]
    MalformedOption(String),
    #[error("unknown option {key:?} for -{group}")]
    UnknownOption { group: &'static str, key: String },
    #[error("invalid value {value:?} for boolean option {key:?}")]
    InvalidBool { key: String, value: String },
    #[error("{name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: i64 },
}

/// Failure reported by an acceleration backend while bringing up a vCPU.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AccelError {
    message: String,
}

impl AccelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("vCPU {index} initialization failed: {source}")]
    VcpuInit {
        index: usize,
        #[source]
        source: AccelError,
    },
    #[error("no vCPU with index {0}")]
    UnknownCpu(usize),
    #[error("failed to spawn vCPU thread")]
    Spawn(#[from] std::io::Error),
    #[error("clock warp is only available with the qtest backend and icount enabled")]
    QtestUnavailable,
}
