use thiserror::Error;

/// What a preempt request was aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Channel,
    Group,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel => f.write_str("channel"),
            Self::Group => f.write_str("group"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FifoError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid allocator configuration: {0}")]
    InvalidConfig(String),

    #[error("Allocation of {len:#x} bytes needs order {order}, max order is {max_order}")]
    TooLarge { len: u64, order: u32, max_order: u32 },

    #[error("Address space exhausted")]
    Exhausted,

    #[error("Range {base:#x}+{len:#x} overlaps a live allocation")]
    RangeInUse { base: u64, len: u64 },

    #[error("Range {base:#x}+{len:#x} is outside the managed space or not block aligned")]
    InvalidRange { base: u64, len: u64 },

    #[error("Invalid channel ID: {0}")]
    InvalidChannel(u32),

    #[error("Invalid group ID: {0}")]
    InvalidGroup(u32),

    #[error("Invalid engine ID: {0}")]
    InvalidEngine(u32),

    #[error("Invalid runlist ID: {0}")]
    InvalidRunlist(u32),

    #[error("Channel {0} is already bound")]
    ChannelBusy(u32),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Channel {0} has faulted")]
    ChannelFaulted(u32),

    #[error("Engine {0} is busy")]
    EngineBusy(u32),

    #[error("Operation timed out")]
    WaitTimeout,

    #[error("Runlist {runlist} update failed after recovery attempt")]
    RunlistUpdateFailed { runlist: u32 },

    #[error("Preempt of {kind} {id} timed out, recovery was run")]
    PreemptFailed { id: u32, kind: TargetKind },

    #[error("Engine {engine} did not idle, recovery was run")]
    EngineIdleFailed { engine: u32 },
}

// A convenient alias
pub type FifoResult<T> = Result<T, FifoError>;
