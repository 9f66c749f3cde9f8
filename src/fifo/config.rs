use super::engine::{EngineInfo, Target};
use super::recovery::MmuFaultInfo;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Whether blocking hardware waits follow the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timing {
    #[default]
    Wallclock,
    /// The device does not run in real time; waits are treated as already complete.
    Simulated,
}

/// Backoff and deadlines for polling hardware pending bits.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub runlist_timeout: Duration,
    pub preempt_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_micros(10),
            max_delay: Duration::from_micros(200),
            runlist_timeout: Duration::from_secs(3),
            preempt_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(3),
        }
    }
}

impl PollConfig {
    #[must_use]
    pub const fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    /// Sets the runlist, preempt and idle deadlines to the same value.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.runlist_timeout = timeout;
        self.preempt_timeout = timeout;
        self.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_runlist_timeout(mut self, timeout: Duration) -> Self {
        self.runlist_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_preempt_timeout(mut self, timeout: Duration) -> Self {
        self.preempt_timeout = timeout;
        self
    }
}

/// Group timeslice as encoded in the runlist: `timeout << scale` scheduler ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeslice {
    pub scale: u8,
    pub timeout: u8,
}

impl Default for Timeslice {
    fn default() -> Self {
        Self {
            scale: 3,
            timeout: 128,
        }
    }
}

/// Decides whether the engine reset for a fault should wait until the faulting context is
/// released, typically because a debugger is attached to it and wants to inspect state.
pub trait DeferPolicy: Send + Sync + fmt::Debug {
    fn defer_reset(&self, target: Target, fault: &MmuFaultInfo) -> bool;
}

/// Never defers; every fault resets its engine immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverDefer;

impl DeferPolicy for NeverDefer {
    fn defer_reset(&self, _target: Target, _fault: &MmuFaultInfo) -> bool {
        false
    }
}

/// Defers resets for contexts that have a debug session attached.
#[derive(Debug, Default)]
pub struct DebugSessions {
    attached: Mutex<HashSet<Target>>,
}

impl DebugSessions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, target: Target) {
        self.attached.lock().insert(target);
    }

    pub fn detach(&self, target: Target) {
        self.attached.lock().remove(&target);
    }
}

impl DeferPolicy for DebugSessions {
    fn defer_reset(&self, target: Target, _fault: &MmuFaultInfo) -> bool {
        self.attached.lock().contains(&target)
    }
}

/// Static description of the scheduler: pool sizes, engines and timing.
#[derive(Debug, Clone)]
pub struct FifoConfig {
    pub num_channels: u32,
    pub num_groups: u32,
    pub engines: Vec<EngineInfo>,
    pub poll: PollConfig,
    pub timing: Timing,
    pub timeslice: Timeslice,
    pub defer: Arc<dyn DeferPolicy>,
}

impl FifoConfig {
    #[must_use]
    pub fn new(num_channels: u32, num_groups: u32) -> Self {
        Self {
            num_channels,
            num_groups,
            engines: Vec::new(),
            poll: PollConfig::default(),
            timing: Timing::default(),
            timeslice: Timeslice::default(),
            defer: Arc::new(NeverDefer),
        }
    }

    #[must_use]
    pub fn with_engine(mut self, engine: EngineInfo) -> Self {
        self.engines.push(engine);
        self
    }

    #[must_use]
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    #[must_use]
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    #[must_use]
    pub fn with_timeslice(mut self, timeslice: Timeslice) -> Self {
        self.timeslice = timeslice;
        self
    }

    #[must_use]
    pub fn with_defer_policy(mut self, policy: Arc<dyn DeferPolicy>) -> Self {
        self.defer = policy;
        self
    }
}
