//! The host scheduler: channels, time-slice groups, runlists, preemption and fault recovery.
//!
//! Lock order, outermost first: the scheduler lock, one runlist's state, a group, a channel.
//! The fault lock nests outside group and channel locks but never takes a runlist lock; the
//! reset lock guards nothing but the reset pulse itself. The remaining locks are leaves.

pub mod channel;
pub mod config;
pub mod engine;
pub mod preempt;
pub mod recovery;
pub mod runlist;
pub mod tsg;

pub use channel::{Channel, ChannelBuilder, ChannelError, ChannelRef, ChannelState};
pub use config::{DebugSessions, DeferPolicy, FifoConfig, NeverDefer, PollConfig, Timeslice, Timing};
pub use engine::{CtxStatus, EngineInfo, EngineKind, Target, UnitStatus};
pub use recovery::{HANDLED_INTR_MASK, MmuFaultInfo};
pub use runlist::{Runlist, RunlistEntry};
pub use tsg::Tsg;

use crate::error::{FifoError, FifoResult};
use crate::hw::device::Device;
use crate::hw::memory::PhysMemory;
use crate::hw::regs::{MAX_PBDMAS, MAX_RUNLISTS, RUNLIST_ENTRY_ID_MASK};
use parking_lot::{Mutex, ReentrantMutex};
use recovery::DeferredReset;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// IDs above this do not fit a runlist entry.
const MAX_IDS: u32 = RUNLIST_ENTRY_ID_MASK + 1;

/// Owns every scheduler object of one device.
#[derive(Debug)]
pub struct Fifo {
    device: Device,
    mem: Arc<dyn PhysMemory>,
    config: FifoConfig,

    channels: Vec<Channel>,
    groups: Vec<Tsg>,
    runlists: BTreeMap<u32, Runlist>,

    free_channels: Mutex<BTreeSet<u32>>,
    free_groups: Mutex<BTreeSet<u32>>,

    /// Serializes runlist updates against engine activity changes.
    sched_lock: ReentrantMutex<()>,
    /// Guards the read-modify-write of the scheduler-disable register.
    sched_disable_lock: Mutex<()>,
    /// Only one preempt may be outstanding in hardware.
    preempt_lock: Mutex<()>,
    fault_lock: Mutex<()>,
    reset_lock: Mutex<()>,

    deferred: Mutex<Vec<DeferredReset>>,
}

impl Fifo {
    /// Validates `config`, allocates one double-buffered runlist per runlist ID the engines
    /// use and unmasks the interrupts the scheduler services.
    pub fn new(
        device: Device,
        mem: Arc<dyn PhysMemory>,
        config: FifoConfig,
    ) -> FifoResult<Arc<Self>> {
        validate(&config)?;

        let mut runlists = BTreeMap::new();
        for engine in &config.engines {
            if runlists.contains_key(&engine.runlist_id) {
                continue;
            }
            let rl = Runlist::new(
                engine.runlist_id,
                Arc::clone(&mem),
                config.num_channels,
                config.num_groups,
            )?;
            runlists.insert(engine.runlist_id, rl);
        }

        let fifo = Self {
            channels: (0..config.num_channels).map(Channel::new).collect(),
            groups: (0..config.num_groups).map(Tsg::new).collect(),
            runlists,
            free_channels: Mutex::new((0..config.num_channels).collect()),
            free_groups: Mutex::new((0..config.num_groups).collect()),
            sched_lock: ReentrantMutex::new(()),
            sched_disable_lock: Mutex::new(()),
            preempt_lock: Mutex::new(()),
            fault_lock: Mutex::new(()),
            reset_lock: Mutex::new(()),
            deferred: Mutex::new(Vec::new()),
            device,
            mem,
            config,
        };

        fifo.device.enable_intr(HANDLED_INTR_MASK);
        log::info!(
            "fifo: {} channels, {} groups, {} engines on {} runlists",
            fifo.config.num_channels,
            fifo.config.num_groups,
            fifo.config.engines.len(),
            fifo.runlists.len()
        );
        Ok(Arc::new(fifo))
    }

    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub const fn config(&self) -> &FifoConfig {
        &self.config
    }

    /// Memory the runlist buffers were carved from.
    #[must_use]
    pub fn memory(&self) -> &Arc<dyn PhysMemory> {
        &self.mem
    }

    /// IDs of every runlist in use, ascending.
    #[must_use]
    pub fn runlist_ids(&self) -> Vec<u32> {
        self.runlists.keys().copied().collect()
    }

    #[must_use]
    pub fn free_channel_count(&self) -> usize {
        self.free_channels.lock().len()
    }

    #[must_use]
    pub fn free_group_count(&self) -> usize {
        self.free_groups.lock().len()
    }
}

fn validate(config: &FifoConfig) -> FifoResult<()> {
    let invalid = |msg: String| -> FifoResult<()> { Err(FifoError::InvalidConfig(msg)) };

    if config.num_channels == 0 || config.num_channels > MAX_IDS {
        return invalid(format!(
            "channel count {} must be within 1..={MAX_IDS}",
            config.num_channels
        ));
    }
    if config.num_groups == 0 || config.num_groups > MAX_IDS {
        return invalid(format!(
            "group count {} must be within 1..={MAX_IDS}",
            config.num_groups
        ));
    }
    if config.engines.is_empty() {
        return invalid("no engines configured".into());
    }

    let mut ids = HashSet::new();
    for engine in &config.engines {
        if !ids.insert(engine.id) {
            return invalid(format!("engine {} listed twice", engine.id));
        }
        if engine.id >= 32 {
            return invalid(format!("engine id {} out of range", engine.id));
        }
        if engine.runlist_id >= MAX_RUNLISTS {
            return invalid(format!(
                "engine {} on runlist {}, max is {}",
                engine.id,
                engine.runlist_id,
                MAX_RUNLISTS - 1
            ));
        }
        if engine.pbdma_id >= MAX_PBDMAS {
            return invalid(format!(
                "engine {} on pbdma {}, max is {}",
                engine.id,
                engine.pbdma_id,
                MAX_PBDMAS - 1
            ));
        }
        if engine.mmu_fault_id >= 32 || engine.reset_id >= 32 || engine.intr_id >= 32 {
            return invalid(format!("engine {} unit ids out of range", engine.id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::memory::HostMemory;
    use crate::hw::sim::SimRegisters;

    fn build(config: FifoConfig) -> FifoResult<Arc<Fifo>> {
        let regs = Arc::new(SimRegisters::new());
        Fifo::new(Device::new(regs), Arc::new(HostMemory), config)
    }

    #[test]
    fn test_config_validation() {
        let gr = EngineInfo::new(0, EngineKind::Graphics, 0);

        assert!(matches!(
            build(FifoConfig::new(0, 4).with_engine(gr)),
            Err(FifoError::InvalidConfig(_))
        ));
        assert!(matches!(
            build(FifoConfig::new(4, 4)),
            Err(FifoError::InvalidConfig(_))
        ));
        assert!(matches!(
            build(FifoConfig::new(4, 4).with_engine(gr).with_engine(gr)),
            Err(FifoError::InvalidConfig(_))
        ));
        assert!(matches!(
            build(FifoConfig::new(4, 4).with_engine(EngineInfo::new(1, EngineKind::Copy, MAX_RUNLISTS))),
            Err(FifoError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_one_runlist_per_id() {
        let fifo = build(
            FifoConfig::new(8, 4)
                .with_engine(EngineInfo::new(0, EngineKind::Graphics, 0))
                .with_engine(EngineInfo::new(1, EngineKind::Copy, 2))
                .with_engine(EngineInfo::new(2, EngineKind::Copy, 2)),
        )
        .unwrap();
        assert_eq!(fifo.runlist_ids(), vec![0, 2]);
        assert_eq!(fifo.free_channel_count(), 8);
        assert_eq!(fifo.free_group_count(), 4);
    }
}
