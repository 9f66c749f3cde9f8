//! Channel pool and the reference-counted channel handle.
//!
//! Channels live in a fixed array owned by [`Fifo`] and never move. A [`ChannelRef`] is a
//! checkout of one slot: cloning it takes another reference, dropping the last one runs the
//! free path (runlist removal, any deferred engine reset, group unbind, hardware unbind) and
//! returns the slot to the pool.

#![allow(clippy::cast_possible_truncation)]

use super::Fifo;
use super::engine::Target;
use super::recovery::MmuFaultInfo;
use crate::error::{FifoError, FifoResult};
use crate::hw::regs::{CCSR_CHANNEL_INST_PTR_MASK, INST_PTR_SHIFT};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Free,
    Bound,
    /// On its runlist's active set.
    Active,
    /// Stopped by a fault or forced recovery until acknowledged.
    Faulted,
}

/// Why a channel was marked faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    MmuFault(MmuFaultInfo),
    PbdmaFault { pbdma: u32, intr: u32 },
    /// A preempt or idle wait on the channel never completed.
    IdleTimeout,
    /// The engine stalled in a context switch.
    CtxswTimeout,
    /// The runlist carrying the channel was never picked up.
    RunlistTimeout,
    /// Recovery requested by a client.
    Forced,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MmuFault(info) => write!(f, "mmu fault: {info}"),
            Self::PbdmaFault { pbdma, intr } => {
                write!(f, "pbdma {pbdma} fault (intr 0x{intr:08x})")
            }
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::CtxswTimeout => f.write_str("context switch timeout"),
            Self::RunlistTimeout => f.write_str("runlist timeout"),
            Self::Forced => f.write_str("forced recovery"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(super) struct ChannelInner {
    pub state: ChannelState,
    pub runlist_id: u32,
    pub group: Option<u32>,
    pub vm_id: Option<u32>,
    pub inst_phys: u64,
    pub error: Option<ChannelError>,
    pub events: u64,
}

/// One hardware command-submission context.
#[derive(Debug)]
pub struct Channel {
    id: u32,
    refcount: AtomicU32,
    pub(super) inner: Mutex<ChannelInner>,
    wake: Condvar,
}

impl Channel {
    pub(super) fn new(id: u32) -> Self {
        Self {
            id,
            refcount: AtomicU32::new(0),
            inner: Mutex::new(ChannelInner::default()),
            wake: Condvar::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn runlist_id(&self) -> u32 {
        self.inner.lock().runlist_id
    }

    #[must_use]
    pub fn group(&self) -> Option<u32> {
        self.inner.lock().group
    }

    #[must_use]
    pub fn vm_id(&self) -> Option<u32> {
        self.inner.lock().vm_id
    }

    /// Reason for the last fault, cleared on acknowledgement.
    #[must_use]
    pub fn error(&self) -> Option<ChannelError> {
        self.inner.lock().error
    }

    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// The scheduling target a fault on this channel applies to.
    pub(super) fn fault_target(&self) -> Target {
        self.inner
            .lock()
            .group
            .map_or(Target::Channel(self.id), Target::Group)
    }

    /// Posts a completion event and wakes every waiter.
    pub fn notify(&self) {
        let mut inner = self.inner.lock();
        inner.events += 1;
        self.wake.notify_all();
    }

    /// Blocks until the next event is posted.
    ///
    /// Returns the new event count, [`FifoError::ChannelFaulted`] if the channel is or becomes
    /// faulted, or [`FifoError::WaitTimeout`] once `timeout` elapses.
    pub fn wait_event(&self, timeout: Duration) -> FifoResult<u64> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        let seen = inner.events;
        loop {
            if inner.state == ChannelState::Faulted {
                return Err(FifoError::ChannelFaulted(self.id));
            }
            if inner.events != seen {
                return Ok(inner.events);
            }
            if self.wake.wait_until(&mut inner, deadline).timed_out() {
                if inner.state == ChannelState::Faulted {
                    return Err(FifoError::ChannelFaulted(self.id));
                }
                if inner.events != seen {
                    return Ok(inner.events);
                }
                return Err(FifoError::WaitTimeout);
            }
        }
    }

    /// Moves a live channel to `Faulted` and wakes waiters. Returns false for free slots.
    pub(super) fn mark_faulted(&self, reason: ChannelError) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ChannelState::Free {
            return false;
        }
        inner.state = ChannelState::Faulted;
        inner.error = Some(reason);
        self.wake.notify_all();
        true
    }

    fn try_get(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n != 0).then_some(n + 1)
            })
            .is_ok()
    }
}

/// Settings for binding a context to a channel slot.
#[derive(Debug, Clone, Copy)]
pub struct ChannelBuilder {
    runlist_id: u32,
    vm_id: Option<u32>,
    inst_phys: u64,
    slot: Option<u32>,
}

impl ChannelBuilder {
    #[must_use]
    pub const fn new(runlist_id: u32) -> Self {
        Self {
            runlist_id,
            vm_id: None,
            inst_phys: 0,
            slot: None,
        }
    }

    /// Address space the channel's context runs in.
    #[must_use]
    pub const fn with_vm(mut self, vm_id: u32) -> Self {
        self.vm_id = Some(vm_id);
        self
    }

    /// Physical address of the channel's instance block.
    #[must_use]
    pub const fn with_inst_block(mut self, phys: u64) -> Self {
        self.inst_phys = phys;
        self
    }

    /// Bind to exactly this slot instead of the lowest free one.
    #[must_use]
    pub const fn with_slot(mut self, chid: u32) -> Self {
        self.slot = Some(chid);
        self
    }
}

/// A counted reference to a bound channel.
pub struct ChannelRef {
    fifo: Arc<Fifo>,
    id: u32,
}

impl ChannelRef {
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn fifo(&self) -> &Arc<Fifo> {
        &self.fifo
    }
}

impl Deref for ChannelRef {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.fifo.channels[self.id as usize]
    }
}

impl Clone for ChannelRef {
    fn clone(&self) -> Self {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        Self {
            fifo: Arc::clone(&self.fifo),
            id: self.id,
        }
    }
}

impl Drop for ChannelRef {
    fn drop(&mut self) {
        self.fifo.channel_put(self.id);
    }
}

impl fmt::Debug for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRef")
            .field("id", &self.id)
            .field("refcount", &self.refcount())
            .finish()
    }
}

// ===============================================================================================
// Channel lifecycle
// ===============================================================================================

impl Fifo {
    pub(super) fn channel(&self, chid: u32) -> FifoResult<&Channel> {
        self.channels
            .get(chid as usize)
            .ok_or(FifoError::InvalidChannel(chid))
    }

    /// Binds a context to a channel slot. The channel starts `Bound`, off every runlist.
    pub fn bind_channel(self: &Arc<Self>, builder: ChannelBuilder) -> FifoResult<ChannelRef> {
        self.runlist(builder.runlist_id)?;

        let chid = {
            let mut free = self.free_channels.lock();
            match builder.slot {
                Some(slot) => {
                    self.channel(slot)?;
                    if !free.remove(&slot) {
                        return Err(FifoError::ChannelBusy(slot));
                    }
                    slot
                }
                None => free.pop_first().ok_or(FifoError::Exhausted)?,
            }
        };

        let ch = &self.channels[chid as usize];
        *ch.inner.lock() = ChannelInner {
            state: ChannelState::Bound,
            runlist_id: builder.runlist_id,
            group: None,
            vm_id: builder.vm_id,
            inst_phys: builder.inst_phys,
            error: None,
            events: 0,
        };
        ch.refcount.store(1, Ordering::Release);
        self.device.bind_channel(chid, builder.inst_phys);

        log::debug!(
            "fifo: bound channel {chid} on runlist {} (inst 0x{:x})",
            builder.runlist_id,
            builder.inst_phys
        );
        Ok(ChannelRef {
            fifo: Arc::clone(self),
            id: chid,
        })
    }

    /// Takes a new reference to a live channel.
    pub fn channel_get(self: &Arc<Self>, chid: u32) -> FifoResult<ChannelRef> {
        if !self.channel(chid)?.try_get() {
            return Err(FifoError::InvalidChannel(chid));
        }
        Ok(ChannelRef {
            fifo: Arc::clone(self),
            id: chid,
        })
    }

    fn channel_put(&self, chid: u32) {
        let ch = &self.channels[chid as usize];
        let prev = ch.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "fifo: channel {chid} reference underflow");
        if prev == 1 {
            self.free_channel(chid);
        }
    }

    fn free_channel(&self, chid: u32) {
        let ch = &self.channels[chid as usize];
        let (runlist_id, group) = {
            let inner = ch.inner.lock();
            (inner.runlist_id, inner.group)
        };

        if let Err(e) = self.update_runlist(runlist_id, Some(chid), false, true) {
            log::error!("fifo: removing channel {chid} from runlist {runlist_id}: {e}");
        }

        self.run_deferred_reset(chid, group);

        if let Some(gid) = group {
            self.leave_group(chid, gid);
        }

        self.device.disable_channel(chid);
        self.device.unbind_channel(chid);
        *ch.inner.lock() = ChannelInner::default();
        ch.wake.notify_all();
        self.free_channels.lock().insert(chid);
        log::debug!("fifo: freed channel {chid}");
    }

    pub fn enable_channel(&self, ch: &ChannelRef) -> FifoResult<()> {
        if ch.state() == ChannelState::Faulted {
            return Err(FifoError::ChannelFaulted(ch.id()));
        }
        self.device.enable_channel(ch.id());
        Ok(())
    }

    pub fn disable_channel(&self, ch: &ChannelRef) {
        self.device.disable_channel(ch.id());
    }

    #[must_use]
    pub fn channel_enabled(&self, ch: &ChannelRef) -> bool {
        self.device.channel_enabled(ch.id())
    }

    /// Clears a fault, returning the channel to `Bound`. It has to be re-added to its runlist.
    pub fn acknowledge_fault(&self, ch: &ChannelRef) -> FifoResult<()> {
        let state = ch.state();
        if state != ChannelState::Faulted {
            return Err(FifoError::InvalidState(format!(
                "channel {} is {state:?}, not faulted",
                ch.id()
            )));
        }
        self.update_runlist(ch.runlist_id(), Some(ch.id()), false, false)?;

        let mut inner = ch.inner.lock();
        inner.state = ChannelState::Bound;
        inner.error = None;
        log::info!("fifo: channel {} fault acknowledged", ch.id());
        Ok(())
    }

    /// Current state of a channel slot.
    pub fn channel_state(&self, chid: u32) -> FifoResult<ChannelState> {
        Ok(self.channel(chid)?.state())
    }

    /// Wakes every bound channel's waiters; used for the non-stalling channel interrupt.
    pub(super) fn wake_all_channels(&self) {
        for ch in &self.channels {
            if ch.state() != ChannelState::Free {
                ch.notify();
            }
        }
    }

    /// The bound channel whose instance block lives at `inst_ptr` (in instance-pointer units).
    ///
    /// Channels bound without an instance block never match.
    pub(super) fn channel_by_inst(&self, inst_ptr: u32) -> Option<&Channel> {
        let wanted = inst_ptr & CCSR_CHANNEL_INST_PTR_MASK;
        self.channels.iter().find(|ch| {
            let inner = ch.inner.lock();
            inner.state != ChannelState::Free
                && inner.inst_phys != 0
                && ((inner.inst_phys >> INST_PTR_SHIFT) as u32 & CCSR_CHANNEL_INST_PTR_MASK) == wanted
        })
    }
}
