use super::Fifo;
use super::channel::{ChannelRef, ChannelState};
use super::config::Timeslice;
use crate::error::{FifoError, FifoResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Default)]
pub(super) struct TsgInner {
    pub in_use: bool,
    pub runlist_id: u32,
    /// Member channel IDs in join order.
    pub members: Vec<u32>,
    pub timeslice: Timeslice,
}

/// A time-slice group: channels that share one scheduling slot.
#[derive(Debug)]
pub struct Tsg {
    id: u32,
    pub(super) inner: Mutex<TsgInner>,
    /// Members currently on the runlist. Only changed under the runlist lock.
    pub(super) active: AtomicU32,
}

impl Tsg {
    pub(super) fn new(id: u32) -> Self {
        Self {
            id,
            inner: Mutex::new(TsgInner::default()),
            active: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn members(&self) -> Vec<u32> {
        self.inner.lock().members.clone()
    }

    #[must_use]
    pub fn active_count(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }
}

impl Fifo {
    pub(super) fn group(&self, gid: u32) -> FifoResult<&Tsg> {
        let tsg = self
            .groups
            .get(gid as usize)
            .ok_or(FifoError::InvalidGroup(gid))?;
        if !tsg.inner.lock().in_use {
            return Err(FifoError::InvalidGroup(gid));
        }
        Ok(tsg)
    }

    /// Allocates an empty group scheduled on `runlist_id`.
    pub fn create_group(&self, runlist_id: u32) -> FifoResult<u32> {
        self.runlist(runlist_id)?;
        let gid = self
            .free_groups
            .lock()
            .pop_first()
            .ok_or(FifoError::Exhausted)?;

        let tsg = &self.groups[gid as usize];
        *tsg.inner.lock() = TsgInner {
            in_use: true,
            runlist_id,
            members: Vec::new(),
            timeslice: self.config.timeslice,
        };
        tsg.active.store(0, Ordering::Release);
        log::debug!("fifo: created group {gid} on runlist {runlist_id}");
        Ok(gid)
    }

    /// Adds a channel that is not on its runlist to a group on the same runlist.
    pub fn bind_to_group(&self, gid: u32, ch: &ChannelRef) -> FifoResult<()> {
        let tsg = self.group(gid)?;
        let rl = self.runlist(ch.runlist_id())?;

        let _rl = rl.state.lock();
        let mut group = tsg.inner.lock();
        let mut inner = ch.inner.lock();

        if group.runlist_id != inner.runlist_id {
            return Err(FifoError::InvalidState(format!(
                "channel {} is on runlist {}, group {gid} on {}",
                ch.id(),
                inner.runlist_id,
                group.runlist_id
            )));
        }
        if inner.state != ChannelState::Bound {
            return Err(FifoError::InvalidState(format!(
                "channel {} is {:?}",
                ch.id(),
                inner.state
            )));
        }
        if let Some(other) = inner.group {
            return Err(FifoError::InvalidState(format!(
                "channel {} already belongs to group {other}",
                ch.id()
            )));
        }

        group.members.push(ch.id());
        inner.group = Some(gid);
        log::debug!("fifo: channel {} joined group {gid}", ch.id());
        Ok(())
    }

    /// Removes a channel from its group, taking it off the runlist first if needed.
    pub fn unbind_from_group(&self, ch: &ChannelRef) -> FifoResult<()> {
        let Some(gid) = ch.group() else {
            return Err(FifoError::InvalidState(format!(
                "channel {} is not in a group",
                ch.id()
            )));
        };
        if ch.state() == ChannelState::Active {
            self.update_runlist(ch.runlist_id(), Some(ch.id()), false, true)?;
        }
        self.leave_group(ch.id(), gid);
        Ok(())
    }

    pub(super) fn leave_group(&self, chid: u32, gid: u32) {
        let tsg = &self.groups[gid as usize];
        let ch = &self.channels[chid as usize];
        let rl = self.runlists.get(&ch.runlist_id());

        let _rl = rl.map(|rl| rl.state.lock());
        let mut group = tsg.inner.lock();
        group.members.retain(|&m| m != chid);
        ch.inner.lock().group = None;
        log::debug!("fifo: channel {chid} left group {gid}");
    }

    /// Releases an empty group.
    pub fn destroy_group(&self, gid: u32) -> FifoResult<()> {
        let tsg = self.group(gid)?;
        {
            let mut group = tsg.inner.lock();
            if !group.members.is_empty() {
                return Err(FifoError::InvalidState(format!(
                    "group {gid} still has {} channels",
                    group.members.len()
                )));
            }
            *group = TsgInner::default();
        }
        self.free_groups.lock().insert(gid);
        log::debug!("fifo: destroyed group {gid}");
        Ok(())
    }

    /// Member channel IDs of a group in join order.
    pub fn group_members(&self, gid: u32) -> FifoResult<Vec<u32>> {
        Ok(self.group(gid)?.members())
    }

    pub fn set_group_timeslice(&self, gid: u32, timeslice: Timeslice) -> FifoResult<()> {
        self.group(gid)?.inner.lock().timeslice = timeslice;
        Ok(())
    }
}
