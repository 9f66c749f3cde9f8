//! Double-buffered runlists and the update protocol.
//!
//! Every update is written into the buffer the hardware is not reading, submitted, and only
//! made current once the hardware has picked it up.

#![allow(clippy::cast_possible_truncation)]

use super::Fifo;
use super::channel::ChannelState;
use super::config::Timeslice;
use super::engine::Target;
use crate::error::{FifoError, FifoResult};
use crate::hw::memory::{DmaBuffer, PhysMemory};
use crate::hw::regs::{
    RUNLIST_ENTRY_ID_MASK, RUNLIST_ENTRY_TIMESLICE_SCALE_MASK, RUNLIST_ENTRY_TIMESLICE_SCALE_SHIFT,
    RUNLIST_ENTRY_TIMESLICE_TIMEOUT_MASK, RUNLIST_ENTRY_TIMESLICE_TIMEOUT_SHIFT,
    RUNLIST_ENTRY_TYPE_TSG, RUNLIST_ENTRY_WORDS,
};
use crate::utils::Bitmap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// One decoded runlist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunlistEntry {
    Channel { id: u32 },
    /// A group header; its `len` active members follow it immediately.
    Group {
        id: u32,
        len: u32,
        timeslice: Timeslice,
    },
}

impl RunlistEntry {
    #[must_use]
    pub fn encode(self) -> [u32; RUNLIST_ENTRY_WORDS] {
        match self {
            Self::Channel { id } => [id & RUNLIST_ENTRY_ID_MASK, 0],
            Self::Group { id, len, timeslice } => [
                (id & RUNLIST_ENTRY_ID_MASK)
                    | RUNLIST_ENTRY_TYPE_TSG
                    | ((u32::from(timeslice.scale) & RUNLIST_ENTRY_TIMESLICE_SCALE_MASK)
                        << RUNLIST_ENTRY_TIMESLICE_SCALE_SHIFT)
                    | ((u32::from(timeslice.timeout) & RUNLIST_ENTRY_TIMESLICE_TIMEOUT_MASK)
                        << RUNLIST_ENTRY_TIMESLICE_TIMEOUT_SHIFT),
                len,
            ],
        }
    }

    #[must_use]
    pub const fn decode(words: [u32; RUNLIST_ENTRY_WORDS]) -> Self {
        let id = words[0] & RUNLIST_ENTRY_ID_MASK;
        if words[0] & RUNLIST_ENTRY_TYPE_TSG == 0 {
            return Self::Channel { id };
        }
        Self::Group {
            id,
            len: words[1],
            timeslice: Timeslice {
                scale: ((words[0] >> RUNLIST_ENTRY_TIMESLICE_SCALE_SHIFT)
                    & RUNLIST_ENTRY_TIMESLICE_SCALE_MASK) as u8,
                timeout: ((words[0] >> RUNLIST_ENTRY_TIMESLICE_TIMEOUT_SHIFT)
                    & RUNLIST_ENTRY_TIMESLICE_TIMEOUT_MASK) as u8,
            },
        }
    }
}

#[derive(Debug)]
pub(super) struct RunlistState {
    pub buffers: Vec<DmaBuffer>,
    /// Index of the buffer the hardware owns.
    pub cur: usize,
    /// Entries in the current buffer.
    pub count: u32,
    pub active_channels: Bitmap,
    pub active_groups: Bitmap,
}

/// The ordered list of runnable channels and groups for one scheduling domain.
#[derive(Debug)]
pub struct Runlist {
    id: u32,
    mem: Arc<dyn PhysMemory>,
    pub(super) state: Mutex<RunlistState>,
}

impl Runlist {
    pub(super) fn new(
        id: u32,
        mem: Arc<dyn PhysMemory>,
        num_channels: u32,
        num_groups: u32,
    ) -> FifoResult<Self> {
        let max_entries = (num_channels + num_groups) as usize;
        let size = max_entries * RUNLIST_ENTRY_WORDS * 4;

        let first = mem.alloc(size)?;
        let second = match mem.alloc(size) {
            Ok(buf) => buf,
            Err(e) => {
                mem.free(first);
                return Err(e);
            }
        };
        log::debug!(
            "fifo: runlist {id} buffers at 0x{:x} / 0x{:x} ({max_entries} entries)",
            first.phys(),
            second.phys()
        );

        Ok(Self {
            id,
            mem,
            state: Mutex::new(RunlistState {
                buffers: vec![first, second],
                cur: 0,
                count: 0,
                active_channels: Bitmap::new(num_channels as usize),
                active_groups: Bitmap::new(num_groups as usize),
            }),
        })
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for Runlist {
    fn drop(&mut self) {
        for buf in self.state.get_mut().buffers.drain(..) {
            self.mem.free(buf);
        }
    }
}

impl Fifo {
    pub(super) fn runlist(&self, runlist_id: u32) -> FifoResult<&Runlist> {
        self.runlists
            .get(&runlist_id)
            .ok_or(FifoError::InvalidRunlist(runlist_id))
    }

    /// Adds or removes a channel and resubmits the runlist.
    ///
    /// With `chid == None` the active sets are left alone: `add == false` submits an empty
    /// runlist (suspending the domain), `add == true` resubmits everything that is active.
    /// Adding or removing a channel that is already in the requested state does nothing.
    ///
    /// When `wait` is set and the hardware does not pick the list up in time, the engines on
    /// this runlist are recovered and the wait is repeated once; a second timeout is
    /// [`FifoError::RunlistUpdateFailed`].
    pub fn update_runlist(
        &self,
        runlist_id: u32,
        chid: Option<u32>,
        add: bool,
        wait: bool,
    ) -> FifoResult<()> {
        let rl = self.runlist(runlist_id)?;
        let _sched = self.sched_lock.lock();
        let mut st = rl.state.lock();
        self.update_runlist_locked(rl, &mut st, chid, add, wait)
    }

    fn update_runlist_locked(
        &self,
        rl: &Runlist,
        st: &mut RunlistState,
        chid: Option<u32>,
        add: bool,
        wait: bool,
    ) -> FifoResult<()> {
        if let Some(chid) = chid {
            if !self.set_channel_active(rl.id, st, chid, add)? {
                return Ok(());
            }
        }

        let next = 1 - st.cur;
        let count = if chid.is_none() && !add {
            0
        } else {
            self.write_entries(st, next)
        };
        self.device
            .submit_runlist(rl.id, st.buffers[next].phys(), count);
        log::debug!(
            "fifo: runlist {} submitted {count} entries from buffer {next}",
            rl.id
        );

        if wait && !self.wait_runlist(rl.id) {
            log::error!("fifo: runlist {} update timed out, recovering its engines", rl.id);
            let targets = self.recover_runlist_engines(rl.id);
            for target in targets {
                for member in self.target_channels(target) {
                    if self.channels[member as usize].runlist_id() == rl.id {
                        if let Err(e) = self.set_channel_active(rl.id, st, member, false) {
                            log::warn!("fifo: clearing faulted channel {member}: {e}");
                        }
                    }
                }
            }
            if !self.wait_runlist(rl.id) {
                log::error!("fifo: runlist {} still pending after recovery", rl.id);
                return Err(FifoError::RunlistUpdateFailed { runlist: rl.id });
            }
        }

        st.cur = next;
        st.count = count;
        Ok(())
    }

    /// Flips a channel's bit in the active set. Returns whether anything changed.
    fn set_channel_active(
        &self,
        runlist_id: u32,
        st: &mut RunlistState,
        chid: u32,
        add: bool,
    ) -> FifoResult<bool> {
        let ch = self.channel(chid)?;
        let group = {
            let mut inner = ch.inner.lock();
            if inner.runlist_id != runlist_id && inner.state != ChannelState::Free {
                return Err(FifoError::InvalidState(format!(
                    "channel {chid} is on runlist {}, not {runlist_id}",
                    inner.runlist_id
                )));
            }
            if add {
                match inner.state {
                    ChannelState::Free => return Err(FifoError::InvalidChannel(chid)),
                    ChannelState::Faulted => return Err(FifoError::ChannelFaulted(chid)),
                    ChannelState::Bound | ChannelState::Active => {}
                }
            }

            let changed = if add {
                !st.active_channels.test_and_set(chid as usize)
            } else {
                st.active_channels.test_and_clear(chid as usize)
            };
            if !changed {
                return Ok(false);
            }
            if add {
                inner.state = ChannelState::Active;
            } else if inner.state == ChannelState::Active {
                inner.state = ChannelState::Bound;
            }
            inner.group
        };

        if let Some(gid) = group {
            let tsg = &self.groups[gid as usize];
            if add {
                if tsg.active.fetch_add(1, Ordering::AcqRel) == 0 {
                    st.active_groups.test_and_set(gid as usize);
                }
            } else if tsg.active.fetch_sub(1, Ordering::AcqRel) == 1 {
                st.active_groups.test_and_clear(gid as usize);
            }
        }
        Ok(true)
    }

    /// Serializes the active sets into buffer `next`: ungrouped channels by ID, then each
    /// active group followed by its active members in join order.
    fn write_entries(&self, st: &mut RunlistState, next: usize) -> u32 {
        let RunlistState {
            buffers,
            active_channels,
            active_groups,
            ..
        } = st;
        let buf = &mut buffers[next];
        let mut count = 0;

        for chid in active_channels.iter_ones() {
            if self.channels[chid].group().is_none() {
                write_entry(buf, count, RunlistEntry::Channel { id: chid as u32 });
                count += 1;
            }
        }

        for gid in active_groups.iter_ones() {
            let (members, timeslice) = {
                let tsg = self.groups[gid].inner.lock();
                let members: Vec<u32> = tsg
                    .members
                    .iter()
                    .copied()
                    .filter(|&m| active_channels.test(m as usize))
                    .collect();
                (members, tsg.timeslice)
            };
            write_entry(
                buf,
                count,
                RunlistEntry::Group {
                    id: gid as u32,
                    len: members.len() as u32,
                    timeslice,
                },
            );
            count += 1;
            for id in members {
                write_entry(buf, count, RunlistEntry::Channel { id });
                count += 1;
            }
        }

        count as u32
    }

    fn wait_runlist(&self, runlist_id: u32) -> bool {
        self.wait_hw(self.config.poll.runlist_timeout, || {
            !self.device.runlist_pending(runlist_id)
        })
    }

    /// Decodes the buffer the hardware currently owns.
    pub fn runlist_snapshot(&self, runlist_id: u32) -> FifoResult<Vec<RunlistEntry>> {
        let rl = self.runlist(runlist_id)?;
        let st = rl.state.lock();
        let buf = &st.buffers[st.cur];
        Ok((0..st.count as usize)
            .map(|i| {
                let base = i * RUNLIST_ENTRY_WORDS;
                RunlistEntry::decode([buf.read_u32(base), buf.read_u32(base + 1)])
            })
            .collect())
    }

    /// Channel IDs on a runlist's active set.
    pub fn active_channels(&self, runlist_id: u32) -> FifoResult<Vec<u32>> {
        let rl = self.runlist(runlist_id)?;
        let st = rl.state.lock();
        Ok(st.active_channels.iter_ones().map(|c| c as u32).collect())
    }

    /// Every channel a target covers: the channel itself or all group members.
    pub(super) fn target_channels(&self, target: Target) -> Vec<u32> {
        match target {
            Target::Channel(chid) => vec![chid],
            Target::Group(gid) => self
                .groups
                .get(gid as usize)
                .map(|tsg| tsg.members())
                .unwrap_or_default(),
        }
    }
}

fn write_entry(buf: &mut DmaBuffer, index: usize, entry: RunlistEntry) {
    let words = entry.encode();
    let base = index * RUNLIST_ENTRY_WORDS;
    buf.write_u32(base, words[0]);
    buf.write_u32(base + 1, words[1]);
}
