//! Simulated FIFO register space.
//!
//! Models just enough of the hardware for the scheduler to run against: runlist and preempt
//! pending bits that clear after a configurable number of polls, hang injection, write-1-to-clear
//! interrupt registers, the channel enable set/clear protocol and engine resets.

use crate::hw::device::{RawMmuFault, RegisterSpace};
use crate::hw::regs::{
    CCSR_CHANNEL_ENABLE, CCSR_CHANNEL_ENABLE_CLR, CCSR_CHANNEL_ENABLE_SET,
    FIFO_ENG_RUNLIST_PENDING, FIFO_ERROR_SCHED_DISABLE, FIFO_INTR_0, FIFO_INTR_0_MMU_FAULT,
    FIFO_INTR_0_PBDMA_INTR, FIFO_INTR_0_SCHED_ERROR, FIFO_INTR_MMU_FAULT_ID, FIFO_INTR_PBDMA_ID,
    FIFO_INTR_SCHED_ERROR, FIFO_PREEMPT, FIFO_PREEMPT_PENDING, FIFO_RUNLIST_LENGTH_MASK,
    MAX_PBDMAS, MAX_RUNLISTS, PMC_ENABLE, RUNLIST_BASE_SHIFT, ccsr_channel, fifo_eng_runlist,
    fifo_engine_status, fifo_intr_mmu_fault_hi, fifo_intr_mmu_fault_info,
    fifo_intr_mmu_fault_inst, fifo_intr_mmu_fault_lo, fifo_pbdma_status, fifo_runlist_base_hi,
    fifo_runlist_base_lo, fifo_runlist_submit, pbdma_intr_0,
};
use parking_lot::Mutex;
use std::collections::HashMap;

/// How long an injected hang lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangMode {
    /// The pending bit sticks until any engine is reset.
    UntilReset,
    /// The pending bit never clears.
    Forever,
}

#[derive(Debug, Default, Clone, Copy)]
struct Pending {
    polls_left: u32,
    hang: Option<HangMode>,
}

impl Pending {
    const fn is_set(&self) -> bool {
        self.hang.is_some() || self.polls_left > 0
    }

    /// One poll of the pending bit. Returns whether it still reads as pending.
    fn poll(&mut self) -> bool {
        if self.hang.is_some() {
            return true;
        }
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return true;
        }
        false
    }
}

#[derive(Debug, Default)]
struct SimState {
    regs: HashMap<u32, u32>,
    latency: u32,
    runlists: HashMap<u32, Pending>,
    runlist_hangs: HashMap<u32, HangMode>,
    preempt: Pending,
    preempt_hang: Option<HangMode>,
    submits: Vec<(u32, u64, u32)>,
    preempts: Vec<u32>,
    resets: Vec<u32>,
}

impl SimState {
    fn get(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn clear_hangs(&mut self) {
        self.runlist_hangs.retain(|_, mode| *mode == HangMode::Forever);
        for (id, pending) in &mut self.runlists {
            if pending.hang == Some(HangMode::UntilReset) {
                pending.hang = None;
            }
            if let Some(mode) = self.runlist_hangs.get(id) {
                pending.hang = Some(*mode);
            }
        }
        if self.preempt_hang == Some(HangMode::UntilReset) {
            self.preempt_hang = None;
        }
        if self.preempt.hang == Some(HangMode::UntilReset) {
            self.preempt.hang = None;
        }
    }
}

fn runlist_of(offset: u32, reg: fn(u32) -> u32) -> Option<u32> {
    (0..MAX_RUNLISTS).find(|&id| reg(id) == offset)
}

fn is_pbdma_intr(offset: u32) -> bool {
    (0..MAX_PBDMAS).any(|id| pbdma_intr_0(id) == offset)
}

/// A register space backed by a map, with just enough behavior to drive the scheduler.
#[derive(Debug)]
pub struct SimRegisters {
    state: Mutex<SimState>,
}

impl Default for SimRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRegisters {
    #[must_use]
    pub fn new() -> Self {
        let mut state = SimState {
            latency: 1,
            ..SimState::default()
        };
        state.regs.insert(PMC_ENABLE, u32::MAX);
        Self {
            state: Mutex::new(state),
        }
    }

    /// Number of polls a pending bit survives after a submit or preempt request.
    #[must_use]
    pub fn with_latency(self, polls: u32) -> Self {
        self.state.lock().latency = polls;
        self
    }

    pub fn set(&self, offset: u32, value: u32) {
        self.state.lock().regs.insert(offset, value);
    }

    #[must_use]
    pub fn get(&self, offset: u32) -> u32 {
        self.state.lock().get(offset)
    }

    /// Makes future runlist submits on `runlist_id` stay pending.
    pub fn hang_runlist(&self, runlist_id: u32, mode: HangMode) {
        self.state.lock().runlist_hangs.insert(runlist_id, mode);
    }

    /// Makes future preempt requests stay pending.
    pub fn hang_preempt(&self, mode: HangMode) {
        self.state.lock().preempt_hang = Some(mode);
    }

    pub fn set_engine_status(&self, engine_id: u32, raw: u32) {
        self.set(fifo_engine_status(engine_id), raw);
    }

    pub fn set_pbdma_status(&self, pbdma_id: u32, raw: u32) {
        self.set(fifo_pbdma_status(pbdma_id), raw);
    }

    /// Latches an MMU fault on `fault_id` and raises the top-level interrupt.
    pub fn raise_mmu_fault(&self, fault_id: u32, fault: RawMmuFault) {
        let mut st = self.state.lock();
        st.regs.insert(fifo_intr_mmu_fault_inst(fault_id), fault.inst);
        st.regs.insert(fifo_intr_mmu_fault_lo(fault_id), fault.addr_lo);
        st.regs.insert(fifo_intr_mmu_fault_hi(fault_id), fault.addr_hi);
        st.regs.insert(fifo_intr_mmu_fault_info(fault_id), fault.info);
        let ids = st.get(FIFO_INTR_MMU_FAULT_ID) | (1 << fault_id);
        st.regs.insert(FIFO_INTR_MMU_FAULT_ID, ids);
        let intr = st.get(FIFO_INTR_0) | FIFO_INTR_0_MMU_FAULT;
        st.regs.insert(FIFO_INTR_0, intr);
        st.regs.insert(FIFO_ERROR_SCHED_DISABLE, 1);
    }

    pub fn raise_sched_error(&self, code: u32) {
        let mut st = self.state.lock();
        st.regs.insert(FIFO_INTR_SCHED_ERROR, code);
        let intr = st.get(FIFO_INTR_0) | FIFO_INTR_0_SCHED_ERROR;
        st.regs.insert(FIFO_INTR_0, intr);
    }

    pub fn raise_pbdma_intr(&self, pbdma_id: u32, bits: u32) {
        let mut st = self.state.lock();
        let cur = st.get(pbdma_intr_0(pbdma_id)) | bits;
        st.regs.insert(pbdma_intr_0(pbdma_id), cur);
        let ids = st.get(FIFO_INTR_PBDMA_ID) | (1 << pbdma_id);
        st.regs.insert(FIFO_INTR_PBDMA_ID, ids);
        let intr = st.get(FIFO_INTR_0) | FIFO_INTR_0_PBDMA_INTR;
        st.regs.insert(FIFO_INTR_0, intr);
    }

    /// The pending top-level interrupt bits.
    #[must_use]
    pub fn intr_status(&self) -> u32 {
        self.get(FIFO_INTR_0)
    }

    /// Every runlist submission so far as `(runlist_id, base, count)`.
    #[must_use]
    pub fn submits(&self) -> Vec<(u32, u64, u32)> {
        self.state.lock().submits.clone()
    }

    #[must_use]
    pub fn last_submit(&self, runlist_id: u32) -> Option<(u64, u32)> {
        self.state
            .lock()
            .submits
            .iter()
            .rev()
            .find(|(id, _, _)| *id == runlist_id)
            .map(|&(_, base, count)| (base, count))
    }

    /// Raw values written to the preempt register.
    #[must_use]
    pub fn preempts(&self) -> Vec<u32> {
        self.state.lock().preempts.clone()
    }

    /// Reset IDs of every unit pulsed through reset.
    #[must_use]
    pub fn resets(&self) -> Vec<u32> {
        self.state.lock().resets.clone()
    }
}

impl RegisterSpace for SimRegisters {
    fn read32(&self, offset: u32) -> u32 {
        let mut st = self.state.lock();

        if let Some(id) = runlist_of(offset, fifo_eng_runlist) {
            let pending = st.runlists.entry(id).or_default().poll();
            let base = st.get(offset) & !FIFO_ENG_RUNLIST_PENDING;
            return if pending {
                base | FIFO_ENG_RUNLIST_PENDING
            } else {
                base
            };
        }

        if offset == FIFO_PREEMPT {
            let pending = st.preempt.poll();
            let base = st.get(offset) & !FIFO_PREEMPT_PENDING;
            return if pending {
                base | FIFO_PREEMPT_PENDING
            } else {
                base
            };
        }

        st.get(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut st = self.state.lock();

        if let Some(id) = runlist_of(offset, fifo_runlist_submit) {
            let lo = u64::from(st.get(fifo_runlist_base_lo(id)));
            let hi = u64::from(st.get(fifo_runlist_base_hi(id)));
            let base = ((hi << 32) | lo) << RUNLIST_BASE_SHIFT;
            st.submits
                .push((id, base, value & FIFO_RUNLIST_LENGTH_MASK));
            st.regs.insert(offset, value);
            let hang = st.runlist_hangs.get(&id).copied();
            let latency = st.latency;
            st.runlists.insert(
                id,
                Pending {
                    polls_left: latency,
                    hang,
                },
            );
            return;
        }

        if offset == FIFO_PREEMPT {
            if st.preempt.is_set() {
                log::warn!("sim: preempt issued while previous request pending");
            }
            st.preempts.push(value);
            st.regs.insert(offset, value & !FIFO_PREEMPT_PENDING);
            let (latency, hang) = (st.latency, st.preempt_hang);
            st.preempt = Pending {
                polls_left: latency,
                hang,
            };
            return;
        }

        if offset == FIFO_INTR_0
            || offset == FIFO_INTR_MMU_FAULT_ID
            || offset == FIFO_ERROR_SCHED_DISABLE
            || offset == FIFO_INTR_PBDMA_ID
            || is_pbdma_intr(offset)
        {
            let cur = st.get(offset);
            st.regs.insert(offset, cur & !value);
            return;
        }

        if offset == PMC_ENABLE {
            let cur = st.get(offset);
            let lowered = cur & !value;
            for bit in 0..32 {
                if lowered & (1 << bit) != 0 {
                    st.resets.push(bit);
                }
            }
            if lowered != 0 {
                st.clear_hangs();
            }
            st.regs.insert(offset, value);
            return;
        }

        if offset >= ccsr_channel(0) && (offset - ccsr_channel(0)) % 8 == 0 {
            let mut cur = st.get(offset);
            if value & CCSR_CHANNEL_ENABLE_SET != 0 {
                cur |= CCSR_CHANNEL_ENABLE;
            }
            if value & CCSR_CHANNEL_ENABLE_CLR != 0 {
                cur &= !CCSR_CHANNEL_ENABLE;
            }
            st.regs.insert(offset, cur);
            return;
        }

        st.regs.insert(offset, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::regs::SCHED_ERROR_CODE_CTXSW_TIMEOUT;

    #[test]
    fn test_runlist_pending_clears_after_latency() {
        let sim = SimRegisters::new().with_latency(2);
        sim.write32(fifo_runlist_submit(1), 4);
        assert_ne!(sim.read32(fifo_eng_runlist(1)) & FIFO_ENG_RUNLIST_PENDING, 0);
        assert_ne!(sim.read32(fifo_eng_runlist(1)) & FIFO_ENG_RUNLIST_PENDING, 0);
        assert_eq!(sim.read32(fifo_eng_runlist(1)) & FIFO_ENG_RUNLIST_PENDING, 0);
        assert_eq!(sim.last_submit(1), Some((0, 4)));
    }

    #[test]
    fn test_hang_until_reset() {
        let sim = SimRegisters::new().with_latency(0);
        sim.hang_preempt(HangMode::UntilReset);
        sim.write32(FIFO_PREEMPT, 3);
        assert_ne!(sim.read32(FIFO_PREEMPT) & FIFO_PREEMPT_PENDING, 0);

        sim.write32(PMC_ENABLE, !(1 << 12));
        sim.write32(PMC_ENABLE, u32::MAX);
        assert_eq!(sim.read32(FIFO_PREEMPT) & FIFO_PREEMPT_PENDING, 0);
        assert_eq!(sim.resets(), vec![12]);
    }

    #[test]
    fn test_intr_write_one_to_clear() {
        let sim = SimRegisters::new();
        sim.raise_sched_error(SCHED_ERROR_CODE_CTXSW_TIMEOUT);
        sim.raise_mmu_fault(2, RawMmuFault::default());
        sim.write32(FIFO_INTR_0, FIFO_INTR_0_SCHED_ERROR);
        assert_eq!(sim.intr_status(), FIFO_INTR_0_MMU_FAULT);
    }

    #[test]
    fn test_channel_enable_protocol() {
        let sim = SimRegisters::new();
        sim.write32(ccsr_channel(3), CCSR_CHANNEL_ENABLE_SET);
        assert_eq!(sim.read32(ccsr_channel(3)), CCSR_CHANNEL_ENABLE);
        sim.write32(ccsr_channel(3), CCSR_CHANNEL_ENABLE | CCSR_CHANNEL_ENABLE_CLR);
        assert_eq!(sim.read32(ccsr_channel(3)), 0);
    }
}
