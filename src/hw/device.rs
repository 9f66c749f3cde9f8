use crate::error::TargetKind;
use crate::hw::regs::{
    CCSR_CHANNEL_ENABLE, CCSR_CHANNEL_ENABLE_CLR, CCSR_CHANNEL_ENABLE_SET, CCSR_CHANNEL_INST_BIND,
    CCSR_CHANNEL_INST_PTR_MASK, FIFO_ENG_RUNLIST_PENDING, FIFO_ERROR_SCHED_DISABLE, FIFO_INTR_0, FIFO_INTR_EN_0,
    FIFO_INTR_MMU_FAULT_ID, FIFO_INTR_PBDMA_ID, FIFO_INTR_SCHED_ERROR, FIFO_PREEMPT,
    FIFO_PREEMPT_ID_MASK, FIFO_PREEMPT_PENDING, FIFO_PREEMPT_TYPE_CHANNEL, FIFO_PREEMPT_TYPE_TSG,
    FIFO_RUNLIST_LENGTH_MASK, FIFO_SCHED_DISABLE, INST_PTR_SHIFT, PMC_ENABLE, RUNLIST_BASE_SHIFT,
    ccsr_channel, ccsr_channel_inst, fifo_eng_runlist, fifo_engine_status, fifo_intr_mmu_fault_hi,
    fifo_intr_mmu_fault_info, fifo_intr_mmu_fault_inst, fifo_intr_mmu_fault_lo,
    fifo_pbdma_status, fifo_runlist_base_hi, fifo_runlist_base_lo, fifo_runlist_submit,
    pbdma_intr_0,
};
use std::fmt;
use std::sync::Arc;

/// Access to a device's control-register space.
///
/// Accesses are side-effecting and must not be reordered relative to other accesses
/// on the same device.
pub trait RegisterSpace: Send + Sync + fmt::Debug {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// Raw MMU fault snapshot for one fault ID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawMmuFault {
    pub inst: u32,
    pub addr_lo: u32,
    pub addr_hi: u32,
    pub info: u32,
}

/// A handle to the FIFO block of one GPU.
///
/// This struct provides typed register operations on top of a [`RegisterSpace`].
/// It wraps the register space in an `Arc`, so it is cheap to clone and share
/// across the scheduler's sub-components.
#[derive(Clone, Debug)]
pub struct Device {
    regs: Arc<dyn RegisterSpace>,
}

impl Device {
    #[must_use]
    pub fn new(regs: Arc<dyn RegisterSpace>) -> Self {
        Self { regs }
    }

    #[inline]
    pub fn read32(&self, offset: u32) -> u32 {
        let val = self.regs.read32(offset);
        log::trace!("fifo: rd 0x{offset:08x} -> 0x{val:08x}");
        val
    }

    #[inline]
    pub fn write32(&self, offset: u32, value: u32) {
        log::trace!("fifo: wr 0x{offset:08x} <- 0x{value:08x}");
        self.regs.write32(offset, value);
    }

    // ===========================================================================================
    // Runlists
    // ===========================================================================================

    /// Points the runlist at `base_phys` and hands it `count` entries.
    ///
    /// The hardware starts consuming the buffer asynchronously; see [`Self::runlist_pending`].
    pub fn submit_runlist(&self, runlist_id: u32, base_phys: u64, count: u32) {
        if count != 0 {
            let pfn = base_phys >> RUNLIST_BASE_SHIFT;
            self.write32(fifo_runlist_base_lo(runlist_id), pfn as u32);
            self.write32(fifo_runlist_base_hi(runlist_id), (pfn >> 32) as u32);
        }
        self.write32(
            fifo_runlist_submit(runlist_id),
            count & FIFO_RUNLIST_LENGTH_MASK,
        );
    }

    #[must_use]
    pub fn runlist_pending(&self, runlist_id: u32) -> bool {
        self.read32(fifo_eng_runlist(runlist_id)) & FIFO_ENG_RUNLIST_PENDING != 0
    }

    // ===========================================================================================
    // Preemption
    // ===========================================================================================

    pub fn issue_preempt(&self, id: u32, kind: TargetKind) {
        let ty = match kind {
            TargetKind::Channel => FIFO_PREEMPT_TYPE_CHANNEL,
            TargetKind::Group => FIFO_PREEMPT_TYPE_TSG,
        };
        self.write32(FIFO_PREEMPT, (id & FIFO_PREEMPT_ID_MASK) | ty);
    }

    #[must_use]
    pub fn preempt_pending(&self) -> bool {
        self.read32(FIFO_PREEMPT) & FIFO_PREEMPT_PENDING != 0
    }

    // ===========================================================================================
    // Scheduling Control
    // ===========================================================================================

    /// Read-modify-write of the scheduler disable mask. Callers serialize.
    pub fn set_sched_disabled(&self, runlist_mask: u32, disabled: bool) {
        let cur = self.read32(FIFO_SCHED_DISABLE);
        let new = if disabled {
            cur | runlist_mask
        } else {
            cur & !runlist_mask
        };
        self.write32(FIFO_SCHED_DISABLE, new);
    }

    #[must_use]
    pub fn sched_disabled(&self) -> u32 {
        self.read32(FIFO_SCHED_DISABLE)
    }

    /// Lets the scheduler run again after the hardware halted it on a fault.
    pub fn resume_after_fault(&self) {
        let halted = self.read32(FIFO_ERROR_SCHED_DISABLE);
        self.write32(FIFO_ERROR_SCHED_DISABLE, halted);
    }

    /// Pulses the unit's enable bit, holding it in reset for one register write.
    pub fn reset_unit(&self, reset_id: u32) {
        let mask = 1 << reset_id;
        let cur = self.read32(PMC_ENABLE);
        self.write32(PMC_ENABLE, cur & !mask);
        let _ = self.read32(PMC_ENABLE);
        self.write32(PMC_ENABLE, cur | mask);
    }

    // ===========================================================================================
    // Status & Faults
    // ===========================================================================================

    #[must_use]
    pub fn engine_status(&self, engine_id: u32) -> u32 {
        self.read32(fifo_engine_status(engine_id))
    }

    #[must_use]
    pub fn pbdma_status(&self, pbdma_id: u32) -> u32 {
        self.read32(fifo_pbdma_status(pbdma_id))
    }

    #[must_use]
    pub fn mmu_fault_ids(&self) -> u32 {
        self.read32(FIFO_INTR_MMU_FAULT_ID)
    }

    pub fn clear_mmu_fault_ids(&self, mask: u32) {
        self.write32(FIFO_INTR_MMU_FAULT_ID, mask);
    }

    #[must_use]
    pub fn mmu_fault(&self, fault_id: u32) -> RawMmuFault {
        RawMmuFault {
            inst: self.read32(fifo_intr_mmu_fault_inst(fault_id)),
            addr_lo: self.read32(fifo_intr_mmu_fault_lo(fault_id)),
            addr_hi: self.read32(fifo_intr_mmu_fault_hi(fault_id)),
            info: self.read32(fifo_intr_mmu_fault_info(fault_id)),
        }
    }

    #[must_use]
    pub fn sched_error_code(&self) -> u32 {
        self.read32(FIFO_INTR_SCHED_ERROR)
    }

    #[must_use]
    pub fn pbdma_intr_ids(&self) -> u32 {
        self.read32(FIFO_INTR_PBDMA_ID)
    }

    #[must_use]
    pub fn pbdma_intr(&self, pbdma_id: u32) -> u32 {
        self.read32(pbdma_intr_0(pbdma_id))
    }

    pub fn clear_pbdma_intr(&self, pbdma_id: u32, bits: u32) {
        self.write32(pbdma_intr_0(pbdma_id), bits);
    }

    pub fn clear_pbdma_intr_ids(&self, mask: u32) {
        self.write32(FIFO_INTR_PBDMA_ID, mask);
    }

    #[must_use]
    pub fn intr_status(&self) -> u32 {
        self.read32(FIFO_INTR_0)
    }

    pub fn enable_intr(&self, mask: u32) {
        self.write32(FIFO_INTR_EN_0, mask);
    }

    /// Acknowledges serviced top-level interrupt bits (write 1 to clear).
    pub fn clear_intr(&self, bits: u32) {
        self.write32(FIFO_INTR_0, bits);
    }

    // ===========================================================================================
    // Channel Control
    // ===========================================================================================

    pub fn bind_channel(&self, chid: u32, inst_phys: u64) {
        let ptr = ((inst_phys >> INST_PTR_SHIFT) as u32) & CCSR_CHANNEL_INST_PTR_MASK;
        self.write32(ccsr_channel_inst(chid), ptr | CCSR_CHANNEL_INST_BIND);
    }

    pub fn unbind_channel(&self, chid: u32) {
        self.write32(ccsr_channel_inst(chid), 0);
    }

    pub fn enable_channel(&self, chid: u32) {
        let cur = self.read32(ccsr_channel(chid));
        self.write32(ccsr_channel(chid), cur | CCSR_CHANNEL_ENABLE_SET);
    }

    pub fn disable_channel(&self, chid: u32) {
        let cur = self.read32(ccsr_channel(chid));
        self.write32(ccsr_channel(chid), cur | CCSR_CHANNEL_ENABLE_CLR);
    }

    #[must_use]
    pub fn channel_enabled(&self, chid: u32) -> bool {
        self.read32(ccsr_channel(chid)) & CCSR_CHANNEL_ENABLE != 0
    }
}
