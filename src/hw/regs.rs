//! Portable FIFO register map.
//!
//! Offsets and field positions follow the general shape of a discrete GPU's host interface
//! but are not bit-exact to any chip generation. Everything that touches a register goes
//! through these helpers so a different layout only needs changes here.

// ===============================================================================================
// Master Control
// ===============================================================================================

/// Engine enable register. Clearing a bit holds the unit in reset.
pub const PMC_ENABLE: u32 = 0x0000_0200;

// ===============================================================================================
// FIFO Interrupts
// ===============================================================================================

pub const FIFO_INTR_0: u32 = 0x0000_2100;
pub const FIFO_INTR_EN_0: u32 = 0x0000_2140;

pub const FIFO_INTR_0_BIND_ERROR: u32 = 1 << 0;
pub const FIFO_INTR_0_SCHED_ERROR: u32 = 1 << 8;
pub const FIFO_INTR_0_CHSW_ERROR: u32 = 1 << 16;
pub const FIFO_INTR_0_DROPPED_MMU_FAULT: u32 = 1 << 27;
pub const FIFO_INTR_0_MMU_FAULT: u32 = 1 << 28;
pub const FIFO_INTR_0_PBDMA_INTR: u32 = 1 << 29;
pub const FIFO_INTR_0_RUNLIST_EVENT: u32 = 1 << 30;
pub const FIFO_INTR_0_CHANNEL_INTR: u32 = 1 << 31;

/// Sticky error bits that are serviced by the error handler and cleared directly.
pub const FIFO_INTR_0_ERROR_MASK: u32 =
    FIFO_INTR_0_BIND_ERROR | FIFO_INTR_0_CHSW_ERROR | FIFO_INTR_0_DROPPED_MMU_FAULT;

/// Scheduler error code, valid while `FIFO_INTR_0_SCHED_ERROR` is pending.
pub const FIFO_INTR_SCHED_ERROR: u32 = 0x0000_254c;
pub const SCHED_ERROR_CODE_CTXSW_TIMEOUT: u32 = 0xa;

/// Bitmask of MMU fault IDs with a pending fault. Write 1 to clear.
pub const FIFO_INTR_MMU_FAULT_ID: u32 = 0x0000_259c;

/// Bitmask of PBDMA units with a pending interrupt.
pub const FIFO_INTR_PBDMA_ID: u32 = 0x0000_25a0;

/// Per-fault-ID fault snapshot registers.
#[must_use]
pub const fn fifo_intr_mmu_fault_inst(fault_id: u32) -> u32 {
    0x0000_2800 + fault_id * 16
}

#[must_use]
pub const fn fifo_intr_mmu_fault_lo(fault_id: u32) -> u32 {
    0x0000_2804 + fault_id * 16
}

#[must_use]
pub const fn fifo_intr_mmu_fault_hi(fault_id: u32) -> u32 {
    0x0000_2808 + fault_id * 16
}

#[must_use]
pub const fn fifo_intr_mmu_fault_info(fault_id: u32) -> u32 {
    0x0000_280c + fault_id * 16
}

pub const MMU_FAULT_INFO_TYPE_MASK: u32 = 0xf;
pub const MMU_FAULT_INFO_WRITE: u32 = 1 << 7;
pub const MMU_FAULT_INFO_CLIENT_SHIFT: u32 = 8;
pub const MMU_FAULT_INFO_CLIENT_MASK: u32 = 0x3f;
pub const MMU_FAULT_INFO_ENGINE_SUBID_GPC: u32 = 1 << 24;

/// The hardware halts scheduling on fault; writing the read value back resumes it.
pub const FIFO_ERROR_SCHED_DISABLE: u32 = 0x0000_262c;

// ===============================================================================================
// Scheduling
// ===============================================================================================

/// One bit per runlist; a set bit stops the scheduler from picking new work on that runlist.
pub const FIFO_SCHED_DISABLE: u32 = 0x0000_2630;

#[must_use]
pub const fn fifo_sched_disable_runlist(runlist_id: u32) -> u32 {
    1 << runlist_id
}

pub const FIFO_PREEMPT: u32 = 0x0000_2634;
pub const FIFO_PREEMPT_ID_MASK: u32 = 0xfff;
pub const FIFO_PREEMPT_TYPE_CHANNEL: u32 = 0 << 24;
pub const FIFO_PREEMPT_TYPE_TSG: u32 = 1 << 24;
pub const FIFO_PREEMPT_PENDING: u32 = 1 << 20;

#[must_use]
pub const fn fifo_runlist_base_lo(runlist_id: u32) -> u32 {
    0x0000_2270 + runlist_id * 0x10
}

#[must_use]
pub const fn fifo_runlist_base_hi(runlist_id: u32) -> u32 {
    0x0000_2274 + runlist_id * 0x10
}

/// Writing the entry count here hands the buffer at the base registers to the hardware.
#[must_use]
pub const fn fifo_runlist_submit(runlist_id: u32) -> u32 {
    0x0000_2278 + runlist_id * 0x10
}

pub const FIFO_RUNLIST_LENGTH_MASK: u32 = 0xffff;

#[must_use]
pub const fn fifo_eng_runlist(runlist_id: u32) -> u32 {
    0x0000_2400 + runlist_id * 8
}

pub const FIFO_ENG_RUNLIST_PENDING: u32 = 1 << 20;

/// Number of runlist register slots.
pub const MAX_RUNLISTS: u32 = 16;

/// Runlist buffers are addressed in 4 KiB units.
pub const RUNLIST_BASE_SHIFT: u32 = 12;

// ===============================================================================================
// Engine / PBDMA Status
// ===============================================================================================

#[must_use]
pub const fn fifo_engine_status(engine_id: u32) -> u32 {
    0x0000_2640 + engine_id * 8
}

#[must_use]
pub const fn fifo_pbdma_status(pbdma_id: u32) -> u32 {
    0x0000_3080 + pbdma_id * 4
}

pub const STATUS_ID_MASK: u32 = 0xfff;
pub const STATUS_ID_TYPE_TSG: u32 = 1 << 12;
pub const STATUS_CTX_SHIFT: u32 = 13;
pub const STATUS_CTX_MASK: u32 = 0x7;
pub const STATUS_NEXT_ID_SHIFT: u32 = 16;
pub const STATUS_NEXT_ID_TYPE_TSG: u32 = 1 << 28;
pub const STATUS_FAULTED: u32 = 1 << 30;
pub const STATUS_BUSY: u32 = 1 << 31;

pub const CTX_STATUS_INVALID: u32 = 0;
pub const CTX_STATUS_VALID: u32 = 1;
pub const CTX_STATUS_CTXSW_LOAD: u32 = 5;
pub const CTX_STATUS_CTXSW_SAVE: u32 = 6;
pub const CTX_STATUS_CTXSW_SWITCH: u32 = 7;

#[must_use]
pub const fn pbdma_intr_0(pbdma_id: u32) -> u32 {
    0x0004_0108 + pbdma_id * 0x2000
}

pub const MAX_PBDMAS: u32 = 8;

/// PBDMA interrupt bits that leave the channel's command stream unusable.
pub const PBDMA_INTR_0_DEVICE_MASK: u32 = 0x0000_ffff;

// ===============================================================================================
// Channel Control
// ===============================================================================================

#[must_use]
pub const fn ccsr_channel_inst(chid: u32) -> u32 {
    0x0080_0000 + chid * 8
}

#[must_use]
pub const fn ccsr_channel(chid: u32) -> u32 {
    0x0080_0004 + chid * 8
}

pub const CCSR_CHANNEL_INST_BIND: u32 = 1 << 31;
pub const CCSR_CHANNEL_INST_PTR_MASK: u32 = 0x0fff_ffff;
pub const CCSR_CHANNEL_ENABLE: u32 = 1 << 0;
pub const CCSR_CHANNEL_ENABLE_SET: u32 = 1 << 10;
pub const CCSR_CHANNEL_ENABLE_CLR: u32 = 1 << 11;

/// Instance blocks are addressed in 4 KiB units.
pub const INST_PTR_SHIFT: u32 = 12;

// ===============================================================================================
// Runlist Entry Format
// ===============================================================================================

/// Each runlist entry is two 32-bit words.
pub const RUNLIST_ENTRY_WORDS: usize = 2;
pub const RUNLIST_ENTRY_ID_MASK: u32 = 0xfff;
pub const RUNLIST_ENTRY_TYPE_TSG: u32 = 1 << 12;
pub const RUNLIST_ENTRY_TIMESLICE_SCALE_SHIFT: u32 = 16;
pub const RUNLIST_ENTRY_TIMESLICE_SCALE_MASK: u32 = 0xf;
pub const RUNLIST_ENTRY_TIMESLICE_TIMEOUT_SHIFT: u32 = 24;
pub const RUNLIST_ENTRY_TIMESLICE_TIMEOUT_MASK: u32 = 0xff;
