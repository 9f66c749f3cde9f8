//! Interrupt decoding, fault attribution and recovery.
//!
//! Every recovery funnels through [`Fifo::handle_mmu_fault`]: real MMU faults read the fault
//! mask and snapshots from hardware, forced recovery (timeouts, PBDMA faults, client requests)
//! supplies the engine mask and target itself. The handler resets engines, marks the resolved
//! channel or whole group faulted and returns the targets; taking them off their runlists is
//! left to the caller so that no runlist lock is ever taken under the fault lock.

use super::Fifo;
use super::channel::{Channel, ChannelError, ChannelState};
use super::engine::{EngineInfo, EngineKind, Target, UnitStatus};
use crate::error::{FifoError, FifoResult};
use crate::hw::device::RawMmuFault;
use crate::hw::regs::{
    FIFO_INTR_0_CHANNEL_INTR, FIFO_INTR_0_ERROR_MASK, FIFO_INTR_0_MMU_FAULT,
    FIFO_INTR_0_PBDMA_INTR, FIFO_INTR_0_RUNLIST_EVENT, FIFO_INTR_0_SCHED_ERROR,
    MMU_FAULT_INFO_CLIENT_MASK, MMU_FAULT_INFO_CLIENT_SHIFT, MMU_FAULT_INFO_ENGINE_SUBID_GPC,
    MMU_FAULT_INFO_TYPE_MASK, MMU_FAULT_INFO_WRITE, PBDMA_INTR_0_DEVICE_MASK,
    SCHED_ERROR_CODE_CTXSW_TIMEOUT,
};
use std::fmt;

/// Top-level interrupt bits the scheduler services.
pub const HANDLED_INTR_MASK: u32 = FIFO_INTR_0_ERROR_MASK
    | FIFO_INTR_0_SCHED_ERROR
    | FIFO_INTR_0_MMU_FAULT
    | FIFO_INTR_0_PBDMA_INTR
    | FIFO_INTR_0_CHANNEL_INTR
    | FIFO_INTR_0_RUNLIST_EVENT;

/// Decoded MMU fault snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MmuFaultInfo {
    pub fault_id: u32,
    /// Instance pointer of the faulting context.
    pub inst: u32,
    pub addr: u64,
    pub kind: u32,
    pub write: bool,
    pub client: u32,
    /// The access came from a GPC client rather than the engine front end.
    pub gpc: bool,
}

impl MmuFaultInfo {
    #[must_use]
    pub const fn decode(fault_id: u32, raw: RawMmuFault) -> Self {
        Self {
            fault_id,
            inst: raw.inst,
            addr: ((raw.addr_hi as u64) << 32) | raw.addr_lo as u64,
            kind: raw.info & MMU_FAULT_INFO_TYPE_MASK,
            write: raw.info & MMU_FAULT_INFO_WRITE != 0,
            client: (raw.info >> MMU_FAULT_INFO_CLIENT_SHIFT) & MMU_FAULT_INFO_CLIENT_MASK,
            gpc: raw.info & MMU_FAULT_INFO_ENGINE_SUBID_GPC != 0,
        }
    }
}

impl fmt::Display for MmuFaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id {} {} at 0x{:x} type {} client {}{} inst 0x{:x}",
            self.fault_id,
            if self.write { "write" } else { "read" },
            self.addr,
            self.kind,
            self.client,
            if self.gpc { " (gpc)" } else { "" },
            self.inst
        )
    }
}

/// An engine reset postponed until the faulting context is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct DeferredReset {
    /// Engine ID bits.
    pub engines: u32,
    pub target: Target,
}

/// Recovery requested by software instead of reported by hardware.
#[derive(Debug, Clone, Copy)]
struct ForcedFault {
    /// MMU fault ID bits of the engines to recover.
    fault_mask: u32,
    target: Option<Target>,
    reason: ChannelError,
}

fn bits(mask: u32) -> impl Iterator<Item = u32> {
    (0..32).filter(move |bit| mask & (1 << bit) != 0)
}

fn runlist_mask<'a>(engines: impl IntoIterator<Item = &'a EngineInfo>) -> u32 {
    engines
        .into_iter()
        .fold(0, |mask, e| mask | (1 << e.runlist_id))
}

impl Fifo {
    // ===========================================================================================
    // Interrupts
    // ===========================================================================================

    /// Services the top-level interrupt bits in `status` and acknowledges them.
    ///
    /// Returns the bits that had a handler; anything else is logged and cleared.
    pub fn handle_interrupt(&self, status: u32) -> u32 {
        let mut handled = 0;

        if status & FIFO_INTR_0_ERROR_MASK != 0 {
            log::error!(
                "fifo: host error interrupt 0x{:08x}",
                status & FIFO_INTR_0_ERROR_MASK
            );
            handled |= status & FIFO_INTR_0_ERROR_MASK;
        }

        if status & FIFO_INTR_0_SCHED_ERROR != 0 {
            self.handle_sched_error();
            handled |= FIFO_INTR_0_SCHED_ERROR;
        }

        if status & FIFO_INTR_0_MMU_FAULT != 0 {
            let targets = self.handle_mmu_fault(None);
            self.remove_from_runlists(&targets);
            handled |= FIFO_INTR_0_MMU_FAULT;
        }

        if status & FIFO_INTR_0_PBDMA_INTR != 0 {
            self.handle_pbdma_intr();
            handled |= FIFO_INTR_0_PBDMA_INTR;
        }

        if status & FIFO_INTR_0_CHANNEL_INTR != 0 {
            self.wake_all_channels();
            handled |= FIFO_INTR_0_CHANNEL_INTR;
        }

        if status & FIFO_INTR_0_RUNLIST_EVENT != 0 {
            log::debug!("fifo: runlist event");
            handled |= FIFO_INTR_0_RUNLIST_EVENT;
        }

        let unknown = status & !handled;
        if unknown != 0 {
            log::warn!("fifo: unhandled interrupt bits 0x{unknown:08x}");
        }
        self.device.clear_intr(status);
        handled
    }

    /// Reads the pending interrupt status and services it.
    pub fn service_interrupts(&self) -> u32 {
        let status = self.device.intr_status();
        if status == 0 {
            return 0;
        }
        self.handle_interrupt(status)
    }

    fn handle_sched_error(&self) {
        let code = self.device.sched_error_code();
        if code != SCHED_ERROR_CODE_CTXSW_TIMEOUT {
            log::error!("fifo: scheduler error code 0x{code:x}");
            return;
        }

        for engine in &self.config.engines {
            let status = UnitStatus::decode(self.device.engine_status(engine.id));
            if !status.busy || !status.ctx.switching() {
                continue;
            }
            let target = status.faulting();
            log::error!(
                "fifo: engine {} stuck in context switch ({:?})",
                engine.id,
                status.ctx
            );
            let targets = self.handle_mmu_fault(Some(ForcedFault {
                fault_mask: 1 << engine.mmu_fault_id,
                target,
                reason: ChannelError::CtxswTimeout,
            }));
            self.remove_from_runlists(&targets);
        }
    }

    fn handle_pbdma_intr(&self) {
        let ids = self.device.pbdma_intr_ids();
        for pbdma in bits(ids) {
            let intr = self.device.pbdma_intr(pbdma);
            self.device.clear_pbdma_intr(pbdma, intr);
            if intr & PBDMA_INTR_0_DEVICE_MASK == 0 {
                continue;
            }

            let status = UnitStatus::decode(self.device.pbdma_status(pbdma));
            match status.resident() {
                Some(target) => {
                    log::error!("fifo: pbdma {pbdma} intr 0x{intr:08x} on {target}");
                    self.recover_target(target, ChannelError::PbdmaFault { pbdma, intr });
                }
                None => log::warn!("fifo: pbdma {pbdma} intr 0x{intr:08x} with no context"),
            }
        }
        self.device.clear_pbdma_intr_ids(ids);
    }

    // ===========================================================================================
    // MMU faults
    // ===========================================================================================

    /// Services the faults in the hardware fault mask, or a forced fault.
    ///
    /// Holds the fault lock throughout. Returns the targets that were marked faulted.
    fn handle_mmu_fault(&self, forced: Option<ForcedFault>) -> Vec<Target> {
        let _fault = self.fault_lock.lock();

        let fake = forced.is_some();
        let mask = forced.map_or_else(|| self.device.mmu_fault_ids(), |f| f.fault_mask);
        if mask == 0 {
            return Vec::new();
        }

        let runlists = runlist_mask(
            self.config
                .engines
                .iter()
                .filter(|e| mask & (1 << e.mmu_fault_id) != 0),
        );
        self.set_sched_disabled(runlists, true);

        let mut targets = Vec::new();

        for fault_id in bits(mask) {
            let raw = if fake {
                RawMmuFault::default()
            } else {
                self.device.mmu_fault(fault_id)
            };
            let info = MmuFaultInfo::decode(fault_id, raw);

            let Some(engine) = self
                .config
                .engines
                .iter()
                .find(|e| e.mmu_fault_id == fault_id)
            else {
                log::error!("fifo: mmu fault on unit with no engine: {info}");
                continue;
            };

            let status = UnitStatus::decode(self.device.engine_status(engine.id));
            let resolved = match forced {
                Some(f) => f.target,
                None => self.channel_by_inst(raw.inst).map(Channel::fault_target),
            };
            let target = resolved.or_else(|| status.faulting()).map(|t| self.normalize(t));
            let reason = forced.map_or(ChannelError::MmuFault(info), |f| f.reason);

            match target {
                Some(t) if !fake => log::error!("fifo: engine {} mmu fault: {info} on {t}", engine.id),
                Some(t) => log::error!("fifo: recovering engine {} ({reason}) on {t}", engine.id),
                None => log::error!("fifo: engine {} fault ({reason}) with no context", engine.id),
            }

            let defer = target.is_some_and(|t| {
                !fake
                    && engine.kind == EngineKind::Graphics
                    && info.gpc
                    && self.config.defer.defer_reset(t, &info)
            });

            if let Some(t) = target.filter(|_| defer) {
                log::warn!(
                    "fifo: deferring reset of engine {} until {t} is released",
                    engine.id
                );
                self.deferred.lock().push(DeferredReset {
                    engines: 1 << engine.id,
                    target: t,
                });
            } else {
                self.reset_engine(engine);
            }

            if let Some(t) = target {
                if self.mark_target_faulted(t, reason) && !targets.contains(&t) {
                    targets.push(t);
                }
            }
        }

        if !fake {
            self.device.clear_mmu_fault_ids(mask);
            self.device.resume_after_fault();
        }
        self.set_sched_disabled(runlists & !self.deferred_runlists(), false);
        targets
    }

    /// A channel inside a group is always recovered together with its group.
    fn normalize(&self, target: Target) -> Target {
        match target {
            Target::Channel(chid) => self
                .channels
                .get(chid as usize)
                .map_or(target, Channel::fault_target),
            Target::Group(_) => target,
        }
    }

    /// Marks every live channel of `target` faulted. Returns whether any was.
    fn mark_target_faulted(&self, target: Target, reason: ChannelError) -> bool {
        let mut any = false;
        for chid in self.target_channels(target) {
            if let Some(ch) = self.channels.get(chid as usize) {
                if ch.mark_faulted(reason) {
                    log::error!("fifo: channel {chid} faulted: {reason}");
                    any = true;
                }
            }
        }
        any
    }

    /// Takes faulted channels off their runlists without waiting for the hardware.
    fn remove_from_runlists(&self, targets: &[Target]) {
        for &target in targets {
            for chid in self.target_channels(target) {
                let runlist_id = self.channels[chid as usize].runlist_id();
                if let Err(e) = self.update_runlist(runlist_id, Some(chid), false, false) {
                    log::warn!("fifo: removing faulted channel {chid}: {e}");
                }
            }
        }
    }

    /// Pulses an engine through reset. Resets from the fault path and the deferred path
    /// queue on the reset lock; none is dropped.
    fn reset_engine(&self, engine: &EngineInfo) {
        let _reset = self.reset_lock.lock();
        log::warn!("fifo: resetting engine {}", engine.id);
        self.device.reset_unit(engine.reset_id);
    }

    // ===========================================================================================
    // Recovery entry points
    // ===========================================================================================

    /// MMU fault ID bits of the engines currently running `target`.
    fn engines_on_target(&self, target: Target) -> u32 {
        self.config
            .engines
            .iter()
            .filter(|e| UnitStatus::decode(self.device.engine_status(e.id)).faulting() == Some(target))
            .fold(0, |mask, e| mask | (1 << e.mmu_fault_id))
    }

    /// Resets whatever engines run `target` and marks it faulted; if it is not resident
    /// anywhere it is only marked faulted.
    pub(super) fn recover_target(&self, target: Target, reason: ChannelError) {
        let target = self.normalize(target);
        let fault_mask = self.engines_on_target(target);
        let targets = if fault_mask != 0 {
            self.handle_mmu_fault(Some(ForcedFault {
                fault_mask,
                target: Some(target),
                reason,
            }))
        } else {
            log::warn!("fifo: {target} not resident on any engine, aborting without reset");
            if self.mark_target_faulted(target, reason) {
                vec![target]
            } else {
                Vec::new()
            }
        };
        self.remove_from_runlists(&targets);
    }

    /// Forces recovery of a channel, or of its whole group if it has one.
    pub fn recover_channel(&self, chid: u32, reason: ChannelError) -> FifoResult<()> {
        if self.channel(chid)?.state() == ChannelState::Free {
            return Err(FifoError::InvalidChannel(chid));
        }
        self.recover_target(Target::Channel(chid), reason);
        Ok(())
    }

    pub fn recover_group(&self, gid: u32, reason: ChannelError) -> FifoResult<()> {
        self.group(gid)?;
        self.recover_target(Target::Group(gid), reason);
        Ok(())
    }

    /// Resets every engine on a runlist whose update never completed.
    ///
    /// Runs with that runlist's lock held, so the returned targets are only marked faulted;
    /// the caller clears them from the locked active set.
    pub(super) fn recover_runlist_engines(&self, runlist_id: u32) -> Vec<Target> {
        let fault_mask = self
            .config
            .engines
            .iter()
            .filter(|e| e.runlist_id == runlist_id)
            .fold(0, |mask, e| mask | (1 << e.mmu_fault_id));
        self.handle_mmu_fault(Some(ForcedFault {
            fault_mask,
            target: None,
            reason: ChannelError::RunlistTimeout,
        }))
    }

    /// Recovers whatever is running on one engine.
    pub(super) fn recover_engine(&self, engine: &EngineInfo, reason: ChannelError) {
        let target = UnitStatus::decode(self.device.engine_status(engine.id)).faulting();
        let targets = self.handle_mmu_fault(Some(ForcedFault {
            fault_mask: 1 << engine.mmu_fault_id,
            target,
            reason,
        }));
        self.remove_from_runlists(&targets);
    }

    // ===========================================================================================
    // Deferred resets
    // ===========================================================================================

    /// Whether any engine reset is waiting for its context to be released.
    #[must_use]
    pub fn deferred_reset_pending(&self) -> bool {
        !self.deferred.lock().is_empty()
    }

    /// Runlists that must stay disabled because an engine on them waits for a deferred reset.
    fn deferred_runlists(&self) -> u32 {
        let deferred = self.deferred.lock();
        runlist_mask(
            self.config
                .engines
                .iter()
                .filter(|e| deferred.iter().any(|r| r.engines & (1 << e.id) != 0)),
        )
    }

    /// Runs the resets deferred for a channel (or its group) being freed.
    ///
    /// Entries stay on the pending list until their engines are reset, so a fault serviced
    /// in between keeps their runlists disabled.
    pub(super) fn run_deferred_reset(&self, chid: u32, group: Option<u32>) {
        let is_due = |r: &DeferredReset| {
            r.target == Target::Channel(chid) || group.is_some_and(|g| r.target == Target::Group(g))
        };
        let due: Vec<DeferredReset> = self
            .deferred
            .lock()
            .iter()
            .copied()
            .filter(is_due)
            .collect();
        if due.is_empty() {
            return;
        }

        let mut runlists = 0;
        for reset in &due {
            for engine in self
                .config
                .engines
                .iter()
                .filter(|e| reset.engines & (1 << e.id) != 0)
            {
                log::warn!("fifo: running deferred reset of engine {} for {}", engine.id, reset.target);
                self.reset_engine(engine);
                runlists |= 1 << engine.runlist_id;
            }
        }

        self.deferred.lock().retain(|r| !due.contains(r));
        self.set_sched_disabled(runlists & !self.deferred_runlists(), false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::{ChannelBuilder, ChannelRef, DebugSessions, FifoConfig, PollConfig};
    use crate::hw::device::Device;
    use crate::hw::memory::HostMemory;
    use crate::hw::regs::INST_PTR_SHIFT;
    use crate::hw::sim::SimRegisters;
    use std::sync::{Arc, mpsc};
    use std::thread;
    use std::time::Duration;

    const GR: u32 = 0;

    fn gr_fifo(sim: &Arc<SimRegisters>, config: FifoConfig) -> Arc<Fifo> {
        let config = config
            .with_engine(EngineInfo::new(GR, EngineKind::Graphics, 0))
            .with_poll(PollConfig::default().with_timeout(Duration::from_millis(20)));
        Fifo::new(Device::new(sim.clone()), Arc::new(HostMemory), config).unwrap()
    }

    fn bind_active(fifo: &Arc<Fifo>, chid: u32) -> ChannelRef {
        let ch = fifo
            .bind_channel(
                ChannelBuilder::new(0)
                    .with_slot(chid)
                    .with_inst_block(u64::from(chid) << 20),
            )
            .unwrap();
        fifo.update_runlist(0, Some(chid), true, true).unwrap();
        ch
    }

    /// Holds the reset lock on another thread until the returned handle is joined.
    fn hold_reset_lock(fifo: &Arc<Fifo>) -> thread::JoinHandle<()> {
        let (held_tx, held_rx) = mpsc::channel();
        let fifo = Arc::clone(fifo);
        let holder = thread::spawn(move || {
            let _reset = fifo.reset_lock.lock();
            held_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(20));
        });
        held_rx.recv().unwrap();
        holder
    }

    #[test]
    fn test_fault_reset_waits_for_running_reset() {
        let sim = Arc::new(SimRegisters::new());
        let fifo = gr_fifo(&sim, FifoConfig::new(8, 2));
        let ch = bind_active(&fifo, 3);

        let holder = hold_reset_lock(&fifo);
        sim.raise_mmu_fault(
            GR,
            RawMmuFault {
                inst: (3u32 << 20) >> INST_PTR_SHIFT,
                ..RawMmuFault::default()
            },
        );
        fifo.service_interrupts();
        holder.join().unwrap();

        assert_eq!(ch.state(), ChannelState::Faulted);
        assert_eq!(sim.resets(), vec![GR]);
        assert_eq!(fifo.device().sched_disabled(), 0);
    }

    #[test]
    fn test_deferred_reset_survives_contention() {
        let sim = Arc::new(SimRegisters::new());
        let sessions = Arc::new(DebugSessions::new());
        let fifo = gr_fifo(
            &sim,
            FifoConfig::new(8, 2).with_defer_policy(sessions.clone()),
        );
        let ch = bind_active(&fifo, 2);
        sessions.attach(Target::Channel(2));

        sim.raise_mmu_fault(
            GR,
            RawMmuFault {
                inst: (2u32 << 20) >> INST_PTR_SHIFT,
                info: MMU_FAULT_INFO_ENGINE_SUBID_GPC,
                ..RawMmuFault::default()
            },
        );
        fifo.service_interrupts();
        assert!(fifo.deferred_reset_pending());

        let holder = hold_reset_lock(&fifo);
        drop(ch);
        holder.join().unwrap();

        assert_eq!(sim.resets(), vec![GR]);
        assert!(!fifo.deferred_reset_pending());
        assert_eq!(fifo.device().sched_disabled(), 0);
    }

    #[test]
    fn test_mmu_fault_decode() {
        let raw = RawMmuFault {
            inst: 0x42,
            addr_lo: 0xdead_b000,
            addr_hi: 0x1,
            info: 0x3 | MMU_FAULT_INFO_WRITE | (5 << MMU_FAULT_INFO_CLIENT_SHIFT)
                | MMU_FAULT_INFO_ENGINE_SUBID_GPC,
        };
        let info = MmuFaultInfo::decode(2, raw);
        assert_eq!(info.addr, 0x1_dead_b000);
        assert_eq!(info.kind, 3);
        assert!(info.write);
        assert_eq!(info.client, 5);
        assert!(info.gpc);
        assert_eq!(info.inst, 0x42);
    }

    #[test]
    fn test_bits_iterates_set_bits() {
        assert_eq!(bits(0b1010_0001).collect::<Vec<_>>(), vec![0, 5, 7]);
        assert_eq!(bits(0).count(), 0);
    }
}
