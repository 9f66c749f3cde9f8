use super::Fifo;
use super::channel::{ChannelError, ChannelState};
use super::config::Timing;
use super::engine::{EngineInfo, Target, UnitStatus};
use crate::error::{FifoError, FifoResult};
use crate::utils::poll_with_backoff;
use std::time::Duration;

impl Fifo {
    /// Polls `done` with the configured backoff until it holds or `timeout` passes.
    pub(super) fn wait_hw(&self, timeout: Duration, done: impl FnMut() -> bool) -> bool {
        match self.config.timing {
            Timing::Simulated => true,
            Timing::Wallclock => poll_with_backoff(
                self.config.poll.initial_delay,
                self.config.poll.max_delay,
                timeout,
                done,
            ),
        }
    }

    pub(super) fn set_sched_disabled(&self, runlist_mask: u32, disabled: bool) {
        if runlist_mask == 0 {
            return;
        }
        let _rmw = self.sched_disable_lock.lock();
        self.device.set_sched_disabled(runlist_mask, disabled);
    }

    pub(super) fn engine(&self, engine_id: u32) -> FifoResult<&EngineInfo> {
        self.config
            .engines
            .iter()
            .find(|e| e.id == engine_id)
            .ok_or(FifoError::InvalidEngine(engine_id))
    }

    // ===========================================================================================
    // Preemption
    // ===========================================================================================

    pub fn preempt_channel(&self, chid: u32) -> FifoResult<()> {
        if self.channel(chid)?.state() == ChannelState::Free {
            return Err(FifoError::InvalidChannel(chid));
        }
        self.preempt_target(Target::Channel(chid))
    }

    pub fn preempt_group(&self, gid: u32) -> FifoResult<()> {
        self.group(gid)?;
        self.preempt_target(Target::Group(gid))
    }

    /// Issues a preempt and waits for it. A preempt that never completes means the context
    /// cannot be stopped by request, so it is recovered and [`FifoError::PreemptFailed`]
    /// is returned.
    fn preempt_target(&self, target: Target) -> FifoResult<()> {
        let done = {
            let _preempt = self.preempt_lock.lock();
            self.device.issue_preempt(target.id(), target.kind());
            self.wait_hw(self.config.poll.preempt_timeout, || {
                !self.device.preempt_pending()
            })
        };
        if done {
            log::trace!("fifo: preempted {target}");
            return Ok(());
        }

        log::error!("fifo: preempt of {target} timed out");
        self.recover_target(target, ChannelError::IdleTimeout);
        Err(FifoError::PreemptFailed {
            id: target.id(),
            kind: target.kind(),
        })
    }

    // ===========================================================================================
    // Engine activity
    // ===========================================================================================

    /// Stops the scheduler from picking new work for an engine's runlist and preempts what is
    /// resident on its PBDMA and on the engine itself.
    ///
    /// A busy engine is refused with [`FifoError::EngineBusy`] unless `wait_for_idle` is set,
    /// in which case the engine is also waited on after the preempts. On any failure the
    /// runlist is re-enabled before the error is returned.
    pub fn disable_engine_activity(&self, engine_id: u32, wait_for_idle: bool) -> FifoResult<()> {
        let engine = *self.engine(engine_id)?;
        let _sched = self.sched_lock.lock();

        let status = UnitStatus::decode(self.device.engine_status(engine.id));
        if status.busy && !wait_for_idle {
            return Err(FifoError::EngineBusy(engine.id));
        }

        self.set_sched_disabled(1 << engine.runlist_id, true);
        if let Err(e) = self.quiesce_engine(&engine, wait_for_idle) {
            log::error!("fifo: disabling engine {} failed: {e}", engine.id);
            self.set_sched_disabled(1 << engine.runlist_id, false);
            return Err(e);
        }
        log::debug!("fifo: engine {} activity disabled", engine.id);
        Ok(())
    }

    fn quiesce_engine(&self, engine: &EngineInfo, wait_for_idle: bool) -> FifoResult<()> {
        let pbdma = UnitStatus::decode(self.device.pbdma_status(engine.pbdma_id)).resident();
        if let Some(target) = pbdma {
            self.preempt_target(target)?;
        }

        let resident = UnitStatus::decode(self.device.engine_status(engine.id)).resident();
        if let Some(target) = resident.filter(|t| Some(*t) != pbdma) {
            self.preempt_target(target)?;
        }

        if wait_for_idle {
            self.wait_engine_idle(engine.id)?;
        }
        Ok(())
    }

    pub fn enable_engine_activity(&self, engine_id: u32) -> FifoResult<()> {
        let engine = self.engine(engine_id)?;
        let _sched = self.sched_lock.lock();
        self.set_sched_disabled(1 << engine.runlist_id, false);
        log::debug!("fifo: engine {} activity enabled", engine.id);
        Ok(())
    }

    /// Disables every engine; if one fails, the ones already disabled are re-enabled.
    pub fn disable_all_engine_activity(&self, wait_for_idle: bool) -> FifoResult<()> {
        let _sched = self.sched_lock.lock();
        let ids: Vec<u32> = self.config.engines.iter().map(|e| e.id).collect();
        for (done, &id) in ids.iter().enumerate() {
            if let Err(e) = self.disable_engine_activity(id, wait_for_idle) {
                for &prev in &ids[..done] {
                    if let Err(err) = self.enable_engine_activity(prev) {
                        log::error!("fifo: re-enabling engine {prev}: {err}");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn enable_all_engine_activity(&self) -> FifoResult<()> {
        let _sched = self.sched_lock.lock();
        for engine in &self.config.engines {
            self.enable_engine_activity(engine.id)?;
        }
        Ok(())
    }

    /// Waits for an engine to go idle; if it never does, whatever runs on it is recovered
    /// and [`FifoError::EngineIdleFailed`] is returned.
    pub fn wait_engine_idle(&self, engine_id: u32) -> FifoResult<()> {
        let engine = *self.engine(engine_id)?;
        let idle = self.wait_hw(self.config.poll.idle_timeout, || {
            !UnitStatus::decode(self.device.engine_status(engine.id)).busy
        });
        if idle {
            return Ok(());
        }

        log::error!("fifo: engine {} did not go idle", engine.id);
        self.recover_engine(&engine, ChannelError::IdleTimeout);
        Err(FifoError::EngineIdleFailed { engine: engine.id })
    }
}
