use crate::error::TargetKind;
use crate::hw::regs::{
    CTX_STATUS_CTXSW_LOAD, CTX_STATUS_CTXSW_SAVE, CTX_STATUS_CTXSW_SWITCH, CTX_STATUS_INVALID,
    CTX_STATUS_VALID, STATUS_BUSY, STATUS_CTX_MASK, STATUS_CTX_SHIFT, STATUS_FAULTED,
    STATUS_ID_MASK, STATUS_ID_TYPE_TSG, STATUS_NEXT_ID_SHIFT, STATUS_NEXT_ID_TYPE_TSG,
};
use std::fmt;

/// Class of execution unit. Only graphics faults are eligible for deferred reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Graphics,
    Copy,
    Other,
}

/// Static description of one engine and the units wired to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineInfo {
    pub id: u32,
    pub kind: EngineKind,
    pub runlist_id: u32,
    /// Command-fetch (PBDMA) unit feeding the engine.
    pub pbdma_id: u32,
    pub intr_id: u32,
    /// Bit in the master enable register that holds the engine in reset.
    pub reset_id: u32,
    /// Bit this engine occupies in the MMU fault ID mask.
    pub mmu_fault_id: u32,
}

impl EngineInfo {
    /// An engine whose unit IDs all default to its engine ID.
    #[must_use]
    pub const fn new(id: u32, kind: EngineKind, runlist_id: u32) -> Self {
        Self {
            id,
            kind,
            runlist_id,
            pbdma_id: id,
            intr_id: id,
            reset_id: id,
            mmu_fault_id: id,
        }
    }

    #[must_use]
    pub const fn with_pbdma(mut self, pbdma_id: u32) -> Self {
        self.pbdma_id = pbdma_id;
        self
    }

    #[must_use]
    pub const fn with_intr(mut self, intr_id: u32) -> Self {
        self.intr_id = intr_id;
        self
    }

    #[must_use]
    pub const fn with_reset(mut self, reset_id: u32) -> Self {
        self.reset_id = reset_id;
        self
    }

    #[must_use]
    pub const fn with_mmu_fault_id(mut self, fault_id: u32) -> Self {
        self.mmu_fault_id = fault_id;
        self
    }
}

/// A schedulable context: one channel or one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Channel(u32),
    Group(u32),
}

impl Target {
    const fn from_status(id: u32, is_group: bool) -> Self {
        if is_group {
            Self::Group(id)
        } else {
            Self::Channel(id)
        }
    }

    #[must_use]
    pub const fn id(self) -> u32 {
        match self {
            Self::Channel(id) | Self::Group(id) => id,
        }
    }

    #[must_use]
    pub const fn kind(self) -> TargetKind {
        match self {
            Self::Channel(_) => TargetKind::Channel,
            Self::Group(_) => TargetKind::Group,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

/// Context-switch state of an engine or PBDMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxStatus {
    Invalid,
    Valid,
    /// Switching in `next_id` from nothing.
    Load,
    /// Switching out `id`.
    Save,
    /// Switching from `id` to `next_id`.
    Switch,
    Unknown(u32),
}

impl CtxStatus {
    const fn decode(raw: u32) -> Self {
        match raw {
            CTX_STATUS_INVALID => Self::Invalid,
            CTX_STATUS_VALID => Self::Valid,
            CTX_STATUS_CTXSW_LOAD => Self::Load,
            CTX_STATUS_CTXSW_SAVE => Self::Save,
            CTX_STATUS_CTXSW_SWITCH => Self::Switch,
            other => Self::Unknown(other),
        }
    }

    const fn encode(self) -> u32 {
        match self {
            Self::Invalid => CTX_STATUS_INVALID,
            Self::Valid => CTX_STATUS_VALID,
            Self::Load => CTX_STATUS_CTXSW_LOAD,
            Self::Save => CTX_STATUS_CTXSW_SAVE,
            Self::Switch => CTX_STATUS_CTXSW_SWITCH,
            Self::Unknown(raw) => raw,
        }
    }

    /// A context switch is in flight.
    #[must_use]
    pub const fn switching(self) -> bool {
        matches!(self, Self::Load | Self::Save | Self::Switch)
    }
}

/// Decoded engine or PBDMA status word. Both units share the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitStatus {
    pub id: u32,
    pub id_is_group: bool,
    pub next_id: u32,
    pub next_is_group: bool,
    pub ctx: CtxStatus,
    pub faulted: bool,
    pub busy: bool,
}

impl UnitStatus {
    #[must_use]
    pub const fn decode(raw: u32) -> Self {
        Self {
            id: raw & STATUS_ID_MASK,
            id_is_group: raw & STATUS_ID_TYPE_TSG != 0,
            next_id: (raw >> STATUS_NEXT_ID_SHIFT) & STATUS_ID_MASK,
            next_is_group: raw & STATUS_NEXT_ID_TYPE_TSG != 0,
            ctx: CtxStatus::decode((raw >> STATUS_CTX_SHIFT) & STATUS_CTX_MASK),
            faulted: raw & STATUS_FAULTED != 0,
            busy: raw & STATUS_BUSY != 0,
        }
    }

    #[must_use]
    pub const fn to_raw(self) -> u32 {
        let mut raw = (self.id & STATUS_ID_MASK)
            | ((self.next_id & STATUS_ID_MASK) << STATUS_NEXT_ID_SHIFT)
            | ((self.ctx.encode() & STATUS_CTX_MASK) << STATUS_CTX_SHIFT);
        if self.id_is_group {
            raw |= STATUS_ID_TYPE_TSG;
        }
        if self.next_is_group {
            raw |= STATUS_NEXT_ID_TYPE_TSG;
        }
        if self.faulted {
            raw |= STATUS_FAULTED;
        }
        if self.busy {
            raw |= STATUS_BUSY;
        }
        raw
    }

    /// A unit running `target` with a valid context.
    #[must_use]
    pub const fn running(target: Target) -> Self {
        Self {
            id: target.id(),
            id_is_group: matches!(target, Target::Group(_)),
            next_id: 0,
            next_is_group: false,
            ctx: CtxStatus::Valid,
            faulted: false,
            busy: true,
        }
    }

    /// A unit switching from `from` (if any) to `to`.
    #[must_use]
    pub const fn switching_to(from: Option<Target>, to: Target) -> Self {
        let (id, id_is_group, ctx) = match from {
            Some(t) => (t.id(), matches!(t, Target::Group(_)), CtxStatus::Switch),
            None => (0, false, CtxStatus::Load),
        };
        Self {
            id,
            id_is_group,
            next_id: to.id(),
            next_is_group: matches!(to, Target::Group(_)),
            ctx,
            faulted: false,
            busy: true,
        }
    }

    const fn current(&self) -> Target {
        Target::from_status(self.id, self.id_is_group)
    }

    const fn next(&self) -> Target {
        Target::from_status(self.next_id, self.next_is_group)
    }

    /// The context occupying the unit for preemption purposes: the outgoing one while valid or
    /// saving, the incoming one while loading or switching.
    #[must_use]
    pub const fn resident(&self) -> Option<Target> {
        match self.ctx {
            CtxStatus::Valid | CtxStatus::Save => Some(self.current()),
            CtxStatus::Load | CtxStatus::Switch => Some(self.next()),
            CtxStatus::Invalid | CtxStatus::Unknown(_) => None,
        }
    }

    /// The context a fault on this unit is attributed to: the incoming one while loading,
    /// otherwise the current one.
    #[must_use]
    pub const fn faulting(&self) -> Option<Target> {
        match self.ctx {
            CtxStatus::Load => Some(self.next()),
            CtxStatus::Invalid | CtxStatus::Unknown(_) => None,
            CtxStatus::Valid | CtxStatus::Save | CtxStatus::Switch => Some(self.current()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_raw_round_trip() {
        let st = UnitStatus::switching_to(Some(Target::Channel(5)), Target::Group(2));
        let back = UnitStatus::decode(st.to_raw());
        assert_eq!(back, st);
        assert_eq!(back.ctx, CtxStatus::Switch);
    }

    #[test]
    fn test_resident_and_faulting_differ_mid_switch() {
        let st = UnitStatus::switching_to(Some(Target::Channel(5)), Target::Channel(9));
        assert_eq!(st.resident(), Some(Target::Channel(9)));
        assert_eq!(st.faulting(), Some(Target::Channel(5)));

        let load = UnitStatus::switching_to(None, Target::Group(1));
        assert_eq!(load.resident(), Some(Target::Group(1)));
        assert_eq!(load.faulting(), Some(Target::Group(1)));

        assert_eq!(UnitStatus::decode(0).resident(), None);
    }
}
