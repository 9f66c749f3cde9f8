use gpu_fifo::fifo::{
    ChannelBuilder, ChannelError, ChannelRef, ChannelState, DebugSessions, EngineInfo,
    EngineKind, Fifo, FifoConfig, PollConfig, RunlistEntry, Target, Timeslice, Timing, UnitStatus,
};
use gpu_fifo::hw::regs::{
    FIFO_INTR_0_CHANNEL_INTR, FIFO_INTR_0_RUNLIST_EVENT, MMU_FAULT_INFO_ENGINE_SUBID_GPC,
    SCHED_ERROR_CODE_CTXSW_TIMEOUT,
};
use gpu_fifo::hw::{Device, HangMode, HostMemory, RawMmuFault, SimRegisters};
use gpu_fifo::{FifoError, TargetKind};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const GR: u32 = 0;
const CE: u32 = 1;

fn poll() -> PollConfig {
    PollConfig::default()
        .with_delays(Duration::from_micros(1), Duration::from_micros(50))
        .with_timeout(Duration::from_millis(20))
}

fn config() -> FifoConfig {
    FifoConfig::new(16, 4)
        .with_engine(EngineInfo::new(GR, EngineKind::Graphics, 0))
        .with_engine(EngineInfo::new(CE, EngineKind::Copy, 1))
        .with_poll(poll())
}

fn setup_with(config: FifoConfig) -> (Arc<SimRegisters>, Arc<Fifo>) {
    let sim = Arc::new(SimRegisters::new());
    let fifo = Fifo::new(Device::new(sim.clone()), Arc::new(HostMemory), config).unwrap();
    (sim, fifo)
}

fn setup() -> (Arc<SimRegisters>, Arc<Fifo>) {
    setup_with(config())
}

const fn inst(chid: u32) -> u64 {
    0x10_0000 + (chid as u64) * 0x1000
}

fn bind(fifo: &Arc<Fifo>, runlist: u32, chid: u32) -> ChannelRef {
    fifo.bind_channel(
        ChannelBuilder::new(runlist)
            .with_slot(chid)
            .with_inst_block(inst(chid)),
    )
    .unwrap()
}

fn activate(fifo: &Fifo, ch: &ChannelRef) {
    fifo.update_runlist(ch.runlist_id(), Some(ch.id()), true, true)
        .unwrap();
}

fn fault_at(chid: u32, info: u32) -> RawMmuFault {
    RawMmuFault {
        inst: (inst(chid) >> 12) as u32,
        addr_lo: 0x4000,
        addr_hi: 0,
        info,
    }
}

fn idle_with(target: Target) -> u32 {
    UnitStatus {
        busy: false,
        ..UnitStatus::running(target)
    }
    .to_raw()
}

// ===============================================================================================
// Runlists
// ===============================================================================================

#[test]
fn test_runlist_serialization_order() {
    let (sim, fifo) = setup();
    let c5 = bind(&fifo, 0, 5);
    let c7 = bind(&fifo, 0, 7);
    let c9 = bind(&fifo, 0, 9);

    let gid = fifo.create_group(0).unwrap();
    fifo.bind_to_group(gid, &c7).unwrap();
    fifo.bind_to_group(gid, &c9).unwrap();

    for ch in [&c9, &c5, &c7] {
        activate(&fifo, ch);
    }

    assert_eq!(
        fifo.runlist_snapshot(0).unwrap(),
        vec![
            RunlistEntry::Channel { id: 5 },
            RunlistEntry::Group {
                id: gid,
                len: 2,
                timeslice: Timeslice::default(),
            },
            RunlistEntry::Channel { id: 7 },
            RunlistEntry::Channel { id: 9 },
        ]
    );
    assert_eq!(sim.last_submit(0).map(|(_, count)| count), Some(4));
    assert_eq!(c7.state(), ChannelState::Active);
    assert_eq!(fifo.active_channels(0).unwrap(), vec![5, 7, 9]);
}

#[test]
fn test_runlist_buffers_alternate() {
    let (sim, fifo) = setup();
    let a = bind(&fifo, 0, 1);
    let b = bind(&fifo, 0, 2);

    activate(&fifo, &a);
    let first = sim.last_submit(0).unwrap().0;
    activate(&fifo, &b);
    let second = sim.last_submit(0).unwrap().0;
    fifo.update_runlist(0, Some(a.id()), false, true).unwrap();
    let third = sim.last_submit(0).unwrap().0;

    assert_ne!(first, second);
    assert_eq!(first, third);
    assert_eq!(
        fifo.runlist_snapshot(0).unwrap(),
        vec![RunlistEntry::Channel { id: 2 }]
    );
    assert_eq!(a.state(), ChannelState::Bound);
}

#[test]
fn test_repeated_add_is_noop() {
    let (sim, fifo) = setup();
    let a = bind(&fifo, 0, 3);
    activate(&fifo, &a);
    let submits = sim.submits().len();
    activate(&fifo, &a);
    assert_eq!(sim.submits().len(), submits);
}

#[test]
fn test_suspend_and_resume_runlist() {
    let (sim, fifo) = setup();
    let a = bind(&fifo, 1, 4);
    activate(&fifo, &a);

    fifo.update_runlist(1, None, false, true).unwrap();
    assert_eq!(sim.last_submit(1).map(|(_, count)| count), Some(0));
    assert!(fifo.runlist_snapshot(1).unwrap().is_empty());
    assert_eq!(fifo.active_channels(1).unwrap(), vec![4]);

    fifo.update_runlist(1, None, true, true).unwrap();
    assert_eq!(
        fifo.runlist_snapshot(1).unwrap(),
        vec![RunlistEntry::Channel { id: 4 }]
    );
}

#[test]
fn test_runlist_timeout_recovers_engines() {
    let (sim, fifo) = setup();
    let a = bind(&fifo, 0, 1);
    let b = bind(&fifo, 0, 2);
    activate(&fifo, &a);
    sim.set_engine_status(GR, UnitStatus::running(Target::Channel(a.id())).to_raw());

    sim.hang_runlist(0, HangMode::UntilReset);
    activate(&fifo, &b);

    assert_eq!(sim.resets(), vec![GR]);
    assert_eq!(a.state(), ChannelState::Faulted);
    assert_eq!(a.error(), Some(ChannelError::RunlistTimeout));
    assert_eq!(b.state(), ChannelState::Active);
    assert_eq!(fifo.active_channels(0).unwrap(), vec![2]);
}

#[test]
fn test_runlist_second_timeout_is_fatal() {
    let (sim, fifo) = setup();
    let a = bind(&fifo, 1, 6);
    sim.hang_runlist(1, HangMode::Forever);

    assert!(matches!(
        fifo.update_runlist(1, Some(a.id()), true, true),
        Err(FifoError::RunlistUpdateFailed { runlist: 1 })
    ));
    assert_eq!(sim.resets(), vec![CE]);
    assert!(fifo.runlist_snapshot(1).unwrap().is_empty());
}

#[test]
fn test_simulated_timing_skips_waits() {
    let (sim, fifo) = setup_with(config().with_timing(Timing::Simulated));
    let a = bind(&fifo, 0, 1);
    sim.hang_runlist(0, HangMode::Forever);
    sim.hang_preempt(HangMode::Forever);

    activate(&fifo, &a);
    fifo.preempt_channel(a.id()).unwrap();
    assert!(sim.resets().is_empty());
}

// ===============================================================================================
// Faults
// ===============================================================================================

#[test]
fn test_mmu_fault_isolates_group() {
    let (sim, fifo) = setup();
    let lone = bind(&fifo, 0, 1);
    let m1 = bind(&fifo, 0, 2);
    let m2 = bind(&fifo, 0, 3);
    let other = bind(&fifo, 0, 4);

    let gid = fifo.create_group(0).unwrap();
    fifo.bind_to_group(gid, &m1).unwrap();
    fifo.bind_to_group(gid, &m2).unwrap();
    for ch in [&lone, &m1, &m2, &other] {
        activate(&fifo, ch);
    }

    sim.raise_mmu_fault(GR, fault_at(m2.id(), 0x2));
    fifo.service_interrupts();

    assert_eq!(m1.state(), ChannelState::Faulted);
    assert_eq!(m2.state(), ChannelState::Faulted);
    assert!(matches!(m2.error(), Some(ChannelError::MmuFault(info)) if info.addr == 0x4000));
    assert_eq!(lone.state(), ChannelState::Active);
    assert_eq!(other.state(), ChannelState::Active);

    assert_eq!(sim.resets(), vec![GR]);
    assert_eq!(fifo.device().sched_disabled(), 0);
    assert_eq!(sim.intr_status(), 0);
    assert_eq!(
        fifo.runlist_snapshot(0).unwrap(),
        vec![
            RunlistEntry::Channel { id: 1 },
            RunlistEntry::Channel { id: 4 }
        ]
    );
    assert!(matches!(
        fifo.update_runlist(0, Some(m1.id()), true, true),
        Err(FifoError::ChannelFaulted(2))
    ));
}

#[test]
fn test_fault_wakes_waiter_and_ack_restores() {
    let (sim, fifo) = setup();
    let ch = bind(&fifo, 0, 5);
    activate(&fifo, &ch);

    let waiter = ch.clone();
    let handle = thread::spawn(move || waiter.wait_event(Duration::from_secs(5)));
    thread::sleep(Duration::from_millis(20));

    sim.raise_mmu_fault(GR, fault_at(ch.id(), 0));
    fifo.service_interrupts();

    assert!(matches!(
        handle.join().unwrap(),
        Err(FifoError::ChannelFaulted(5))
    ));
    assert!(matches!(
        fifo.enable_channel(&ch),
        Err(FifoError::ChannelFaulted(5))
    ));

    fifo.acknowledge_fault(&ch).unwrap();
    assert_eq!(ch.state(), ChannelState::Bound);
    assert_eq!(ch.error(), None);
    activate(&fifo, &ch);
    assert_eq!(ch.state(), ChannelState::Active);

    assert!(matches!(
        fifo.acknowledge_fault(&ch),
        Err(FifoError::InvalidState(_))
    ));
}

#[test]
fn test_deferred_reset_runs_at_free() {
    let sessions = Arc::new(DebugSessions::new());
    let (sim, fifo) = setup_with(config().with_defer_policy(sessions.clone()));
    let ch = bind(&fifo, 0, 3);
    let bystander = bind(&fifo, 0, 4);
    activate(&fifo, &ch);
    activate(&fifo, &bystander);
    sessions.attach(Target::Channel(ch.id()));

    sim.raise_mmu_fault(GR, fault_at(ch.id(), MMU_FAULT_INFO_ENGINE_SUBID_GPC));
    fifo.service_interrupts();

    assert_eq!(ch.state(), ChannelState::Faulted);
    assert_eq!(bystander.state(), ChannelState::Active);
    assert!(sim.resets().is_empty());
    assert!(fifo.deferred_reset_pending());
    assert_eq!(fifo.device().sched_disabled() & 1, 1);

    drop(ch);
    assert_eq!(sim.resets(), vec![GR]);
    assert!(!fifo.deferred_reset_pending());
    assert_eq!(fifo.device().sched_disabled(), 0);
}

#[test]
fn test_non_gpc_fault_is_not_deferred() {
    let sessions = Arc::new(DebugSessions::new());
    let (sim, fifo) = setup_with(config().with_defer_policy(sessions.clone()));
    let ch = bind(&fifo, 0, 3);
    activate(&fifo, &ch);
    sessions.attach(Target::Channel(ch.id()));

    sim.raise_mmu_fault(GR, fault_at(ch.id(), 0));
    fifo.service_interrupts();

    assert_eq!(sim.resets(), vec![GR]);
    assert!(!fifo.deferred_reset_pending());
}

#[test]
fn test_ctxsw_timeout_recovers_outgoing_context() {
    let (sim, fifo) = setup();
    let out = bind(&fifo, 1, 1);
    let inc = bind(&fifo, 1, 2);
    activate(&fifo, &out);
    activate(&fifo, &inc);

    sim.set_engine_status(
        CE,
        UnitStatus::switching_to(Some(Target::Channel(out.id())), Target::Channel(inc.id()))
            .to_raw(),
    );
    sim.raise_sched_error(SCHED_ERROR_CODE_CTXSW_TIMEOUT);
    fifo.service_interrupts();

    assert_eq!(out.state(), ChannelState::Faulted);
    assert_eq!(out.error(), Some(ChannelError::CtxswTimeout));
    assert_eq!(inc.state(), ChannelState::Active);
    assert_eq!(sim.resets(), vec![CE]);
}

#[test]
fn test_pbdma_fault_recovers_resident_channel() {
    let (sim, fifo) = setup();
    let ch = bind(&fifo, 0, 7);
    activate(&fifo, &ch);
    sim.set_pbdma_status(GR, UnitStatus::running(Target::Channel(ch.id())).to_raw());
    sim.set_engine_status(GR, UnitStatus::running(Target::Channel(ch.id())).to_raw());

    sim.raise_pbdma_intr(GR, 0x10);
    fifo.service_interrupts();

    assert_eq!(
        ch.error(),
        Some(ChannelError::PbdmaFault {
            pbdma: GR,
            intr: 0x10
        })
    );
    assert_eq!(sim.resets(), vec![GR]);
    assert!(fifo.active_channels(0).unwrap().is_empty());
}

#[test]
fn test_recover_group_without_resident_engine() {
    let (sim, fifo) = setup();
    let a = bind(&fifo, 0, 1);
    let b = bind(&fifo, 0, 2);
    let gid = fifo.create_group(0).unwrap();
    fifo.bind_to_group(gid, &a).unwrap();
    fifo.bind_to_group(gid, &b).unwrap();
    activate(&fifo, &a);

    fifo.recover_channel(b.id(), ChannelError::Forced).unwrap();

    assert_eq!(a.state(), ChannelState::Faulted);
    assert_eq!(b.state(), ChannelState::Faulted);
    assert!(sim.resets().is_empty());
    assert!(fifo.runlist_snapshot(0).unwrap().is_empty());
}

#[test]
fn test_interrupt_mask_and_channel_wakeup() {
    let (_sim, fifo) = setup();
    let ch = bind(&fifo, 0, 2);

    assert_eq!(
        fifo.handle_interrupt(FIFO_INTR_0_RUNLIST_EVENT | (1 << 3)),
        FIFO_INTR_0_RUNLIST_EVENT
    );

    let waiter = ch.clone();
    let handle = thread::spawn(move || waiter.wait_event(Duration::from_secs(5)));
    while !handle.is_finished() {
        fifo.handle_interrupt(FIFO_INTR_0_CHANNEL_INTR);
        thread::sleep(Duration::from_millis(5));
    }
    assert!(handle.join().unwrap().is_ok());
    assert!(matches!(
        ch.wait_event(Duration::from_millis(10)),
        Err(FifoError::WaitTimeout)
    ));
}

// ===============================================================================================
// Preemption and engine activity
// ===============================================================================================

#[test]
fn test_preempt_success() {
    let (sim, fifo) = setup();
    let ch = bind(&fifo, 0, 3);
    let gid = fifo.create_group(0).unwrap();

    fifo.preempt_channel(ch.id()).unwrap();
    fifo.preempt_group(gid).unwrap();
    assert_eq!(sim.preempts().len(), 2);
    assert!(matches!(
        fifo.preempt_channel(9),
        Err(FifoError::InvalidChannel(9))
    ));
}

#[test]
fn test_preempt_timeout_recovers_target() {
    let (sim, fifo) = setup();
    let ch = bind(&fifo, 0, 3);
    activate(&fifo, &ch);
    sim.set_engine_status(GR, UnitStatus::running(Target::Channel(ch.id())).to_raw());
    sim.hang_preempt(HangMode::UntilReset);

    assert!(matches!(
        fifo.preempt_channel(ch.id()),
        Err(FifoError::PreemptFailed {
            id: 3,
            kind: TargetKind::Channel
        })
    ));
    assert_eq!(ch.state(), ChannelState::Faulted);
    assert_eq!(ch.error(), Some(ChannelError::IdleTimeout));
    assert_eq!(sim.resets(), vec![GR]);

    // The reset cleared the hang.
    let other = bind(&fifo, 0, 4);
    fifo.preempt_channel(other.id()).unwrap();
}

#[test]
fn test_disable_engine_preempts_pbdma_then_engine() {
    let (sim, fifo) = setup();
    let a = bind(&fifo, 0, 1);
    let b = bind(&fifo, 0, 2);
    sim.set_pbdma_status(GR, idle_with(Target::Channel(b.id())));
    sim.set_engine_status(GR, idle_with(Target::Channel(a.id())));

    fifo.disable_engine_activity(GR, false).unwrap();
    assert_eq!(sim.preempts(), vec![b.id(), a.id()]);
    assert_eq!(fifo.device().sched_disabled(), 1);

    fifo.enable_engine_activity(GR).unwrap();
    assert_eq!(fifo.device().sched_disabled(), 0);
}

#[test]
fn test_disable_engine_skips_duplicate_preempt() {
    let (sim, fifo) = setup();
    let a = bind(&fifo, 1, 1);
    sim.set_pbdma_status(CE, idle_with(Target::Channel(a.id())));
    sim.set_engine_status(CE, idle_with(Target::Channel(a.id())));

    fifo.disable_engine_activity(CE, false).unwrap();
    assert_eq!(sim.preempts().len(), 1);
    assert_eq!(fifo.device().sched_disabled(), 1 << 1);
}

#[test]
fn test_disable_busy_engine() {
    let (sim, fifo) = setup();
    let a = bind(&fifo, 0, 1);
    sim.set_engine_status(GR, UnitStatus::running(Target::Channel(a.id())).to_raw());

    assert!(matches!(
        fifo.disable_engine_activity(GR, false),
        Err(FifoError::EngineBusy(GR))
    ));
    assert_eq!(fifo.device().sched_disabled(), 0);

    // Waiting for idle on an engine that never idles recovers it and rolls back.
    assert!(matches!(
        fifo.disable_engine_activity(GR, true),
        Err(FifoError::EngineIdleFailed { engine: GR })
    ));
    assert_eq!(fifo.device().sched_disabled(), 0);
    assert_eq!(a.state(), ChannelState::Faulted);
}

#[test]
fn test_disable_rolls_back_on_preempt_failure() {
    let (sim, fifo) = setup();
    let a = bind(&fifo, 0, 1);
    sim.set_engine_status(GR, idle_with(Target::Channel(a.id())));
    sim.hang_preempt(HangMode::Forever);

    assert!(matches!(
        fifo.disable_engine_activity(GR, false),
        Err(FifoError::PreemptFailed { id: 1, .. })
    ));
    assert_eq!(fifo.device().sched_disabled(), 0);
}

#[test]
fn test_disable_all_rolls_back() {
    let (sim, fifo) = setup();
    let a = bind(&fifo, 1, 1);
    sim.set_engine_status(CE, UnitStatus::running(Target::Channel(a.id())).to_raw());

    assert!(matches!(
        fifo.disable_all_engine_activity(false),
        Err(FifoError::EngineBusy(CE))
    ));
    assert_eq!(fifo.device().sched_disabled(), 0);

    sim.set_engine_status(CE, 0);
    fifo.disable_all_engine_activity(false).unwrap();
    assert_eq!(fifo.device().sched_disabled(), 0b11);
    fifo.enable_all_engine_activity().unwrap();
    assert_eq!(fifo.device().sched_disabled(), 0);
}

#[test]
fn test_wait_engine_idle() {
    let (sim, fifo) = setup();
    fifo.wait_engine_idle(GR).unwrap();
    assert!(matches!(
        fifo.wait_engine_idle(7),
        Err(FifoError::InvalidEngine(7))
    ));

    let a = bind(&fifo, 0, 1);
    sim.set_engine_status(GR, UnitStatus::running(Target::Channel(a.id())).to_raw());
    assert!(matches!(
        fifo.wait_engine_idle(GR),
        Err(FifoError::EngineIdleFailed { engine: GR })
    ));
    assert_eq!(a.error(), Some(ChannelError::IdleTimeout));
}

// ===============================================================================================
// Channel and group lifecycle
// ===============================================================================================

#[test]
fn test_channel_refcount_lifecycle() {
    let (sim, fifo) = setup();
    let ch = bind(&fifo, 0, 2);
    activate(&fifo, &ch);
    assert_eq!(fifo.free_channel_count(), 15);

    let again = fifo.channel_get(2).unwrap();
    let third = again.clone();
    assert_eq!(ch.refcount(), 3);

    drop(again);
    drop(ch);
    assert_eq!(fifo.channel_state(2).unwrap(), ChannelState::Active);

    drop(third);
    assert_eq!(fifo.channel_state(2).unwrap(), ChannelState::Free);
    assert_eq!(fifo.free_channel_count(), 16);
    assert!(fifo.runlist_snapshot(0).unwrap().is_empty());
    assert_eq!(sim.last_submit(0).map(|(_, count)| count), Some(0));
    assert!(matches!(
        fifo.channel_get(2),
        Err(FifoError::InvalidChannel(2))
    ));
}

#[test]
fn test_channel_binding_errors() {
    let (_sim, fifo) = setup();
    let _held = bind(&fifo, 0, 2);

    assert!(matches!(
        fifo.bind_channel(ChannelBuilder::new(0).with_slot(2)),
        Err(FifoError::ChannelBusy(2))
    ));
    assert!(matches!(
        fifo.bind_channel(ChannelBuilder::new(0).with_slot(99)),
        Err(FifoError::InvalidChannel(99))
    ));
    assert!(matches!(
        fifo.bind_channel(ChannelBuilder::new(5)),
        Err(FifoError::InvalidRunlist(5))
    ));

    let rest: Vec<ChannelRef> = (0..15)
        .map(|_| fifo.bind_channel(ChannelBuilder::new(1)).unwrap())
        .collect();
    assert!(matches!(
        fifo.bind_channel(ChannelBuilder::new(1)),
        Err(FifoError::Exhausted)
    ));
    drop(rest);
    assert_eq!(fifo.free_channel_count(), 15);
}

#[test]
fn test_channel_enable_disable() {
    let (_sim, fifo) = setup();
    let ch = bind(&fifo, 0, 1);
    assert!(!fifo.channel_enabled(&ch));
    fifo.enable_channel(&ch).unwrap();
    assert!(fifo.channel_enabled(&ch));
    fifo.disable_channel(&ch);
    assert!(!fifo.channel_enabled(&ch));
}

#[test]
fn test_group_membership_rules() {
    let (_sim, fifo) = setup();
    let gid = fifo.create_group(0).unwrap();
    let active = bind(&fifo, 0, 1);
    let elsewhere = bind(&fifo, 1, 2);
    let member = bind(&fifo, 0, 3);
    activate(&fifo, &active);

    assert!(matches!(
        fifo.bind_to_group(gid, &active),
        Err(FifoError::InvalidState(_))
    ));
    assert!(matches!(
        fifo.bind_to_group(gid, &elsewhere),
        Err(FifoError::InvalidState(_))
    ));

    fifo.bind_to_group(gid, &member).unwrap();
    assert!(matches!(
        fifo.bind_to_group(gid, &member),
        Err(FifoError::InvalidState(_))
    ));
    assert!(matches!(
        fifo.destroy_group(gid),
        Err(FifoError::InvalidState(_))
    ));

    activate(&fifo, &member);
    fifo.unbind_from_group(&member).unwrap();
    assert_eq!(member.state(), ChannelState::Bound);
    assert_eq!(member.group(), None);
    assert!(fifo.group_members(gid).unwrap().is_empty());

    fifo.destroy_group(gid).unwrap();
    assert!(matches!(
        fifo.group_members(gid),
        Err(FifoError::InvalidGroup(_))
    ));
}

#[test]
fn test_group_timeslice_in_runlist() {
    let (_sim, fifo) = setup();
    let gid = fifo.create_group(1).unwrap();
    let ch = bind(&fifo, 1, 8);
    fifo.bind_to_group(gid, &ch).unwrap();
    let slice = Timeslice {
        scale: 2,
        timeout: 64,
    };
    fifo.set_group_timeslice(gid, slice).unwrap();
    activate(&fifo, &ch);

    assert_eq!(
        fifo.runlist_snapshot(1).unwrap(),
        vec![
            RunlistEntry::Group {
                id: gid,
                len: 1,
                timeslice: slice,
            },
            RunlistEntry::Channel { id: 8 },
        ]
    );

    drop(ch);
    assert!(fifo.group_members(gid).unwrap().is_empty());
    assert!(fifo.runlist_snapshot(1).unwrap().is_empty());
}

#[test]
fn test_deferred_gate_survives_fault_on_sibling_engine() {
    const CE2: u32 = 2;
    let sessions = Arc::new(DebugSessions::new());
    let (sim, fifo) = setup_with(
        FifoConfig::new(16, 4)
            .with_engine(EngineInfo::new(GR, EngineKind::Graphics, 0))
            .with_engine(EngineInfo::new(CE2, EngineKind::Copy, 0))
            .with_poll(poll())
            .with_defer_policy(sessions.clone()),
    );
    let debugged = bind(&fifo, 0, 3);
    let copy = bind(&fifo, 0, 5);
    activate(&fifo, &debugged);
    activate(&fifo, &copy);
    sessions.attach(Target::Channel(debugged.id()));

    sim.raise_mmu_fault(GR, fault_at(debugged.id(), MMU_FAULT_INFO_ENGINE_SUBID_GPC));
    fifo.service_interrupts();
    assert!(fifo.deferred_reset_pending());
    assert_eq!(fifo.device().sched_disabled() & 1, 1);

    sim.set_engine_status(CE2, UnitStatus::running(Target::Channel(copy.id())).to_raw());
    fifo.recover_channel(copy.id(), ChannelError::Forced).unwrap();

    assert_eq!(copy.state(), ChannelState::Faulted);
    assert_eq!(sim.resets(), vec![CE2]);
    assert!(fifo.deferred_reset_pending());
    assert_eq!(fifo.device().sched_disabled() & 1, 1);

    drop(debugged);
    assert_eq!(sim.resets(), vec![CE2, GR]);
    assert!(!fifo.deferred_reset_pending());
    assert_eq!(fifo.device().sched_disabled(), 0);
}

#[test]
fn test_fault_without_inst_block_uses_engine_status() {
    let (sim, fifo) = setup();
    let first = fifo.bind_channel(ChannelBuilder::new(0).with_slot(1)).unwrap();
    let second = fifo.bind_channel(ChannelBuilder::new(0).with_slot(2)).unwrap();
    activate(&fifo, &first);
    activate(&fifo, &second);

    sim.set_engine_status(GR, UnitStatus::running(Target::Channel(second.id())).to_raw());
    sim.raise_mmu_fault(GR, RawMmuFault::default());
    fifo.service_interrupts();

    assert_eq!(first.state(), ChannelState::Active);
    assert_eq!(second.state(), ChannelState::Faulted);
    assert_eq!(fifo.active_channels(0).unwrap(), vec![first.id()]);
}

// ===============================================================================================
// Concurrency
// ===============================================================================================

#[test]
fn test_concurrent_updates_faults_and_quiesce() {
    const ROUNDS: u32 = 200;
    let (sim, fifo) = setup();

    let updaters: Vec<_> = (0..4u32)
        .map(|t| {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || {
                let runlist = t % 2;
                for round in 0..ROUNDS {
                    let ch = fifo
                        .bind_channel(
                            ChannelBuilder::new(runlist).with_inst_block(inst(t * 8 + round % 8)),
                        )
                        .unwrap();
                    let extra = ch.clone();
                    // Fails once the faulting thread has hit this channel.
                    fifo.update_runlist(runlist, Some(ch.id()), true, true).ok();
                    drop(extra);
                    if round % 2 == 0 {
                        fifo.update_runlist(runlist, Some(ch.id()), false, round % 4 == 0)
                            .ok();
                    }
                }
            })
        })
        .collect();

    let faulter = {
        let (sim, fifo) = (Arc::clone(&sim), Arc::clone(&fifo));
        thread::spawn(move || {
            for round in 0..ROUNDS {
                let engine = if round % 2 == 0 { GR } else { CE };
                sim.raise_mmu_fault(engine, fault_at((round * 5) % 32, 0));
                fifo.service_interrupts();
                if fifo.disable_engine_activity(engine, false).is_ok() {
                    fifo.enable_engine_activity(engine).unwrap();
                }
            }
        })
    };

    for handle in updaters {
        handle.join().unwrap();
    }
    faulter.join().unwrap();

    assert_eq!(fifo.free_channel_count(), 16);
    for runlist in fifo.runlist_ids() {
        assert!(fifo.active_channels(runlist).unwrap().is_empty());
        assert!(fifo.runlist_snapshot(runlist).unwrap().is_empty());
    }
    assert!(sim.resets().len() >= ROUNDS as usize);
    assert!(!fifo.deferred_reset_pending());
    assert_eq!(fifo.device().sched_disabled(), 0);
}
