use gpu_fifo::fifo::{
    ChannelBuilder, ChannelState, DebugSessions, EngineInfo, EngineKind, Fifo, FifoConfig,
    PollConfig, Target, UnitStatus,
};
use gpu_fifo::hw::regs::MMU_FAULT_INFO_ENGINE_SUBID_GPC;
use gpu_fifo::hw::{Device, HangMode, HostMemory, RawMmuFault, SimRegisters};
use std::sync::Arc;
use std::time::Duration;

const GR: u32 = 0;

fn show(fifo: &Fifo, ids: &[u32]) -> Result<(), Box<dyn std::error::Error>> {
    for &id in ids {
        let state = fifo.channel_state(id)?;
        let marker = if state == ChannelState::Faulted { "!!" } else { "  " };
        println!("    {marker} channel {id:>2}: {state:?}");
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    println!("============================================================");
    println!("               GPU FIFO - Fault Recovery Demo               ");
    println!("============================================================");

    let sim = Arc::new(SimRegisters::new());
    let sessions = Arc::new(DebugSessions::new());
    let config = FifoConfig::new(16, 4)
        .with_engine(EngineInfo::new(GR, EngineKind::Graphics, 0))
        .with_poll(PollConfig::default().with_timeout(Duration::from_millis(50)))
        .with_defer_policy(sessions.clone());
    let fifo = Fifo::new(Device::new(sim.clone()), Arc::new(HostMemory), config)?;

    let mut chans = Vec::new();
    for slot in 1..=4u64 {
        let ch = fifo.bind_channel(
            ChannelBuilder::new(0)
                .with_slot(slot as u32)
                .with_inst_block(slot << 20),
        )?;
        chans.push(ch);
    }
    let gid = fifo.create_group(0)?;
    fifo.bind_to_group(gid, &chans[1])?;
    fifo.bind_to_group(gid, &chans[2])?;
    for ch in &chans {
        fifo.update_runlist(0, Some(ch.id()), true, true)?;
    }
    let ids: Vec<u32> = chans.iter().map(|c| c.id()).collect();
    println!("[+] Channels {ids:?} active, group {gid} = {:?}", fifo.group_members(gid)?);

    // 1. An MMU fault inside the group takes the whole group down
    println!("\n[1] MMU fault on channel {}", ids[2]);
    sim.raise_mmu_fault(
        GR,
        RawMmuFault {
            inst: (3u32 << 20) >> 12,
            addr_lo: 0xbad0_0000,
            ..RawMmuFault::default()
        },
    );
    fifo.service_interrupts();
    show(&fifo, &ids)?;
    println!("    engine resets so far: {:?}", sim.resets());

    // 2. A hung preempt escalates to recovery
    println!("\n[2] Preempt of channel {} never completes", ids[0]);
    sim.set_engine_status(GR, UnitStatus::running(Target::Channel(ids[0])).to_raw());
    sim.hang_preempt(HangMode::UntilReset);
    if let Err(e) = fifo.preempt_channel(ids[0]) {
        println!("    preempt: {e}");
    }
    show(&fifo, &ids)?;

    // 3. A debugger-attached context defers its engine reset until release
    println!("\n[3] Fault on debugged channel {} (reset deferred)", ids[3]);
    sessions.attach(Target::Channel(ids[3]));
    sim.raise_mmu_fault(
        GR,
        RawMmuFault {
            inst: (4u32 << 20) >> 12,
            info: MMU_FAULT_INFO_ENGINE_SUBID_GPC,
            ..RawMmuFault::default()
        },
    );
    fifo.service_interrupts();
    println!("    deferred reset pending: {}", fifo.deferred_reset_pending());

    let resets = sim.resets().len();
    chans.pop();
    println!(
        "    after release: pending {}, resets {} -> {}",
        fifo.deferred_reset_pending(),
        resets,
        sim.resets().len()
    );

    // 4. Acknowledge and reschedule the first channel
    println!("\n[4] Acknowledging channel {}", ids[0]);
    fifo.acknowledge_fault(&chans[0])?;
    fifo.update_runlist(0, Some(ids[0]), true, true)?;
    show(&fifo, &ids[..3])?;

    Ok(())
}
