use gpu_fifo::fifo::{
    ChannelBuilder, EngineInfo, EngineKind, Fifo, FifoConfig, RunlistEntry, Timing,
};
use gpu_fifo::hw::{Device, HostMemory, SimRegisters};
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("============================================================");
    println!("              GPU FIFO - Runlist Construction Demo          ");
    println!("============================================================");

    let sim = Arc::new(SimRegisters::new());
    let config = FifoConfig::new(32, 8)
        .with_engine(EngineInfo::new(0, EngineKind::Graphics, 0))
        .with_engine(EngineInfo::new(1, EngineKind::Copy, 1))
        .with_timing(Timing::Simulated);
    let fifo = Fifo::new(Device::new(sim.clone()), Arc::new(HostMemory), config)?;
    println!("[+] Scheduler up, runlists {:?}", fifo.runlist_ids());

    // 1. Bind a few channels on the graphics runlist
    let lone = fifo.bind_channel(ChannelBuilder::new(0).with_slot(5))?;
    let first = fifo.bind_channel(ChannelBuilder::new(0).with_slot(7))?;
    let second = fifo.bind_channel(ChannelBuilder::new(0).with_slot(9))?;
    println!("[+] Bound channels {}, {}, {}", lone.id(), first.id(), second.id());

    // 2. Group two of them
    let gid = fifo.create_group(0)?;
    fifo.bind_to_group(gid, &first)?;
    fifo.bind_to_group(gid, &second)?;
    println!("[+] Group {gid} holds {:?}", fifo.group_members(gid)?);

    // 3. Put everything on the runlist
    for ch in [&lone, &first, &second] {
        fifo.update_runlist(0, Some(ch.id()), true, true)?;
    }

    println!("\n[+] Runlist 0:");
    for (i, entry) in fifo.runlist_snapshot(0)?.iter().enumerate() {
        match entry {
            RunlistEntry::Channel { id } => println!("    {i:>2}: channel {id}"),
            RunlistEntry::Group { id, len, timeslice } => println!(
                "    {i:>2}: group {id} ({len} channels, timeslice {} << {})",
                timeslice.timeout, timeslice.scale
            ),
        }
    }
    if let Some((base, count)) = sim.last_submit(0) {
        println!("    submitted {count} entries from 0x{base:x}");
    }

    // 4. Suspend and resume
    fifo.update_runlist(0, None, false, true)?;
    println!("\n[+] Suspended: {} entries", fifo.runlist_snapshot(0)?.len());
    fifo.update_runlist(0, None, true, true)?;
    println!("[+] Resumed:   {} entries", fifo.runlist_snapshot(0)?.len());

    println!("\n[+] Submission log:");
    for (runlist, base, count) in sim.submits() {
        println!("    runlist {runlist}: {count:>2} entries @ 0x{base:x}");
    }

    Ok(())
}
