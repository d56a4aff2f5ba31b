//! v86mon - drive the virtual-8086 monitor core from the command line.
//!
//! Boots a monitor, creates guest sessions with the standard PC device set,
//! programs each guest's PIC and PIT through trapped port writes the way a
//! BIOS would, then runs the host tick source and reports how many timer
//! interrupts each guest received.

use std::error::Error;
use std::process::ExitCode;

use clap::Parser;
use v86mon::devices::pic::{MASTER_CMD, MASTER_DATA, SLAVE_CMD, SLAVE_DATA};
use v86mon::devices::pit::{PIT_CHANNEL0, PIT_COMMAND};
use v86mon::{IoData, Monitor, MonitorConfig, V86Frame, VmId, PIT_INPUT_HZ};

/// Guest-side IRQ0 handler entry (the BIOS timer handler address).
const TIMER_HANDLER: (u16, u16) = (0xF000, 0xFEA5);

#[derive(Parser, Debug)]
#[command(name = "v86mon")]
#[command(about = "Run virtual-8086 guests against emulated PIC, PIT and DMA controllers")]
struct Args {
    /// Number of guest sessions to create
    #[arg(long, default_value = "1")]
    vms: usize,

    /// Total host ticks to run
    #[arg(long, default_value = "1193182")]
    ticks: u32,

    /// Host ticks per timer interrupt
    #[arg(long, default_value = "1000")]
    step: u32,

    /// PIT channel 0 reload value (0 means 65536)
    #[arg(long, default_value = "11932")]
    reload: u16,

    /// Host tick rate in Hz
    #[arg(long, default_value_t = PIT_INPUT_HZ)]
    tick_hz: u32,

    /// Guest memory per VM in KiB
    #[arg(long, default_value = "1088")]
    memory_kb: u64,

    /// Number of VM slots
    #[arg(long, default_value = "16")]
    max_vms: usize,

    /// Log every trapped port access
    #[arg(long)]
    dbio: bool,

    /// Shell command to run after the guests have run (repeatable)
    #[arg(short, long)]
    cmd: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let monitor = Monitor::new(MonitorConfig {
        max_vms: args.max_vms,
        tick_hz: args.tick_hz,
        guest_memory_size: args.memory_kb * 1024,
        ..Default::default()
    })?;
    monitor.set_io_trace(args.dbio);

    let mut vms = Vec::with_capacity(args.vms);
    for _ in 0..args.vms {
        let vm = monitor.create_vm()?;
        monitor.install_standard_devices(vm)?;
        boot_guest(&monitor, vm, args.reload)?;
        vms.push(vm);
    }
    tracing::info!(vms = vms.len(), reload = args.reload, "guests programmed");

    let step = args.step.max(1);
    let mut remaining = args.ticks;
    while remaining > 0 {
        let n = remaining.min(step);
        monitor.timer_tick(n);
        remaining -= n;
        for &vm in &vms {
            finish_handler(&monitor, vm)?;
        }
    }

    for &vm in &vms {
        let pic = monitor.get_vpic(vm)?;
        let pit = monitor.get_vpit(vm, 0)?;
        println!(
            "{vm}: {} timer expirations, {} interrupts delivered",
            pit.expirations,
            pic.delivered()
        );
    }

    for line in &args.cmd {
        print!("{}", monitor.run_shell(line)?);
    }

    for vm in vms {
        monitor.kill_vm(vm);
    }
    Ok(())
}

/// Set up the guest's IVT, stack and interrupt controllers like a BIOS POST.
fn boot_guest(monitor: &Monitor, vm: VmId, reload: u16) -> Result<(), Box<dyn Error>> {
    monitor.with_guest(vm, |guest| {
        *guest.frame_mut() = V86Frame {
            cs: 0x1000,
            ip: 0x0000,
            ss: 0x9000,
            sp: 0xFFFE,
            ..V86Frame::default()
        };
        guest
            .memory()
            .write_ivt(0x08, TIMER_HANDLER.0, TIMER_HANDLER.1)
    })??;

    let out = |port: u16, value: u8| monitor.io_out(vm, port, &IoData::byte(value));

    // Master: edge triggered, cascaded, vectors 0x08-0x0F, slave on IR2.
    out(MASTER_CMD, 0x11)?;
    out(MASTER_DATA, 0x08)?;
    out(MASTER_DATA, 0x04)?;
    out(MASTER_DATA, 0x01)?;
    // Slave: vectors 0x70-0x77, cascade identity 2.
    out(SLAVE_CMD, 0x11)?;
    out(SLAVE_DATA, 0x70)?;
    out(SLAVE_DATA, 0x02)?;
    out(SLAVE_DATA, 0x01)?;
    // Only the timer is unmasked.
    out(MASTER_DATA, 0xFE)?;
    out(SLAVE_DATA, 0xFF)?;

    // Channel 0, lobyte/hibyte, mode 2 (rate generator).
    let [lo, hi] = reload.to_le_bytes();
    out(PIT_COMMAND, 0x34)?;
    out(PIT_CHANNEL0, lo)?;
    out(PIT_CHANNEL0, hi)?;

    monitor.if_enabled(vm)?;
    Ok(())
}

/// Stand in for the guest's timer handler: acknowledge the PIC and return.
fn finish_handler(monitor: &Monitor, vm: VmId) -> Result<(), Box<dyn Error>> {
    let pic = monitor.get_vpic(vm)?;
    if pic.master().isr() & 0x01 == 0 {
        return Ok(());
    }
    monitor.io_out(vm, MASTER_CMD, &IoData::byte(0x20))?;
    monitor.guest_iret(vm)?;
    Ok(())
}
