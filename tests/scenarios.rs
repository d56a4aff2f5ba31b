//! End-to-end flows through the public monitor API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use v86mon::devices::pic::{MASTER_CMD, MASTER_DATA, SLAVE_CMD, SLAVE_DATA};
use v86mon::devices::pit::{PIT_CHANNEL0, PIT_COMMAND};
use v86mon::{IoData, IrqOutcome, Monitor, MonitorConfig, MonitorError, VmId};

fn monitor() -> Monitor {
    Monitor::new(MonitorConfig {
        max_vms: 4,
        guest_memory_size: 0x2_0000,
        ..Default::default()
    })
    .unwrap()
}

fn out(monitor: &Monitor, vm: VmId, port: u16, value: u8) {
    monitor.io_out(vm, port, &IoData::byte(value)).unwrap();
}

fn inb(monitor: &Monitor, vm: VmId, port: u16) -> u8 {
    let mut data = IoData::new(1);
    monitor.io_in(vm, port, &mut data).unwrap();
    data.get(0).unwrap()
}

fn program_pit(monitor: &Monitor, vm: VmId, command: u8, reload: u16) {
    let [lo, hi] = reload.to_le_bytes();
    out(monitor, vm, PIT_COMMAND, command);
    out(monitor, vm, PIT_CHANNEL0, lo);
    out(monitor, vm, PIT_CHANNEL0, hi);
}

/// VM with the standard devices and a timer handler in its IVT.
fn booted_vm(monitor: &Monitor) -> VmId {
    let vm = monitor.create_vm().unwrap();
    monitor.install_standard_devices(vm).unwrap();
    monitor
        .with_guest(vm, |g| g.memory().write_ivt(0x08, 0xF000, 0xFEA5))
        .unwrap()
        .unwrap();
    vm
}

#[test]
fn test_single_pic_timer_interrupt_cycle() {
    let monitor = monitor();
    let vm = booted_vm(&monitor);

    // Single 8259, vectors at 0x08, only IRQ0 unmasked.
    out(&monitor, vm, MASTER_CMD, 0x13);
    out(&monitor, vm, MASTER_DATA, 0x08);
    out(&monitor, vm, MASTER_DATA, 0x01);
    out(&monitor, vm, MASTER_DATA, 0xFE);
    assert_eq!(inb(&monitor, vm, MASTER_DATA), 0xFE);
    monitor.if_enabled(vm).unwrap();

    assert_eq!(
        monitor.simulate_irq(vm, 0).unwrap(),
        IrqOutcome::Delivered { line: 0, vector: 0x08 }
    );
    let frame = monitor.with_guest(vm, |g| *g.frame()).unwrap();
    assert_eq!((frame.cs, frame.ip), (0xF000, 0xFEA5));

    // A second request while IRQ0 is in service is dropped.
    assert_eq!(monitor.simulate_irq(vm, 0).unwrap(), IrqOutcome::Dropped);

    out(&monitor, vm, MASTER_CMD, 0x20);
    monitor.guest_iret(vm).unwrap();
    assert_eq!(monitor.get_vpic(vm).unwrap().master().isr(), 0);

    assert_eq!(
        monitor.simulate_irq(vm, 0).unwrap(),
        IrqOutcome::Delivered { line: 0, vector: 0x08 }
    );
    assert_eq!(monitor.with_guest(vm, |g| g.injected()).unwrap(), 2);
}

#[test]
fn test_masked_irq_stays_pending() {
    let monitor = monitor();
    let vm = booted_vm(&monitor);
    out(&monitor, vm, MASTER_DATA, 0xFE);
    monitor.if_enabled(vm).unwrap();

    assert_eq!(monitor.simulate_irq(vm, 3).unwrap(), IrqOutcome::Pending);
    assert_eq!(monitor.with_guest(vm, |g| g.injected()).unwrap(), 0);
    assert!(monitor.get_vpic(vm).unwrap().is_pending(3));

    // Unmasking releases it.
    out(&monitor, vm, MASTER_DATA, 0xF6);
    assert_eq!(monitor.with_guest(vm, |g| g.last_vector()).unwrap(), Some(0x0B));
}

#[test]
fn test_cascaded_pic_reprogrammed_bases() {
    let monitor = monitor();
    let vm = booted_vm(&monitor);

    for (port, value) in [
        (MASTER_CMD, 0x11),
        (MASTER_DATA, 0x20),
        (MASTER_DATA, 0x04),
        (MASTER_DATA, 0x01),
        (SLAVE_CMD, 0x11),
        (SLAVE_DATA, 0x28),
        (SLAVE_DATA, 0x02),
        (SLAVE_DATA, 0x01),
    ] {
        out(&monitor, vm, port, value);
    }
    monitor.if_enabled(vm).unwrap();

    assert_eq!(
        monitor.simulate_irq(vm, 12).unwrap(),
        IrqOutcome::Delivered { line: 12, vector: 0x2C }
    );
    let pic = monitor.get_vpic(vm).unwrap();
    assert_eq!(pic.slave().isr(), 1 << 4);
    assert_eq!(pic.master().isr(), 1 << 2);

    out(&monitor, vm, SLAVE_CMD, 0x20);
    out(&monitor, vm, MASTER_CMD, 0x20);
    let pic = monitor.get_vpic(vm).unwrap();
    assert_eq!((pic.master().isr(), pic.slave().isr()), (0, 0));
}

#[test]
fn test_pit_rate_generator_fires_per_reload() {
    let monitor = monitor();
    let vm = booted_vm(&monitor);
    out(&monitor, vm, MASTER_DATA, 0xFE);
    monitor.if_enabled(vm).unwrap();

    program_pit(&monitor, vm, 0x34, 100);
    monitor.timer_tick(250);

    let pit = monitor.get_vpit(vm, 0).unwrap();
    assert_eq!(pit.expirations, 2);
    // The first expiry was delivered; the second found IRQ0 still in service.
    assert_eq!(monitor.get_vpic(vm).unwrap().delivered(), 1);

    out(&monitor, vm, MASTER_CMD, 0x20);
    monitor.guest_iret(vm).unwrap();
    monitor.timer_tick(50);
    assert_eq!(monitor.get_vpit(vm, 0).unwrap().expirations, 3);
    assert_eq!(monitor.get_vpic(vm).unwrap().delivered(), 2);
}

#[test]
fn test_one_shot_timer_reaches_guest_after_block() {
    let monitor = monitor();
    let vm = booted_vm(&monitor);
    out(&monitor, vm, MASTER_DATA, 0xFE);
    monitor.if_enabled(vm).unwrap();
    monitor.set_resumable(vm, false).unwrap();

    // Mode 0 fires once; the guest is blocked when it does.
    program_pit(&monitor, vm, 0x30, 100);
    monitor.timer_tick(150);
    assert_eq!(monitor.get_vpit(vm, 0).unwrap().expirations, 1);
    assert!(monitor.get_vpic(vm).unwrap().is_pending(0));

    monitor.set_resumable(vm, true).unwrap();
    assert_eq!(monitor.if_enabled(vm).unwrap(), Some((0, 0x08)));
    let frame = monitor.with_guest(vm, |g| *g.frame()).unwrap();
    assert_eq!((frame.cs, frame.ip), (0xF000, 0xFEA5));
}

#[test]
fn test_timer_kills_guest_with_stack_outside_ram() {
    let monitor = monitor();
    let vm = booted_vm(&monitor);
    let healthy = booted_vm(&monitor);
    for id in [vm, healthy] {
        out(&monitor, id, MASTER_DATA, 0xFE);
        monitor.if_enabled(id).unwrap();
        program_pit(&monitor, id, 0x34, 100);
    }
    monitor.with_guest(vm, |g| g.frame_mut().ss = 0xF000).unwrap();

    monitor.timer_tick(150);
    assert!(!monitor.is_alive(vm));
    assert_eq!(monitor.vm_ids(), vec![healthy]);
    assert_eq!(monitor.get_vpic(healthy).unwrap().delivered(), 1);
}

#[test]
fn test_vms_are_isolated() {
    let monitor = monitor();
    let a = booted_vm(&monitor);
    let b = booted_vm(&monitor);

    out(&monitor, a, MASTER_DATA, 0x5A);
    assert_eq!(inb(&monitor, a, MASTER_DATA), 0x5A);
    assert_eq!(inb(&monitor, b, MASTER_DATA), 0x00);

    program_pit(&monitor, a, 0x34, 10);
    monitor.timer_tick(100);
    assert_eq!(monitor.get_vpit(a, 0).unwrap().expirations, 10);
    assert_eq!(monitor.get_vpit(b, 0).unwrap().expirations, 0);
}

#[test]
fn test_killed_vm_rejects_every_entry_point() {
    let monitor = monitor();
    let vm = booted_vm(&monitor);
    monitor.kill_vm(vm);

    let mut data = IoData::new(1);
    assert!(matches!(
        monitor.io_in(vm, MASTER_DATA, &mut data),
        Err(MonitorError::NoSuchVm(_))
    ));
    assert!(matches!(
        monitor.simulate_irq(vm, 0),
        Err(MonitorError::NoSuchVm(_))
    ));
    assert!(monitor.get_io_handler(vm, MASTER_CMD).is_none());

    // The slot is reused under a new identity.
    let next = monitor.create_vm().unwrap();
    assert_eq!(next.slot(), vm.slot());
    assert_ne!(next, vm);
}

#[test]
fn test_kill_races_with_timer() {
    let monitor = monitor();
    let vm = booted_vm(&monitor);

    let fired = Arc::new(AtomicU64::new(0));
    let counter = fired.clone();
    monitor
        .set_pit_callback(
            vm,
            0,
            Some(Box::new(move |_vm: VmId, _ch: u8| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    program_pit(&monitor, vm, 0x34, 10);

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..20_000 {
                monitor.timer_tick(1);
            }
        });
        s.spawn(|| {
            while fired.load(Ordering::SeqCst) < 50 {
                std::hint::spin_loop();
            }
            monitor.kill_vm(vm);
        });
    });

    assert!(!monitor.is_alive(vm));
    let after = fired.load(Ordering::SeqCst);
    assert!(after >= 50);

    // No callback runs once the kill has returned, and the callback is gone.
    monitor.timer_tick(1000);
    assert_eq!(fired.load(Ordering::SeqCst), after);
    assert_eq!(Arc::strong_count(&fired), 1);
}

#[test]
fn test_dma_channel_programmed_through_ports() {
    let monitor = monitor();
    let vm = booted_vm(&monitor);

    // Channel 2 (floppy): clear flip-flop, address 0x1000, count 0x01FF, page 0x03.
    out(&monitor, vm, 0x0C, 0x00);
    out(&monitor, vm, 0x04, 0x00);
    out(&monitor, vm, 0x04, 0x10);
    out(&monitor, vm, 0x05, 0xFF);
    out(&monitor, vm, 0x05, 0x01);
    out(&monitor, vm, 0x81, 0x03);
    out(&monitor, vm, 0x0B, 0x46);
    out(&monitor, vm, 0x0A, 0x02);

    let info = monitor.get_dma_info(vm, 2).unwrap();
    assert_eq!(info.address, 0x1000);
    assert_eq!(info.length, 0x01FF);
    assert_eq!(info.page, 0x03);
    assert!(!info.masked);
}

#[test]
fn test_shell_reports_running_guests() {
    let monitor = monitor();
    let vm = booted_vm(&monitor);
    program_pit(&monitor, vm, 0x34, 100);
    monitor.timer_tick(300);

    let out = monitor.run_shell("vminfo -pit -pic").unwrap();
    assert!(out.contains("pit 0: mode=2 reload=100 armed=true interval=100 fired=3"));
    assert!(out.contains("pic master: base=0x08"));
    assert!(monitor.run_shell("help").unwrap().contains("dbio -on|-off"));
}
