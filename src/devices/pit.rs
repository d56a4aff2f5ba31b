//! Virtual 8254 programmable interval timer.
//!
//! Three 16-bit down counters share one input clock of 1.193182 MHz. Channel 0
//! drives IRQ0 of the VM's PIC; channels 1 and 2 (DRAM refresh and the PC
//! speaker on real hardware) only report expirations to an optional callback.
//!
//! ```text
//!  port 0x43 (control word)
//!  ┌─────┬─────┬───────┬─────┐
//!  │ SC  │ RW  │ MODE  │ BCD │
//!  │ 7:6 │ 5:4 │  3:1  │  0  │
//!  └─────┴─────┴───────┴─────┘
//!   SC = 0..2 channel, 3 read-back
//!   RW = 0 counter latch, 1 lobyte, 2 hibyte, 3 lobyte then hibyte
//! ```
//!
//! # Timing
//!
//! The counters are not stepped. When a reload value is complete the channel
//! records the global tick count (`start_ticks`) and the reload converted to
//! host ticks (`interval_ticks`). Expiry is evaluated lazily from the tick
//! source whenever the monitor ticks or the guest reads a counter:
//!
//! ```text
//!  start ────── interval ────── interval ──┬─── now
//!        fire #1         fire #2          (remaining, not yet due)
//! ```
//!
//! A periodic channel advances `start_ticks` by exactly one interval per
//! firing, so a batch of ticks covering k intervals fires k times. All tick
//! arithmetic is wrapping.

use std::any::Any;

use super::{merge_byte, select_byte, DeviceBus, DeviceError, DeviceKind, VirtualDevice};
use crate::clock::{ticks_since, TickSource};
use crate::monitor::io::PortRange;
use crate::monitor::registry::VmId;

/// Counter 0 data port.
pub const PIT_CHANNEL0: u16 = 0x40;
/// Control word port.
pub const PIT_COMMAND: u16 = 0x43;

/// Number of counters.
pub const PIT_CHANNELS: usize = 3;

/// A reload value of 0 counts 65536 clocks.
const FULL_COUNT: u32 = 0x1_0000;

/// Callback run when an auxiliary channel expires.
pub type PitCallback = Box<dyn FnMut(VmId, u8) + Send>;

/// Counting mode (control word bits 3:1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PitMode {
    /// Mode 0: one shot, OUT rises at terminal count.
    InterruptOnTerminalCount,
    /// Mode 1: gate-triggered one shot.
    HardwareOneShot,
    /// Mode 2: periodic, one-clock low pulse.
    RateGenerator,
    /// Mode 3: periodic, 50% duty cycle.
    SquareWave,
    /// Mode 4: one shot strobe.
    SoftwareStrobe,
    /// Mode 5: gate-triggered strobe.
    HardwareStrobe,
}

impl PitMode {
    /// Decode control word bits 3:1. Modes 6 and 7 alias 2 and 3.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => PitMode::InterruptOnTerminalCount,
            1 => PitMode::HardwareOneShot,
            2 | 6 => PitMode::RateGenerator,
            3 | 7 => PitMode::SquareWave,
            4 => PitMode::SoftwareStrobe,
            _ => PitMode::HardwareStrobe,
        }
    }

    /// True if the counter reloads itself after each expiry.
    pub fn is_periodic(&self) -> bool {
        matches!(self, PitMode::RateGenerator | PitMode::SquareWave)
    }

    /// Mode number as written by the guest.
    pub fn number(&self) -> u8 {
        match self {
            PitMode::InterruptOnTerminalCount => 0,
            PitMode::HardwareOneShot => 1,
            PitMode::RateGenerator => 2,
            PitMode::SquareWave => 3,
            PitMode::SoftwareStrobe => 4,
            PitMode::HardwareStrobe => 5,
        }
    }
}

/// Byte access pattern of the data port (control word bits 5:4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    LowByte,
    HighByte,
    LowHigh,
}

impl AccessMode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x03 {
            1 => Some(AccessMode::LowByte),
            2 => Some(AccessMode::HighByte),
            3 => Some(AccessMode::LowHigh),
            _ => None,
        }
    }
}

/// Which byte of a lobyte/hibyte sequence comes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchState {
    CounterLow,
    CounterHigh,
}

/// Observable state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PitChannelInfo {
    pub mode: PitMode,
    pub access: AccessMode,
    /// Programmed reload value; 0 means 65536.
    pub reload: u16,
    pub armed: bool,
    pub start_ticks: u32,
    pub interval_ticks: u32,
    /// Expirations since the monitor created the channel.
    pub expirations: u64,
}

#[derive(Debug, Clone)]
struct PitChannel {
    mode: PitMode,
    access: AccessMode,
    /// Low six bits of the last control word.
    control: u8,
    reload: u16,
    write_state: LatchState,
    read_state: LatchState,
    pending_low: u8,
    count_latch: Option<u16>,
    status_latch: Option<u8>,
    /// Reload written but not yet loaded into the counter.
    null_count: bool,
    armed: bool,
    start_ticks: u32,
    interval_ticks: u32,
    expirations: u64,
}

impl PitChannel {
    fn new() -> Self {
        Self {
            mode: PitMode::InterruptOnTerminalCount,
            access: AccessMode::LowHigh,
            control: 0x30,
            reload: 0,
            write_state: LatchState::CounterLow,
            read_state: LatchState::CounterLow,
            pending_low: 0,
            count_latch: None,
            status_latch: None,
            null_count: true,
            armed: false,
            start_ticks: 0,
            interval_ticks: 0,
            expirations: 0,
        }
    }

    fn period(&self) -> u32 {
        match self.reload {
            0 => FULL_COUNT,
            n => u32::from(n),
        }
    }

    fn program(&mut self, control: u8, access: AccessMode) {
        self.mode = PitMode::from_bits(control >> 1);
        self.access = access;
        self.control = control & 0x3F;
        self.write_state = LatchState::CounterLow;
        self.read_state = LatchState::CounterLow;
        self.count_latch = None;
        self.null_count = true;
        self.armed = false;
    }

    fn arm(&mut self, now: u32, clock: &TickSource) {
        self.start_ticks = now;
        self.interval_ticks = clock.pit_to_ticks(self.period());
        self.armed = true;
        self.null_count = false;
    }

    /// True while a two-byte transfer is half done.
    fn mid_sequence(&self) -> bool {
        self.write_state == LatchState::CounterHigh
            || (self.count_latch.is_some() && self.read_state == LatchState::CounterHigh)
    }

    /// Account for every interval elapsed by `now`, returning the number of
    /// firings.
    fn expire(&mut self, now: u32) -> u32 {
        if !self.armed || self.mid_sequence() || self.interval_ticks == 0 {
            return 0;
        }
        let mut fired = 0;
        while ticks_since(now, self.start_ticks) >= self.interval_ticks {
            fired += 1;
            self.expirations += 1;
            if self.mode.is_periodic() {
                self.start_ticks = self.start_ticks.wrapping_add(self.interval_ticks);
            } else {
                self.armed = false;
                break;
            }
        }
        fired
    }

    /// Remaining count at `now`.
    fn current_count(&self, now: u32, clock: &TickSource) -> u16 {
        if !self.armed {
            // Expired one-shots sit at terminal count.
            return if self.null_count { self.reload } else { 0 };
        }
        let period = u64::from(self.period());
        let elapsed = clock.ticks_to_pit(ticks_since(now, self.start_ticks));
        let remaining = if self.mode.is_periodic() {
            period - elapsed % period
        } else {
            period.saturating_sub(elapsed)
        };
        // 65536 reads back as 0.
        remaining as u16
    }

    fn out(&self, now: u32, clock: &TickSource) -> bool {
        match self.mode {
            PitMode::InterruptOnTerminalCount | PitMode::HardwareOneShot => !self.armed,
            PitMode::SquareWave => {
                let count = match self.current_count(now, clock) {
                    0 => FULL_COUNT,
                    n => u32::from(n),
                };
                !self.armed || count > self.period() / 2
            }
            _ => true,
        }
    }

    fn status(&self, now: u32, clock: &TickSource) -> u8 {
        let mut status = self.control;
        if self.out(now, clock) {
            status |= 0x80;
        }
        if self.null_count {
            status |= 0x40;
        }
        status
    }

    fn latch_count(&mut self, now: u32, clock: &TickSource) {
        if self.count_latch.is_none() {
            self.count_latch = Some(self.current_count(now, clock));
            self.read_state = LatchState::CounterLow;
        }
    }

    fn read(&mut self, now: u32, clock: &TickSource) -> u8 {
        if let Some(status) = self.status_latch.take() {
            return status;
        }

        let value = self
            .count_latch
            .unwrap_or_else(|| self.current_count(now, clock));
        let (byte, done) = match self.access {
            AccessMode::LowByte => (select_byte(value, false), true),
            AccessMode::HighByte => (select_byte(value, true), true),
            AccessMode::LowHigh => match self.read_state {
                LatchState::CounterLow => {
                    self.read_state = LatchState::CounterHigh;
                    (select_byte(value, false), false)
                }
                LatchState::CounterHigh => {
                    self.read_state = LatchState::CounterLow;
                    (select_byte(value, true), true)
                }
            },
        };
        if done {
            self.count_latch = None;
        }
        byte
    }

    /// Returns true if the write completed the reload value.
    fn write(&mut self, value: u8, now: u32, clock: &TickSource) -> bool {
        match self.access {
            AccessMode::LowByte => self.reload = u16::from(value),
            AccessMode::HighByte => self.reload = u16::from(value) << 8,
            AccessMode::LowHigh => match self.write_state {
                LatchState::CounterLow => {
                    self.pending_low = value;
                    self.write_state = LatchState::CounterHigh;
                    self.null_count = true;
                    return false;
                }
                LatchState::CounterHigh => {
                    self.reload = merge_byte(u16::from(self.pending_low), value, true);
                    self.write_state = LatchState::CounterLow;
                }
            },
        }
        self.arm(now, clock);
        true
    }

    fn info(&self) -> PitChannelInfo {
        PitChannelInfo {
            mode: self.mode,
            access: self.access,
            reload: self.reload,
            armed: self.armed,
            start_ticks: self.start_ticks,
            interval_ticks: self.interval_ticks,
            expirations: self.expirations,
        }
    }
}

/// The 8254 of one VM.
pub struct VirtualPit {
    channels: [PitChannel; PIT_CHANNELS],
    callbacks: [Option<PitCallback>; PIT_CHANNELS],
}

impl Default for VirtualPit {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VirtualPit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualPit")
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl VirtualPit {
    /// Three idle channels.
    pub fn new() -> Self {
        Self {
            channels: [PitChannel::new(), PitChannel::new(), PitChannel::new()],
            callbacks: [None, None, None],
        }
    }

    /// State of `channel`.
    pub fn info(&self, channel: u8) -> Option<PitChannelInfo> {
        self.channels.get(usize::from(channel)).map(PitChannel::info)
    }

    /// State of all channels.
    pub fn snapshot(&self) -> [PitChannelInfo; PIT_CHANNELS] {
        [
            self.channels[0].info(),
            self.channels[1].info(),
            self.channels[2].info(),
        ]
    }

    /// Run `callback` whenever `channel` expires. Channel 0 still raises IRQ0.
    pub fn set_callback(
        &mut self,
        channel: u8,
        callback: Option<PitCallback>,
    ) -> Result<(), DeviceError> {
        let slot = self
            .callbacks
            .get_mut(usize::from(channel))
            .ok_or(DeviceError::ChannelOutOfRange(channel))?;
        *slot = callback;
        Ok(())
    }

    fn write_control(&mut self, value: u8, bus: &DeviceBus<'_>) -> Result<(), DeviceError> {
        let select = value >> 6;
        if select == 3 {
            self.read_back(value, bus);
            return Ok(());
        }

        let channel = &mut self.channels[usize::from(select)];
        match AccessMode::from_bits(value >> 4) {
            None => channel.latch_count(bus.now(), bus.clock()),
            Some(access) => {
                channel.program(value, access);
                tracing::trace!(
                    vm = %bus.vm(),
                    channel = select,
                    mode = channel.mode.number(),
                    "PIT channel programmed"
                );
            }
        }

        if value & 0x01 != 0 {
            return Err(DeviceError::Unsupported {
                device: "pit",
                what: "BCD counting",
                value,
            });
        }
        Ok(())
    }

    /// Read-back command: bit 5 clear latches counts, bit 4 clear latches
    /// status, bits 3:1 select channels 2..0.
    fn read_back(&mut self, value: u8, bus: &DeviceBus<'_>) {
        let (now, clock) = (bus.now(), bus.clock());
        for (i, channel) in self.channels.iter_mut().enumerate() {
            if value & (0x02 << i) == 0 {
                continue;
            }
            if value & 0x20 == 0 {
                channel.latch_count(now, clock);
            }
            if value & 0x10 == 0 && channel.status_latch.is_none() {
                channel.status_latch = Some(channel.status(now, clock));
            }
        }
    }

    /// Bring every channel up to date with the tick source and fire its
    /// expirations.
    fn run_expiry(&mut self, bus: &mut DeviceBus<'_>) {
        let now = bus.now();
        for index in 0..PIT_CHANNELS {
            let fired = self.channels[index].expire(now);
            for _ in 0..fired {
                self.fire(index as u8, bus);
            }
        }
    }

    fn fire(&mut self, channel: u8, bus: &mut DeviceBus<'_>) {
        if channel == 0 {
            // IRQ0 stays latched on the PIC when the guest cannot take it.
            if let Err(e) = bus.simulate_irq(0) {
                tracing::debug!(vm = %bus.vm(), "timer IRQ deferred: {e}");
            }
        }
        if let Some(callback) = self.callbacks[usize::from(channel)].as_mut() {
            callback(bus.vm(), channel);
        }
    }
}

impl VirtualDevice for VirtualPit {
    fn name(&self) -> &'static str {
        "pit"
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Pit
    }

    fn port_ranges(&self) -> Vec<PortRange> {
        PortRange::inclusive(PIT_CHANNEL0, PIT_COMMAND)
            .into_iter()
            .collect()
    }

    fn io_read(&mut self, port: u16, bus: &mut DeviceBus<'_>) -> u8 {
        match port {
            PIT_CHANNEL0..=0x42 => {
                self.run_expiry(bus);
                let index = usize::from(port - PIT_CHANNEL0);
                self.channels[index].read(bus.now(), bus.clock())
            }
            // The control word register is write-only.
            _ => 0xFF,
        }
    }

    fn io_write(&mut self, port: u16, value: u8, bus: &mut DeviceBus<'_>) {
        match port {
            PIT_COMMAND => {
                if let Err(e) = self.write_control(value, bus) {
                    e.log(bus.vm());
                }
            }
            PIT_CHANNEL0..=0x42 => {
                let index = usize::from(port - PIT_CHANNEL0);
                if self.channels[index].write(value, bus.now(), bus.clock()) {
                    let ch = &self.channels[index];
                    tracing::debug!(
                        vm = %bus.vm(),
                        channel = index,
                        reload = ch.period(),
                        interval_ticks = ch.interval_ticks,
                        "PIT channel armed"
                    );
                }
            }
            _ => {}
        }
    }

    fn tick(&mut self, bus: &mut DeviceBus<'_>) {
        self.run_expiry(bus);
    }

    fn kill(&mut self, _vm: VmId) {
        for channel in self.channels.iter_mut() {
            channel.armed = false;
        }
        self.callbacks = [None, None, None];
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::PIT_INPUT_HZ;
    use crate::devices::pic::VirtualPic;
    use crate::memory::GuestMemory;
    use crate::monitor::guest::Guest;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const VM: VmId = VmId::new(0, 0);

    struct Rig {
        clock: TickSource,
        guest: Guest,
        pit: VirtualPit,
    }

    impl Rig {
        fn new() -> Self {
            Self::at(0)
        }

        fn at(start: u32) -> Self {
            Self {
                clock: TickSource::starting_at(PIT_INPUT_HZ, start),
                guest: Guest::new(GuestMemory::new(0x1000).unwrap()),
                pit: VirtualPit::new(),
            }
        }

        fn write(&mut self, port: u16, value: u8) {
            let mut bus = DeviceBus::new(VM, &self.clock, &mut self.guest, None);
            self.pit.io_write(port, value, &mut bus);
        }

        fn read(&mut self, port: u16) -> u8 {
            let mut bus = DeviceBus::new(VM, &self.clock, &mut self.guest, None);
            self.pit.io_read(port, &mut bus)
        }

        fn advance(&mut self, n: u32) {
            self.clock.advance(n);
            let mut bus = DeviceBus::new(VM, &self.clock, &mut self.guest, None);
            self.pit.tick(&mut bus);
        }

        fn program(&mut self, channel: u8, mode: u8, reload: u16) {
            self.write(PIT_COMMAND, (channel << 6) | 0x30 | (mode << 1));
            let port = PIT_CHANNEL0 + u16::from(channel);
            self.write(port, reload as u8);
            self.write(port, (reload >> 8) as u8);
        }

        fn expirations(&self, channel: u8) -> u64 {
            self.pit.info(channel).unwrap().expirations
        }
    }

    #[test]
    fn test_periodic_batch_fires_exactly_twice() {
        let mut rig = Rig::new();
        rig.program(0, 2, 100);
        rig.advance(250);
        assert_eq!(rig.expirations(0), 2);

        // The remaining 50 ticks carry over.
        rig.advance(50);
        assert_eq!(rig.expirations(0), 3);
    }

    #[test]
    fn test_one_shot_irq_waits_for_blocked_guest() {
        let clock = TickSource::new(PIT_INPUT_HZ);
        let memory = GuestMemory::new(0x2_0000).unwrap();
        memory.write_ivt(0x08, 0xF000, 0xFEA5).unwrap();
        let mut guest = Guest::new(memory);
        guest.frame_mut().ss = 0x1000;
        guest.set_vif(true);
        guest.set_resumable(false);
        let mut pic = VirtualPic::new();
        let mut pit = VirtualPit::new();

        let mut bus = DeviceBus::new(VM, &clock, &mut guest, Some(&mut pic));
        for (port, value) in [(PIT_COMMAND, 0x30), (PIT_CHANNEL0, 100), (PIT_CHANNEL0, 0)] {
            pit.io_write(port, value, &mut bus);
        }
        clock.advance(150);
        let mut bus = DeviceBus::new(VM, &clock, &mut guest, Some(&mut pic));
        pit.tick(&mut bus);

        assert_eq!(pit.info(0).unwrap().expirations, 1);
        assert!(!pit.info(0).unwrap().armed);
        assert!(pic.is_pending(0));

        guest.set_resumable(true);
        assert_eq!(pic.deliver(VM, &mut guest).unwrap(), Some((0, 0x08)));
        assert_eq!(guest.frame().cs, 0xF000);
    }

    #[test]
    fn test_arming_records_interval() {
        let mut rig = Rig::at(1000);
        rig.program(0, 3, 0);
        let info = rig.pit.info(0).unwrap();
        assert!(info.armed);
        assert_eq!(info.mode, PitMode::SquareWave);
        assert_eq!(info.start_ticks, 1000);
        assert_eq!(info.interval_ticks, 65_536);
        assert_eq!(info.reload, 0);
    }

    #[test]
    fn test_one_shot_goes_idle() {
        let mut rig = Rig::new();
        rig.program(0, 0, 100);
        rig.advance(1000);
        assert_eq!(rig.expirations(0), 1);
        assert!(!rig.pit.info(0).unwrap().armed);

        rig.advance(1000);
        assert_eq!(rig.expirations(0), 1);
    }

    #[test]
    fn test_half_written_reload_never_fires() {
        let mut rig = Rig::new();
        rig.program(0, 2, 100);
        rig.advance(50);

        // Low byte of a new reload: the channel holds its fire.
        rig.write(PIT_CHANNEL0, 0x10);
        rig.advance(500);
        assert_eq!(rig.expirations(0), 0);

        rig.write(PIT_CHANNEL0, 0x00);
        assert_eq!(rig.pit.info(0).unwrap().reload, 0x10);
        assert_eq!(rig.pit.info(0).unwrap().start_ticks, 550);
    }

    #[test]
    fn test_command_disarms_until_reload_complete() {
        let mut rig = Rig::new();
        rig.program(0, 2, 100);
        rig.write(PIT_COMMAND, 0x34);
        assert!(!rig.pit.info(0).unwrap().armed);
        rig.advance(1000);
        assert_eq!(rig.expirations(0), 0);
    }

    #[test]
    fn test_wraparound_of_tick_counter() {
        let mut rig = Rig::at(u32::MAX - 40);
        rig.program(0, 2, 100);
        rig.advance(250);
        assert_eq!(rig.expirations(0), 2);
    }

    #[test]
    fn test_lobyte_access_arms_immediately() {
        let mut rig = Rig::new();
        rig.write(PIT_COMMAND, 0x14);
        rig.write(PIT_CHANNEL0, 50);
        assert!(rig.pit.info(0).unwrap().armed);
        assert_eq!(rig.pit.info(0).unwrap().access, AccessMode::LowByte);
        rig.advance(120);
        assert_eq!(rig.expirations(0), 2);
    }

    #[test]
    fn test_counter_latch_snapshot() {
        let mut rig = Rig::new();
        rig.program(0, 2, 1000);
        rig.clock.advance(300);

        rig.write(PIT_COMMAND, 0x00);
        rig.clock.advance(100);
        // Latched value is 700 = 0x02BC regardless of further ticks.
        assert_eq!(rig.read(PIT_CHANNEL0), 0xBC);
        assert_eq!(rig.read(PIT_CHANNEL0), 0x02);

        // Unlatched read sees the live count, 600 = 0x0258.
        assert_eq!(rig.read(PIT_CHANNEL0), 0x58);
        assert_eq!(rig.read(PIT_CHANNEL0), 0x02);
    }

    #[test]
    fn test_read_back_status() {
        let mut rig = Rig::new();
        rig.program(2, 0, 100);
        // Latch status only, channel 2.
        rig.write(PIT_COMMAND, 0xE8);
        let status = rig.read(0x42);
        assert_eq!(status & 0x3F, 0x30);
        assert_eq!(status & 0x40, 0, "reload already loaded");
        assert_eq!(status & 0x80, 0, "OUT low while counting");
    }

    #[test]
    fn test_aux_channel_callback() {
        let mut rig = Rig::new();
        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        rig.pit
            .set_callback(
                2,
                Some(Box::new(move |_vm: VmId, ch: u8| {
                    assert_eq!(ch, 2);
                    seen.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        rig.program(2, 3, 10);
        rig.advance(35);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        assert!(matches!(
            rig.pit.set_callback(3, None),
            Err(DeviceError::ChannelOutOfRange(3))
        ));
    }

    #[test]
    fn test_kill_cancels_callbacks() {
        let mut rig = Rig::new();
        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        rig.pit
            .set_callback(
                1,
                Some(Box::new(move |_vm: VmId, _ch: u8| {
                    seen.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        rig.program(1, 2, 10);
        rig.pit.kill(VM);
        rig.advance(100);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mode_aliases() {
        assert_eq!(PitMode::from_bits(6), PitMode::RateGenerator);
        assert_eq!(PitMode::from_bits(7), PitMode::SquareWave);
        assert!(!PitMode::from_bits(4).is_periodic());
    }

    proptest! {
        #[test]
        fn prop_periodic_fires_once_per_interval(
            reload in 1u16..2000,
            k in 0u32..20,
            extra in 0u32..2,
            start in any::<u32>(),
            batches in 1usize..6,
        ) {
            let mut rig = Rig::at(start);
            rig.program(0, 2, reload);

            let total = k * u32::from(reload) + extra * (u32::from(reload) - 1);
            let step = total / batches as u32;
            let mut advanced = 0;
            for _ in 1..batches {
                rig.advance(step);
                advanced += step;
            }
            rig.advance(total - advanced);

            prop_assert_eq!(rig.expirations(0), u64::from(k));
        }
    }
}
