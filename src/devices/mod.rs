//! Virtual PC peripherals attached to a VM.
//!
//! Every device kind implements [`VirtualDevice`]. The monitor stores devices
//! in the owning VM's arena and reaches them in three ways:
//!
//! - **Port traps**: `io_read`/`io_write` for each byte of a trapped IN/OUT
//!   that falls in one of the device's registered ranges.
//! - **System tick**: `tick` on every `Monitor::timer_tick`, used by devices
//!   that compute their state lazily against the global tick counter.
//! - **Teardown**: `kill` when the VM's kill-handler list reaches the device.
//!
//! A device that needs the guest to see an interrupt calls
//! [`DeviceBus::simulate_irq`], which routes through the VM's virtual PIC.
//!
//! ```text
//!   PIT channel 0 expires
//!        │ bus.simulate_irq(0)
//!        ▼
//!   VirtualPic::simulate_irq ──► IRR/IMR/ISR arbitration
//!        │ highest-priority deliverable line
//!        ▼
//!   Guest::simulate_int(base | line)
//! ```

use std::any::Any;

use thiserror::Error;

use crate::clock::TickSource;
use crate::monitor::guest::{Guest, InjectError};
use crate::monitor::io::PortRange;
use crate::monitor::registry::VmId;

pub mod cmos;
pub mod dma;
pub mod pic;
pub mod pit;

pub use cmos::VirtualCmos;
pub use dma::{DmaChannelInfo, VirtualDma};
pub use pic::{IrqOutcome, PicState, VirtualPic};
pub use pit::{PitChannelInfo, PitMode, VirtualPit};

/// Device-internal protocol errors.
///
/// These never reach the guest: the device logs them and discards the
/// offending access.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// A protocol byte arrived in a state that does not expect it.
    #[error("{device}: byte {value:#04x} not valid in state {state}")]
    InvalidState {
        device: &'static str,
        state: &'static str,
        value: u8,
    },

    /// IRQ line number outside 0..16.
    #[error("IRQ line {0} out of range")]
    LineOutOfRange(u8),

    /// Timer or DMA channel number outside the controller.
    #[error("channel {0} out of range")]
    ChannelOutOfRange(u8),

    /// A valid command the emulation does not implement.
    #[error("{device}: unsupported command {value:#04x} ({what})")]
    Unsupported {
        device: &'static str,
        what: &'static str,
        value: u8,
    },
}

impl DeviceError {
    /// Log the error on behalf of `vm`.
    pub fn log(&self, vm: VmId) {
        tracing::warn!(vm = %vm, "{self}");
    }
}

/// Kind of a virtual device, also naming the module that provides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Pic,
    Pit,
    Dma,
    Cmos,
    /// A device supplied by a collaborator.
    External,
}

impl DeviceKind {
    /// Module providing this device kind, if it is a built-in one.
    pub fn module(&self) -> Option<&'static str> {
        match self {
            DeviceKind::Pic => Some("pic"),
            DeviceKind::Pit => Some("pit"),
            DeviceKind::Dma => Some("dma"),
            DeviceKind::Cmos => Some("cmos"),
            DeviceKind::External => None,
        }
    }
}

/// A virtual peripheral owned by one VM.
pub trait VirtualDevice: Send {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Device kind.
    fn kind(&self) -> DeviceKind;

    /// Port ranges the device claims when installed with its defaults.
    fn port_ranges(&self) -> Vec<PortRange>;

    /// Guest read of one byte from `port`.
    fn io_read(&mut self, port: u16, bus: &mut DeviceBus<'_>) -> u8;

    /// Guest write of one byte to `port`.
    fn io_write(&mut self, port: u16, value: u8, bus: &mut DeviceBus<'_>);

    /// Periodic system tick.
    fn tick(&mut self, _bus: &mut DeviceBus<'_>) {}

    /// The owning VM is being destroyed.
    fn kill(&mut self, _vm: VmId) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A device's view of its VM during one call.
pub struct DeviceBus<'a> {
    vm: VmId,
    clock: &'a TickSource,
    now: u32,
    guest: &'a mut Guest,
    pic: Option<&'a mut VirtualPic>,
}

impl<'a> DeviceBus<'a> {
    /// Wire a bus for `vm`. `pic` is `None` when the VM has no PIC or when
    /// the PIC itself is the device being called.
    pub fn new(
        vm: VmId,
        clock: &'a TickSource,
        guest: &'a mut Guest,
        pic: Option<&'a mut VirtualPic>,
    ) -> Self {
        Self {
            vm,
            clock,
            now: clock.now(),
            guest,
            pic,
        }
    }

    /// The VM this call belongs to.
    pub fn vm(&self) -> VmId {
        self.vm
    }

    /// Global tick count sampled when the bus was created.
    pub fn now(&self) -> u32 {
        self.now
    }

    /// The global tick source.
    pub fn clock(&self) -> &TickSource {
        self.clock
    }

    /// The VM's guest context.
    pub fn guest(&mut self) -> &mut Guest {
        &mut *self.guest
    }

    /// Raise virtual IRQ `line` on the VM's PIC.
    pub fn simulate_irq(&mut self, line: u8) -> Result<IrqOutcome, InjectError> {
        let vm = self.vm;
        match self.pic.as_deref_mut() {
            Some(pic) => pic.simulate_irq(vm, line, &mut *self.guest),
            None => {
                tracing::trace!(vm = %vm, line, "IRQ raised without a PIC");
                Ok(IrqOutcome::Dropped)
            }
        }
    }
}

/// Split a 16-bit value into the byte selected by a flip-flop.
#[inline]
pub(crate) fn select_byte(value: u16, high: bool) -> u8 {
    if high {
        (value >> 8) as u8
    } else {
        value as u8
    }
}

/// Replace the byte of `value` selected by a flip-flop.
#[inline]
pub(crate) fn merge_byte(value: u16, byte: u8, high: bool) -> u16 {
    if high {
        (value & 0x00FF) | (u16::from(byte) << 8)
    } else {
        (value & 0xFF00) | u16::from(byte)
    }
}
