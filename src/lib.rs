//! v86mon - a virtual-8086 monitor core.
//!
//! The monitor owns a table of guest sessions (VMs) running real-mode code in
//! virtual-8086 mode. It emulates the privileged parts of a PC on their
//! behalf: trapped port I/O is routed to per-VM virtual devices, and the
//! virtual 8259 PIC pair, 8254 PIT and 8237 DMA pair reproduce the hardware
//! protocols closely enough for BIOS-era guest code to program them.
//!
//! ```no_run
//! use v86mon::{IoData, Monitor, MonitorConfig};
//!
//! # fn main() -> Result<(), v86mon::MonitorError> {
//! let monitor = Monitor::new(MonitorConfig::default())?;
//! let vm = monitor.create_vm()?;
//! monitor.install_standard_devices(vm)?;
//!
//! // Program PIT channel 0 for a periodic 100-clock rate.
//! monitor.io_out(vm, 0x43, &IoData::byte(0x34))?;
//! monitor.io_out(vm, 0x40, &IoData::byte(100))?;
//! monitor.io_out(vm, 0x40, &IoData::byte(0))?;
//! monitor.timer_tick(250);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod devices;
pub mod memory;
pub mod monitor;

pub use clock::{TickSource, PIT_INPUT_HZ};
pub use config::MonitorConfig;
pub use devices::{
    DeviceError, DeviceKind, DmaChannelInfo, IrqOutcome, PitChannelInfo, PitMode, VirtualDevice,
};
pub use memory::{GuestMemory, MemoryError};
pub use monitor::{
    DeviceId, Guest, IoData, IoHandlerEntry, IoOutcome, Monitor, MonitorError, PortRange,
    ShellCommand, ShellError, V86Frame, VmId, VmSummary,
};
