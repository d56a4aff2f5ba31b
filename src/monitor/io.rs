//! Trapped port I/O and ARPL monitor calls.
//!
//! The guest runs with IOPL below its CPL, so every IN/OUT it executes raises
//! a protection fault that lands in the monitor. The monitor then looks the
//! port up in the VM's [`IoHandlerTable`] and forwards the access to the
//! owning virtual device:
//!
//! ```text
//!  guest OUT 0x20, AL
//!        │  #GP (IOPL < CPL)
//!        ▼
//!  Monitor::io_out(vm, 0x20, data)
//!        │  IoHandlerTable::get(0x20)   (binary search)
//!        ▼
//!  DeviceId ──► VirtualDevice::io_write(0x20, byte, bus)
//! ```
//!
//! Multi-byte accesses are split into consecutive single-byte accesses
//! (`port`, `port + 1`, ...), so a 16-bit write to 0x20 programs both the
//! command and the mask register of the master PIC.
//!
//! ARPL is not valid in virtual-8086 mode and raises #UD. Guest-side monitor
//! drivers use it as a cheap call gate: the service number selects an entry in
//! the VM's [`ArplTable`].

use std::collections::BTreeMap;
use std::fmt;

use super::guest::Guest;
use super::registry::DeviceId;
use super::MonitorError;

/// Widest trapped access: `IN EAX, DX` / `OUT DX, EAX`.
pub const MAX_IO_SIZE: usize = 4;

/// Operand of one trapped IN or OUT, in port order.
///
/// Byte `i` belongs to port `port + i`. For an OUT it holds what the guest
/// wrote; for an IN the monitor fills it before the guest's AL/AX/EAX is
/// updated.
#[derive(Debug, Clone, Copy)]
pub struct IoData {
    data: [u8; MAX_IO_SIZE],
    /// Operand width in bytes; bytes past it are ignored.
    len: u8,
}

impl IoData {
    /// Zeroed operand of `len` bytes, for an IN. Wider than
    /// [`MAX_IO_SIZE`] is clamped.
    #[inline]
    pub fn new(len: usize) -> Self {
        debug_assert!(len <= MAX_IO_SIZE);
        Self {
            data: [0; MAX_IO_SIZE],
            len: len.min(MAX_IO_SIZE) as u8,
        }
    }

    /// OUT operand with the guest's bytes, lowest port first.
    #[inline]
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut operand = Self::new(bytes.len().min(MAX_IO_SIZE));
        let width = operand.len();
        operand.data[..width].copy_from_slice(&bytes[..width]);
        operand
    }

    /// `OUT DX, AL`.
    #[inline]
    pub fn byte(value: u8) -> Self {
        Self::from_slice(&[value])
    }

    /// The bytes of the access, lowest port first.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    /// Operand width.
    #[inline]
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte for port `port + index`.
    #[inline]
    pub fn get(&self, index: usize) -> Option<u8> {
        self.as_slice().get(index).copied()
    }

    /// Store the byte read from port `port + index`. Out-of-width writes are
    /// ignored.
    #[inline]
    pub fn set(&mut self, index: usize, value: u8) {
        if let Some(slot) = self.data[..usize::from(self.len)].get_mut(index) {
            *slot = value;
        }
    }
}

impl Default for IoData {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Result of dispatching a trapped port access.
///
/// `Unhandled` is not an error: the caller applies the default behaviour
/// (reads float high, writes are dropped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// At least one byte of the access reached a virtual device.
    Handled,
    /// No device claims any byte of the access.
    Unhandled,
}

/// A contiguous, non-empty range of I/O ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    start: u16,
    len: u16,
}

impl PortRange {
    /// Range of `len` ports starting at `start`.
    ///
    /// Returns `None` for an empty range or one running past 0xFFFF.
    pub fn new(start: u16, len: u16) -> Option<Self> {
        let end = u32::from(start) + u32::from(len);
        (len != 0 && end <= 0x1_0000).then_some(Self { start, len })
    }

    /// Inclusive range `first..=last`.
    pub fn inclusive(first: u16, last: u16) -> Option<Self> {
        let len = last.checked_sub(first)?.checked_add(1)?;
        Self::new(first, len)
    }

    /// A single port.
    pub fn single(port: u16) -> Self {
        Self { start: port, len: 1 }
    }

    /// First port.
    pub fn start(&self) -> u16 {
        self.start
    }

    /// Last port (inclusive).
    pub fn last(&self) -> u16 {
        self.start + (self.len - 1)
    }

    /// Number of ports.
    pub fn len(&self) -> u16 {
        self.len
    }

    /// Ranges are never empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    fn end_exclusive(&self) -> u32 {
        u32::from(self.start) + u32::from(self.len)
    }

    /// True if `port` lies inside the range.
    pub fn contains(&self, port: u16) -> bool {
        u32::from(port) >= u32::from(self.start) && u32::from(port) < self.end_exclusive()
    }

    /// True if the two ranges share at least one port.
    pub fn overlaps(&self, other: &PortRange) -> bool {
        u32::from(self.start) < other.end_exclusive()
            && u32::from(other.start) < self.end_exclusive()
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}-{:#06x}", self.start, self.last())
    }
}

/// A registered port range and the device that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoHandlerEntry {
    /// Ports claimed by the handler.
    pub range: PortRange,
    /// The owning device in the VM's device arena.
    pub device: DeviceId,
}

/// Per-VM mapping from port ranges to virtual devices.
///
/// Entries are kept sorted by start port and never overlap, so a lookup is a
/// single binary search.
#[derive(Debug)]
pub struct IoHandlerTable {
    /// Registered ranges sorted by start port.
    entries: Vec<IoHandlerEntry>,
    /// Maximum number of ranges.
    capacity: usize,
}

impl IoHandlerTable {
    /// Create an empty table holding at most `capacity` ranges.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    /// Register `device` for `range`.
    ///
    /// # Errors
    ///
    /// - `Conflict` if any port in `range` is already claimed.
    /// - `ResourceExhausted` if the table is full.
    pub fn add(&mut self, range: PortRange, device: DeviceId) -> Result<(), MonitorError> {
        let idx = self.entries.partition_point(|e| e.range.start < range.start);

        // Only the neighbours can overlap since existing entries are disjoint.
        let clash = [idx.checked_sub(1), Some(idx)]
            .into_iter()
            .flatten()
            .filter_map(|i| self.entries.get(i))
            .any(|e| e.range.overlaps(&range));
        if clash {
            return Err(MonitorError::Conflict {
                start: range.start(),
                end: range.last(),
            });
        }

        if self.entries.len() >= self.capacity {
            return Err(MonitorError::ResourceExhausted {
                resource: "I/O handler slot",
            });
        }

        self.entries.insert(idx, IoHandlerEntry { range, device });
        Ok(())
    }

    /// Remove the registration for exactly `range`. Missing entries are ignored.
    pub fn remove(&mut self, range: PortRange) -> Option<DeviceId> {
        let idx = self
            .entries
            .binary_search_by_key(&range.start, |e| e.range.start)
            .ok()?;
        if self.entries[idx].range != range {
            return None;
        }
        Some(self.entries.remove(idx).device)
    }

    /// Remove every range owned by `device`.
    pub fn remove_device(&mut self, device: DeviceId) {
        self.entries.retain(|e| e.device != device);
    }

    /// Find the handler owning `port`.
    pub fn get(&self, port: u16) -> Option<IoHandlerEntry> {
        let idx = self.entries.partition_point(|e| e.range.start <= port);
        let cand = self.entries.get(idx.checked_sub(1)?)?;
        cand.range.contains(port).then_some(*cand)
    }

    /// Registered entries in port order.
    pub fn entries(&self) -> &[IoHandlerEntry] {
        &self.entries
    }
}

/// Handler for an ARPL monitor call.
pub trait ArplHandler: Send {
    /// Service the call. The guest context is the trapping VM's.
    fn call(&mut self, guest: &mut Guest);
}

impl<F> ArplHandler for F
where
    F: FnMut(&mut Guest) + Send,
{
    fn call(&mut self, guest: &mut Guest) {
        self(guest)
    }
}

struct ArplEntry {
    name: &'static str,
    handler: Box<dyn ArplHandler>,
}

/// Per-VM table of ARPL services.
#[derive(Default)]
pub struct ArplTable {
    services: BTreeMap<u8, ArplEntry>,
}

impl ArplTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `service`.
    pub fn add(
        &mut self,
        service: u8,
        name: &'static str,
        handler: Box<dyn ArplHandler>,
    ) -> Result<(), MonitorError> {
        if self.services.contains_key(&service) {
            return Err(MonitorError::Conflict {
                start: u16::from(service),
                end: u16::from(service),
            });
        }
        self.services.insert(service, ArplEntry { name, handler });
        Ok(())
    }

    /// Remove the handler for `service`. Missing entries are ignored.
    pub fn remove(&mut self, service: u8) {
        self.services.remove(&service);
    }

    /// Name of the handler registered for `service`.
    pub fn get(&self, service: u8) -> Option<&'static str> {
        self.services.get(&service).map(|e| e.name)
    }

    /// Run the handler for `service`, returning false if none is registered.
    pub fn dispatch(&mut self, service: u8, guest: &mut Guest) -> bool {
        match self.services.get_mut(&service) {
            Some(entry) => {
                entry.handler.call(guest);
                true
            }
            None => false,
        }
    }

    /// Registered services in ascending order.
    pub fn services(&self) -> impl Iterator<Item = (u8, &'static str)> + '_ {
        self.services.iter().map(|(s, e)| (*s, e.name))
    }
}
