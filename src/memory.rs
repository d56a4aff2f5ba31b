//! Guest physical memory for virtual-8086 sessions, backed by the vm-memory crate.
//!
//! A v86 guest addresses memory through 16-bit segment:offset pairs, which
//! reach at most `0xFFFF:0xFFFF` = 0x10FFEF. Each VM therefore gets a single
//! region starting at guest physical address 0 that covers the first megabyte
//! plus the high memory area.
//!
//! # Memory Layout
//!
//! ```text
//! 0x00000 ┌─────────────────┐
//!         │ IVT (256 × 4)   │ ← real-mode interrupt vectors, seg:off each
//! 0x00400 ├─────────────────┤
//!         │ BDA             │ ← BIOS data area
//! 0x00500 ├─────────────────┤
//!         │ Conventional    │
//!         │ memory          │
//! 0xA0000 ├─────────────────┤
//!         │ Video / ROM     │
//! 0x100000├─────────────────┤
//!         │ HMA             │ ← reachable with A20 enabled
//! 0x110000└─────────────────┘
//! ```

use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

/// Bytes addressable from virtual-8086 mode (1 MiB + 64 KiB).
pub const REAL_MODE_MEMORY_SIZE: u64 = 0x11_0000;

/// Errors raised by guest memory accesses.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The host could not map the guest region.
    #[error("Failed to allocate guest memory: {0}")]
    Allocation(String),

    /// The access fell outside guest RAM.
    #[error("Guest memory access out of bounds at {addr:#x} ({len} bytes)")]
    OutOfBounds { addr: u64, len: usize },
}

/// Compute the linear address of a real-mode `segment:offset` pair.
#[inline]
pub fn linear(segment: u16, offset: u16) -> u64 {
    (u64::from(segment) << 4) + u64::from(offset)
}

/// Guest physical memory region backed by vm-memory.
///
/// Thin wrapper around `GuestMemoryMmap` with a single anonymous region
/// starting at guest physical address 0.
pub struct GuestMemory {
    /// The underlying vm-memory guest memory.
    inner: GuestMemoryMmap,
    /// Size of the memory region in bytes.
    size: u64,
}

impl GuestMemory {
    /// Allocate a new guest memory region of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the host mapping fails.
    pub fn new(size: u64) -> Result<Self, MemoryError> {
        let len = usize::try_from(size).map_err(|_| {
            MemoryError::Allocation(format!("guest memory size {size:#x} exceeds host range"))
        })?;
        let regions = vec![(GuestAddress(0), len)];

        let inner = GuestMemoryMmap::from_ranges(&regions).map_err(|e| {
            MemoryError::Allocation(format!("Failed to create guest memory: {}", e))
        })?;

        Ok(Self { inner, size })
    }

    /// Size of guest RAM in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Write bytes at a guest physical address.
    ///
    /// # Errors
    ///
    /// Returns an error if the write would exceed memory bounds.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds {
                addr,
                len: data.len(),
            })
    }

    /// Read bytes from a guest physical address into a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the read would exceed memory bounds.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds {
                addr,
                len: data.len(),
            })
    }

    /// Read a little-endian 16-bit value.
    pub fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Write a little-endian 16-bit value.
    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Read the real-mode interrupt vector `vector` as `(segment, offset)`.
    pub fn read_ivt(&self, vector: u8) -> Result<(u16, u16), MemoryError> {
        let entry = u64::from(vector) * 4;
        let offset = self.read_u16(entry)?;
        let segment = self.read_u16(entry + 2)?;
        Ok((segment, offset))
    }

    /// Point real-mode interrupt vector `vector` at `segment:offset`.
    pub fn write_ivt(&self, vector: u8, segment: u16, offset: u16) -> Result<(), MemoryError> {
        let entry = u64::from(vector) * 4;
        self.write_u16(entry, offset)?;
        self.write_u16(entry + 2, segment)
    }
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory").field("size", &self.size).finish()
    }
}
