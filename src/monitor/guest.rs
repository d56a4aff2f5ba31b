//! Guest virtual-8086 context and interrupt injection.
//!
//! While a guest is not running, its user-visible state lives in the saved
//! v86 frame: CS:IP, SS:SP and FLAGS. Injecting an interrupt means editing
//! that frame exactly the way the CPU would on a real-mode `INT n`:
//!
//! ```text
//!   before                         after simulate_int(0x08)
//!   SS:SP ──► ...                  SS:SP-6 ──► IP   (return offset)
//!                                  SS:SP-4 ──► CS   (return segment)
//!                                  SS:SP-2 ──► FLAGS
//!   CS:IP = guest code             CS:IP = IVT[0x08] (segment:offset)
//!   FLAGS.IF/TF as before          FLAGS.IF = FLAGS.TF = 0
//! ```
//!
//! The next resumption of the VM then starts inside the guest's own handler,
//! indistinguishable from a hardware interrupt.
//!
//! The interrupt flag in the saved FLAGS is the guest's *virtual* IF: the
//! host keeps real interrupts enabled while the guest runs, and the monitor
//! only delivers virtual IRQs while this bit is set.

use thiserror::Error;

use crate::memory::{linear, GuestMemory, MemoryError};

/// FLAGS bit 1, always set.
pub const FLAGS_RESERVED: u16 = 1 << 1;
/// Trap flag.
pub const FLAGS_TF: u16 = 1 << 8;
/// Interrupt enable flag.
pub const FLAGS_IF: u16 = 1 << 9;

/// Why an interrupt could not be injected.
#[derive(Error, Debug)]
pub enum InjectError {
    /// The guest cannot be resumed (blocked by its owner or being torn down).
    #[error("guest is not resumable")]
    NotResumable,

    /// The interrupt frame or IVT entry lies outside guest RAM.
    #[error("interrupt frame outside guest memory: {0}")]
    Memory(#[from] MemoryError),
}

/// Saved user-visible registers of a v86 guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V86Frame {
    pub cs: u16,
    pub ip: u16,
    pub ss: u16,
    pub sp: u16,
    pub flags: u16,
}

impl Default for V86Frame {
    fn default() -> Self {
        Self {
            cs: 0,
            ip: 0,
            ss: 0,
            sp: 0xFFFE,
            flags: FLAGS_RESERVED,
        }
    }
}

/// Guest session state owned by a VM.
#[derive(Debug)]
pub struct Guest {
    frame: V86Frame,
    memory: GuestMemory,
    /// Whether the resume path may enter the guest.
    resumable: bool,
    /// Set once `kill_vm` has started on this VM.
    dying: bool,
    /// An interrupt frame or IVT access fell outside guest RAM.
    faulted: bool,
    /// Number of interrupts injected so far.
    injected: u64,
    /// Most recently injected vector.
    last_vector: Option<u8>,
}

impl Guest {
    /// Fresh guest with a default frame and interrupts disabled.
    pub fn new(memory: GuestMemory) -> Self {
        Self {
            frame: V86Frame::default(),
            memory,
            resumable: true,
            dying: false,
            faulted: false,
            injected: 0,
            last_vector: None,
        }
    }

    /// Saved register frame.
    pub fn frame(&self) -> &V86Frame {
        &self.frame
    }

    /// Mutable saved register frame.
    pub fn frame_mut(&mut self) -> &mut V86Frame {
        &mut self.frame
    }

    /// Guest RAM.
    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// Virtual interrupt-enable flag.
    pub fn vif(&self) -> bool {
        self.frame.flags & FLAGS_IF != 0
    }

    /// Set or clear the virtual interrupt-enable flag.
    pub fn set_vif(&mut self, enabled: bool) {
        if enabled {
            self.frame.flags |= FLAGS_IF;
        } else {
            self.frame.flags &= !FLAGS_IF;
        }
    }

    /// True if an interrupt may be injected now.
    pub fn is_resumable(&self) -> bool {
        self.resumable && !self.dying
    }

    /// Allow or forbid resuming the guest.
    pub fn set_resumable(&mut self, resumable: bool) {
        self.resumable = resumable;
    }

    pub(crate) fn mark_dying(&mut self) {
        self.dying = true;
    }

    /// True once an injection or `IRET` touched memory outside guest RAM.
    /// Such a guest cannot make progress and the monitor kills it.
    pub fn faulted(&self) -> bool {
        self.faulted
    }

    /// Number of interrupts injected so far.
    pub fn injected(&self) -> u64 {
        self.injected
    }

    /// Most recently injected vector.
    pub fn last_vector(&self) -> Option<u8> {
        self.last_vector
    }

    /// Vector `vector` through the guest's real-mode IVT.
    ///
    /// # Errors
    ///
    /// - `NotResumable` if the guest cannot currently be entered.
    /// - `Memory` if the IVT entry or the stack frame is outside guest RAM.
    ///   The saved frame is left untouched and the guest is marked faulted.
    pub fn simulate_int(&mut self, vector: u8) -> Result<(), InjectError> {
        if !self.is_resumable() {
            return Err(InjectError::NotResumable);
        }
        let (segment, offset) = self.push_int_frame(vector).map_err(|e| {
            self.faulted = true;
            e
        })?;

        let f = self.frame;
        self.frame = V86Frame {
            cs: segment,
            ip: offset,
            sp: f.sp.wrapping_sub(6),
            flags: (f.flags & !(FLAGS_IF | FLAGS_TF)) | FLAGS_RESERVED,
            ..f
        };
        self.injected += 1;
        self.last_vector = Some(vector);
        tracing::trace!(
            vector = format_args!("{vector:#04x}"),
            target = format_args!("{segment:04x}:{offset:04x}"),
            "interrupt injected"
        );
        Ok(())
    }

    /// Read the IVT entry for `vector` and push FLAGS, CS and IP.
    fn push_int_frame(&self, vector: u8) -> Result<(u16, u16), MemoryError> {
        let target = self.memory.read_ivt(vector)?;
        let f = self.frame;
        let sp = [2u16, 4, 6].map(|n| f.sp.wrapping_sub(n));
        self.memory.write_u16(linear(f.ss, sp[0]), f.flags)?;
        self.memory.write_u16(linear(f.ss, sp[1]), f.cs)?;
        self.memory.write_u16(linear(f.ss, sp[2]), f.ip)?;
        Ok(target)
    }

    /// Emulate `IRET`: pop IP, CS and FLAGS from the guest stack.
    ///
    /// A stack outside guest RAM marks the guest faulted.
    pub fn iret(&mut self) -> Result<(), MemoryError> {
        let f = self.frame;
        let (ip, cs, flags) = self.pop_int_frame().map_err(|e| {
            self.faulted = true;
            e
        })?;
        self.frame = V86Frame {
            cs,
            ip,
            sp: f.sp.wrapping_add(6),
            flags: flags | FLAGS_RESERVED,
            ..f
        };
        Ok(())
    }

    fn pop_int_frame(&self) -> Result<(u16, u16, u16), MemoryError> {
        let f = self.frame;
        let ip = self.memory.read_u16(linear(f.ss, f.sp))?;
        let cs = self.memory.read_u16(linear(f.ss, f.sp.wrapping_add(2)))?;
        let flags = self.memory.read_u16(linear(f.ss, f.sp.wrapping_add(4)))?;
        Ok((ip, cs, flags))
    }
}
