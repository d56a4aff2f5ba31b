//! Virtual 8259A programmable interrupt controller pair.
//!
//! The PC/AT wires two 8259As in cascade: the slave's INT output feeds line 2
//! of the master, giving 15 usable lines.
//!
//! ```text
//!               ┌──────────────┐
//!  IRQ0..IRQ7 ─►│   master     │── INT ──► guest (vector = base | line)
//!               │ 0x20 / 0x21  │
//!               └──────▲───────┘
//!                      │ line 2
//!               ┌──────┴───────┐
//!  IRQ8..IRQ15 ►│    slave     │
//!               │ 0xA0 / 0xA1  │
//!               └──────────────┘
//! ```
//!
//! # Registers
//!
//! Each chip keeps three 8-bit registers, one bit per line:
//!
//! - **IRR** (interrupt request): lines that have asserted a request.
//! - **ISR** (in service): lines delivered to the guest and not yet EOI'd.
//! - **IMR** (mask): lines the guest has disabled.
//!
//! Line 0 has the highest priority. A line is deliverable when it is requested,
//! unmasked, and of strictly higher priority than every in-service line.
//!
//! # Programming
//!
//! Writing a byte with bit 4 set to the command port starts initialisation
//! (ICW1). The chip then expects ICW2 (vector base), ICW3 (cascade wiring,
//! only when not in single mode) and ICW4 (only when ICW1 requested it). After
//! that, command-port bytes are OCW2 (EOI and priority commands) or OCW3
//! (register readback select), and data-port bytes set the mask (OCW1).

use std::any::Any;

use super::{DeviceBus, DeviceError, DeviceKind, VirtualDevice};
use crate::monitor::guest::{Guest, InjectError};
use crate::monitor::io::PortRange;
use crate::monitor::registry::VmId;

/// Master command port.
pub const MASTER_CMD: u16 = 0x20;
/// Master data (mask) port.
pub const MASTER_DATA: u16 = 0x21;
/// Slave command port.
pub const SLAVE_CMD: u16 = 0xA0;
/// Slave data (mask) port.
pub const SLAVE_DATA: u16 = 0xA1;

/// Number of lines across both chips.
pub const PIC_LINES: u8 = 16;

/// Initialization and command word bits.
mod regs {
    /// ICW1: marks the byte as ICW1.
    pub const ICW1_INIT: u8 = 0x10;
    /// ICW1: level triggered mode.
    pub const ICW1_LTIM: u8 = 0x08;
    /// ICW1: single chip, no ICW3.
    pub const ICW1_SNGL: u8 = 0x02;
    /// ICW1: ICW4 follows.
    pub const ICW1_IC4: u8 = 0x01;

    /// ICW4: 8086 mode.
    pub const ICW4_8086: u8 = 0x01;
    /// ICW4: automatic EOI.
    pub const ICW4_AEOI: u8 = 0x02;

    /// Distinguishes OCW3 from OCW2 on the command port.
    pub const OCW3_SELECT: u8 = 0x08;
    /// OCW3: poll command.
    pub const OCW3_POLL: u8 = 0x04;
    /// OCW3: read register command.
    pub const OCW3_READ_IRR: u8 = 0x02;
    pub const OCW3_READ_ISR: u8 = 0x03;
    /// OCW3: special mask mode field.
    pub const OCW3_SMM_MASK: u8 = 0x60;
    pub const OCW3_SMM_SET: u8 = 0x60;
    pub const OCW3_SMM_RESET: u8 = 0x40;

    /// OCW2 commands (bits 7..5).
    pub const OCW2_ROTATE_AEOI_CLEAR: u8 = 0b000;
    pub const OCW2_NONSPECIFIC_EOI: u8 = 0b001;
    pub const OCW2_NOP: u8 = 0b010;
    pub const OCW2_SPECIFIC_EOI: u8 = 0b011;
    pub const OCW2_ROTATE_AEOI_SET: u8 = 0b100;
    pub const OCW2_ROTATE_NONSPECIFIC_EOI: u8 = 0b101;
    pub const OCW2_SET_PRIORITY: u8 = 0b110;
    pub const OCW2_ROTATE_SPECIFIC_EOI: u8 = 0b111;
}

/// Protocol state of one chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicState {
    /// Operational. Command-port reads return IRR.
    Normal,
    /// ICW1 seen, waiting for the vector base.
    WaitIcw2,
    /// Waiting for the cascade wiring byte.
    WaitIcw3,
    /// Waiting for the mode byte.
    WaitIcw4,
    /// Next command-port read returns ISR.
    ReadIsr,
    /// Next command-port read returns IRR.
    ReadIrr,
}

impl PicState {
    /// Name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            PicState::Normal => "normal",
            PicState::WaitIcw2 => "wait-icw2",
            PicState::WaitIcw3 => "wait-icw3",
            PicState::WaitIcw4 => "wait-icw4",
            PicState::ReadIsr => "read-isr",
            PicState::ReadIrr => "read-irr",
        }
    }

    fn initializing(&self) -> bool {
        matches!(
            self,
            PicState::WaitIcw2 | PicState::WaitIcw3 | PicState::WaitIcw4
        )
    }
}

/// Result of raising a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqOutcome {
    /// An interrupt was injected into the guest. `line` is the line actually
    /// delivered, which may be a higher priority one than the line raised.
    Delivered { line: u8, vector: u8 },
    /// The request is latched in IRR and waits for the guest.
    Pending,
    /// The request was discarded.
    Dropped,
}

/// One 8259A.
#[derive(Debug, Clone)]
pub struct Pic8259 {
    irr: u8,
    isr: u8,
    imr: u8,
    base: u8,
    icw1: u8,
    icw3: u8,
    icw4: u8,
    state: PicState,
}

impl Pic8259 {
    /// A chip as the BIOS leaves it: edge triggered, cascaded, 8086 mode.
    fn new(base: u8, icw3: u8) -> Self {
        Self {
            irr: 0,
            isr: 0,
            imr: 0,
            base,
            icw1: regs::ICW1_INIT | regs::ICW1_IC4,
            icw3,
            icw4: regs::ICW4_8086,
            state: PicState::Normal,
        }
    }

    /// Pending requests.
    pub fn irr(&self) -> u8 {
        self.irr
    }

    /// Lines in service.
    pub fn isr(&self) -> u8 {
        self.isr
    }

    /// Mask register.
    pub fn imr(&self) -> u8 {
        self.imr
    }

    /// Vector base (a multiple of 8).
    pub fn base(&self) -> u8 {
        self.base
    }

    pub fn state(&self) -> PicState {
        self.state
    }

    pub fn icw1(&self) -> u8 {
        self.icw1
    }

    pub fn icw3(&self) -> u8 {
        self.icw3
    }

    pub fn icw4(&self) -> u8 {
        self.icw4
    }

    /// True if ICW1 selected single mode.
    pub fn single(&self) -> bool {
        self.icw1 & regs::ICW1_SNGL != 0
    }

    /// True if ICW4 selected automatic EOI.
    pub fn auto_eoi(&self) -> bool {
        self.icw4 & regs::ICW4_AEOI != 0
    }

    /// Highest-priority deliverable line, with `extra` ORed into IRR.
    fn ready_with(&self, extra: u8) -> Option<u8> {
        // All lines strictly above the highest-priority in-service line. With
        // nothing in service this is every line.
        let highest_isr = self.isr & self.isr.wrapping_neg();
        let ready = (self.irr | extra) & !self.imr & highest_isr.wrapping_sub(1);
        (ready != 0).then(|| ready.trailing_zeros() as u8)
    }

    fn ready(&self) -> Option<u8> {
        self.ready_with(0)
    }

    /// Clear the highest-priority in-service bit.
    fn eoi(&mut self) -> Option<u8> {
        let lowest = self.isr & self.isr.wrapping_neg();
        self.isr &= !lowest;
        (lowest != 0).then(|| lowest.trailing_zeros() as u8)
    }

    fn write_command(&mut self, value: u8) -> Result<(), DeviceError> {
        if value & regs::ICW1_INIT != 0 {
            self.icw1 = value;
            self.irr = 0;
            self.isr = 0;
            self.imr = 0;
            self.state = PicState::WaitIcw2;
            if value & regs::ICW1_LTIM != 0 {
                return Err(DeviceError::Unsupported {
                    device: "pic",
                    what: "level triggered mode",
                    value,
                });
            }
            return Ok(());
        }

        if self.state.initializing() {
            return self.write_icw(value);
        }

        if value & regs::OCW3_SELECT != 0 {
            self.write_ocw3(value)
        } else {
            self.write_ocw2(value)
        }
    }

    fn write_data(&mut self, value: u8) -> Result<(), DeviceError> {
        if self.state.initializing() {
            return self.write_icw(value);
        }
        self.imr = value;
        Ok(())
    }

    fn write_icw(&mut self, value: u8) -> Result<(), DeviceError> {
        let want_icw4 = self.icw1 & regs::ICW1_IC4 != 0;
        match self.state {
            PicState::WaitIcw2 => {
                self.base = value & 0xF8;
                self.state = if !self.single() {
                    PicState::WaitIcw3
                } else if want_icw4 {
                    PicState::WaitIcw4
                } else {
                    PicState::Normal
                };
                if !want_icw4 {
                    self.icw4 = 0;
                }
            }
            PicState::WaitIcw3 => {
                self.icw3 = value;
                self.state = if want_icw4 {
                    PicState::WaitIcw4
                } else {
                    PicState::Normal
                };
            }
            PicState::WaitIcw4 => {
                self.icw4 = value;
                self.state = PicState::Normal;
                if value & regs::ICW4_8086 == 0 {
                    return Err(DeviceError::Unsupported {
                        device: "pic",
                        what: "8080 mode",
                        value,
                    });
                }
            }
            state => {
                return Err(DeviceError::InvalidState {
                    device: "pic",
                    state: state.name(),
                    value,
                })
            }
        }
        Ok(())
    }

    fn write_ocw2(&mut self, value: u8) -> Result<(), DeviceError> {
        let unsupported = |what| DeviceError::Unsupported {
            device: "pic",
            what,
            value,
        };

        match value >> 5 {
            regs::OCW2_NONSPECIFIC_EOI => {
                self.eoi();
                Ok(())
            }
            regs::OCW2_SPECIFIC_EOI => {
                let level = value & 0x07;
                if let Some(line) = self.eoi() {
                    if line != level {
                        tracing::trace!(level, line, "specific EOI for a lower priority level");
                    }
                }
                Ok(())
            }
            regs::OCW2_ROTATE_NONSPECIFIC_EOI | regs::OCW2_ROTATE_SPECIFIC_EOI => {
                self.eoi();
                Err(unsupported("priority rotation"))
            }
            regs::OCW2_ROTATE_AEOI_SET | regs::OCW2_ROTATE_AEOI_CLEAR => {
                Err(unsupported("rotate in automatic EOI mode"))
            }
            regs::OCW2_SET_PRIORITY => Err(unsupported("set priority")),
            regs::OCW2_NOP => Ok(()),
            _ => unreachable!("OCW2 command is three bits"),
        }
    }

    fn write_ocw3(&mut self, value: u8) -> Result<(), DeviceError> {
        match value & 0x03 {
            regs::OCW3_READ_IRR => self.state = PicState::ReadIrr,
            regs::OCW3_READ_ISR => self.state = PicState::ReadIsr,
            _ => {}
        }

        if value & regs::OCW3_POLL != 0 {
            return Err(DeviceError::Unsupported {
                device: "pic",
                what: "poll command",
                value,
            });
        }
        match value & regs::OCW3_SMM_MASK {
            regs::OCW3_SMM_SET | regs::OCW3_SMM_RESET => Err(DeviceError::Unsupported {
                device: "pic",
                what: "special mask mode",
                value,
            }),
            _ => Ok(()),
        }
    }

    fn read_command(&mut self) -> u8 {
        match self.state {
            PicState::ReadIsr => {
                self.state = PicState::Normal;
                self.isr
            }
            PicState::ReadIrr => {
                self.state = PicState::Normal;
                self.irr
            }
            _ => self.irr,
        }
    }

    fn read_data(&self) -> u8 {
        self.imr
    }
}

/// Master/slave 8259A pair of one VM.
#[derive(Debug, Clone)]
pub struct VirtualPic {
    master: Pic8259,
    slave: Pic8259,
    /// Interrupts delivered through this PIC.
    delivered: u64,
}

impl Default for VirtualPic {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualPic {
    /// PIC pair with the PC BIOS defaults: master at vector 0x08, slave at
    /// 0x70, slave cascaded on master line 2.
    pub fn new() -> Self {
        Self {
            master: Pic8259::new(0x08, 1 << 2),
            slave: Pic8259::new(0x70, 2),
            delivered: 0,
        }
    }

    pub fn master(&self) -> &Pic8259 {
        &self.master
    }

    pub fn slave(&self) -> &Pic8259 {
        &self.slave
    }

    /// Interrupts delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Master line the slave is wired to, or `None` in single mode.
    pub fn cascade_line(&self) -> Option<u8> {
        if self.master.single() || self.master.icw3 == 0 {
            return None;
        }
        Some(self.master.icw3.trailing_zeros() as u8)
    }

    /// True if `line` has a latched request.
    pub fn is_pending(&self, line: u8) -> bool {
        match line {
            0..=7 => self.master.irr & (1 << line) != 0,
            8..=15 => self.slave.irr & (1 << (line - 8)) != 0,
            _ => false,
        }
    }

    fn chip_mut(&mut self, line: u8) -> (&mut Pic8259, u8) {
        if line < 8 {
            (&mut self.master, 1 << line)
        } else {
            (&mut self.slave, 1 << (line - 8))
        }
    }

    /// Raise `line` and try to deliver the highest-priority pending request.
    ///
    /// The request is latched even when the line is masked or the guest has
    /// interrupts disabled; it is dropped only when the same line is still in
    /// service.
    ///
    /// # Errors
    ///
    /// Returns the injection error if the guest could not take the interrupt.
    /// The request stays latched and nothing is marked in service, so the
    /// next successful [`deliver`](Self::deliver) picks it up.
    pub fn simulate_irq(
        &mut self,
        vm: VmId,
        line: u8,
        guest: &mut Guest,
    ) -> Result<IrqOutcome, InjectError> {
        if line >= PIC_LINES {
            DeviceError::LineOutOfRange(line).log(vm);
            return Ok(IrqOutcome::Dropped);
        }

        let (chip, bit) = self.chip_mut(line);
        if chip.isr & bit != 0 {
            tracing::trace!(vm = %vm, line, "IRQ dropped, line in service");
            return Ok(IrqOutcome::Dropped);
        }
        chip.irr |= bit;

        Ok(match self.deliver(vm, guest)? {
            Some((line, vector)) => IrqOutcome::Delivered { line, vector },
            None => IrqOutcome::Pending,
        })
    }

    /// Deliver the highest-priority pending request if the guest will take it.
    ///
    /// Returns the delivered `(line, vector)`, or `None` if nothing is
    /// deliverable or the guest has virtual interrupts disabled.
    pub fn deliver(
        &mut self,
        vm: VmId,
        guest: &mut Guest,
    ) -> Result<Option<(u8, u8)>, InjectError> {
        if !guest.vif() || self.master.state.initializing() {
            return Ok(None);
        }

        let cascade = self.cascade_line();
        let slave_ready = cascade.and_then(|_| self.slave.ready());
        let cascade_req = match (cascade, slave_ready) {
            (Some(c), Some(_)) => 1 << c,
            _ => 0,
        };
        let Some(mline) = self.master.ready_with(cascade_req) else {
            return Ok(None);
        };

        let (line, vector) = match slave_ready {
            Some(sline) if Some(mline) == cascade => (8 + sline, self.slave.base | sline),
            _ => (mline, self.master.base | mline),
        };

        if let Err(e) = guest.simulate_int(vector) {
            tracing::debug!(vm = %vm, line, "IRQ delivery failed, request stays latched: {e}");
            return Err(e);
        }
        let (chip, bit) = self.chip_mut(line);
        chip.irr &= !bit;

        if line >= 8 {
            if !self.slave.auto_eoi() {
                self.slave.isr |= 1 << (line - 8);
            }
            if !self.master.auto_eoi() {
                self.master.isr |= 1 << mline;
            }
        } else if !self.master.auto_eoi() {
            self.master.isr |= 1 << line;
        }

        self.delivered += 1;
        tracing::trace!(
            vm = %vm,
            line,
            vector = format_args!("{vector:#04x}"),
            "IRQ delivered"
        );
        Ok(Some((line, vector)))
    }

    /// Handle a guest write to one of the four PIC ports.
    pub fn write_port(&mut self, vm: VmId, port: u16, value: u8) {
        let chip = match port {
            MASTER_CMD | MASTER_DATA => &mut self.master,
            SLAVE_CMD | SLAVE_DATA => &mut self.slave,
            _ => return,
        };
        let was_initializing = chip.state.initializing();
        let result = if port & 1 == 0 {
            chip.write_command(value)
        } else {
            chip.write_data(value)
        };
        if let Err(e) = result {
            e.log(vm);
        }
        if was_initializing && chip.state == PicState::Normal {
            tracing::debug!(
                vm = %vm,
                port = format_args!("{port:#x}"),
                base = format_args!("{:#04x}", chip.base),
                icw4 = format_args!("{:#04x}", chip.icw4),
                "PIC initialised"
            );
        }
    }

    /// Handle a guest read from one of the four PIC ports.
    pub fn read_port(&mut self, port: u16) -> u8 {
        match port {
            MASTER_CMD => self.master.read_command(),
            MASTER_DATA => self.master.read_data(),
            SLAVE_CMD => self.slave.read_command(),
            SLAVE_DATA => self.slave.read_data(),
            _ => 0xFF,
        }
    }
}

impl VirtualDevice for VirtualPic {
    fn name(&self) -> &'static str {
        "pic"
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Pic
    }

    fn port_ranges(&self) -> Vec<PortRange> {
        [(MASTER_CMD, MASTER_DATA), (SLAVE_CMD, SLAVE_DATA)]
            .into_iter()
            .filter_map(|(first, last)| PortRange::inclusive(first, last))
            .collect()
    }

    fn io_read(&mut self, port: u16, _bus: &mut DeviceBus<'_>) -> u8 {
        self.read_port(port)
    }

    fn io_write(&mut self, port: u16, value: u8, bus: &mut DeviceBus<'_>) {
        let vm = bus.vm();
        self.write_port(vm, port, value);

        // An EOI or an unmask may have made a latched request deliverable.
        if let Err(e) = self.deliver(vm, bus.guest()) {
            tracing::warn!(vm = %vm, "pending IRQ not delivered: {e}");
        }
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
    use crate::memory::GuestMemory;
    use crate::monitor::guest::FLAGS_IF;
    use proptest::prelude::*;

    const VM: VmId = VmId::new(0, 0);

    /// Guest with every IVT entry valid and interrupts enabled.
    fn guest() -> Guest {
        let memory = GuestMemory::new(0x2_0000).unwrap();
        for vector in 0..=255u8 {
            memory.write_ivt(vector, 0xF000, u16::from(vector) * 4).unwrap();
        }
        let mut guest = Guest::new(memory);
        guest.frame_mut().ss = 0x1000;
        guest.frame_mut().sp = 0x8000;
        guest.frame_mut().flags |= FLAGS_IF;
        guest
    }

    /// Program the master the way a single-PIC guest would.
    fn init_single(pic: &mut VirtualPic) {
        pic.write_port(VM, MASTER_CMD, 0x13);
        pic.write_port(VM, MASTER_DATA, 0x08);
        pic.write_port(VM, MASTER_DATA, 0x01);
        pic.write_port(VM, MASTER_DATA, 0xFE);
    }

    /// Program both chips the way the PC BIOS does.
    fn init_cascade(pic: &mut VirtualPic) {
        pic.write_port(VM, MASTER_CMD, 0x11);
        pic.write_port(VM, MASTER_DATA, 0x20);
        pic.write_port(VM, MASTER_DATA, 0x04);
        pic.write_port(VM, MASTER_DATA, 0x01);
        pic.write_port(VM, SLAVE_CMD, 0x11);
        pic.write_port(VM, SLAVE_DATA, 0x28);
        pic.write_port(VM, SLAVE_DATA, 0x02);
        pic.write_port(VM, SLAVE_DATA, 0x01);
    }

    #[test]
    fn test_defaults_before_init() {
        let pic = VirtualPic::new();
        assert_eq!(pic.master().base(), 0x08);
        assert_eq!(pic.slave().base(), 0x70);
        assert_eq!(pic.cascade_line(), Some(2));
        assert_eq!(pic.master().state(), PicState::Normal);
    }

    #[test]
    fn test_single_mode_init_sequence() {
        let mut pic = VirtualPic::new();
        pic.write_port(VM, MASTER_CMD, 0x13);
        assert_eq!(pic.master().state(), PicState::WaitIcw2);
        pic.write_port(VM, MASTER_DATA, 0x0B);
        // Single mode skips ICW3.
        assert_eq!(pic.master().state(), PicState::WaitIcw4);
        pic.write_port(VM, MASTER_DATA, 0x01);
        assert_eq!(pic.master().state(), PicState::Normal);
        assert_eq!(pic.master().base(), 0x08);
        assert_eq!(pic.cascade_line(), None);

        pic.write_port(VM, MASTER_DATA, 0xFE);
        assert_eq!(pic.read_port(MASTER_DATA), 0xFE);
    }

    #[test]
    fn test_init_clears_registers() {
        let mut pic = VirtualPic::new();
        let mut guest = guest();
        guest.set_vif(false);
        pic.write_port(VM, MASTER_DATA, 0xFF);
        pic.simulate_irq(VM, 3, &mut guest).unwrap();
        assert!(pic.is_pending(3));

        pic.write_port(VM, MASTER_CMD, 0x11);
        assert_eq!(pic.master().irr(), 0);
        assert_eq!(pic.master().imr(), 0);
    }

    #[test]
    fn test_deliver_eoi_redeliver() {
        let mut pic = VirtualPic::new();
        let mut guest = guest();
        init_single(&mut pic);

        let out = pic.simulate_irq(VM, 0, &mut guest).unwrap();
        assert_eq!(out, IrqOutcome::Delivered { line: 0, vector: 0x08 });
        assert_eq!(pic.master().isr(), 0x01);
        assert_eq!(pic.master().irr(), 0x00);
        assert!(!guest.vif());

        // Same line again while in service.
        guest.set_vif(true);
        assert_eq!(pic.simulate_irq(VM, 0, &mut guest).unwrap(), IrqOutcome::Dropped);

        pic.write_port(VM, MASTER_CMD, 0x20);
        assert_eq!(pic.master().isr(), 0);

        let out = pic.simulate_irq(VM, 0, &mut guest).unwrap();
        assert_eq!(out, IrqOutcome::Delivered { line: 0, vector: 0x08 });
        assert_eq!(guest.injected(), 2);
    }

    #[test]
    fn test_masked_line_stays_pending() {
        let mut pic = VirtualPic::new();
        let mut guest = guest();
        init_single(&mut pic);

        assert_eq!(pic.simulate_irq(VM, 1, &mut guest).unwrap(), IrqOutcome::Pending);
        assert!(pic.is_pending(1));
        assert_eq!(guest.injected(), 0);

        // Unmasking makes it deliverable on the next arbitration.
        pic.write_port(VM, MASTER_DATA, 0xFC);
        assert_eq!(pic.deliver(VM, &mut guest).unwrap(), Some((1, 0x09)));
    }

    #[test]
    fn test_vif_clear_defers_delivery() {
        let mut pic = VirtualPic::new();
        let mut guest = guest();
        guest.set_vif(false);

        assert_eq!(pic.simulate_irq(VM, 4, &mut guest).unwrap(), IrqOutcome::Pending);
        guest.set_vif(true);
        assert_eq!(pic.deliver(VM, &mut guest).unwrap(), Some((4, 0x0C)));
    }

    #[test]
    fn test_priority_nesting() {
        let mut pic = VirtualPic::new();
        let mut guest = guest();

        pic.simulate_irq(VM, 3, &mut guest).unwrap();
        assert_eq!(pic.master().isr(), 0x08);

        // Lower priority waits behind line 3.
        guest.set_vif(true);
        assert_eq!(pic.simulate_irq(VM, 5, &mut guest).unwrap(), IrqOutcome::Pending);

        // Higher priority nests.
        let out = pic.simulate_irq(VM, 1, &mut guest).unwrap();
        assert_eq!(out, IrqOutcome::Delivered { line: 1, vector: 0x09 });
        assert_eq!(pic.master().isr(), 0x0A);

        // Non-specific EOI retires line 1, then line 3, then 5 goes out.
        guest.set_vif(true);
        pic.write_port(VM, MASTER_CMD, 0x20);
        assert_eq!(pic.deliver(VM, &mut guest).unwrap(), None);
        pic.write_port(VM, MASTER_CMD, 0x63);
        assert_eq!(pic.deliver(VM, &mut guest).unwrap(), Some((5, 0x0D)));
    }

    #[test]
    fn test_cascade_delivery() {
        let mut pic = VirtualPic::new();
        let mut guest = guest();
        init_cascade(&mut pic);

        let out = pic.simulate_irq(VM, 12, &mut guest).unwrap();
        assert_eq!(out, IrqOutcome::Delivered { line: 12, vector: 0x2C });
        assert_eq!(pic.slave().isr(), 1 << 4);
        assert_eq!(pic.master().isr(), 1 << 2);

        // Master line 1 outranks the cascade line, line 3 does not.
        guest.set_vif(true);
        assert_eq!(pic.simulate_irq(VM, 3, &mut guest).unwrap(), IrqOutcome::Pending);
        let out = pic.simulate_irq(VM, 1, &mut guest).unwrap();
        assert_eq!(out, IrqOutcome::Delivered { line: 1, vector: 0x21 });
    }

    #[test]
    fn test_isr_irr_readback() {
        let mut pic = VirtualPic::new();
        let mut guest = guest();
        pic.simulate_irq(VM, 2, &mut guest).unwrap();
        pic.simulate_irq(VM, 6, &mut guest).unwrap();

        pic.write_port(VM, MASTER_CMD, 0x0B);
        assert_eq!(pic.master().state(), PicState::ReadIsr);
        assert_eq!(pic.read_port(MASTER_CMD), 0x04);
        assert_eq!(pic.master().state(), PicState::Normal);

        pic.write_port(VM, MASTER_CMD, 0x0A);
        assert_eq!(pic.read_port(MASTER_CMD), 0x40);
    }

    #[test]
    fn test_auto_eoi_leaves_isr_clear() {
        let mut pic = VirtualPic::new();
        let mut guest = guest();
        pic.write_port(VM, MASTER_CMD, 0x13);
        pic.write_port(VM, MASTER_DATA, 0x08);
        pic.write_port(VM, MASTER_DATA, 0x03);

        pic.simulate_irq(VM, 0, &mut guest).unwrap();
        assert_eq!(pic.master().isr(), 0);
        assert_eq!(pic.delivered(), 1);
    }

    #[test]
    fn test_failed_injection_keeps_request_pending() {
        let mut pic = VirtualPic::new();
        let mut guest = guest();
        guest.set_resumable(false);

        assert!(matches!(
            pic.simulate_irq(VM, 0, &mut guest),
            Err(InjectError::NotResumable)
        ));
        assert!(pic.is_pending(0));
        assert_eq!(pic.master().isr(), 0);
        assert_eq!(pic.delivered(), 0);

        guest.set_resumable(true);
        assert_eq!(pic.deliver(VM, &mut guest).unwrap(), Some((0, 0x08)));
        assert!(!pic.is_pending(0));
        assert_eq!(pic.master().isr(), 0x01);
    }

    #[test]
    fn test_failed_slave_injection_keeps_both_chips_clean() {
        let mut pic = VirtualPic::new();
        let mut guest = guest();
        init_cascade(&mut pic);
        guest.set_resumable(false);

        assert!(pic.simulate_irq(VM, 10, &mut guest).is_err());
        assert!(pic.is_pending(10));
        assert_eq!((pic.master().isr(), pic.slave().isr()), (0, 0));

        guest.set_resumable(true);
        assert_eq!(pic.deliver(VM, &mut guest).unwrap(), Some((10, 0x2A)));
    }

    #[test]
    fn test_unsupported_commands_are_ignored() {
        let mut pic = VirtualPic::new();
        // Set priority, poll, special mask mode.
        pic.write_port(VM, MASTER_CMD, 0xC3);
        pic.write_port(VM, MASTER_CMD, 0x0C);
        pic.write_port(VM, MASTER_CMD, 0x68);
        assert_eq!(pic.master().state(), PicState::Normal);
        assert_eq!(pic.master().base(), 0x08);
    }

    #[test]
    fn test_line_out_of_range() {
        let mut pic = VirtualPic::new();
        let mut guest = guest();
        assert_eq!(pic.simulate_irq(VM, 16, &mut guest).unwrap(), IrqOutcome::Dropped);
    }

    proptest! {
        #[test]
        fn prop_masked_lines_never_delivered(
            mask in any::<u8>(),
            lines in proptest::collection::vec(0u8..8, 1..32),
        ) {
            let mut pic = VirtualPic::new();
            let mut guest = guest();
            init_single(&mut pic);
            pic.write_port(VM, MASTER_DATA, mask);

            for line in lines {
                guest.set_vif(true);
                if let IrqOutcome::Delivered { line, .. } =
                    pic.simulate_irq(VM, line, &mut guest).unwrap()
                {
                    prop_assert_eq!(mask & (1 << line), 0);
                }
                pic.write_port(VM, MASTER_CMD, 0x20);
            }
            prop_assert_eq!(pic.master().isr() & mask, 0);
        }

        #[test]
        fn prop_icw_sequence_ends_normal(
            single in any::<bool>(),
            want_icw4 in any::<bool>(),
            adi in any::<bool>(),
            icw2 in any::<u8>(),
            icw3 in any::<u8>(),
            aeoi in any::<bool>(),
        ) {
            let mut pic = VirtualPic::new();
            let icw1 = regs::ICW1_INIT
                | (u8::from(adi) << 2)
                | (u8::from(single) << 1)
                | u8::from(want_icw4);
            pic.write_port(VM, MASTER_CMD, icw1);
            pic.write_port(VM, MASTER_DATA, icw2);
            if !single {
                pic.write_port(VM, MASTER_DATA, icw3);
            }
            if want_icw4 {
                pic.write_port(VM, MASTER_DATA, regs::ICW4_8086 | (u8::from(aeoi) << 1));
            }

            let master = pic.master();
            prop_assert_eq!(master.state(), PicState::Normal);
            prop_assert_eq!(master.base(), icw2 & 0xF8);
            prop_assert_eq!(master.single(), single);
            prop_assert_eq!(master.auto_eoi(), want_icw4 && aeoi);
            if !single {
                prop_assert_eq!(master.icw3(), icw3);
            }
        }

        #[test]
        fn prop_eoi_clears_only_highest_isr(in_service in 1u8..=255, specific in any::<bool>()) {
            let mut pic = VirtualPic::new();
            let mut guest = guest();
            init_single(&mut pic);
            pic.write_port(VM, MASTER_DATA, 0x00);

            // Lowest priority first, so every delivery nests.
            for line in (0..8u8).rev().filter(|&l| in_service & (1 << l) != 0) {
                guest.set_vif(true);
                let out = pic.simulate_irq(VM, line, &mut guest).unwrap();
                prop_assert_eq!(out, IrqOutcome::Delivered { line, vector: 0x08 | line });
            }
            prop_assert_eq!(pic.master().isr(), in_service);

            let highest = in_service.trailing_zeros() as u8;
            let ocw2 = if specific { 0x60 | highest } else { 0x20 };
            pic.write_port(VM, MASTER_CMD, ocw2);
            prop_assert_eq!(pic.master().isr(), in_service & !(1 << highest));
        }
    }
}
