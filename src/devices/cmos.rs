//! Virtual MC146818 CMOS RAM and real-time clock.
//!
//! The CMOS is accessed via I/O ports 0x70 (index) and 0x71 (data). The guest
//! writes a register index to port 0x70, then reads or writes the register
//! through port 0x71. Bit 7 of the index byte is the NMI mask on real
//! hardware and is not part of the index.
//!
//! The clock does not run: the time registers hold midnight, Saturday
//! January 1 2000, in BCD. Status register A never reports an update in
//! progress, so guest code polling UIP before reading the time proceeds
//! immediately.
//!
//! ```text
//!  0x00-0x09  time and date (BCD)       0x14       equipment byte
//!  0x0A-0x0D  status registers A-D      0x15-0x16  base memory in KiB
//!  0x0E       diagnostic status         0x17-0x18  extended memory in KiB
//!  0x0F       shutdown status           0x30-0x31  extended memory (copy)
//!  0x10-0x2F  configuration             0x32       century (BCD)
//! ```
//!
//! Reference: <https://wiki.osdev.org/CMOS>

use std::any::Any;

use super::{DeviceBus, DeviceKind, VirtualDevice};
use crate::monitor::io::PortRange;

/// CMOS I/O port for the index register.
pub const CMOS_PORT_INDEX: u16 = 0x70;

/// CMOS I/O port for the data register.
pub const CMOS_PORT_DATA: u16 = 0x71;

/// Size of the register file.
const CMOS_SIZE: usize = 128;

mod regs {
    pub const SECONDS: u8 = 0x00;
    pub const DAY_OF_WEEK: u8 = 0x06;
    pub const DAY_OF_MONTH: u8 = 0x07;
    pub const MONTH: u8 = 0x08;
    pub const YEAR: u8 = 0x09;
    /// Status Register A - bit 7 is UIP (Update In Progress).
    pub const STATUS_A: u8 = 0x0A;
    /// Status Register B - format and interrupt control.
    pub const STATUS_B: u8 = 0x0B;
    /// Status Register C - interrupt flags (read clears).
    pub const STATUS_C: u8 = 0x0C;
    /// Status Register D - bit 7 indicates valid RAM/time.
    pub const STATUS_D: u8 = 0x0D;
    pub const EQUIPMENT: u8 = 0x14;
    pub const BASE_MEM_LOW: u8 = 0x15;
    pub const EXT_MEM_LOW: u8 = 0x17;
    pub const EXT_MEM_LOW_COPY: u8 = 0x30;
    pub const CENTURY: u8 = 0x32;
}

/// Conventional memory reported to the guest, in KiB.
const BASE_MEMORY_KB: u16 = 640;

/// CMOS register file of one VM.
#[derive(Debug, Clone)]
pub struct VirtualCmos {
    /// Currently selected register index.
    index: u8,
    ram: [u8; CMOS_SIZE],
}

impl VirtualCmos {
    /// Register file for a guest with `memory_size` bytes of RAM.
    pub fn new(memory_size: u64) -> Self {
        let mut ram = [0u8; CMOS_SIZE];

        // Midnight, Saturday 2000-01-01.
        ram[usize::from(regs::DAY_OF_WEEK)] = 0x07;
        ram[usize::from(regs::DAY_OF_MONTH)] = 0x01;
        ram[usize::from(regs::MONTH)] = 0x01;
        ram[usize::from(regs::YEAR)] = 0x00;
        ram[usize::from(regs::CENTURY)] = 0x20;

        // Standard divider settings, UIP=0.
        ram[usize::from(regs::STATUS_A)] = 0x26;
        // 24-hour mode, BCD, no interrupts.
        ram[usize::from(regs::STATUS_B)] = 0x02;
        ram[usize::from(regs::STATUS_D)] = 0x80;

        // One floppy drive, 80x25 colour display.
        ram[usize::from(regs::EQUIPMENT)] = 0x21;

        let base_kb = BASE_MEMORY_KB.to_le_bytes();
        ram[usize::from(regs::BASE_MEM_LOW)..][..2].copy_from_slice(&base_kb);

        let ext_kb = u16::try_from(memory_size.saturating_sub(0x10_0000) / 1024)
            .unwrap_or(u16::MAX)
            .to_le_bytes();
        ram[usize::from(regs::EXT_MEM_LOW)..][..2].copy_from_slice(&ext_kb);
        ram[usize::from(regs::EXT_MEM_LOW_COPY)..][..2].copy_from_slice(&ext_kb);

        Self { index: 0, ram }
    }

    /// Currently selected register.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Raw register value.
    pub fn register(&self, index: u8) -> u8 {
        self.ram[usize::from(index) % CMOS_SIZE]
    }

    /// Write to CMOS (port 0x70 or 0x71).
    pub fn write(&mut self, port: u16, value: u8) {
        match port {
            CMOS_PORT_INDEX => self.index = value & 0x7F,
            CMOS_PORT_DATA => match self.index {
                // UIP and the interrupt flags are read-only.
                regs::STATUS_A => {
                    let reg = &mut self.ram[usize::from(regs::STATUS_A)];
                    *reg = (*reg & 0x80) | (value & 0x7F);
                }
                regs::STATUS_C | regs::STATUS_D => {}
                index => self.ram[usize::from(index)] = value,
            },
            _ => {}
        }
    }

    /// Read from CMOS (port 0x71).
    pub fn read(&mut self, port: u16) -> u8 {
        if port != CMOS_PORT_DATA {
            return 0xFF;
        }
        let value = self.ram[usize::from(self.index)];
        if self.index == regs::STATUS_C {
            self.ram[usize::from(regs::STATUS_C)] = 0;
        }
        value
    }
}

impl VirtualDevice for VirtualCmos {
    fn name(&self) -> &'static str {
        "cmos"
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Cmos
    }

    fn port_ranges(&self) -> Vec<PortRange> {
        PortRange::inclusive(CMOS_PORT_INDEX, CMOS_PORT_DATA)
            .into_iter()
            .collect()
    }

    fn io_read(&mut self, port: u16, _bus: &mut DeviceBus<'_>) -> u8 {
        self.read(port)
    }

    fn io_write(&mut self, port: u16, value: u8, _bus: &mut DeviceBus<'_>) {
        self.write(port, value);
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
    use crate::memory::REAL_MODE_MEMORY_SIZE;

    fn read_reg(cmos: &mut VirtualCmos, index: u8) -> u8 {
        cmos.write(CMOS_PORT_INDEX, index);
        cmos.read(CMOS_PORT_DATA)
    }

    #[test]
    fn test_status_registers_report_ready() {
        let mut cmos = VirtualCmos::new(REAL_MODE_MEMORY_SIZE);
        assert_eq!(read_reg(&mut cmos, regs::STATUS_A) & 0x80, 0);
        assert_eq!(read_reg(&mut cmos, regs::STATUS_D), 0x80);
    }

    #[test]
    fn test_static_time() {
        let mut cmos = VirtualCmos::new(REAL_MODE_MEMORY_SIZE);
        assert_eq!(read_reg(&mut cmos, regs::SECONDS), 0x00);
        assert_eq!(read_reg(&mut cmos, regs::MONTH), 0x01);
        assert_eq!(read_reg(&mut cmos, regs::CENTURY), 0x20);
    }

    #[test]
    fn test_nmi_bit_is_not_part_of_index() {
        let mut cmos = VirtualCmos::new(REAL_MODE_MEMORY_SIZE);
        cmos.write(CMOS_PORT_INDEX, 0x80 | regs::CENTURY);
        assert_eq!(cmos.index(), regs::CENTURY);
        assert_eq!(cmos.read(CMOS_PORT_DATA), 0x20);
    }

    #[test]
    fn test_memory_size_bytes() {
        let mut cmos = VirtualCmos::new(REAL_MODE_MEMORY_SIZE);
        assert_eq!(read_reg(&mut cmos, 0x15), 0x80);
        assert_eq!(read_reg(&mut cmos, 0x16), 0x02);
        // 64 KiB of HMA above 1 MiB.
        assert_eq!(read_reg(&mut cmos, 0x17), 64);
        assert_eq!(read_reg(&mut cmos, 0x18), 0);
        assert_eq!(cmos.register(0x30), 64);

        let small = VirtualCmos::new(0x8_0000);
        assert_eq!(small.register(0x17), 0);
    }

    #[test]
    fn test_scratch_registers_are_writable() {
        let mut cmos = VirtualCmos::new(REAL_MODE_MEMORY_SIZE);
        cmos.write(CMOS_PORT_INDEX, 0x40);
        cmos.write(CMOS_PORT_DATA, 0x5A);
        assert_eq!(read_reg(&mut cmos, 0x40), 0x5A);

        // Status D is read-only.
        cmos.write(CMOS_PORT_INDEX, regs::STATUS_D);
        cmos.write(CMOS_PORT_DATA, 0x00);
        assert_eq!(read_reg(&mut cmos, regs::STATUS_D), 0x80);
    }

    #[test]
    fn test_index_port_reads_float() {
        let mut cmos = VirtualCmos::new(REAL_MODE_MEMORY_SIZE);
        assert_eq!(cmos.read(CMOS_PORT_INDEX), 0xFF);
    }
}
