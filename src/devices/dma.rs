//! Virtual 8237A DMA controller pair with page registers.
//!
//! Only the programming interface is emulated: guest drivers can load
//! addresses, counts, modes and masks and read them back, but no transfer ever
//! happens. Collaborators that do move data (a floppy or sound device model)
//! query a channel with [`VirtualDma::info`] and update it with
//! [`VirtualDma::set_info`].
//!
//! # Port Map
//!
//! ```text
//!  controller 0 (channels 0-3, byte ports)   controller 1 (channels 4-7, word ports)
//!  0x00+2n  channel n address                0xC0+4n  channel 4+n address
//!  0x01+2n  channel n count                  0xC2+4n  channel 4+n count
//!  0x08     status (r) / command (w)         0xD0     status (r) / command (w)
//!  0x09     request                          0xD2     request
//!  0x0A     single mask                      0xD4     single mask
//!  0x0B     mode                             0xD6     mode
//!  0x0C     clear flip-flop                  0xD8     clear flip-flop
//!  0x0D     temp (r) / master clear (w)      0xDA     temp (r) / master clear (w)
//!  0x0E     clear mask                       0xDC     clear mask
//!  0x0F     all mask bits                    0xDE     all mask bits
//!
//!  page registers 0x80-0x8F: 0x87 ch0, 0x83 ch1, 0x81 ch2, 0x82 ch3,
//!                            0x8F ch4, 0x8B ch5, 0x89 ch6, 0x8A ch7
//! ```
//!
//! # Flip-Flops
//!
//! Address and count registers are 16 bits wide behind an 8-bit port. Each
//! channel keeps one flip-flop for its address register and one for its count
//! register; every byte access toggles the flip-flop of the register touched.
//! The clear flip-flop command resets all of a controller's flip-flops to the
//! low byte without changing any stored value.

use std::any::Any;

use super::{merge_byte, select_byte, DeviceBus, DeviceError, DeviceKind, VirtualDevice};
use crate::monitor::io::PortRange;

/// Number of channels across both controllers.
pub const DMA_CHANNELS: u8 = 8;

/// Page register port for each channel.
const PAGE_PORTS: [u16; DMA_CHANNELS as usize] = [0x87, 0x83, 0x81, 0x82, 0x8F, 0x8B, 0x89, 0x8A];

/// Control register indices, shared by both controllers.
mod regs {
    pub const STATUS_COMMAND: u8 = 0;
    pub const REQUEST: u8 = 1;
    pub const SINGLE_MASK: u8 = 2;
    pub const MODE: u8 = 3;
    pub const CLEAR_FLIP_FLOP: u8 = 4;
    pub const TEMP_MASTER_CLEAR: u8 = 5;
    pub const CLEAR_MASK: u8 = 6;
    pub const ALL_MASK: u8 = 7;
}

/// Programmed state of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaChannelInfo {
    /// Page register (address bits 23:16).
    pub page: u8,
    /// Base address register.
    pub address: u16,
    /// Base count register (transfer length minus one).
    pub length: u16,
    /// Last mode byte written for the channel, including its select bits.
    pub mode: u8,
    pub masked: bool,
    /// Software DMA request pending.
    pub requested: bool,
}

/// One register of a channel reached through a flip-flop.
#[derive(Debug, Clone, Copy, Default)]
struct FlipFlopRegister {
    value: u16,
    high: bool,
}

impl FlipFlopRegister {
    fn write(&mut self, byte: u8) {
        self.value = merge_byte(self.value, byte, self.high);
        self.high = !self.high;
    }

    fn read(&mut self) -> u8 {
        let byte = select_byte(self.value, self.high);
        self.high = !self.high;
        byte
    }
}

#[derive(Debug, Clone, Copy)]
struct DmaChannel {
    address: FlipFlopRegister,
    length: FlipFlopRegister,
    page: u8,
    mode: u8,
    masked: bool,
    requested: bool,
}

impl Default for DmaChannel {
    fn default() -> Self {
        Self {
            address: FlipFlopRegister::default(),
            length: FlipFlopRegister::default(),
            page: 0,
            mode: 0,
            masked: true,
            requested: false,
        }
    }
}

/// One 8237A (four channels).
#[derive(Debug, Clone, Default)]
struct DmaController {
    channels: [DmaChannel; 4],
    command: u8,
}

impl DmaController {
    fn clear_flip_flops(&mut self) {
        for ch in self.channels.iter_mut() {
            ch.address.high = false;
            ch.length.high = false;
        }
    }

    fn mask_bits(&self) -> u8 {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, ch)| ch.masked)
            .fold(0xF0, |bits, (i, _)| bits | (1 << i))
    }

    fn status(&self) -> u8 {
        // Transfers never run, so terminal count bits 3:0 stay clear.
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, ch)| ch.requested)
            .fold(0, |bits, (i, _)| bits | (0x10 << i))
    }

    fn write_channel(&mut self, channel: usize, count: bool, value: u8) {
        let ch = &mut self.channels[channel];
        if count {
            ch.length.write(value);
        } else {
            ch.address.write(value);
        }
    }

    fn read_channel(&mut self, channel: usize, count: bool) -> u8 {
        let ch = &mut self.channels[channel];
        if count {
            ch.length.read()
        } else {
            ch.address.read()
        }
    }

    fn write_control(&mut self, index: u8, value: u8) -> Result<(), DeviceError> {
        let ch = usize::from(value & 0x03);
        match index {
            regs::STATUS_COMMAND => {
                self.command = value;
                if value & 0x01 != 0 {
                    return Err(DeviceError::Unsupported {
                        device: "dma",
                        what: "memory-to-memory transfer",
                        value,
                    });
                }
            }
            regs::REQUEST => self.channels[ch].requested = value & 0x04 != 0,
            regs::SINGLE_MASK => self.channels[ch].masked = value & 0x04 != 0,
            regs::MODE => self.channels[ch].mode = value,
            regs::CLEAR_FLIP_FLOP => self.clear_flip_flops(),
            regs::TEMP_MASTER_CLEAR => {
                self.command = 0;
                self.clear_flip_flops();
                for ch in self.channels.iter_mut() {
                    ch.masked = true;
                    ch.requested = false;
                }
            }
            regs::CLEAR_MASK => {
                for ch in self.channels.iter_mut() {
                    ch.masked = false;
                }
            }
            regs::ALL_MASK => {
                for (i, ch) in self.channels.iter_mut().enumerate() {
                    ch.masked = value & (1 << i) != 0;
                }
            }
            _ => {
                return Err(DeviceError::InvalidState {
                    device: "dma",
                    state: "control register index",
                    value: index,
                })
            }
        }
        Ok(())
    }

    fn read_control(&self, index: u8) -> u8 {
        match index {
            regs::STATUS_COMMAND => self.status(),
            // Only memory-to-memory transfers load the temporary register.
            regs::TEMP_MASTER_CLEAR => 0,
            regs::ALL_MASK => self.mask_bits(),
            _ => 0xFF,
        }
    }
}

/// Where a port lands in the DMA block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DmaPort {
    /// Address (`count == false`) or count register of a channel.
    Channel {
        controller: usize,
        channel: usize,
        count: bool,
    },
    Control { controller: usize, index: u8 },
    Page(u8),
    /// Page block port with no channel behind it.
    Scratch(u8),
}

fn decode(port: u16) -> Option<DmaPort> {
    match port {
        0x00..=0x07 => Some(DmaPort::Channel {
            controller: 0,
            channel: usize::from(port >> 1),
            count: port & 1 != 0,
        }),
        0x08..=0x0F => Some(DmaPort::Control {
            controller: 0,
            index: (port - 0x08) as u8,
        }),
        0x80..=0x8F => {
            let index = (port - 0x80) as u8;
            match PAGE_PORTS.iter().position(|&p| p == port) {
                Some(channel) => Some(DmaPort::Page(channel as u8)),
                None => Some(DmaPort::Scratch(index)),
            }
        }
        0xC0..=0xCF if port & 1 == 0 => {
            let off = (port - 0xC0) >> 1;
            Some(DmaPort::Channel {
                controller: 1,
                channel: usize::from(off >> 1),
                count: off & 1 != 0,
            })
        }
        0xD0..=0xDF if port & 1 == 0 => Some(DmaPort::Control {
            controller: 1,
            index: ((port - 0xD0) >> 1) as u8,
        }),
        _ => None,
    }
}

/// The two 8237As of one VM.
#[derive(Debug, Clone, Default)]
pub struct VirtualDma {
    controllers: [DmaController; 2],
    scratch: [u8; 16],
}

impl VirtualDma {
    pub fn new() -> Self {
        Self::default()
    }

    fn split(channel: u8) -> Result<(usize, usize), DeviceError> {
        if channel >= DMA_CHANNELS {
            return Err(DeviceError::ChannelOutOfRange(channel));
        }
        Ok((usize::from(channel / 4), usize::from(channel % 4)))
    }

    /// Programmed state of `channel` (0..8).
    pub fn info(&self, channel: u8) -> Result<DmaChannelInfo, DeviceError> {
        let (c, n) = Self::split(channel)?;
        let ch = &self.controllers[c].channels[n];
        Ok(DmaChannelInfo {
            page: ch.page,
            address: ch.address.value,
            length: ch.length.value,
            mode: ch.mode,
            masked: ch.masked,
            requested: ch.requested,
        })
    }

    /// Overwrite the programmed state of `channel`. Flip-flops are untouched.
    pub fn set_info(&mut self, channel: u8, info: DmaChannelInfo) -> Result<(), DeviceError> {
        let (c, n) = Self::split(channel)?;
        let ch = &mut self.controllers[c].channels[n];
        ch.page = info.page;
        ch.address.value = info.address;
        ch.length.value = info.length;
        ch.mode = info.mode;
        ch.masked = info.masked;
        ch.requested = info.requested;
        Ok(())
    }

    /// Handle a guest write to a DMA port.
    pub fn write_port(&mut self, port: u16, value: u8) -> Result<(), DeviceError> {
        match decode(port) {
            Some(DmaPort::Channel {
                controller,
                channel,
                count,
            }) => self.controllers[controller].write_channel(channel, count, value),
            Some(DmaPort::Control { controller, index }) => {
                return self.controllers[controller].write_control(index, value)
            }
            Some(DmaPort::Page(channel)) => {
                let (c, n) = Self::split(channel)?;
                self.controllers[c].channels[n].page = value;
            }
            Some(DmaPort::Scratch(index)) => self.scratch[usize::from(index)] = value,
            None => {}
        }
        Ok(())
    }

    /// Handle a guest read from a DMA port.
    pub fn read_port(&mut self, port: u16) -> u8 {
        match decode(port) {
            Some(DmaPort::Channel {
                controller,
                channel,
                count,
            }) => self.controllers[controller].read_channel(channel, count),
            Some(DmaPort::Control { controller, index }) => {
                self.controllers[controller].read_control(index)
            }
            Some(DmaPort::Page(channel)) => match Self::split(channel) {
                Ok((c, n)) => self.controllers[c].channels[n].page,
                Err(_) => 0xFF,
            },
            Some(DmaPort::Scratch(index)) => self.scratch[usize::from(index)],
            None => 0xFF,
        }
    }
}

impl VirtualDevice for VirtualDma {
    fn name(&self) -> &'static str {
        "dma"
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Dma
    }

    fn port_ranges(&self) -> Vec<PortRange> {
        [(0x00, 0x0F), (0x80, 0x8F), (0xC0, 0xDF)]
            .into_iter()
            .filter_map(|(first, last)| PortRange::inclusive(first, last))
            .collect()
    }

    fn io_read(&mut self, port: u16, _bus: &mut DeviceBus<'_>) -> u8 {
        self.read_port(port)
    }

    fn io_write(&mut self, port: u16, value: u8, bus: &mut DeviceBus<'_>) {
        if let Err(e) = self.write_port(port, value) {
            e.log(bus.vm());
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
