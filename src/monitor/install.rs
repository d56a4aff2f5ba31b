//! Installing the standard virtual devices and inspecting their state.

use super::registry::Vm;
use super::{DeviceId, Monitor, MonitorError, VmId};
use crate::devices::pit::{PitCallback, PIT_CHANNELS};
use crate::devices::{
    DeviceError, DmaChannelInfo, PitChannelInfo, VirtualCmos, VirtualDevice, VirtualDma,
    VirtualPic, VirtualPit,
};

impl Monitor {
    /// Attach `device` and route its default port ranges to it.
    ///
    /// Nothing is left behind on failure: routed ranges are removed, the
    /// device is detached and its module is closed again.
    pub fn install_device(
        &self,
        id: VmId,
        device: Box<dyn VirtualDevice>,
    ) -> Result<DeviceId, MonitorError> {
        let mut vms = self.vms.lock();
        let vm = vms.get_mut(id).ok_or(MonitorError::NoSuchVm(id))?;

        let module = device.kind().module();
        if let Some(module) = module {
            self.modules.lock().open(module, 0)?;
        }
        let ranges = device.port_ranges();
        let name = device.name();
        let dev = vm.attach(device);

        for range in ranges {
            if let Err(e) = vm.io.add(range, dev) {
                vm.detach(dev);
                if let Some(module) = module {
                    self.close_module_logged(module);
                }
                tracing::warn!(vm = %id, device = name, "install failed: {e}");
                return Err(e);
            }
        }
        tracing::debug!(vm = %id, device = name, "device installed");
        Ok(dev)
    }

    /// Install the 8259 pair on ports 0x20-0x21 and 0xA0-0xA1.
    pub fn install_pic(&self, id: VmId) -> Result<DeviceId, MonitorError> {
        self.install_device(id, Box::new(VirtualPic::new()))
    }

    /// Install the 8254 on ports 0x40-0x43.
    ///
    /// Install the PIC first: the PIT raises IRQ0 on it and is torn down
    /// after it.
    pub fn install_pit(&self, id: VmId) -> Result<DeviceId, MonitorError> {
        self.install_device(id, Box::new(VirtualPit::new()))
    }

    /// Install the 8237 pair on ports 0x00-0x0F, 0x80-0x8F and 0xC0-0xDF.
    pub fn install_dma(&self, id: VmId) -> Result<DeviceId, MonitorError> {
        self.install_device(id, Box::new(VirtualDma::new()))
    }

    /// Install the CMOS RAM on ports 0x70-0x71, sized for the VM's memory.
    pub fn install_cmos(&self, id: VmId) -> Result<DeviceId, MonitorError> {
        let size = self.with_guest(id, |g| g.memory().size())?;
        self.install_device(id, Box::new(VirtualCmos::new(size)))
    }

    /// PIC, PIT, DMA and CMOS, in that order.
    pub fn install_standard_devices(&self, id: VmId) -> Result<(), MonitorError> {
        self.install_pic(id)?;
        self.install_pit(id)?;
        self.install_dma(id)?;
        self.install_cmos(id)?;
        Ok(())
    }

    fn no_device(id: VmId, device: &'static str) -> MonitorError {
        MonitorError::NoSuchDevice { vm: id, device }
    }

    /// Run PIT expiry up to the current tick before its state is read.
    fn sync_pit(&self, id: VmId, vm: &mut Vm) -> Result<(), MonitorError> {
        let pit = vm
            .device_id_of::<VirtualPit>()
            .ok_or(Self::no_device(id, "pit"))?;
        vm.with_device(pit, &self.clock, |d, bus| d.tick(bus));
        Ok(())
    }

    /// State of PIT `channel`, with expiry run up to the current tick.
    pub fn get_vpit(&self, id: VmId, channel: u8) -> Result<PitChannelInfo, MonitorError> {
        self.with_vm(id, |vm| {
            self.sync_pit(id, vm)?;
            let pit = vm
                .find_device::<VirtualPit>()
                .ok_or(Self::no_device(id, "pit"))?;
            pit.info(channel)
                .ok_or(MonitorError::Device(DeviceError::ChannelOutOfRange(channel)))
        })
    }

    /// State of every PIT channel, with expiry run up to the current tick.
    pub fn get_vpit_all(&self, id: VmId) -> Result<[PitChannelInfo; PIT_CHANNELS], MonitorError> {
        self.with_vm(id, |vm| {
            self.sync_pit(id, vm)?;
            vm.find_device::<VirtualPit>()
                .map(VirtualPit::snapshot)
                .ok_or(Self::no_device(id, "pit"))
        })
    }

    /// Run `callback` on every expiry of PIT `channel`, or stop with `None`.
    ///
    /// The callback runs with the registry locked and must not call back
    /// into the monitor.
    pub fn set_pit_callback(
        &self,
        id: VmId,
        channel: u8,
        callback: Option<PitCallback>,
    ) -> Result<(), MonitorError> {
        self.with_vm(id, |vm| {
            let pit = vm
                .find_device_mut::<VirtualPit>()
                .ok_or(Self::no_device(id, "pit"))?;
            Ok(pit.set_callback(channel, callback)?)
        })
    }

    /// Programmed state of DMA `channel`.
    pub fn get_dma_info(&self, id: VmId, channel: u8) -> Result<DmaChannelInfo, MonitorError> {
        self.with_vm(id, |vm| {
            let dma = vm
                .find_device::<VirtualDma>()
                .ok_or(Self::no_device(id, "dma"))?;
            Ok(dma.info(channel)?)
        })
    }

    /// Overwrite the programmed state of DMA `channel`.
    pub fn set_dma_info(
        &self,
        id: VmId,
        channel: u8,
        info: DmaChannelInfo,
    ) -> Result<(), MonitorError> {
        self.with_vm(id, |vm| {
            let dma = vm
                .find_device_mut::<VirtualDma>()
                .ok_or(Self::no_device(id, "dma"))?;
            Ok(dma.set_info(channel, info)?)
        })
    }
}
