//! VM slot table and per-VM device ownership.
//!
//! The registry owns every live [`Vm`]. A VM in turn owns everything attached
//! to it: its guest context, its device arena, its I/O and ARPL handler tables
//! and its kill-handler list.
//!
//! ```text
//! VmRegistry
//! ├── slot 0: generation 3, Vm ─┬─ Guest (frame, memory)
//! │                             ├─ devices: [PIC, PIT, DMA, CMOS]  (arena)
//! │                             ├─ io:      0x20-0x21 → DeviceId(0), ...
//! │                             ├─ arpl:    service → handler
//! │                             └─ kill:    [Device(0), Device(1), Callback]
//! ├── slot 1: generation 1, free
//! └── ...
//! ```
//!
//! # Identity
//!
//! A [`VmId`] is a slot index plus the slot's generation at creation time.
//! Killing a VM bumps the generation, so an id held past `kill_vm` can never
//! reach the next VM placed in the same slot.
//!
//! # Teardown Order
//!
//! Kill handlers run in registration order. Devices register theirs when they
//! are attached, so a device that refers to another (the PIT raises IRQs on
//! the PIC) must be attached after it and is torn down after it.

use std::fmt;

use super::guest::Guest;
use super::io::{ArplTable, IoHandlerTable};
use super::MonitorError;
use crate::clock::TickSource;
use crate::devices::pic::VirtualPic;
use crate::devices::{DeviceBus, VirtualDevice};
use crate::memory::GuestMemory;

/// Number of legacy IRQ lines that can be routed to a VM.
pub const HOST_IRQ_LINES: usize = 16;

/// Identity of a VM: slot index plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId {
    slot: u16,
    generation: u32,
}

impl VmId {
    pub(crate) const fn new(slot: u16, generation: u32) -> Self {
        Self { slot, generation }
    }

    /// Slot index in the registry.
    pub fn slot(&self) -> usize {
        usize::from(self.slot)
    }

    /// Generation of the slot when the VM was created.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm{}.{}", self.slot, self.generation)
    }
}

/// Index of a device in its VM's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub(crate) usize);

impl DeviceId {
    /// Arena index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Teardown callback supplied by a collaborator.
pub type KillCallback = Box<dyn FnOnce(VmId) + Send>;

/// One entry of a VM's kill-handler list.
pub enum KillHandler {
    /// Tear down an attached device.
    Device(DeviceId),
    /// Run a collaborator's callback.
    Callback {
        /// Name shown in diagnostics.
        name: &'static str,
        /// The callback itself.
        run: KillCallback,
    },
}

/// One guest session.
pub struct Vm {
    id: VmId,
    /// Guest virtual-8086 context.
    pub(crate) guest: Guest,
    /// Device arena. Slots are emptied while a device is being dispatched to
    /// and permanently when it is torn down.
    pub(crate) devices: Vec<Option<Box<dyn VirtualDevice>>>,
    /// Port ranges owned by devices.
    pub(crate) io: IoHandlerTable,
    /// ARPL monitor-call services.
    pub(crate) arpl: ArplTable,
    /// Teardown list, run in order by `kill_vm`.
    pub(crate) kill_handlers: Vec<KillHandler>,
    /// Host task bound to this VM, if any.
    pub(crate) task: Option<u32>,
}

impl Vm {
    fn new(id: VmId, memory: GuestMemory, max_io_handlers: usize) -> Self {
        Self {
            id,
            guest: Guest::new(memory),
            devices: Vec::new(),
            io: IoHandlerTable::new(max_io_handlers),
            arpl: ArplTable::new(),
            kill_handlers: Vec::new(),
            task: None,
        }
    }

    /// This VM's identity.
    pub fn id(&self) -> VmId {
        self.id
    }

    /// Guest context.
    pub fn guest(&self) -> &Guest {
        &self.guest
    }

    /// Store `device` in the arena and register its kill handler.
    pub(crate) fn attach(&mut self, device: Box<dyn VirtualDevice>) -> DeviceId {
        let id = DeviceId(self.devices.len());
        self.devices.push(Some(device));
        self.kill_handlers.push(KillHandler::Device(id));
        id
    }

    /// Take device `id` back out of the VM together with its port ranges and
    /// kill handler.
    pub(crate) fn detach(&mut self, id: DeviceId) -> Option<Box<dyn VirtualDevice>> {
        let device = self.devices.get_mut(id.0)?.take()?;
        self.io.remove_device(id);
        self.kill_handlers
            .retain(|h| !matches!(h, KillHandler::Device(d) if *d == id));
        Some(device)
    }

    /// True if `id` names a live device in the arena.
    pub(crate) fn has_device(&self, id: DeviceId) -> bool {
        matches!(self.devices.get(id.0), Some(Some(_)))
    }

    /// The attached device of concrete type `T`, if any.
    pub(crate) fn find_device<T: VirtualDevice + 'static>(&self) -> Option<&T> {
        self.devices
            .iter()
            .flatten()
            .find_map(|d| d.as_any().downcast_ref::<T>())
    }

    /// Id of the attached device of concrete type `T`.
    pub(crate) fn device_id_of<T: VirtualDevice + 'static>(&self) -> Option<DeviceId> {
        self.devices
            .iter()
            .position(|d| matches!(d, Some(d) if d.as_any().is::<T>()))
            .map(DeviceId)
    }

    /// Mutable access to the attached device of concrete type `T`.
    pub(crate) fn find_device_mut<T: VirtualDevice + 'static>(&mut self) -> Option<&mut T> {
        self.devices
            .iter_mut()
            .flatten()
            .find_map(|d| d.as_any_mut().downcast_mut::<T>())
    }

    /// Split borrow of the PIC and the guest context.
    pub(crate) fn pic_and_guest(&mut self) -> (Option<&mut VirtualPic>, &mut Guest) {
        let pic = self
            .devices
            .iter_mut()
            .flatten()
            .find_map(|d| d.as_any_mut().downcast_mut::<VirtualPic>());
        (pic, &mut self.guest)
    }

    /// Run `f` against device `id` with a bus wired to this VM.
    ///
    /// The device is lifted out of the arena for the duration of the call so
    /// that the bus can hand out the PIC and the guest context alongside it.
    pub(crate) fn with_device<R>(
        &mut self,
        id: DeviceId,
        clock: &TickSource,
        f: impl FnOnce(&mut dyn VirtualDevice, &mut DeviceBus<'_>) -> R,
    ) -> Option<R> {
        let mut device = self.devices.get_mut(id.0)?.take()?;
        let vm = self.id;
        let result = {
            let (pic, guest) = self.pic_and_guest();
            let mut bus = DeviceBus::new(vm, clock, guest, pic);
            f(device.as_mut(), &mut bus)
        };
        self.devices[id.0] = Some(device);
        Some(result)
    }

    /// Ids of all live devices, in attach order.
    pub(crate) fn device_ids(&self) -> Vec<DeviceId> {
        self.devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_some())
            .map(|(i, _)| DeviceId(i))
            .collect()
    }

    /// Names of all live devices, in attach order.
    pub fn device_names(&self) -> Vec<&'static str> {
        self.devices.iter().flatten().map(|d| d.name()).collect()
    }

    /// Run every kill handler in registration order.
    ///
    /// `on_device` is called with each device after its own `kill` hook has
    /// run and before it is dropped.
    pub(crate) fn run_kill_handlers(&mut self, mut on_device: impl FnMut(&dyn VirtualDevice)) {
        let handlers = std::mem::take(&mut self.kill_handlers);
        for handler in handlers {
            match handler {
                KillHandler::Device(id) => {
                    let Some(mut device) = self.devices.get_mut(id.0).and_then(Option::take)
                    else {
                        continue;
                    };
                    device.kill(self.id);
                    self.io.remove_device(id);
                    on_device(device.as_ref());
                    tracing::debug!(vm = %self.id, device = device.name(), "device torn down");
                }
                KillHandler::Callback { name, run } => {
                    tracing::debug!(vm = %self.id, handler = name, "running kill handler");
                    run(self.id);
                }
            }
        }
    }
}

/// A registry slot.
struct Slot {
    generation: u32,
    vm: Option<Vm>,
}

/// Fixed-size VM slot table.
pub struct VmRegistry {
    slots: Vec<Slot>,
    /// Host IRQ line → VM receiving it.
    irq_owners: [Option<VmId>; HOST_IRQ_LINES],
}

impl VmRegistry {
    /// Create a table with `max_vms` slots.
    pub fn new(max_vms: usize) -> Self {
        Self {
            slots: (0..max_vms)
                .map(|_| Slot {
                    generation: 0,
                    vm: None,
                })
                .collect(),
            irq_owners: [None; HOST_IRQ_LINES],
        }
    }

    /// Allocate a VM in the first free slot.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` if every slot is occupied.
    pub fn create(
        &mut self,
        memory: GuestMemory,
        max_io_handlers: usize,
    ) -> Result<VmId, MonitorError> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.vm.is_none())
            .ok_or(MonitorError::ResourceExhausted {
                resource: "VM slot",
            })?;

        let id = VmId::new(index as u16, slot.generation);
        slot.vm = Some(Vm::new(id, memory, max_io_handlers));
        Ok(id)
    }

    /// The live VM for `id`.
    pub fn get(&self, id: VmId) -> Option<&Vm> {
        self.slots
            .get(id.slot())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.vm.as_ref())
    }

    /// Mutable access to the live VM for `id`.
    pub fn get_mut(&mut self, id: VmId) -> Option<&mut Vm> {
        self.slots
            .get_mut(id.slot())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.vm.as_mut())
    }

    /// Remove the VM for `id` and invalidate the id.
    pub fn remove(&mut self, id: VmId) -> Option<Vm> {
        let slot = self
            .slots
            .get_mut(id.slot())
            .filter(|s| s.generation == id.generation)?;
        let vm = slot.vm.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        for owner in self.irq_owners.iter_mut() {
            if *owner == Some(id) {
                *owner = None;
            }
        }
        Some(vm)
    }

    /// Iterate over live VMs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Vm> {
        self.slots.iter().filter_map(|s| s.vm.as_ref())
    }

    /// Iterate mutably over live VMs in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Vm> {
        self.slots.iter_mut().filter_map(|s| s.vm.as_mut())
    }

    /// The VM bound to host task `pid`.
    pub fn find_by_task(&self, pid: u32) -> Option<VmId> {
        self.iter().find(|vm| vm.task == Some(pid)).map(Vm::id)
    }

    /// The VM receiving host IRQ `irq`.
    pub fn irq_owner(&self, irq: u8) -> Option<VmId> {
        self.irq_owners.get(usize::from(irq)).copied().flatten()
    }

    /// Route host IRQ `irq` to `vm`, or unroute it with `None`.
    pub fn set_irq_owner(&mut self, irq: u8, vm: Option<VmId>) -> bool {
        match self.irq_owners.get_mut(usize::from(irq)) {
            Some(owner) => {
                *owner = vm;
                true
            }
            None => false,
        }
    }
}
