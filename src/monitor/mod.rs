//! The virtual-8086 monitor core.
//!
//! A [`Monitor`] is the process-lifetime object that owns every guest session
//! (VM) and the tables shared between them. Guests run in virtual-8086 mode;
//! whenever one executes a privileged operation the host kernel traps into the
//! monitor, which emulates it against the VM's virtual devices and resumes the
//! guest.
//!
//! # Architecture
//!
//! ```text
//!  host timer IRQ     host device IRQ       guest IN/OUT trap    guest ARPL trap
//!        │                  │                      │                    │
//!        ▼                  ▼                      ▼                    ▼
//!   timer_tick(n)     hardware_irq(irq)      io_in / io_out       dispatch_arpl
//!        │                  │                      │                    │
//!        └──────────────────┴─────────┬────────────┴────────────────────┘
//!                                     ▼
//!                       spin::Mutex<VmRegistry>  (interrupts off)
//!                                     │
//!              ┌──────────────────────┼─────────────────────┐
//!              ▼                      ▼                     ▼
//!          Vm (slot 0)            Vm (slot 1)              ...
//!      PIC · PIT · DMA · CMOS    PIC · PIT
//!              │
//!              ▼
//!      Guest::simulate_int ──► next resume enters the guest's handler
//! ```
//!
//! # Critical Sections
//!
//! Every entry point takes the registry lock for its whole duration. That
//! single lock stands in for running with host interrupts disabled: an IRQ
//! raised against a VM is serialized against the guest's EOI, PIT expiry is
//! serialized against PIT reprogramming, and `kill_vm` unlinks a VM's devices
//! without any tick observing a half-destroyed VM. Lock order is registry,
//! then module table.
//!
//! Kill handlers and PIT callbacks run with the registry lock held and must
//! not call back into the monitor.

mod install;
pub mod guest;
pub mod io;
pub mod modules;
pub mod registry;
pub mod shell;

use std::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;
use thiserror::Error;

use crate::clock::TickSource;
use crate::config::MonitorConfig;
use crate::devices::{DeviceError, IrqOutcome, VirtualDevice, VirtualPic};
use crate::memory::{GuestMemory, MemoryError};

pub use guest::{Guest, InjectError, V86Frame};
pub use io::{ArplHandler, IoData, IoHandlerEntry, IoOutcome, PortRange};
pub use modules::{ModuleInfo, ModuleTable, BUILTIN_MODULES};
pub use registry::{DeviceId, KillCallback, VmId, VmRegistry, HOST_IRQ_LINES};
pub use shell::{Shell, ShellCommand, ShellError};

/// Errors that can occur in monitor operations.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// A fixed-size table has no free entry.
    #[error("No free {resource}")]
    ResourceExhausted { resource: &'static str },

    /// The requested port range or service overlaps an existing registration.
    #[error("Range {start:#x}-{end:#x} overlaps an existing registration")]
    Conflict { start: u16, end: u16 },

    /// The VM id is dead or was never allocated.
    #[error("No such VM: {0}")]
    NoSuchVm(VmId),

    /// The guest cannot take an interrupt right now.
    ///
    /// The PIC keeps the request latched and delivers it once the guest can
    /// be resumed and has interrupts enabled.
    #[error("VM {0} is not resumable")]
    NotResumable(VmId),

    /// The VM has no device of the requested kind.
    #[error("VM {vm} has no {device}")]
    NoSuchDevice { vm: VmId, device: &'static str },

    /// Guest memory could not be allocated or accessed.
    #[error("Guest memory error: {0}")]
    GuestMemory(#[from] MemoryError),

    /// No module with this name exists.
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// The module is older than the caller requires.
    #[error("Module {name} has version {have}, need {want}")]
    ModuleVersion {
        name: &'static str,
        have: u32,
        want: u32,
    },

    /// The module is still open and cannot be expunged.
    #[error("Module {0} is in use")]
    ModuleBusy(&'static str),

    /// Opening the module would recurse into itself.
    #[error("Module dependency cycle through {0}")]
    ModuleCycle(&'static str),

    /// The configuration is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A device rejected a request.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

impl MonitorError {
    fn from_inject(vm: VmId, err: InjectError) -> Self {
        match err {
            InjectError::NotResumable => MonitorError::NotResumable(vm),
            InjectError::Memory(e) => MonitorError::GuestMemory(e),
        }
    }
}

/// Point-in-time description of one VM, for diagnostics.
#[derive(Debug, Clone)]
pub struct VmSummary {
    pub id: VmId,
    pub vif: bool,
    pub resumable: bool,
    pub injected: u64,
    pub task: Option<u32>,
    pub devices: Vec<(DeviceId, &'static str)>,
    pub io: Vec<IoHandlerEntry>,
    pub arpl: Vec<(u8, &'static str)>,
}

impl VmSummary {
    /// Name of device `id`, or `"?"` if it is gone.
    pub fn device_name(&self, id: DeviceId) -> &'static str {
        self.devices
            .iter()
            .find(|(d, _)| *d == id)
            .map(|(_, name)| *name)
            .unwrap_or("?")
    }
}

/// The monitor: VM registry, module table, shell and global tick source.
pub struct Monitor {
    config: MonitorConfig,
    clock: TickSource,
    vms: Mutex<VmRegistry>,
    modules: Mutex<ModuleTable>,
    shell: Mutex<Shell>,
    /// Log every trapped port access.
    io_trace: AtomicBool,
}

impl Monitor {
    /// Create a monitor with the built-in modules and shell commands.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `config` fails validation.
    pub fn new(config: MonitorConfig) -> Result<Self, MonitorError> {
        config.validate()?;
        tracing::info!(
            max_vms = config.max_vms,
            tick_hz = config.tick_hz,
            memory = config.guest_memory_size,
            "monitor starting"
        );
        Ok(Self {
            clock: TickSource::new(config.tick_hz),
            vms: Mutex::new(VmRegistry::new(config.max_vms)),
            modules: Mutex::new(ModuleTable::default()),
            shell: Mutex::new(Shell::default()),
            io_trace: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// The global tick source.
    pub fn clock(&self) -> &TickSource {
        &self.clock
    }

    /// Run `f` against the live VM `id` with the registry locked.
    ///
    /// A guest left faulted by `f` is killed before the lock is released.
    fn with_vm<R>(
        &self,
        id: VmId,
        f: impl FnOnce(&mut registry::Vm) -> Result<R, MonitorError>,
    ) -> Result<R, MonitorError> {
        let mut vms = self.vms.lock();
        let vm = vms.get_mut(id).ok_or(MonitorError::NoSuchVm(id))?;
        let result = f(vm);
        if vm.guest.faulted() {
            self.kill_faulted(&mut vms, id);
        }
        result
    }

    // ---- VM registry ----

    /// Allocate a VM with fresh guest memory, no devices and an empty
    /// kill-handler list.
    ///
    /// # Errors
    ///
    /// - `ResourceExhausted` if every VM slot is in use.
    /// - `GuestMemory` if guest RAM cannot be mapped.
    pub fn create_vm(&self) -> Result<VmId, MonitorError> {
        let memory = GuestMemory::new(self.config.guest_memory_size)?;

        let mut vms = self.vms.lock();
        let id = vms.create(memory, self.config.max_io_handlers)?;
        if let Err(e) = self.modules.lock().open("vm", 0) {
            vms.remove(id);
            return Err(e);
        }
        tracing::info!(vm = %id, "VM created");
        Ok(id)
    }

    /// Run every kill handler of `id` in registration order, then invalidate
    /// the id. A dead id is ignored.
    pub fn kill_vm(&self, id: VmId) {
        let mut vms = self.vms.lock();
        if !self.kill_locked(&mut vms, id) {
            tracing::debug!(vm = %id, "kill of a dead VM ignored");
        }
    }

    /// Kill a VM whose guest can no longer take interrupts.
    fn kill_faulted(&self, vms: &mut VmRegistry, id: VmId) {
        tracing::warn!(vm = %id, "guest state outside guest RAM, killing VM");
        self.kill_locked(vms, id);
    }

    fn kill_locked(&self, vms: &mut VmRegistry, id: VmId) -> bool {
        let Some(vm) = vms.get_mut(id) else {
            return false;
        };

        vm.guest.mark_dying();
        vm.run_kill_handlers(|device| {
            if let Some(module) = device.kind().module() {
                self.close_module_logged(module);
            }
        });
        vms.remove(id);
        self.close_module_logged("vm");
        tracing::info!(vm = %id, "VM killed");
        true
    }

    fn close_module_logged(&self, name: &str) {
        if let Err(e) = self.modules.lock().close(name) {
            tracing::warn!(module = name, "close failed: {e}");
        }
    }

    /// True if `id` names a live VM.
    pub fn is_alive(&self, id: VmId) -> bool {
        self.vms.lock().get(id).is_some()
    }

    /// Ids of all live VMs in slot order.
    pub fn vm_ids(&self) -> Vec<VmId> {
        self.vms.lock().iter().map(registry::Vm::id).collect()
    }

    /// Append a teardown callback to the VM's kill-handler list.
    pub fn add_vm_kill_handler(
        &self,
        id: VmId,
        name: &'static str,
        handler: impl FnOnce(VmId) + Send + 'static,
    ) -> Result<(), MonitorError> {
        self.with_vm(id, |vm| {
            vm.kill_handlers.push(registry::KillHandler::Callback {
                name,
                run: Box::new(handler),
            });
            Ok(())
        })
    }

    /// Bind host task `pid` to the VM it runs.
    pub fn bind_task(&self, id: VmId, pid: u32) -> Result<(), MonitorError> {
        self.with_vm(id, |vm| {
            vm.task = Some(pid);
            Ok(())
        })
    }

    /// The VM bound to host task `pid`.
    pub fn vm_for_task(&self, pid: u32) -> Option<VmId> {
        self.vms.lock().find_by_task(pid)
    }

    // ---- devices and port I/O ----

    /// Attach `device` to the VM, opening its module.
    ///
    /// The device's kill handler is appended to the VM's list, so devices
    /// that refer to others must be attached after them.
    pub fn attach_device(
        &self,
        id: VmId,
        device: Box<dyn VirtualDevice>,
    ) -> Result<DeviceId, MonitorError> {
        let mut vms = self.vms.lock();
        let vm = vms.get_mut(id).ok_or(MonitorError::NoSuchVm(id))?;
        if let Some(module) = device.kind().module() {
            self.modules.lock().open(module, 0)?;
        }
        let dev = vm.attach(device);
        tracing::debug!(vm = %id, device = dev.index(), "device attached");
        Ok(dev)
    }

    /// Route `range` to `device`.
    ///
    /// # Errors
    ///
    /// - `Conflict` if any port of `range` is already routed.
    /// - `ResourceExhausted` if the VM's handler table is full.
    /// - `NoSuchDevice` if `device` is not attached to the VM.
    pub fn add_io_handler(
        &self,
        id: VmId,
        range: PortRange,
        device: DeviceId,
    ) -> Result<(), MonitorError> {
        self.with_vm(id, |vm| {
            if !vm.has_device(device) {
                return Err(MonitorError::NoSuchDevice { vm: id, device: "device" });
            }
            vm.io.add(range, device)
        })
    }

    /// Remove the routing for exactly `range`. Missing entries are ignored.
    pub fn remove_io_handler(&self, id: VmId, range: PortRange) {
        if let Some(vm) = self.vms.lock().get_mut(id) {
            vm.io.remove(range);
        }
    }

    /// The handler owning `port`, or `None` if the access is unhandled.
    pub fn get_io_handler(&self, id: VmId, port: u16) -> Option<IoHandlerEntry> {
        self.vms.lock().get(id)?.io.get(port)
    }

    /// Emulate a trapped `IN`. Unhandled bytes read as 0xFF.
    pub fn io_in(&self, id: VmId, port: u16, data: &mut IoData) -> Result<IoOutcome, MonitorError> {
        let trace = self.io_trace.load(Ordering::Relaxed);
        self.with_vm(id, |vm| {
            let mut outcome = IoOutcome::Unhandled;
            for i in 0..data.len() {
                let p = port.wrapping_add(i as u16);
                let value = match vm.io.get(p) {
                    Some(entry) => {
                        outcome = IoOutcome::Handled;
                        vm.with_device(entry.device, &self.clock, |d, bus| d.io_read(p, bus))
                            .unwrap_or(0xFF)
                    }
                    None => 0xFF,
                };
                data.set(i, value);
            }
            if trace {
                tracing::debug!(
                    vm = %id,
                    port = format_args!("{port:#x}"),
                    data = ?data.as_slice(),
                    handled = outcome == IoOutcome::Handled,
                    "IN"
                );
            }
            Ok(outcome)
        })
    }

    /// Emulate a trapped `OUT`. Unhandled bytes are dropped.
    pub fn io_out(&self, id: VmId, port: u16, data: &IoData) -> Result<IoOutcome, MonitorError> {
        let trace = self.io_trace.load(Ordering::Relaxed);
        self.with_vm(id, |vm| {
            let mut outcome = IoOutcome::Unhandled;
            for (i, &byte) in data.as_slice().iter().enumerate() {
                let p = port.wrapping_add(i as u16);
                if let Some(entry) = vm.io.get(p) {
                    outcome = IoOutcome::Handled;
                    vm.with_device(entry.device, &self.clock, |d, bus| d.io_write(p, byte, bus));
                }
            }
            if trace {
                tracing::debug!(
                    vm = %id,
                    port = format_args!("{port:#x}"),
                    data = ?data.as_slice(),
                    handled = outcome == IoOutcome::Handled,
                    "OUT"
                );
            }
            Ok(outcome)
        })
    }

    /// Enable or disable per-access I/O tracing.
    pub fn set_io_trace(&self, enabled: bool) {
        self.io_trace.store(enabled, Ordering::Relaxed);
    }

    pub fn io_trace(&self) -> bool {
        self.io_trace.load(Ordering::Relaxed)
    }

    // ---- ARPL services ----

    /// Register `handler` for ARPL service `service`.
    ///
    /// # Errors
    ///
    /// `Conflict` if the service number is taken.
    pub fn add_arpl_handler(
        &self,
        id: VmId,
        service: u8,
        name: &'static str,
        handler: impl ArplHandler + 'static,
    ) -> Result<(), MonitorError> {
        self.with_vm(id, |vm| vm.arpl.add(service, name, Box::new(handler)))
    }

    /// Remove the handler for `service`. Missing entries are ignored.
    pub fn remove_arpl_handler(&self, id: VmId, service: u8) {
        if let Some(vm) = self.vms.lock().get_mut(id) {
            vm.arpl.remove(service);
        }
    }

    /// Name of the handler for `service`.
    pub fn get_arpl_handler(&self, id: VmId, service: u8) -> Option<&'static str> {
        self.vms.lock().get(id)?.arpl.get(service)
    }

    /// Run the handler for a trapped ARPL. Returns false if none is
    /// registered, in which case the trap is a genuine #UD.
    pub fn dispatch_arpl(&self, id: VmId, service: u8) -> Result<bool, MonitorError> {
        self.with_vm(id, |vm| Ok(vm.arpl.dispatch(service, &mut vm.guest)))
    }

    // ---- interrupts ----

    /// Raise virtual IRQ `line` on the VM's PIC.
    ///
    /// # Errors
    ///
    /// - `NoSuchDevice` if the VM has no PIC.
    /// - `NotResumable` if an interrupt was due but the guest could not take
    ///   it. The request stays latched and goes out on a later delivery.
    /// - `GuestMemory` if the interrupt frame fell outside guest RAM. The VM
    ///   is killed before this returns.
    pub fn simulate_irq(&self, id: VmId, line: u8) -> Result<IrqOutcome, MonitorError> {
        self.with_vm(id, |vm| {
            let (pic, guest) = vm.pic_and_guest();
            let pic = pic.ok_or(MonitorError::NoSuchDevice { vm: id, device: "pic" })?;
            pic.simulate_irq(id, line, guest)
                .map_err(|e| MonitorError::from_inject(id, e))
        })
    }

    /// Vector the guest through its real-mode IVT entry `vector`.
    pub fn simulate_vm_int(&self, id: VmId, vector: u8) -> Result<(), MonitorError> {
        self.with_vm(id, |vm| {
            vm.guest
                .simulate_int(vector)
                .map_err(|e| MonitorError::from_inject(id, e))
        })
    }

    /// The guest set its virtual IF. Delivers the highest-priority pending
    /// IRQ, if any, returning its `(line, vector)`.
    pub fn if_enabled(&self, id: VmId) -> Result<Option<(u8, u8)>, MonitorError> {
        self.with_vm(id, |vm| {
            vm.guest.set_vif(true);
            Self::deliver_pending(id, vm)
        })
    }

    /// The guest cleared its virtual IF.
    pub fn if_disabled(&self, id: VmId) -> Result<(), MonitorError> {
        self.with_vm(id, |vm| {
            vm.guest.set_vif(false);
            Ok(())
        })
    }

    /// Emulate the guest's `IRET` and deliver any IRQ that became
    /// deliverable.
    pub fn guest_iret(&self, id: VmId) -> Result<Option<(u8, u8)>, MonitorError> {
        self.with_vm(id, |vm| {
            vm.guest.iret()?;
            Self::deliver_pending(id, vm)
        })
    }

    fn deliver_pending(id: VmId, vm: &mut registry::Vm) -> Result<Option<(u8, u8)>, MonitorError> {
        match vm.pic_and_guest() {
            (Some(pic), guest) => pic
                .deliver(id, guest)
                .map_err(|e| MonitorError::from_inject(id, e)),
            (None, _) => Ok(None),
        }
    }

    /// Allow or forbid resuming the guest.
    pub fn set_resumable(&self, id: VmId, resumable: bool) -> Result<(), MonitorError> {
        self.with_vm(id, |vm| {
            vm.guest.set_resumable(resumable);
            Ok(())
        })
    }

    /// Run `f` on the VM's guest context.
    pub fn with_guest<R>(&self, id: VmId, f: impl FnOnce(&mut Guest) -> R) -> Result<R, MonitorError> {
        self.with_vm(id, |vm| Ok(f(&mut vm.guest)))
    }

    /// Advance the global tick source by `n` and bring every VM's devices up
    /// to date. Returns the new tick count.
    pub fn timer_tick(&self, n: u32) -> u32 {
        let mut vms = self.vms.lock();
        let now = self.clock.advance(n);
        let mut faulted = Vec::new();
        for vm in vms.iter_mut() {
            for dev in vm.device_ids() {
                vm.with_device(dev, &self.clock, |d, bus| d.tick(bus));
            }
            if vm.guest.faulted() {
                faulted.push(vm.id());
            }
        }
        for id in faulted {
            self.kill_faulted(&mut vms, id);
        }
        now
    }

    /// Reflect host IRQ `irq` into the VM that grabbed it.
    ///
    /// # Errors
    ///
    /// - `Device(LineOutOfRange)` for lines above 15.
    /// - `Conflict` if another VM already holds the line.
    pub fn grab_irq(&self, id: VmId, irq: u8) -> Result<(), MonitorError> {
        let mut vms = self.vms.lock();
        if vms.get(id).is_none() {
            return Err(MonitorError::NoSuchVm(id));
        }
        if let Some(owner) = vms.irq_owner(irq) {
            if owner != id {
                return Err(MonitorError::Conflict {
                    start: u16::from(irq),
                    end: u16::from(irq),
                });
            }
        }
        if !vms.set_irq_owner(irq, Some(id)) {
            return Err(DeviceError::LineOutOfRange(irq).into());
        }
        tracing::debug!(vm = %id, irq, "host IRQ grabbed");
        Ok(())
    }

    /// Stop reflecting host IRQ `irq`.
    pub fn release_irq(&self, irq: u8) {
        self.vms.lock().set_irq_owner(irq, None);
    }

    /// A host IRQ arrived. Returns `None` if no VM owns the line.
    pub fn hardware_irq(&self, irq: u8) -> Result<Option<IrqOutcome>, MonitorError> {
        let mut vms = self.vms.lock();
        let Some(id) = vms.irq_owner(irq) else {
            return Ok(None);
        };
        let vm = vms.get_mut(id).ok_or(MonitorError::NoSuchVm(id))?;
        let (pic, guest) = vm.pic_and_guest();
        let pic = pic.ok_or(MonitorError::NoSuchDevice { vm: id, device: "pic" })?;
        let result = pic.simulate_irq(id, irq, guest);
        if vm.guest.faulted() {
            self.kill_faulted(&mut vms, id);
        }
        result.map(Some).map_err(|e| MonitorError::from_inject(id, e))
    }

    // ---- modules ----

    /// Open module `name` (at least version `min_version`) and its dependencies.
    pub fn open_module(&self, name: &str, min_version: u32) -> Result<(), MonitorError> {
        self.modules.lock().open(name, min_version)
    }

    /// Release one reference to module `name`.
    pub fn close_module(&self, name: &str) -> Result<(), MonitorError> {
        self.modules.lock().close(name)
    }

    /// Unload module `name`; refused while it is open.
    pub fn expunge_module(&self, name: &str) -> Result<(), MonitorError> {
        self.modules.lock().expunge(name)
    }

    /// Every module with its open count.
    pub fn modules(&self) -> Vec<(ModuleInfo, u32)> {
        self.modules.lock().modules().collect()
    }

    // ---- shell ----

    /// Register additional shell commands.
    pub fn add_shell_cmds(&self, cmds: &[ShellCommand]) -> Result<(), ShellError> {
        self.shell.lock().add_shell_cmds(cmds)
    }

    /// Registered shell commands.
    pub fn shell_commands(&self) -> Vec<ShellCommand> {
        self.shell.lock().commands().to_vec()
    }

    /// Parse and run one shell command line.
    pub fn run_shell(&self, line: &str) -> Result<String, ShellError> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or(ShellError::Empty)?;
        let args: Vec<&str> = words.collect();
        let cmd = self
            .shell
            .lock()
            .lookup(name)
            .ok_or_else(|| ShellError::UnknownCommand(name.to_string()))?;
        (cmd.run)(self, &args)
    }

    /// Describe every live VM.
    pub fn vm_summaries(&self) -> Vec<VmSummary> {
        let vms = self.vms.lock();
        vms.iter()
            .map(|vm| VmSummary {
                id: vm.id(),
                vif: vm.guest.vif(),
                resumable: vm.guest.is_resumable(),
                injected: vm.guest.injected(),
                task: vm.task,
                devices: vm
                    .device_ids()
                    .into_iter()
                    .zip(vm.device_names())
                    .collect(),
                io: vm.io.entries().to_vec(),
                arpl: vm.arpl.services().collect(),
            })
            .collect()
    }

    /// Snapshot of the VM's PIC pair.
    pub fn get_vpic(&self, id: VmId) -> Result<VirtualPic, MonitorError> {
        self.with_vm(id, |vm| {
            vm.find_device::<VirtualPic>()
                .cloned()
                .ok_or(MonitorError::NoSuchDevice { vm: id, device: "pic" })
        })
    }
}
