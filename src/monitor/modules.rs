//! Module table.
//!
//! Every piece of monitor functionality a VM can use is provided by a named,
//! versioned module. Modules declare their dependencies and are reference
//! counted: opening a module opens its dependencies first, closing it releases
//! them again. A module can only be expunged (unloaded) once nothing holds it
//! open.
//!
//! ```text
//!        vm
//!      ┌──┴──┬──────┬──────┐
//!     pic   dma   cmos    │
//!      └──────────────── pit
//! ```
//!
//! The monitor opens `vm` for every live VM and the module of every device it
//! attaches, and closes them again from the VM's kill handlers.

use super::MonitorError;

/// Static description of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: &'static str,
    pub version: u32,
    /// Modules opened before this one.
    pub deps: &'static [&'static str],
}

/// Modules built into the monitor.
pub const BUILTIN_MODULES: &[ModuleInfo] = &[
    ModuleInfo {
        name: "vm",
        version: 1,
        deps: &[],
    },
    ModuleInfo {
        name: "pic",
        version: 1,
        deps: &["vm"],
    },
    ModuleInfo {
        name: "pit",
        version: 1,
        deps: &["vm", "pic"],
    },
    ModuleInfo {
        name: "dma",
        version: 1,
        deps: &["vm"],
    },
    ModuleInfo {
        name: "cmos",
        version: 1,
        deps: &["vm"],
    },
];

#[derive(Debug)]
struct ModuleEntry {
    info: ModuleInfo,
    open_count: u32,
    loaded: bool,
}

/// Reference-counted module table.
#[derive(Debug)]
pub struct ModuleTable {
    entries: Vec<ModuleEntry>,
}

impl Default for ModuleTable {
    fn default() -> Self {
        Self::new(BUILTIN_MODULES)
    }
}

impl ModuleTable {
    /// Table holding `modules`, none of them loaded.
    pub fn new(modules: &[ModuleInfo]) -> Self {
        Self {
            entries: modules
                .iter()
                .map(|&info| ModuleEntry {
                    info,
                    open_count: 0,
                    loaded: false,
                })
                .collect(),
        }
    }

    fn index(&self, name: &str) -> Result<usize, MonitorError> {
        self.entries
            .iter()
            .position(|e| e.info.name == name)
            .ok_or_else(|| MonitorError::ModuleNotFound(name.to_string()))
    }

    /// Open `name` and, first, everything it depends on.
    ///
    /// # Errors
    ///
    /// - `ModuleNotFound` if `name` or one of its dependencies is unknown.
    /// - `ModuleVersion` if `name` is older than `min_version`.
    /// - `ModuleCycle` if the dependency graph loops back on itself.
    ///
    /// On error nothing stays open.
    pub fn open(&mut self, name: &str, min_version: u32) -> Result<(), MonitorError> {
        let mut opened = Vec::new();
        let result = self.open_inner(name, min_version, &mut Vec::new(), &mut opened);
        if result.is_err() {
            for index in opened.into_iter().rev() {
                self.entries[index].open_count -= 1;
            }
        }
        result
    }

    fn open_inner(
        &mut self,
        name: &str,
        min_version: u32,
        visiting: &mut Vec<usize>,
        opened: &mut Vec<usize>,
    ) -> Result<(), MonitorError> {
        let index = self.index(name)?;
        let info = self.entries[index].info;
        if visiting.contains(&index) {
            return Err(MonitorError::ModuleCycle(info.name));
        }
        if info.version < min_version {
            return Err(MonitorError::ModuleVersion {
                name: info.name,
                have: info.version,
                want: min_version,
            });
        }

        visiting.push(index);
        for dep in info.deps {
            self.open_inner(dep, 0, visiting, opened)?;
        }
        visiting.pop();

        let entry = &mut self.entries[index];
        if !entry.loaded {
            entry.loaded = true;
            tracing::debug!(module = info.name, version = info.version, "module loaded");
        }
        entry.open_count += 1;
        opened.push(index);
        Ok(())
    }

    /// Release one reference to `name` and to its dependencies.
    ///
    /// Closing a module that is not open is logged and ignored.
    pub fn close(&mut self, name: &str) -> Result<(), MonitorError> {
        let index = self.index(name)?;
        let entry = &mut self.entries[index];
        if entry.open_count == 0 {
            tracing::warn!(module = entry.info.name, "close of a module that is not open");
            return Ok(());
        }
        entry.open_count -= 1;
        let deps = entry.info.deps;
        for dep in deps.iter().rev() {
            self.close(dep)?;
        }
        Ok(())
    }

    /// Unload `name`.
    ///
    /// # Errors
    ///
    /// `ModuleBusy` while anything holds it open.
    pub fn expunge(&mut self, name: &str) -> Result<(), MonitorError> {
        let index = self.index(name)?;
        let entry = &mut self.entries[index];
        if entry.open_count > 0 {
            return Err(MonitorError::ModuleBusy(entry.info.name));
        }
        if entry.loaded {
            entry.loaded = false;
            tracing::debug!(module = entry.info.name, "module expunged");
        }
        Ok(())
    }

    /// Number of open references to `name`.
    pub fn open_count(&self, name: &str) -> Option<u32> {
        self.index(name).ok().map(|i| self.entries[i].open_count)
    }

    /// True if `name` is loaded.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.index(name)
            .map(|i| self.entries[i].loaded)
            .unwrap_or(false)
    }

    /// Every module with its open count.
    pub fn modules(&self) -> impl Iterator<Item = (ModuleInfo, u32)> + '_ {
        self.entries.iter().map(|e| (e.info, e.open_count))
    }
}
