//! Diagnostic shell commands.
//!
//! Commands are plain function pointers registered by name. Built-ins:
//!
//! - `vminfo` lists live VMs; `-io`, `-arpl`, `-pic` and `-pit` add the port
//!   handlers, ARPL services and controller state of each VM.
//! - `dbio -on|-off` toggles per-port I/O tracing.
//! - `modules` lists the module table.
//! - `help` lists every command.

use std::fmt::Write;

use thiserror::Error;

use super::{Monitor, VmSummary};

/// Errors reported by shell commands.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShellError {
    /// No command with this name is registered.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// A command with this name is already registered.
    #[error("command already registered: {0}")]
    Duplicate(&'static str),

    /// The command rejected its arguments.
    #[error("usage: {0}")]
    Usage(&'static str),

    /// Empty command line.
    #[error("empty command line")]
    Empty,
}

/// Signature of a shell command.
pub type ShellFn = fn(&Monitor, &[&str]) -> Result<String, ShellError>;

/// A named shell command.
#[derive(Clone, Copy)]
pub struct ShellCommand {
    pub name: &'static str,
    pub help: &'static str,
    pub run: ShellFn,
}

impl std::fmt::Debug for ShellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellCommand")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Registered shell commands.
#[derive(Debug)]
pub struct Shell {
    commands: Vec<ShellCommand>,
}

impl Default for Shell {
    fn default() -> Self {
        Self {
            commands: BUILTIN_COMMANDS.to_vec(),
        }
    }
}

impl Shell {
    /// Register `cmds`. Nothing is registered if any name is taken.
    pub fn add_shell_cmds(&mut self, cmds: &[ShellCommand]) -> Result<(), ShellError> {
        for (i, cmd) in cmds.iter().enumerate() {
            let clash = self.lookup(cmd.name).is_some()
                || cmds[..i].iter().any(|c| c.name == cmd.name);
            if clash {
                return Err(ShellError::Duplicate(cmd.name));
            }
        }
        self.commands.extend_from_slice(cmds);
        Ok(())
    }

    /// Find the command called `name`.
    pub fn lookup(&self, name: &str) -> Option<ShellCommand> {
        self.commands.iter().find(|c| c.name == name).copied()
    }

    /// All registered commands in registration order.
    pub fn commands(&self) -> &[ShellCommand] {
        &self.commands
    }
}

const BUILTIN_COMMANDS: &[ShellCommand] = &[
    ShellCommand {
        name: "vminfo",
        help: "vminfo [-io] [-arpl] [-pic] [-pit]",
        run: cmd_vminfo,
    },
    ShellCommand {
        name: "dbio",
        help: "dbio -on|-off",
        run: cmd_dbio,
    },
    ShellCommand {
        name: "modules",
        help: "modules",
        run: cmd_modules,
    },
    ShellCommand {
        name: "help",
        help: "help",
        run: cmd_help,
    },
];

fn cmd_vminfo(monitor: &Monitor, args: &[&str]) -> Result<String, ShellError> {
    let (mut io, mut arpl, mut pic, mut pit) = (false, false, false, false);
    for arg in args {
        match *arg {
            "-io" => io = true,
            "-arpl" => arpl = true,
            "-pic" => pic = true,
            "-pit" => pit = true,
            _ => return Err(ShellError::Usage("vminfo [-io] [-arpl] [-pic] [-pit]")),
        }
    }

    let mut out = String::new();
    let summaries = monitor.vm_summaries();
    if summaries.is_empty() {
        out.push_str("no VMs\n");
    }
    for vm in &summaries {
        write_summary(&mut out, vm);
        if io {
            for entry in &vm.io {
                let _ = writeln!(out, "  io {} -> {}", entry.range, vm.device_name(entry.device));
            }
        }
        if arpl {
            for (service, name) in &vm.arpl {
                let _ = writeln!(out, "  arpl {service:#04x} {name}");
            }
        }
        if pic {
            if let Ok(state) = monitor.get_vpic(vm.id) {
                for (label, chip) in [("master", state.master()), ("slave", state.slave())] {
                    let _ = writeln!(
                        out,
                        "  pic {label}: base={:#04x} irr={:#04x} isr={:#04x} imr={:#04x} state={}",
                        chip.base(),
                        chip.irr(),
                        chip.isr(),
                        chip.imr(),
                        chip.state().name()
                    );
                }
            }
        }
        if pit {
            if let Ok(channels) = monitor.get_vpit_all(vm.id) {
                for (i, ch) in channels.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "  pit {i}: mode={} reload={} armed={} interval={} fired={}",
                        ch.mode.number(),
                        ch.reload,
                        ch.armed,
                        ch.interval_ticks,
                        ch.expirations
                    );
                }
            }
        }
    }
    Ok(out)
}

fn write_summary(out: &mut String, vm: &VmSummary) {
    let _ = write!(
        out,
        "{}: vif={} resumable={} injected={}",
        vm.id,
        u8::from(vm.vif),
        u8::from(vm.resumable),
        vm.injected
    );
    if let Some(task) = vm.task {
        let _ = write!(out, " task={task}");
    }
    let names: Vec<&str> = vm.devices.iter().map(|(_, name)| *name).collect();
    let _ = writeln!(out, " devices=[{}]", names.join(","));
}

fn cmd_dbio(monitor: &Monitor, args: &[&str]) -> Result<String, ShellError> {
    let enable = match args {
        ["-on"] => true,
        ["-off"] => false,
        _ => return Err(ShellError::Usage("dbio -on|-off")),
    };
    monitor.set_io_trace(enable);
    Ok(format!("I/O tracing {}\n", if enable { "on" } else { "off" }))
}

fn cmd_modules(monitor: &Monitor, _args: &[&str]) -> Result<String, ShellError> {
    let mut out = String::new();
    for (info, open) in monitor.modules() {
        let _ = writeln!(out, "{} v{} open={open}", info.name, info.version);
    }
    Ok(out)
}

fn cmd_help(monitor: &Monitor, _args: &[&str]) -> Result<String, ShellError> {
    let mut out = String::new();
    for cmd in monitor.shell_commands() {
        let _ = writeln!(out, "{}", cmd.help);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &Monitor, _: &[&str]) -> Result<String, ShellError> {
        Ok(String::new())
    }

    #[test]
    fn test_builtins_registered() {
        let shell = Shell::default();
        assert!(shell.lookup("vminfo").is_some());
        assert!(shell.lookup("dbio").is_some());
        assert!(shell.lookup("nope").is_none());
    }

    #[test]
    fn test_duplicate_names_rejected_atomically() {
        let mut shell = Shell::default();
        let cmds = [
            ShellCommand {
                name: "fresh",
                help: "fresh",
                run: noop,
            },
            ShellCommand {
                name: "dbio",
                help: "dbio",
                run: noop,
            },
        ];
        assert_eq!(shell.add_shell_cmds(&cmds), Err(ShellError::Duplicate("dbio")));
        assert!(shell.lookup("fresh").is_none());

        shell.add_shell_cmds(&cmds[..1]).unwrap();
        assert!(shell.lookup("fresh").is_some());
    }
}
