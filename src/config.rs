//! Monitor configuration.

use crate::clock::PIT_INPUT_HZ;
use crate::memory::REAL_MODE_MEMORY_SIZE;
use crate::monitor::MonitorError;

/// Smallest guest memory that still holds the IVT (0x000-0x3FF) and BDA (0x400-0x4FF).
pub const MIN_GUEST_MEMORY: u64 = 0x500;

/// Static limits and rates for a [`crate::Monitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Number of VM slots in the registry.
    pub max_vms: usize,
    /// Maximum number of I/O handler ranges per VM.
    pub max_io_handlers: usize,
    /// Host tick rate in Hz.
    ///
    /// The default equals the PIT input clock, which makes one host tick one
    /// PIT clock.
    pub tick_hz: u32,
    /// Guest RAM per VM in bytes.
    pub guest_memory_size: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_vms: 16,
            max_io_handlers: 64,
            tick_hz: PIT_INPUT_HZ,
            guest_memory_size: REAL_MODE_MEMORY_SIZE,
        }
    }
}

impl MonitorConfig {
    /// Check that the limits are usable.
    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.max_vms == 0 || self.max_vms > usize::from(u16::MAX) {
            return Err(MonitorError::InvalidConfig(format!(
                "max_vms must be in 1..={}, got {}",
                u16::MAX,
                self.max_vms
            )));
        }
        if self.max_io_handlers == 0 {
            return Err(MonitorError::InvalidConfig(
                "max_io_handlers must be non-zero".into(),
            ));
        }
        if self.tick_hz == 0 {
            return Err(MonitorError::InvalidConfig("tick_hz must be non-zero".into()));
        }
        if self.guest_memory_size < MIN_GUEST_MEMORY {
            return Err(MonitorError::InvalidConfig(format!(
                "guest memory must be at least {MIN_GUEST_MEMORY:#x} bytes, got {:#x}",
                self.guest_memory_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(MonitorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_slots() {
        let config = MonitorConfig {
            max_vms: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MonitorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_tiny_memory() {
        let config = MonitorConfig {
            guest_memory_size: 0x100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
