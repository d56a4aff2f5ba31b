//! Global host tick source.
//!
//! Every VM's virtual timer is measured against one monotonically increasing
//! host tick counter. The counter is a `u32` that wraps; all consumers compare
//! tick values with [`ticks_since`], never with `<`/`>`.
//!
//! ```text
//!  host timer IRQ ──► TickSource::advance(n) ──► Monitor::timer_tick
//!                           │                         │
//!                           ▼                         ▼
//!                     now() (read-only)      per-VM PIT expiry check
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

/// Input clock of the 8254 PIT in Hz.
pub const PIT_INPUT_HZ: u32 = 1_193_182;

/// Wrap-safe elapsed ticks from `start` to `now`.
#[inline]
pub fn ticks_since(now: u32, start: u32) -> u32 {
    now.wrapping_sub(start)
}

/// Monotonic (wrapping) host tick counter shared by all VMs.
#[derive(Debug)]
pub struct TickSource {
    ticks: AtomicU32,
    /// Host tick rate in Hz.
    hz: u32,
}

impl TickSource {
    /// Create a tick source running at `hz`, starting at tick 0.
    pub fn new(hz: u32) -> Self {
        Self::starting_at(hz, 0)
    }

    /// Create a tick source with an explicit initial count (used to exercise
    /// counter wraparound).
    pub fn starting_at(hz: u32, start: u32) -> Self {
        Self {
            ticks: AtomicU32::new(start),
            hz,
        }
    }

    /// Current tick count.
    #[inline]
    pub fn now(&self) -> u32 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Advance the counter by `n` ticks, returning the new count.
    pub fn advance(&self, n: u32) -> u32 {
        self.ticks.fetch_add(n, Ordering::AcqRel).wrapping_add(n)
    }

    /// Host tick rate in Hz.
    #[inline]
    pub fn hz(&self) -> u32 {
        self.hz
    }

    /// Convert a PIT count (in 1.193182 MHz clocks) to host ticks, rounding up.
    ///
    /// Never returns 0 for a non-zero count so that a programmed channel always
    /// advances.
    pub fn pit_to_ticks(&self, pit_clocks: u32) -> u32 {
        let ticks = (u64::from(pit_clocks) * u64::from(self.hz)).div_ceil(u64::from(PIT_INPUT_HZ));
        let ticks = u32::try_from(ticks).unwrap_or(u32::MAX);
        if pit_clocks != 0 {
            ticks.max(1)
        } else {
            0
        }
    }

    /// Convert host ticks back to PIT clocks, rounding down.
    pub fn ticks_to_pit(&self, ticks: u32) -> u64 {
        u64::from(ticks) * u64::from(PIT_INPUT_HZ) / u64::from(self.hz.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_and_now() {
        let clock = TickSource::new(PIT_INPUT_HZ);
        assert_eq!(clock.now(), 0);
        assert_eq!(clock.advance(250), 250);
        assert_eq!(clock.now(), 250);
    }

    #[test]
    fn test_wraparound() {
        let clock = TickSource::starting_at(PIT_INPUT_HZ, u32::MAX - 9);
        let start = clock.now();
        clock.advance(20);
        assert_eq!(clock.now(), 10);
        assert_eq!(ticks_since(clock.now(), start), 20);
    }

    #[test]
    fn test_identity_conversion_at_pit_rate() {
        let clock = TickSource::new(PIT_INPUT_HZ);
        assert_eq!(clock.pit_to_ticks(100), 100);
        assert_eq!(clock.ticks_to_pit(100), 100);
    }

    #[test]
    fn test_conversion_at_100hz() {
        let clock = TickSource::new(100);
        // 65536 PIT clocks is ~54.9ms, i.e. 6 ticks when rounded up.
        assert_eq!(clock.pit_to_ticks(65_536), 6);
        // Short counts still take at least one tick.
        assert_eq!(clock.pit_to_ticks(1), 1);
        assert_eq!(clock.pit_to_ticks(0), 0);
    }
}
