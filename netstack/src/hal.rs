//! Hardware abstraction consumed by the driver and the stack
//!
//! Board support code implements these for its SPI peripheral, GPIO pins,
//! external interrupt line and system tick.

use crate::error::Result;

/// One chip-select scoped SPI exchange.
pub trait SpiDevice {
    /// Asserts chip select, clocks out `write`, then clocks `read.len()`
    /// bytes in, and deasserts chip select.
    fn transaction(&mut self, write: &[u8], read: &mut [u8]) -> Result<()>;
}

pub trait OutputPin {
    fn set_high(&mut self);
    fn set_low(&mut self);
}

/// Edge-triggered interrupt line from the controller's INT pin.
pub trait InterruptLine {
    fn enable(&mut self);
    fn disable(&mut self);
    /// Acknowledges a latched edge so the next falling edge fires again.
    fn clear(&mut self);
}

/// Monotonic millisecond clock.
pub trait Clock: Sync {
    fn now_ms(&self) -> u64;
    fn delay_ms(&self, ms: u32);
}

/// Pin that ignores writes, for boards with the reset line tied high.
pub struct NoPin;

impl OutputPin for NoPin {
    fn set_high(&mut self) {}
    fn set_low(&mut self) {}
}

/// Interrupt line stub for polled operation.
pub struct Polled;

impl InterruptLine for Polled {
    fn enable(&mut self) {}
    fn disable(&mut self) {}
    fn clear(&mut self) {}
}

#[cfg(test)]
pub mod testing {
    use super::Clock;
    use core::sync::atomic::{AtomicU64, Ordering};

    /// Virtual clock; delays advance time instead of sleeping.
    pub struct ManualClock {
        now: AtomicU64,
    }

    impl ManualClock {
        pub fn new(start_ms: u64) -> Self {
            ManualClock { now: AtomicU64::new(start_ms) }
        }

        pub fn advance(&self, ms: u64) {
            self.now.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }

        fn delay_ms(&self, ms: u32) {
            self.advance(ms as u64);
        }
    }
}
