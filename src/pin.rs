//! Driver-facing pin handles.
//!
//! Handles are created by provisioning a pin on a device engine and own that
//! pin exclusively until closed. `close()` reports teardown errors; dropping
//! a handle without closing performs the same teardown best-effort.

use std::fmt;
use std::sync::Arc;

use embedded_hal::digital as hal_digital;

use crate::common::{InterruptEvent, PortDriver};
use crate::error::Error;
use crate::registry::PinEntry;

/// A provisioned digital input.
pub struct InputPin {
    driver: Arc<dyn PortDriver>,
    entry: Arc<PinEntry>,
    pin: u8,
    closed: bool,
}

impl InputPin {
    pub(crate) fn new(driver: Arc<dyn PortDriver>, entry: Arc<PinEntry>) -> Self {
        let pin = entry.key().pin();
        Self {
            driver,
            entry,
            pin,
            closed: false,
        }
    }

    /// Pin number within the owning device.
    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Read the live level from hardware.
    pub fn read(&self) -> Result<bool, Error> {
        self.driver.read_pin(self.pin)
    }

    pub fn is_high(&self) -> Result<bool, Error> {
        self.read()
    }

    pub fn is_low(&self) -> Result<bool, Error> {
        self.read().map(|value| !value)
    }

    /// Install `listener` for this pin's edge events, replacing any previous
    /// listener.
    ///
    /// Events arrive on the notification thread of the device's interrupt
    /// line; the listener may call back into this crate.
    pub fn on_edge<F>(&self, listener: F)
    where
        F: FnMut(InterruptEvent) + Send + 'static,
    {
        self.entry.set_listener(Box::new(listener));
    }

    /// Remove the edge listener.
    pub fn clear_listener(&self) {
        self.entry.clear_listener();
    }

    /// Release the pin, restoring its registers to the all-clear state.
    pub fn close(mut self) -> Result<(), Error> {
        self.closed = true;
        self.driver.close_pin(self.pin)
    }
}

impl fmt::Debug for InputPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputPin")
            .field("key", self.entry.key())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Drop for InputPin {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.driver.close_pin(self.pin) {
                log::warn!("closing input pin {} on drop failed: {}", self.pin, err);
            }
        }
    }
}

impl hal_digital::ErrorType for InputPin {
    type Error = Error;
}

impl hal_digital::InputPin for InputPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        InputPin::is_high(self)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        InputPin::is_low(self)
    }
}

/// A provisioned digital output.
pub struct OutputPin {
    driver: Arc<dyn PortDriver>,
    pin: u8,
    closed: bool,
}

impl OutputPin {
    pub(crate) fn new(driver: Arc<dyn PortDriver>, pin: u8) -> Self {
        Self {
            driver,
            pin,
            closed: false,
        }
    }

    /// Pin number within the owning device.
    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Read the live level from hardware; outputs read back their driven
    /// state.
    pub fn read(&self) -> Result<bool, Error> {
        self.driver.read_pin(self.pin)
    }

    pub fn write(&self, value: bool) -> Result<(), Error> {
        self.driver.write_pin(self.pin, value)
    }

    pub fn set_high(&self) -> Result<(), Error> {
        self.write(true)
    }

    pub fn set_low(&self) -> Result<(), Error> {
        self.write(false)
    }

    /// Invert the latched state with one read-modify-write.
    pub fn toggle(&self) -> Result<(), Error> {
        self.driver.toggle_pin(self.pin)
    }

    /// Latched state, answered from shadow without bus traffic.
    pub fn is_set_high(&self) -> Result<bool, Error> {
        self.driver.is_pin_set(self.pin)
    }

    pub fn is_set_low(&self) -> Result<bool, Error> {
        self.is_set_high().map(|value| !value)
    }

    /// Release the pin, restoring its registers to the all-clear state.
    pub fn close(mut self) -> Result<(), Error> {
        self.closed = true;
        self.driver.close_pin(self.pin)
    }
}

impl fmt::Debug for OutputPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputPin")
            .field("pin", &self.pin)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Drop for OutputPin {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.driver.close_pin(self.pin) {
                log::warn!("closing output pin {} on drop failed: {}", self.pin, err);
            }
        }
    }
}

impl hal_digital::ErrorType for OutputPin {
    type Error = Error;
}

impl hal_digital::OutputPin for OutputPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        OutputPin::set_low(self)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        OutputPin::set_high(self)
    }
}

impl hal_digital::StatefulOutputPin for OutputPin {
    fn is_set_high(&mut self) -> Result<bool, Self::Error> {
        OutputPin::is_set_high(self)
    }

    fn is_set_low(&mut self) -> Result<bool, Self::Error> {
        OutputPin::is_set_low(self)
    }

    fn toggle(&mut self) -> Result<(), Self::Error> {
        OutputPin::toggle(self)
    }
}
