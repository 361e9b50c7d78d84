use std::fmt;
use std::time::SystemTime;

use crate::error::Error;

/// Modes a pin can be provisioned in.
///
/// Board or device metadata declares which of these a given pin supports; the
/// registry validates every provisioning request against that set before any
/// hardware is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceMode {
    DigitalInput,
    DigitalOutput,
    AnalogInput,
    AnalogOutput,
    PwmOutput,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceMode::DigitalInput => "digital input",
            DeviceMode::DigitalOutput => "digital output",
            DeviceMode::AnalogInput => "analog input",
            DeviceMode::AnalogOutput => "analog output",
            DeviceMode::PwmOutput => "pwm output",
        })
    }
}

/// Internal pull resistor configuration for an input pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    /// Leave the input floating.
    Off,
    /// Enable the internal pull-up.
    Up,
    /// Enable the internal pull-down, on hardware that has one.
    Down,
}

/// Which edge(s) of an input signal raise an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Rising,
    Falling,
    Both,
}

/// A level change observed on one pin.
///
/// `pin` is an index in the originating device's own pin space: the line
/// number for host GPIO events, the flat pin index for expander events.
#[derive(Debug, Clone, Copy)]
pub struct InterruptEvent {
    pub pin: u8,
    pub value: bool,
    pub timestamp: SystemTime,
}

impl InterruptEvent {
    pub fn new(pin: u8, value: bool) -> Self {
        Self {
            pin,
            value,
            timestamp: SystemTime::now(),
        }
    }
}

/// Edge listener callback, invoked on the notification thread of whichever
/// service observed the edge.
pub type EdgeCallback = Box<dyn FnMut(InterruptEvent) + Send>;

/// Host-side GPIO service delivering edge notifications.
///
/// Implemented by the native, daemon and simulated GPIO providers. Each
/// subscribed line delivers its events from one notification thread;
/// subscribing a line again replaces the previous callback.
///
/// `unsubscribe` may block until an in-flight callback has returned, so it
/// must not be called from inside a callback.
pub trait EdgeSource {
    fn subscribe_edge(
        &mut self,
        line: u8,
        trigger: Trigger,
        callback: EdgeCallback,
    ) -> Result<(), Error>;

    fn unsubscribe(&mut self, line: u8) -> Result<(), Error>;
}

/// Pin-level operations a device engine provides to its handles.
///
/// Object-safe so the handles stay free of the engine's bus type parameter.
/// `close_pin` must be idempotent with respect to whole-device teardown: a
/// handle may be dropped after its device was closed.
pub(crate) trait PortDriver: Send + Sync {
    /// Live level of the pin, read from hardware.
    fn read_pin(&self, pin: u8) -> Result<bool, Error>;
    /// Drive an output pin.
    fn write_pin(&self, pin: u8, value: bool) -> Result<(), Error>;
    /// Invert an output pin's latched state.
    fn toggle_pin(&self, pin: u8) -> Result<(), Error>;
    /// Latched state of an output pin, answered from shadow.
    fn is_pin_set(&self, pin: u8) -> Result<bool, Error>;
    /// Restore the pin's registers and release its registry entry.
    fn close_pin(&self, pin: u8) -> Result<(), Error>;
}
