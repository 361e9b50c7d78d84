mod bus;
mod common;
pub mod dev;
mod error;
mod pin;
mod registry;
mod shadow;

pub use bus::{BusHandle, I2cBus, RegisterBus, SpiBus};
pub use common::{DeviceMode, EdgeCallback, EdgeSource, InterruptEvent, PullMode, Trigger};
pub use error::{Error, TransportError};
pub use pin::{InputPin, OutputPin};
pub use registry::{DeviceKey, DeviceRegistry, PinEntry, PinInfo};

pub(crate) use common::PortDriver;
pub(crate) use shadow::{ShadowReg, ShadowStore};

pub use dev::mcp23x17::{Config, InterruptMode, Mcp23017Bus, Mcp23S17Bus, Mcp23x17};
