use crate::common::DeviceMode;
use crate::registry::DeviceKey;

/// Failure reported by the transport underneath a device.
///
/// The `embedded-hal` error types are interface-specific, so the cause is
/// carried as the reported [`embedded_hal::i2c::ErrorKind`] /
/// [`embedded_hal::spi::ErrorKind`], or as the host GPIO service's rendered
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// An I2C transaction failed.
    #[error("i2c transaction failed: {0}")]
    I2c(embedded_hal::i2c::ErrorKind),
    /// A SPI transaction failed.
    #[error("spi transaction failed: {0}")]
    Spi(embedded_hal::spi::ErrorKind),
    /// The host GPIO service reported a failure on an interrupt line.
    #[error("host gpio failure: {0}")]
    Gpio(String),
}

/// Errors surfaced by provisioning and pin operations.
///
/// Validation errors (range, mode, direction, key collision) are returned to
/// the caller synchronously and never swallowed. Transport errors propagate
/// for normal calls; on the interrupt and teardown paths they are logged
/// instead, because no caller is waiting there.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Pin index outside the device's pin count.
    #[error("pin {pin} is out of range ({pins} pins)")]
    OutOfRange { pin: u8, pins: u8 },
    /// The key is already held by a live device.
    #[error("{0} is already provisioned")]
    AlreadyProvisioned(DeviceKey),
    /// The pin does not support the requested mode.
    #[error("pin {pin} does not support {mode}")]
    InvalidMode { pin: u8, mode: DeviceMode },
    /// Write attempted on a pin configured as an input.
    #[error("pin {pin} is configured as an input")]
    WrongDirection { pin: u8 },
    /// The device has been torn down.
    #[error("device is closed")]
    Closed,
    /// The backend transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl embedded_hal::digital::Error for Error {
    fn kind(&self) -> embedded_hal::digital::ErrorKind {
        embedded_hal::digital::ErrorKind::Other
    }
}
