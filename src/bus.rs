//! Serialized register access to one bus target.
//!
//! Every physical device (one I2C address, one SPI chip select) is wrapped in
//! exactly one [`BusHandle`]; its mutex guarantees at most one in-flight
//! transaction per target no matter how many pins or drivers share it.

use std::sync::{Arc, Mutex};

use crate::error::{Error, TransportError};

/// Blanket shorthand for types implementing [`embedded_hal::i2c::I2c`].
pub trait I2cBus: embedded_hal::i2c::I2c {}
impl<T: embedded_hal::i2c::I2c> I2cBus for T {}

/// Blanket shorthand for types implementing [`embedded_hal::spi::SpiDevice`].
pub trait SpiBus: embedded_hal::spi::SpiDevice {}
impl<T: embedded_hal::spi::SpiDevice> SpiBus for T {}

/// Register-addressed access to one bus target.
///
/// Implementations pair an I2C or SPI interface with the target's address and
/// register framing. They do no locking of their own; serialization is
/// [`BusHandle`]'s job.
pub trait RegisterBus {
    /// Short class name of the target, used in device keys and logs.
    fn class(&self) -> &'static str;

    /// Bus address of the target.
    fn address(&self) -> u8;

    fn read_reg(&mut self, reg: u8) -> Result<u8, TransportError>;

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), TransportError>;

    /// Burst read starting at `reg`, for targets with address auto-increment.
    fn read_block(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Burst write starting at `reg`.
    fn write_block(&mut self, reg: u8, data: &[u8]) -> Result<(), TransportError>;

    /// Best-effort presence check.
    fn probe(&mut self) -> bool;
}

/// Shareable handle serializing all transactions to one target.
pub struct BusHandle<B> {
    target: Arc<Mutex<B>>,
}

impl<B> Clone for BusHandle<B> {
    fn clone(&self) -> Self {
        Self {
            target: Arc::clone(&self.target),
        }
    }
}

impl<B: RegisterBus> BusHandle<B> {
    pub fn new(target: B) -> Self {
        Self {
            target: Arc::new(Mutex::new(target)),
        }
    }

    pub fn read_reg(&self, reg: impl Into<u8>) -> Result<u8, Error> {
        let mut target = self.target.lock().unwrap();
        Ok(target.read_reg(reg.into())?)
    }

    pub fn write_reg(&self, reg: impl Into<u8>, value: u8) -> Result<(), Error> {
        let mut target = self.target.lock().unwrap();
        Ok(target.write_reg(reg.into(), value)?)
    }

    /// Read-modify-write under one lock scope; returns the written byte.
    pub fn update_reg(
        &self,
        reg: impl Into<u8>,
        mask_set: u8,
        mask_clear: u8,
    ) -> Result<u8, Error> {
        let reg = reg.into();
        let mut target = self.target.lock().unwrap();
        let mut value = target.read_reg(reg)?;
        value |= mask_set;
        value &= !mask_clear;
        target.write_reg(reg, value)?;
        Ok(value)
    }

    pub fn read_block(&self, reg: impl Into<u8>, buf: &mut [u8]) -> Result<(), Error> {
        let mut target = self.target.lock().unwrap();
        Ok(target.read_block(reg.into(), buf)?)
    }

    pub fn write_block(&self, reg: impl Into<u8>, data: &[u8]) -> Result<(), Error> {
        let mut target = self.target.lock().unwrap();
        Ok(target.write_block(reg.into(), data)?)
    }

    pub fn probe(&self) -> bool {
        self.target.lock().unwrap().probe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeTarget {
        regs: [u8; 0x16],
        reads: usize,
        writes: usize,
        fail: bool,
    }

    impl RegisterBus for FakeTarget {
        fn class(&self) -> &'static str {
            "fake"
        }

        fn address(&self) -> u8 {
            0x00
        }

        fn read_reg(&mut self, reg: u8) -> Result<u8, TransportError> {
            if self.fail {
                return Err(TransportError::I2c(embedded_hal::i2c::ErrorKind::Bus));
            }
            self.reads += 1;
            Ok(self.regs[reg as usize])
        }

        fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::I2c(embedded_hal::i2c::ErrorKind::Bus));
            }
            self.writes += 1;
            self.regs[reg as usize] = value;
            Ok(())
        }

        fn read_block(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), TransportError> {
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = self.regs[reg as usize + i];
            }
            self.reads += 1;
            Ok(())
        }

        fn write_block(&mut self, reg: u8, data: &[u8]) -> Result<(), TransportError> {
            for (i, value) in data.iter().enumerate() {
                self.regs[reg as usize + i] = *value;
            }
            self.writes += 1;
            Ok(())
        }

        fn probe(&mut self) -> bool {
            !self.fail
        }
    }

    #[test]
    fn update_reg_is_one_read_one_write() {
        let handle = BusHandle::new(FakeTarget {
            regs: {
                let mut regs = [0u8; 0x16];
                regs[0x04] = 0b1100_0000;
                regs
            },
            ..FakeTarget::default()
        });

        let written = handle.update_reg(0x04u8, 0b0000_0101, 0b1000_0000).unwrap();
        assert_eq!(written, 0b0100_0101);
        assert_eq!(handle.read_reg(0x04u8).unwrap(), 0b0100_0101);

        let stats = handle.target.lock().unwrap();
        assert_eq!((stats.reads, stats.writes), (2, 1));
    }

    #[test]
    fn clones_share_one_target() {
        let handle = BusHandle::new(FakeTarget::default());
        let other = handle.clone();

        handle.write_reg(0x12u8, 0xa5).unwrap();
        assert_eq!(other.read_reg(0x12u8).unwrap(), 0xa5);
    }

    #[test]
    fn block_transfers_round_trip() {
        let handle = BusHandle::new(FakeTarget::default());

        handle.write_block(0x00u8, &[0x11, 0x22, 0x33]).unwrap();
        let mut buf = [0u8; 3];
        handle.read_block(0x00u8, &mut buf).unwrap();
        assert_eq!(buf, [0x11, 0x22, 0x33]);
    }

    #[test]
    fn transport_failures_surface_as_errors() {
        let handle = BusHandle::new(FakeTarget {
            fail: true,
            ..FakeTarget::default()
        });

        assert_eq!(
            handle.read_reg(0x00u8),
            Err(Error::Transport(TransportError::I2c(
                embedded_hal::i2c::ErrorKind::Bus
            )))
        );
        assert!(!handle.probe());
    }
}
