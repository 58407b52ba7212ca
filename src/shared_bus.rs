use embedded_hal::blocking::i2c::{Read, Write, WriteRead};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Cloneable handle to a single I2C bus.
///
/// The multiplexer and every sensor driver each hold a clone, so they can all
/// own "their" bus while the transactions still go out over the one device.
/// Each transaction holds the lock for its duration only.
pub struct SharedI2c<I2C> {
    bus: Arc<Mutex<I2C>>,
}

impl<I2C> SharedI2c<I2C> {
    pub fn new(i2c: I2C) -> Self {
        SharedI2c {
            bus: Arc::new(Mutex::new(i2c)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, I2C> {
        // A panic mid-transaction leaves nothing half-written on our side.
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<I2C> Clone for SharedI2c<I2C> {
    fn clone(&self) -> Self {
        SharedI2c {
            bus: Arc::clone(&self.bus),
        }
    }
}

impl<I2C: Write> Write for SharedI2c<I2C> {
    type Error = I2C::Error;

    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), Self::Error> {
        self.lock().write(address, bytes)
    }
}

impl<I2C: Read> Read for SharedI2c<I2C> {
    type Error = I2C::Error;

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), Self::Error> {
        self.lock().read(address, buffer)
    }
}

impl<I2C: WriteRead> WriteRead for SharedI2c<I2C> {
    type Error = I2C::Error;

    fn write_read(
        &mut self,
        address: u8,
        bytes: &[u8],
        buffer: &mut [u8],
    ) -> Result<(), Self::Error> {
        self.lock().write_read(address, bytes, buffer)
    }
}
