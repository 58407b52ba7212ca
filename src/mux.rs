use core::fmt::Debug;
use embedded_hal::blocking::i2c::Write;

use crate::error::{Result, TofError};

/// Default address of a TCA9548A with A0-A2 tied low
pub const TCA9548A_ADDRESS: u8 = 0x70;

/// Highest downstream channel of an 8-way multiplexer
pub const MAX_CHANNEL: u8 = 7;

/// Routes bus traffic to one downstream channel.
pub trait ChannelSelect {
    fn select_channel(&mut self, channel: u8) -> Result<()>;
}

/// TCA9548A-class I2C multiplexer.
///
/// Selecting a channel is a single write of the bitmask `1 << channel`; the
/// device has no other state we care about.
pub struct Tca9548a<I2C> {
    i2c: I2C,
    address: u8,
}

impl<I2C> Tca9548a<I2C> {
    pub fn new(i2c: I2C, address: u8) -> Self {
        Tca9548a { i2c, address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }
}

impl<I2C, E> ChannelSelect for Tca9548a<I2C>
where
    I2C: Write<Error = E>,
    E: Debug,
{
    fn select_channel(&mut self, channel: u8) -> Result<()> {
        if channel > MAX_CHANNEL {
            return Err(TofError::InvalidChannel(channel));
        }

        self.i2c.write(self.address, &[1 << channel]).map_err(|e| {
            TofError::BusIo(format!(
                "Failed to select channel {} on multiplexer 0x{:02X}: {:?}",
                channel, self.address, e
            ))
        })
    }
}
