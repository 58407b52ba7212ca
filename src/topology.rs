//! Which sensors live where on the bus.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TofError};
use crate::mux::{MAX_CHANNEL, TCA9548A_ADDRESS};
use crate::sensor::DEFAULT_SENSOR_ADDRESS;

/// Second address for the direct pair.  One sensor has to be re-addressed
/// away from 0x29 before both can share a bus without a multiplexer.
pub const SECONDARY_SENSOR_ADDRESS: u8 = 0x2A;

/// One sensor: its fixed address and, behind a multiplexer, its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorSlot {
    pub label: String,
    pub address: u8,
    pub channel: Option<u8>,
}

impl SensorSlot {
    pub fn new(address: u8, channel: Option<u8>) -> Self {
        let label = match channel {
            Some(channel) => format!("Port {}", channel),
            None => format!("Sensor 0x{:02X}", address),
        };
        SensorSlot {
            label,
            address,
            channel,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl fmt::Display for SensorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel {
            Some(channel) => write!(f, "0x{:02X}@{}", self.address, channel),
            None => write!(f, "0x{:02X}", self.address),
        }
    }
}

/// Parses `ADDR[@CHANNEL]`, e.g. `0x29@0`, `0x2A` or `41@3`.
impl FromStr for SensorSlot {
    type Err = TofError;

    fn from_str(s: &str) -> Result<Self> {
        let (address, channel) = match s.split_once('@') {
            Some((address, channel)) => (address, Some(channel)),
            None => (s, None),
        };

        let address = parse_address(address)?;
        let channel = match channel {
            Some(c) => {
                let channel: u8 = c.trim().parse().map_err(|_| {
                    TofError::InvalidConfig(format!("Invalid channel '{}' in '{}'", c, s))
                })?;
                if channel > MAX_CHANNEL {
                    return Err(TofError::InvalidChannel(channel));
                }
                Some(channel)
            }
            None => None,
        };

        Ok(SensorSlot::new(address, channel))
    }
}

/// Parses a 7-bit I2C address in hex (`0x29`) or decimal (`41`).
pub fn parse_address(s: &str) -> Result<u8> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    match parsed {
        Ok(address) if address <= 0x7F => Ok(address),
        _ => Err(TofError::InvalidConfig(format!(
            "Invalid I2C address '{}'. Must be 0x00-0x7F",
            s
        ))),
    }
}

/// The sensors polled each iteration, in read order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub multiplexer: Option<u8>,
    pub slots: Vec<SensorSlot>,
}

impl Topology {
    /// Two sensors at the default address on channels 0 and 2 of a
    /// multiplexer at 0x70.
    pub fn multiplexed_pair() -> Self {
        Topology {
            multiplexer: Some(TCA9548A_ADDRESS),
            slots: vec![
                SensorSlot::new(DEFAULT_SENSOR_ADDRESS, Some(0)),
                SensorSlot::new(DEFAULT_SENSOR_ADDRESS, Some(2)),
            ],
        }
    }

    /// Two sensors at distinct addresses directly on the bus.
    pub fn direct_pair() -> Self {
        Topology {
            multiplexer: None,
            slots: vec![
                SensorSlot::new(DEFAULT_SENSOR_ADDRESS, None),
                SensorSlot::new(SECONDARY_SENSOR_ADDRESS, None),
            ],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.slots.is_empty() {
            return Err(TofError::InvalidTopology("no sensors configured".to_string()));
        }

        if let Some(mux) = self.multiplexer {
            if mux > 0x7F {
                return Err(TofError::InvalidTopology(format!(
                    "multiplexer address 0x{:02X} is not a 7-bit address",
                    mux
                )));
            }
        }

        for slot in &self.slots {
            if slot.address > 0x7F {
                return Err(TofError::InvalidTopology(format!(
                    "{}: address 0x{:02X} is not a 7-bit address",
                    slot.label, slot.address
                )));
            }
            if Some(slot.address) == self.multiplexer {
                return Err(TofError::InvalidTopology(format!(
                    "{}: address 0x{:02X} collides with the multiplexer",
                    slot.label, slot.address
                )));
            }
            match (slot.channel, self.multiplexer) {
                (Some(channel), _) if channel > MAX_CHANNEL => {
                    return Err(TofError::InvalidChannel(channel));
                }
                (Some(_), None) => {
                    return Err(TofError::InvalidTopology(format!(
                        "{}: channel given but no multiplexer configured",
                        slot.label
                    )));
                }
                _ => {}
            }
        }

        // Without a channel to tell them apart, two sensors on one address
        // would answer the same transactions.
        for (i, a) in self.slots.iter().enumerate() {
            for b in &self.slots[i + 1..] {
                if a.address == b.address && a.channel == b.channel {
                    return Err(TofError::InvalidTopology(format!(
                        "{} and {} are both at {}",
                        a.label, b.label, a
                    )));
                }
            }
        }

        Ok(())
    }
}
