//! Error types for the sensor bus and sampling loop

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TofError {
    /// Multiplexer channel outside 0..=7
    #[error("Invalid multiplexer channel: {0}. Must be 0-7")]
    InvalidChannel(u8),

    /// Transport failure talking to the multiplexer or a sensor
    #[error("I2C bus error: {0}")]
    BusIo(String),

    /// Sensor-level ranging failure
    #[error("Sensor {label} read failed: {reason}")]
    SensorRead { label: String, reason: String },

    #[error("Invalid sensor topology: {0}")]
    InvalidTopology(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn sampler thread: {0}")]
    ThreadSpawn(String),

    #[error("Sampler thread panicked")]
    WorkerPanicked,
}

impl TofError {
    /// Configuration faults that no amount of retrying will clear.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TofError::InvalidChannel(_) | TofError::InvalidTopology(_) | TofError::InvalidConfig(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TofError>;
