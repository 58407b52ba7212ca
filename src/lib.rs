//! Polls VL53L1X time-of-flight sensors over Linux I2C, optionally through a
//! TCA9548A multiplexer, and reports one text line per sampling iteration.
//!
//! ```no_run
//! use tof_monitor::{LinuxBus, Sampler, SamplerConfig, SensorConfig, Topology};
//!
//! let bus = LinuxBus::new(1, SensorConfig::default());
//! let mut sampler = Sampler::new(
//!     bus,
//!     Topology::multiplexed_pair(),
//!     SamplerConfig::default(),
//!     |line: &str| println!("{}", line),
//! );
//!
//! sampler.start()?;
//! std::thread::sleep(std::time::Duration::from_secs(5));
//! sampler.stop()?;
//! # Ok::<(), tof_monitor::TofError>(())
//! ```

pub mod config;
pub mod error;
pub mod mux;
pub mod observer;
pub mod reading;
pub mod rig;
pub mod sampler;
pub mod sensor;
pub mod shared_bus;
pub mod topology;

#[cfg(feature = "python")]
mod python;

pub use config::{ErrorPolicy, SamplerConfig};
pub use error::{Result, TofError};
pub use mux::{ChannelSelect, Tca9548a};
pub use observer::{ExitSlot, Observer};
pub use reading::{Reading, Sample};
pub use rig::{BusOpener, LinuxBus, Rig};
pub use sampler::Sampler;
pub use sensor::{Measurement, RangingSensor, SensorConfig, Vl53l1xSensor};
pub use topology::{SensorSlot, Topology};
