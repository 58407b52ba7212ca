use core::fmt::Debug;
use std::thread;
use std::time::{Duration, Instant};
use vl53l1x_uld::comm::{Read, Write};
use vl53l1x_uld::{DistanceMode, IOVoltage, VL53L1X};

use crate::error::{Result, TofError};

/// Valid timing budget values in milliseconds
pub const VALID_TIMING_BUDGETS: &[u16] = &[15, 20, 33, 50, 100, 200, 500];

/// Default 7-bit address of a VL53L1X out of reset
pub const DEFAULT_SENSOR_ADDRESS: u8 = 0x29;

/// Model ID reported by a genuine VL53L1X
const VL53L1X_MODEL_ID: u16 = 0xEACC;

/// Extra slack on top of two timing budgets before a ranging attempt is
/// declared dead.
const DATA_READY_SLACK: Duration = Duration::from_millis(50);

/// One distance measurement straight from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub distance_mm: u16,
    // 0 = valid, 1 = sigma fail, 2 = signal fail, 4 = out of bounds,
    // 7 = wraparound. Reported, never filtered.
    pub range_status: u8,
}

/// A time-of-flight sensor that can be ranged on demand.
pub trait RangingSensor {
    fn start_ranging(&mut self) -> Result<()>;
    fn read_distance(&mut self) -> Result<Measurement>;
    fn stop_ranging(&mut self) -> Result<()>;
}

/// Per-sensor setup applied when the bus is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorConfig {
    /// 2.8V IO if true, 1.8V otherwise
    pub voltage_2v8: bool,
    pub timing_budget_ms: u16,
    pub long_range: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        SensorConfig {
            voltage_2v8: true,
            timing_budget_ms: 33,
            long_range: false,
        }
    }
}

impl SensorConfig {
    pub fn validate(&self) -> Result<()> {
        if !VALID_TIMING_BUDGETS.contains(&self.timing_budget_ms) {
            return Err(TofError::InvalidConfig(format!(
                "Invalid timing budget {} ms. Must be one of: {:?}",
                self.timing_budget_ms, VALID_TIMING_BUDGETS
            )));
        }
        if self.timing_budget_ms == 15 && self.long_range {
            return Err(TofError::InvalidConfig(
                "15 ms timing budget is only available in short distance mode".to_string(),
            ));
        }
        Ok(())
    }

    /// How long a single ranging attempt may take before it counts as failed.
    pub fn data_ready_timeout(&self) -> Duration {
        Duration::from_millis(2 * self.timing_budget_ms as u64) + DATA_READY_SLACK
    }
}

/// VL53L1X time-of-flight sensor.
pub struct Vl53l1xSensor<I2C>
where
    I2C: Read + Write,
{
    label: String,
    sensor: VL53L1X<I2C>,
    timeout: Duration,
}

impl<I2C, E> Vl53l1xSensor<I2C>
where
    I2C: Read<Error = E> + Write<Error = E>,
    E: Debug,
{
    /// Checks the model ID and applies `config`.  In a multiplexed topology
    /// the caller must have selected the sensor's channel already.
    pub fn open(i2c: I2C, address: u8, label: &str, config: &SensorConfig) -> Result<Self> {
        config.validate()?;

        let mut sensor = VL53L1X::new(i2c, address);

        let id = sensor
            .get_sensor_id()
            .map_err(|e| bus_error(label, "read sensor id", e))?;
        if id != VL53L1X_MODEL_ID {
            return Err(TofError::SensorRead {
                label: label.to_string(),
                reason: format!(
                    "unexpected model id 0x{:04X} (expected 0x{:04X})",
                    id, VL53L1X_MODEL_ID
                ),
            });
        }

        sensor
            .init(if config.voltage_2v8 {
                IOVoltage::Volt2_8
            } else {
                IOVoltage::Volt1_8
            })
            .map_err(|e| bus_error(label, "initialize sensor", e))?;
        sensor
            .set_distance_mode(if config.long_range {
                DistanceMode::Long
            } else {
                DistanceMode::Short
            })
            .map_err(|e| bus_error(label, "set distance mode", e))?;
        sensor
            .set_timing_budget_ms(config.timing_budget_ms)
            .map_err(|e| bus_error(label, "set timing budget", e))?;

        log::debug!(
            "{} ready at 0x{:02X} (budget {} ms, {} range)",
            label,
            address,
            config.timing_budget_ms,
            if config.long_range { "long" } else { "short" }
        );

        Ok(Vl53l1xSensor {
            label: label.to_string(),
            sensor,
            timeout: config.data_ready_timeout(),
        })
    }
}

impl<I2C, E> RangingSensor for Vl53l1xSensor<I2C>
where
    I2C: Read<Error = E> + Write<Error = E>,
    E: Debug,
{
    fn start_ranging(&mut self) -> Result<()> {
        self.sensor
            .start_ranging()
            .map_err(|e| bus_error(&self.label, "start ranging", e))
    }

    fn read_distance(&mut self) -> Result<Measurement> {
        let deadline = Instant::now() + self.timeout;

        // Rapid poll: a reading lands at most one timing budget after
        // ranging starts.
        loop {
            let ready = self
                .sensor
                .is_data_ready()
                .map_err(|e| bus_error(&self.label, "check data ready", e))?;
            if ready {
                break;
            }
            if Instant::now() >= deadline {
                return Err(TofError::SensorRead {
                    label: self.label.clone(),
                    reason: format!("no data after {} ms", self.timeout.as_millis()),
                });
            }
            thread::sleep(Duration::from_millis(1));
        }

        let distance_mm = self
            .sensor
            .get_distance()
            .map_err(|e| bus_error(&self.label, "get distance", e))?;
        let range_status = match self.sensor.get_range_status() {
            Ok(status) => status as u8,
            Err(_) => 0,
        };
        self.sensor
            .clear_interrupt()
            .map_err(|e| bus_error(&self.label, "clear interrupt", e))?;

        Ok(Measurement {
            distance_mm,
            range_status,
        })
    }

    fn stop_ranging(&mut self) -> Result<()> {
        self.sensor
            .stop_ranging()
            .map_err(|e| bus_error(&self.label, "stop ranging", e))
    }
}

fn bus_error<E: Debug>(label: &str, action: &str, e: E) -> TofError {
    TofError::BusIo(format!("{}: failed to {}: {:?}", label, action, e))
}
