use core::fmt::Debug;
use embedded_hal::blocking::i2c::{Write, WriteRead};
use linux_embedded_hal::I2cdev;

use crate::error::{Result, TofError};
use crate::mux::{ChannelSelect, Tca9548a};
use crate::reading::{Reading, Sample};
use crate::sensor::{RangingSensor, SensorConfig, Vl53l1xSensor};
use crate::shared_bus::SharedI2c;
use crate::topology::Topology;

/// An opened bus: the multiplexer (if any) and one sensor per topology slot.
///
/// The rig is the bus handle.  Whoever holds it has the bus to themselves,
/// and dropping it closes the underlying device.
pub struct Rig<M, S> {
    topology: Topology,
    mux: Option<M>,
    sensors: Vec<S>,
}

impl<M, S> Rig<M, S>
where
    M: ChannelSelect,
    S: RangingSensor,
{
    pub fn new(topology: Topology, mux: Option<M>, sensors: Vec<S>) -> Result<Self> {
        if sensors.len() != topology.slots.len() {
            return Err(TofError::InvalidTopology(format!(
                "{} sensors opened for {} slots",
                sensors.len(),
                topology.slots.len()
            )));
        }
        if mux.is_none() && topology.slots.iter().any(|s| s.channel.is_some()) {
            return Err(TofError::InvalidTopology(
                "channels configured but no multiplexer opened".to_string(),
            ));
        }
        Ok(Rig {
            topology,
            mux,
            sensors,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Reads every sensor once, in topology order.
    pub fn sample(&mut self) -> Result<Sample> {
        let mut readings = Vec::with_capacity(self.sensors.len());

        for (slot, sensor) in self.topology.slots.iter().zip(self.sensors.iter_mut()) {
            if let Some(channel) = slot.channel {
                match self.mux.as_mut() {
                    Some(mux) => mux.select_channel(channel)?,
                    None => return Err(TofError::InvalidChannel(channel)),
                }
            }

            sensor.start_ranging()?;
            let measurement = match sensor.read_distance() {
                Ok(m) => m,
                Err(e) => {
                    // Leave the sensor idle even though this read is lost.
                    if let Err(stop_err) = sensor.stop_ranging() {
                        log::debug!("{}: stop after failed read: {}", slot.label, stop_err);
                    }
                    return Err(e);
                }
            };
            sensor.stop_ranging()?;

            readings.push(Reading::new(slot, measurement));
        }

        Ok(Sample::new(readings))
    }
}

/// Acquires the bus handle when the sampler starts.
pub trait BusOpener: Send {
    type Mux: ChannelSelect + Send + 'static;
    type Sensor: RangingSensor + Send + 'static;

    fn open(&mut self, topology: &Topology) -> Result<Rig<Self::Mux, Self::Sensor>>;
}

/// `/dev/i2c-N` with VL53L1X sensors.
pub struct LinuxBus {
    bus: u8,
    config: SensorConfig,
}

impl LinuxBus {
    pub fn new(bus: u8, config: SensorConfig) -> Self {
        LinuxBus { bus, config }
    }

    pub fn path(&self) -> String {
        format!("/dev/i2c-{}", self.bus)
    }
}

impl BusOpener for LinuxBus {
    type Mux = Tca9548a<SharedI2c<I2cdev>>;
    type Sensor = Vl53l1xSensor<SharedI2c<I2cdev>>;

    fn open(&mut self, topology: &Topology) -> Result<Rig<Self::Mux, Self::Sensor>> {
        let path = self.path();
        let i2c = I2cdev::new(&path)
            .map_err(|e| TofError::BusIo(format!("Failed to open I2C bus {}: {}", path, e)))?;

        let rig = open_vl53l1x_rig(i2c, topology, &self.config)?;
        log::info!("Opened {} with {} sensor(s)", path, topology.slots.len());
        Ok(rig)
    }
}

/// Builds a rig of VL53L1X sensors on one bus device.  Each sensor's channel
/// is selected before the sensor is first touched.
pub fn open_vl53l1x_rig<I2C, E>(
    i2c: I2C,
    topology: &Topology,
    config: &SensorConfig,
) -> Result<Rig<Tca9548a<SharedI2c<I2C>>, Vl53l1xSensor<SharedI2c<I2C>>>>
where
    I2C: Write<Error = E> + WriteRead<Error = E>,
    SharedI2c<I2C>: vl53l1x_uld::comm::Read<Error = E> + vl53l1x_uld::comm::Write<Error = E>,
    E: Debug,
{
    let i2c = SharedI2c::new(i2c);

    let mut mux = topology
        .multiplexer
        .map(|address| Tca9548a::new(i2c.clone(), address));

    let mut sensors = Vec::with_capacity(topology.slots.len());
    for slot in &topology.slots {
        if let Some(channel) = slot.channel {
            match mux.as_mut() {
                Some(mux) => mux.select_channel(channel)?,
                None => return Err(TofError::InvalidChannel(channel)),
            }
        }
        sensors.push(Vl53l1xSensor::open(
            i2c.clone(),
            slot.address,
            &slot.label,
            config,
        )?);
    }

    Rig::new(topology.clone(), mux, sensors)
}
