use nix::time::{clock_gettime, ClockId};
use std::fmt;
use std::time::Duration;

use crate::sensor::Measurement;
use crate::topology::SensorSlot;

/// One sensor's distance for one sampling iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    pub label: String,
    pub address: u8,
    pub channel: Option<u8>,
    pub distance_mm: u16,
    pub range_status: u8,
}

impl Reading {
    pub fn new(slot: &SensorSlot, measurement: Measurement) -> Self {
        Reading {
            label: slot.label.clone(),
            address: slot.address,
            channel: slot.channel,
            distance_mm: measurement.distance_mm,
            range_status: measurement.range_status,
        }
    }
}

impl Reading {
    /// `Port 0 (0x29@0): 100 mm, status 0` for the debug log.
    pub fn detail(&self) -> String {
        let place = match self.channel {
            Some(channel) => format!("0x{:02X}@{}", self.address, channel),
            None => format!("0x{:02X}", self.address),
        };
        format!(
            "{} ({}): {} mm, status {}",
            self.label, place, self.distance_mm, self.range_status
        )
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} mm", self.label, self.distance_mm)
    }
}

/// All readings of one iteration, in topology order.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Seconds on the monotonic clock when the last sensor was read
    pub timestamp: f64,
    pub readings: Vec<Reading>,
}

impl Sample {
    pub fn new(readings: Vec<Reading>) -> Self {
        Sample {
            timestamp: monotonic_seconds(),
            readings,
        }
    }
}

/// `Port 0: 100 mm, Port 2: 150 mm`
impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, reading) in self.readings.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", reading)?;
        }
        Ok(())
    }
}

/// Seconds on `CLOCK_MONOTONIC`; 0.0 if the clock cannot be read.
pub fn monotonic_seconds() -> f64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| Duration::new(ts.tv_sec() as u64, ts.tv_nsec() as u32).as_secs_f64())
        .unwrap_or(0.0)
}
