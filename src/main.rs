//! ToF monitor - prints live distances from VL53L1X sensors on an I2C bus.
//!
//! Defaults match the bench rig: two sensors at 0x29 behind channels 0 and 2
//! of a TCA9548A at 0x70 on /dev/i2c-1.

use clap::Parser;
use crossbeam_channel::{bounded, Sender};
use std::time::Duration;

use tof_monitor::topology::parse_address;
use tof_monitor::{
    ErrorPolicy, LinuxBus, Observer, Sampler, SamplerConfig, SensorConfig, SensorSlot, TofError,
    Topology,
};

#[derive(Parser, Debug)]
#[command(name = "tof-monitor")]
#[command(about = "Live distance readings from VL53L1X sensors", long_about = None)]
struct Args {
    /// I2C bus number (/dev/i2c-N)
    #[arg(short, long, default_value_t = 1)]
    bus: u8,

    /// Multiplexer address
    #[arg(long, default_value = "0x70", value_parser = parse_addr)]
    mux_address: u8,

    /// Sensors sit directly on the bus, no multiplexer
    #[arg(long)]
    direct: bool,

    /// Sensor as ADDR[@CHANNEL], e.g. 0x29@0. Repeat for more sensors.
    #[arg(short, long = "sensor", value_parser = parse_slot)]
    sensors: Vec<SensorSlot>,

    /// Delay between sampling iterations
    #[arg(short, long, default_value_t = 100)]
    interval_ms: u64,

    /// Consecutive failed iterations tolerated before giving up (0 = fail fast)
    #[arg(long, default_value_t = 3)]
    max_failures: u32,

    /// Sensor timing budget: 15, 20, 33, 50, 100, 200 or 500
    #[arg(long, default_value_t = 33)]
    timing_budget_ms: u16,

    /// Long distance mode
    #[arg(long)]
    long_range: bool,

    /// Sensor IO at 1.8V instead of 2.8V
    #[arg(long)]
    io_1v8: bool,

    /// Run the sampler thread at max priority
    #[arg(long)]
    high_priority: bool,
}

fn parse_addr(s: &str) -> Result<u8, String> {
    parse_address(s).map_err(|e| e.to_string())
}

fn parse_slot(s: &str) -> Result<SensorSlot, String> {
    s.parse().map_err(|e: TofError| e.to_string())
}

impl Args {
    fn topology(&self) -> Topology {
        let multiplexer = if self.direct {
            None
        } else {
            Some(self.mux_address)
        };

        if !self.sensors.is_empty() {
            return Topology {
                multiplexer,
                slots: self.sensors.clone(),
            };
        }

        if self.direct {
            Topology::direct_pair()
        } else {
            Topology {
                multiplexer,
                ..Topology::multiplexed_pair()
            }
        }
    }

    fn sensor_config(&self) -> SensorConfig {
        SensorConfig {
            voltage_2v8: !self.io_1v8,
            timing_budget_ms: self.timing_budget_ms,
            long_range: self.long_range,
        }
    }

    fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            interval: Duration::from_millis(self.interval_ms),
            policy: ErrorPolicy {
                max_consecutive_failures: self.max_failures,
            },
            high_priority: self.high_priority,
        }
    }
}

/// Prints each line and wakes main when the loop ends on its own.
struct ConsoleObserver {
    done: Sender<()>,
}

impl Observer for ConsoleObserver {
    fn on_line(&self, line: &str) {
        println!("{}", line);
    }

    fn on_stopped(&self, _error: Option<&TofError>) {
        let _ = self.done.try_send(());
    }
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();

    let sensor_config = args.sensor_config();
    sensor_config.validate()?;
    let topology = args.topology();
    topology.validate()?;

    log::info!(
        "Sampling {} sensor(s) on /dev/i2c-{} every {} ms",
        topology.slots.len(),
        args.bus,
        args.interval_ms
    );
    for slot in &topology.slots {
        log::info!("  {} at {}", slot.label, slot);
    }

    // Ctrl+C and a dead sampler both land here.
    let (done_tx, done_rx) = bounded(2);
    let ctrlc_tx = done_tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.try_send(());
    })?;

    let mut sampler = Sampler::new(
        LinuxBus::new(args.bus, sensor_config),
        topology,
        args.sampler_config(),
        ConsoleObserver { done: done_tx },
    );

    sampler.start()?;
    let _ = done_rx.recv();

    log::info!("Stopping...");
    sampler.stop()?;
    Ok(())
}
