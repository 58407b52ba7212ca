use pyo3::create_exception;
use pyo3::exceptions::{PyException, PyIOError, PyValueError};
use pyo3::prelude::*;
use std::time::Duration;

use crate::config::{ErrorPolicy, SamplerConfig};
use crate::error::TofError;
use crate::observer::{ExitSlot, Observer};
use crate::rig::LinuxBus;
use crate::sampler::Sampler;
use crate::sensor::SensorConfig;
use crate::topology::Topology;

// Raised when the sampling loop died on its own
create_exception!(tof_monitor, ThreadError, PyException);

fn to_py_err(e: TofError) -> PyErr {
    match e {
        TofError::InvalidChannel(_) | TofError::InvalidTopology(_) | TofError::InvalidConfig(_) => {
            PyErr::new::<PyValueError, _>(e.to_string())
        }
        TofError::BusIo(_) | TofError::SensorRead { .. } => PyErr::new::<PyIOError, _>(e.to_string()),
        TofError::ThreadSpawn(_) | TofError::WorkerPanicked => ThreadError::new_err(e.to_string()),
    }
}

struct PyCallback {
    callback: PyObject,
    on_stopped: Option<PyObject>,
    exit: ExitSlot,
}

impl Observer for PyCallback {
    fn on_line(&self, line: &str) {
        Python::with_gil(|py| {
            if let Err(e) = self.callback.call1(py, (line,)) {
                log::warn!("Python callback raised: {}", e);
            }
        });
    }

    fn on_stopped(&self, error: Option<&TofError>) {
        self.exit.record(error);
        if let Some(on_stopped) = &self.on_stopped {
            let message = error.map(|e| e.to_string());
            Python::with_gil(|py| {
                if let Err(e) = on_stopped.call1(py, (message,)) {
                    log::warn!("Python on_stopped callback raised: {}", e);
                }
            });
        }
    }
}

#[pyclass]
#[doc = "Polls VL53L1X sensors in a background thread.\n\n\
         The callback passed to start() receives one line per iteration,\n\
         called from the sampler thread.  on_stopped, if given, is called\n\
         once with the fatal error message (or None) after the I2C bus has\n\
         been released.  stop() blocks until that has happened."]
struct TofMonitor {
    bus: u8,
    topology: Topology,
    sensor_config: SensorConfig,
    config: SamplerConfig,
    sampler: Option<Sampler<LinuxBus>>,
    exit: ExitSlot,
}

#[pymethods]
impl TofMonitor {
    #[new]
    #[pyo3(signature = (bus=1, direct=false, interval_ms=100, max_failures=3, timing_budget_ms=33, long_range=false))]
    fn new(
        bus: u8,
        direct: bool,
        interval_ms: u64,
        max_failures: u32,
        timing_budget_ms: u16,
        long_range: bool,
    ) -> PyResult<Self> {
        let sensor_config = SensorConfig {
            timing_budget_ms,
            long_range,
            ..SensorConfig::default()
        };
        sensor_config.validate().map_err(to_py_err)?;

        let config = SamplerConfig {
            interval: Duration::from_millis(interval_ms),
            policy: ErrorPolicy {
                max_consecutive_failures: max_failures,
            },
            high_priority: false,
        };
        config.validate().map_err(to_py_err)?;

        Ok(TofMonitor {
            bus,
            topology: if direct {
                Topology::direct_pair()
            } else {
                Topology::multiplexed_pair()
            },
            sensor_config,
            config,
            sampler: None,
            exit: ExitSlot::default(),
        })
    }

    #[pyo3(signature = (callback, on_stopped=None))]
    fn start(
        &mut self,
        py: Python<'_>,
        callback: PyObject,
        on_stopped: Option<PyObject>,
    ) -> PyResult<()> {
        if self.is_running() {
            return Ok(());
        }

        // Join whatever is left of the previous run before opening the bus again.
        if let Some(mut old) = self.sampler.take() {
            if let Err(e) = py.allow_threads(move || old.stop()) {
                log::warn!("Previous run ended with: {}", e);
            }
        }

        let mut sampler = Sampler::new(
            LinuxBus::new(self.bus, self.sensor_config.clone()),
            self.topology.clone(),
            self.config.clone(),
            PyCallback {
                callback,
                on_stopped,
                exit: self.exit.clone(),
            },
        );
        self.exit.record(None);
        sampler.start().map_err(to_py_err)?;
        self.sampler = Some(sampler);
        Ok(())
    }

    fn stop(&mut self, py: Python<'_>) -> PyResult<()> {
        let sampler = &mut self.sampler;
        // The sampler thread needs the GIL to run callbacks, so let go of it
        // while joining.
        py.allow_threads(move || match sampler.as_mut() {
            Some(sampler) => sampler.stop(),
            None => Ok(()),
        })
        .map_err(|e| ThreadError::new_err(e.to_string()))
    }

    /// Message of the error that ended the last run, cleared once read.
    fn last_error(&self) -> Option<String> {
        self.exit.take().map(|e| e.to_string())
    }

    fn is_running(&self) -> bool {
        self.sampler.as_ref().map_or(false, |s| s.is_running())
    }
}

impl Drop for TofMonitor {
    fn drop(&mut self) {
        // Same GIL hand-off as stop(); Sampler's own Drop would join with it held.
        if let Some(mut sampler) = self.sampler.take() {
            let result = Python::with_gil(|py| py.allow_threads(move || sampler.stop()));
            if let Err(e) = result {
                log::warn!("TofMonitor dropped after error: {}", e);
            }
        }
    }
}

// Register the module
#[pymodule]
fn tof_monitor(py: Python, m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<TofMonitor>()?;
    m.add("ThreadError", py.get_type::<ThreadError>())?;
    Ok(())
}
