use std::time::Duration;

use crate::error::{Result, TofError};

/// Delay between sampling iterations
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Consecutive failed iterations tolerated by default before the loop gives up
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// What a failed iteration does to the loop.
///
/// Each failure is logged.  Once more than `max_consecutive_failures`
/// iterations in a row have failed the error becomes fatal; a good
/// iteration resets the count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPolicy {
    pub max_consecutive_failures: u32,
}

impl ErrorPolicy {
    /// First failure ends the loop.
    pub fn fail_fast() -> Self {
        ErrorPolicy {
            max_consecutive_failures: 0,
        }
    }

    /// Failures are logged and the loop never gives up.
    pub fn log_and_continue() -> Self {
        ErrorPolicy {
            max_consecutive_failures: u32::MAX,
        }
    }

    pub fn tolerates(&self, consecutive_failures: u32) -> bool {
        consecutive_failures <= self.max_consecutive_failures
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy {
            max_consecutive_failures: DEFAULT_MAX_FAILURES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerConfig {
    pub interval: Duration,
    pub policy: ErrorPolicy,
    /// Run the sampler thread at max priority (needs CAP_SYS_NICE to stick)
    pub high_priority: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            interval: DEFAULT_INTERVAL,
            policy: ErrorPolicy::default(),
            high_priority: false,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(TofError::InvalidConfig(
                "Sampling interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
