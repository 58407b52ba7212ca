use crossbeam_channel::{Sender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::TofError;

/// Receives the sampler's output on the sampler thread.
pub trait Observer: Send + Sync {
    /// One formatted line per sampling iteration.
    fn on_line(&self, line: &str);

    /// Called once after the bus has been released.  `error` is the fatal
    /// error that ended the loop, if any.
    fn on_stopped(&self, _error: Option<&TofError>) {}
}

impl<F> Observer for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_line(&self, line: &str) {
        self(line)
    }
}

/// Forwards lines into a channel.  A full channel drops the line rather than
/// stall the bus; the next iteration brings a fresh one anyway.
impl Observer for Sender<String> {
    fn on_line(&self, line: &str) {
        match self.try_send(line.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("Observer channel full, dropping reading");
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("Observer channel closed");
            }
        }
    }
}

/// Keeps how the last run ended for callers that are not on the sampler
/// thread.  Clones share one slot.
#[derive(Clone, Default)]
pub struct ExitSlot {
    error: Arc<Mutex<Option<TofError>>>,
}

impl ExitSlot {
    pub fn record(&self, error: Option<&TofError>) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = error.cloned();
    }

    /// The fatal error of the last run, cleared once read.
    pub fn take(&self) -> Option<TofError> {
        self.error.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}
