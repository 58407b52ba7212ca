use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use thread_priority::{ThreadBuilder, ThreadPriority};

use crate::config::SamplerConfig;
use crate::error::{Result, TofError};
use crate::mux::ChannelSelect;
use crate::observer::Observer;
use crate::rig::{BusOpener, Rig};
use crate::sensor::RangingSensor;
use crate::topology::Topology;

/// Background polling loop over one bus.
///
/// `start()` opens the bus and hands it to a worker thread; `stop()` asks the
/// worker to finish its current iteration and blocks until it has released
/// the bus.  Only one run is active per sampler.
pub struct Sampler<O: BusOpener> {
    opener: O,
    topology: Topology,
    config: SamplerConfig,
    observer: Arc<dyn Observer>,

    // Thread management
    thread_handle: Option<JoinHandle<Result<()>>>,
    is_running: Arc<AtomicBool>,
}

impl<O: BusOpener> Sampler<O> {
    pub fn new(
        opener: O,
        topology: Topology,
        config: SamplerConfig,
        observer: impl Observer + 'static,
    ) -> Self {
        Sampler {
            opener,
            topology,
            config,
            observer: Arc::new(observer),
            thread_handle: None,
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn start(&mut self) -> Result<()> {
        // Return early if already sampling
        if self.is_running() {
            log::warn!("Sampler already running");
            return Ok(());
        }

        // A run that died on its own leaves a handle behind.
        if let Some(handle) = self.thread_handle.take() {
            if let Err(e) = join(handle) {
                log::warn!("Previous sampler run ended with: {}", e);
            }
        }

        self.config.validate()?;
        self.topology.validate()?;

        let rig = self.opener.open(&self.topology)?;

        let is_running = Arc::clone(&self.is_running);
        let observer = Arc::clone(&self.observer);
        let config = self.config.clone();

        // Set the running flag before starting thread
        is_running.store(true, Ordering::Release);

        let mut builder = ThreadBuilder::default().name("tof_sampler");
        if config.high_priority {
            builder = builder.priority(ThreadPriority::Max);
        }

        let thread_is_running = Arc::clone(&is_running);
        let thread = builder
            .spawn(move |priority| {
                if let Err(e) = priority {
                    log::warn!("Failed to set sampler thread priority: {:?}", e);
                }

                // Clears the flag on every exit path, unwinding included.
                let _running = RunningGuard(thread_is_running.clone());

                let result = sampling_loop(rig, &thread_is_running, observer.as_ref(), &config);
                thread_is_running.store(false, Ordering::Release);

                match &result {
                    Ok(()) => log::info!("Sampler stopped"),
                    Err(e) => log::error!("Sampler stopped on error: {}", e),
                }
                observer.on_stopped(result.as_ref().err());
                result
            })
            .map_err(|e| {
                is_running.store(false, Ordering::Release);
                TofError::ThreadSpawn(e.to_string())
            })?;

        self.thread_handle = Some(thread);
        Ok(())
    }

    /// Requests a stop and blocks until the bus is released.
    ///
    /// Returns the fatal error of the run if the loop died on its own.  With
    /// nothing running this is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        self.is_running.store(false, Ordering::Release);

        match self.thread_handle.take() {
            Some(handle) => join(handle),
            None => Ok(()),
        }
    }

    /// Blocks until the loop exits by itself, i.e. on a fatal error.
    pub fn wait(&mut self) -> Result<()> {
        match self.thread_handle.take() {
            Some(handle) => join(handle),
            None => Ok(()),
        }
    }
}

impl<O: BusOpener> Drop for Sampler<O> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Sampler dropped after error: {}", e);
        }
    }
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn join(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle.join().map_err(|_| TofError::WorkerPanicked)?
}

// Worker function for the sampler thread.  Owns the rig, so the bus is
// released when this returns, however it returns.
fn sampling_loop<M, S>(
    mut rig: Rig<M, S>,
    is_running: &AtomicBool,
    observer: &dyn Observer,
    config: &SamplerConfig,
) -> Result<()>
where
    M: ChannelSelect,
    S: RangingSensor,
{
    let mut failures: u32 = 0;

    while is_running.load(Ordering::Acquire) {
        match rig.sample() {
            Ok(sample) => {
                failures = 0;
                let line = sample.to_string();
                // Observers own the user-facing output; the log only mirrors it.
                log::debug!("[{:.3}] {}", sample.timestamp, line);
                for reading in &sample.readings {
                    log::trace!("{}", reading.detail());
                }
                observer.on_line(&line);
            }
            Err(e) if e.is_permanent() => return Err(e),
            Err(e) => {
                failures = failures.saturating_add(1);
                if !config.policy.tolerates(failures) {
                    return Err(e);
                }
                log::warn!("Sampling failed ({} in a row): {}", failures, e);
            }
        }

        thread::sleep(config.interval);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ErrorPolicy;
    use crate::rig::fakes::*;
    use crate::topology::SensorSlot;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::sync::atomic::Ordering;
    use std::sync::{Mutex, Once, PoisonError};
    use std::time::Duration;

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    #[derive(Debug, PartialEq)]
    enum Event {
        Line(String),
        Stopped(Option<TofError>),
    }

    struct RecordingObserver(Sender<Event>);

    impl Observer for RecordingObserver {
        fn on_line(&self, line: &str) {
            let _ = self.0.send(Event::Line(line.to_string()));
        }

        fn on_stopped(&self, error: Option<&TofError>) {
            let _ = self.0.send(Event::Stopped(error.cloned()));
        }
    }

    fn config(policy: ErrorPolicy) -> SamplerConfig {
        SamplerConfig {
            interval: Duration::from_millis(5),
            policy,
            high_priority: false,
        }
    }

    fn sampler(
        opener: FakeOpener,
        policy: ErrorPolicy,
    ) -> (Sampler<FakeOpener>, Receiver<Event>) {
        let (tx, rx) = unbounded();
        let sampler = Sampler::new(
            opener,
            Topology::multiplexed_pair(),
            config(policy),
            RecordingObserver(tx),
        );
        (sampler, rx)
    }

    fn next_line(rx: &Receiver<Event>) -> String {
        match rx.recv_timeout(RECV_TIMEOUT).unwrap() {
            Event::Line(line) => line,
            other => panic!("expected a line, got {:?}", other),
        }
    }

    /// Records every log line; installed once for the whole test binary.
    struct CaptureLogger;

    static CAPTURED: Mutex<Vec<(log::Level, String)>> = Mutex::new(Vec::new());
    static LOGGER: CaptureLogger = CaptureLogger;

    impl log::Log for CaptureLogger {
        fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
            true
        }

        fn log(&self, record: &log::Record<'_>) {
            CAPTURED
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((record.level(), record.args().to_string()));
        }

        fn flush(&self) {}
    }

    fn capture_logs() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            if log::set_logger(&LOGGER).is_ok() {
                log::set_max_level(log::LevelFilter::Trace);
            }
        });
    }

    fn logged_containing(needle: &str) -> Vec<log::Level> {
        CAPTURED
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, msg)| msg.contains(needle))
            .map(|(level, _)| *level)
            .collect()
    }

    fn read_error() -> TofError {
        TofError::SensorRead {
            label: "Port 0".to_string(),
            reason: "no data after 116 ms".to_string(),
        }
    }

    #[test]
    fn lines_arrive_in_read_order() {
        let log = BusLog::default();
        let opener = FakeOpener::new(&log, vec![vec![Ok(100), Ok(200)], vec![Ok(150), Ok(250)]]);
        let (mut sampler, rx) = sampler(opener, ErrorPolicy::fail_fast());

        sampler.start().unwrap();
        assert_eq!(next_line(&rx), "Port 0: 100 mm, Port 2: 150 mm");
        assert_eq!(next_line(&rx), "Port 0: 200 mm, Port 2: 250 mm");
        sampler.stop().unwrap();

        assert!(!sampler.is_running());
        assert_eq!(log.releases(), 1);
    }

    #[test]
    fn immediate_stop_releases_bus_once() {
        let log = BusLog::default();
        let opener = FakeOpener::new(&log, vec![vec![Ok(1)], vec![Ok(2)]]);
        let opens = Arc::clone(&opener.opens);
        let (mut sampler, _rx) = sampler(opener, ErrorPolicy::fail_fast());

        sampler.start().unwrap();
        sampler.stop().unwrap();

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(log.releases(), 1);
        // Every iteration that began also finished.
        let ops = log.ops();
        assert_eq!(ops.len() % 8, 0);
        assert_eq!(
            ops.iter().filter(|op| matches!(op, BusOp::Start(_))).count(),
            ops.iter().filter(|op| matches!(op, BusOp::Stop(_))).count()
        );
    }

    #[test]
    fn fatal_error_ends_the_run_and_releases_bus() {
        let log = BusLog::default();
        let opener = FakeOpener::new(&log, vec![vec![Ok(10), Err(read_error())], vec![Ok(20)]]);
        let (mut sampler, rx) = sampler(opener, ErrorPolicy::fail_fast());

        sampler.start().unwrap();
        assert_eq!(next_line(&rx), "Port 0: 10 mm, Port 2: 20 mm");
        assert_eq!(sampler.wait(), Err(read_error()));

        assert!(!sampler.is_running());
        assert_eq!(log.releases(), 1);
        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT).unwrap(),
            Event::Stopped(Some(read_error()))
        );

        // Already joined; nothing left to stop.
        assert_eq!(sampler.stop(), Ok(()));
        assert_eq!(log.releases(), 1);
    }

    #[test]
    fn fatal_error_surfaces_through_stop() {
        let log = BusLog::default();
        let opener = FakeOpener::new(&log, vec![vec![Err(read_error())], vec![]]);
        let (mut sampler, rx) = sampler(opener, ErrorPolicy::fail_fast());

        sampler.start().unwrap();
        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT).unwrap(),
            Event::Stopped(Some(read_error()))
        );
        assert_eq!(sampler.stop(), Err(read_error()));
        assert_eq!(log.releases(), 1);
    }

    #[test]
    fn recoverable_error_retries_next_iteration() {
        let log = BusLog::default();
        let opener = FakeOpener::new(&log, vec![vec![Err(read_error()), Ok(7)], vec![Ok(8)]]);
        let (mut sampler, rx) = sampler(opener, ErrorPolicy::log_and_continue());

        sampler.start().unwrap();
        assert_eq!(next_line(&rx), "Port 0: 7 mm, Port 2: 8 mm");
        sampler.stop().unwrap();

        let ops = log.ops();
        let reads: Vec<_> = ops
            .iter()
            .filter(|op| matches!(op, BusOp::Read(_)))
            .take(3)
            .cloned()
            .collect();
        assert_eq!(reads, vec![BusOp::Read(0), BusOp::Read(0), BusOp::Read(1)]);
        assert_eq!(log.releases(), 1);
    }

    #[test]
    fn failure_cap_resets_on_success() {
        let log = BusLog::default();
        let opener = FakeOpener::new(
            &log,
            vec![
                vec![
                    Err(read_error()),
                    Err(read_error()),
                    Ok(3),
                    Err(read_error()),
                    Err(read_error()),
                    Err(read_error()),
                ],
                vec![Ok(4)],
            ],
        );
        let policy = ErrorPolicy {
            max_consecutive_failures: 2,
        };
        let (mut sampler, rx) = sampler(opener, policy);

        sampler.start().unwrap();
        assert_eq!(sampler.wait(), Err(read_error()));

        let events: Vec<Event> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                Event::Line("Port 0: 3 mm, Port 2: 4 mm".to_string()),
                Event::Stopped(Some(read_error())),
            ]
        );
        let sensor0_reads = log
            .ops()
            .iter()
            .filter(|op| **op == BusOp::Read(0))
            .count();
        assert_eq!(sensor0_reads, 6);
    }

    #[test]
    fn stop_while_stopped_is_a_no_op() {
        let log = BusLog::default();
        let opener = FakeOpener::new(&log, vec![]);
        let opens = Arc::clone(&opener.opens);
        let (mut sampler, rx) = sampler(opener, ErrorPolicy::fail_fast());

        assert_eq!(sampler.stop(), Ok(()));
        assert_eq!(sampler.stop(), Ok(()));

        assert_eq!(opens.load(Ordering::SeqCst), 0);
        assert!(log.ops().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn open_failure_leaves_sampler_stopped() {
        let log = BusLog::default();
        let mut opener = FakeOpener::new(&log, vec![]);
        opener.fail_open = true;
        let (mut sampler, _rx) = sampler(opener, ErrorPolicy::fail_fast());

        assert!(matches!(sampler.start(), Err(TofError::BusIo(_))));
        assert!(!sampler.is_running());
        assert_eq!(sampler.stop(), Ok(()));
    }

    #[test]
    fn second_start_does_not_reopen_the_bus() {
        let log = BusLog::default();
        let opener = FakeOpener::new(&log, vec![vec![Ok(1)], vec![Ok(2)]]);
        let opens = Arc::clone(&opener.opens);
        let (mut sampler, rx) = sampler(opener, ErrorPolicy::fail_fast());

        sampler.start().unwrap();
        next_line(&rx);
        sampler.start().unwrap();
        sampler.stop().unwrap();

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(log.releases(), 1);
    }

    #[test]
    fn restart_after_stop_opens_a_fresh_bus() {
        let log = BusLog::default();
        let mut opener = FakeOpener::new(&log, vec![vec![Ok(1)], vec![Ok(2)]]);
        opener.reopen_scripts = Some(vec![vec![Ok(31)], vec![Ok(32)]]);
        let opens = Arc::clone(&opener.opens);
        let (mut sampler, rx) = sampler(opener, ErrorPolicy::fail_fast());

        sampler.start().unwrap();
        assert_eq!(next_line(&rx), "Port 0: 1 mm, Port 2: 2 mm");
        sampler.stop().unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(log.releases(), 1);

        // Whatever the first run left behind ends with its stop notice.
        let leftovers: Vec<Event> = rx.try_iter().collect();
        assert_eq!(leftovers.last(), Some(&Event::Stopped(None)));

        sampler.start().unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(next_line(&rx), "Port 0: 31 mm, Port 2: 32 mm");
        sampler.stop().unwrap();

        assert_eq!(log.releases(), 2);
    }

    #[test]
    fn lines_are_logged_below_info() {
        capture_logs();
        let log = BusLog::default();
        let opener = FakeOpener::new(&log, vec![vec![Ok(4242)], vec![Ok(4343)]]);
        let (mut sampler, rx) = sampler(opener, ErrorPolicy::fail_fast());

        sampler.start().unwrap();
        assert_eq!(next_line(&rx), "Port 0: 4242 mm, Port 2: 4343 mm");
        sampler.stop().unwrap();

        let levels = logged_containing("Port 0: 4242 mm, Port 2: 4343 mm");
        assert!(levels.contains(&log::Level::Debug));
        assert!(levels.iter().all(|level| *level > log::Level::Info));
        assert!(logged_containing("Port 2 (0x29@2): 4343 mm, status 0")
            .contains(&log::Level::Trace));
    }

    #[test]
    fn invalid_topology_fails_before_opening() {
        let log = BusLog::default();
        let opener = FakeOpener::new(&log, vec![]);
        let opens = Arc::clone(&opener.opens);
        let (tx, _rx) = unbounded();
        let topology = Topology {
            multiplexer: Some(0x70),
            slots: vec![SensorSlot::new(0x29, Some(9))],
        };
        let mut sampler = Sampler::new(
            opener,
            topology,
            config(ErrorPolicy::fail_fast()),
            RecordingObserver(tx),
        );

        assert_eq!(sampler.start(), Err(TofError::InvalidChannel(9)));
        assert_eq!(opens.load(Ordering::SeqCst), 0);
        assert!(!sampler.is_running());
    }

    #[test]
    fn dropping_a_running_sampler_stops_it() {
        let log = BusLog::default();
        let opener = FakeOpener::new(&log, vec![vec![Ok(1)], vec![Ok(2)]]);
        let (mut sampler, rx) = sampler(opener, ErrorPolicy::fail_fast());

        sampler.start().unwrap();
        next_line(&rx);
        drop(sampler);

        assert_eq!(log.releases(), 1);
    }
}
