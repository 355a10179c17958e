//! Control session lifecycle and the read/decode/apply loop
//!
//! A session binds one serial link to one audio endpoint and runs the
//! control loop on a blocking task until cancelled or the link fails
//! fatally. Phases: Starting -> Running -> (Draining) -> Stopped, with
//! terminal Failed.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::debounce::{DebounceFilter, DEFAULT_EPSILON};
use super::state::{ControlState, PhaseCell, SessionPhase};
use crate::audio::{EndpointCatalog, VolumeSink};
use crate::error::{AppError, Result};
use crate::serial::{decode_sample, SampleSource, SerialConfig, SerialLink};
use crate::utils::LogThrottle;

/// Throttle interval for repeated read-failure logs
const LOG_THROTTLE_SECS: u64 = 5;

/// Throttle key for transient read failures
const READ_FAILURE_KEY: &str = "serial_read";

/// Control loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Maximum raw value the sensor reports (1023 for a 10-bit ADC)
    pub sensor_max: u32,
    /// Debounce threshold on the normalized level
    pub epsilon: f64,
    /// Fixed inter-iteration delay in milliseconds
    pub pace_ms: u64,
    /// Consecutive read failures tolerated before the session fails
    pub max_read_failures: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            sensor_max: 1023,
            epsilon: DEFAULT_EPSILON,
            pace_ms: 100,
            max_read_failures: 10,
        }
    }
}

/// The read -> decode -> filter -> apply loop over one source and one sink.
///
/// Generic over the sample source so it can be exercised with scripted
/// sources; the production source is [`SerialLink`].
pub struct ControlLoop<S: SampleSource> {
    source: S,
    sink: Box<dyn VolumeSink>,
    config: ControlConfig,
    filter: DebounceFilter,
    state: ControlState,
    phase: PhaseCell,
    throttle: LogThrottle,
}

impl<S: SampleSource> ControlLoop<S> {
    pub fn new(source: S, sink: Box<dyn VolumeSink>, config: ControlConfig, phase: PhaseCell) -> Self {
        let filter = DebounceFilter::new(config.epsilon);
        Self {
            source,
            sink,
            config,
            filter,
            state: ControlState::new(),
            phase,
            throttle: LogThrottle::new(Duration::from_secs(LOG_THROTTLE_SECS)),
        }
    }

    /// Drive the loop until cancellation or a fatal link failure.
    ///
    /// Cancellation is cooperative: the token is checked at the top of each
    /// iteration, so latency is bounded by one read timeout plus the pacing
    /// delay. Set calls are issued strictly in sample order; the debounce
    /// filter suppresses, never reorders.
    pub fn run(mut self, cancel: &CancellationToken) -> Result<()> {
        let pace = Duration::from_millis(self.config.pace_ms);
        let mut consecutive_failures = 0u32;

        self.phase.set(SessionPhase::Running);
        debug!("Control loop running");

        loop {
            if cancel.is_cancelled() {
                info!("Cancellation received, draining control loop");
                self.phase.set(SessionPhase::Draining);
                break;
            }

            match self.source.read_sample() {
                Ok(sample) => {
                    consecutive_failures = 0;
                    self.throttle.reset(READ_FAILURE_KEY);

                    let level = decode_sample(&sample, self.config.sensor_max);
                    if self.filter.should_apply(level, self.state.last_applied()) {
                        match self.sink.set_scalar(level) {
                            Ok(()) => {
                                self.state.mark_applied(level);
                                debug!("Volume applied: {:.4}", level);
                            }
                            Err(e) => {
                                // State stays untouched so the next differing
                                // sample retries the write
                                warn!("Volume apply failed: {}", e);
                            }
                        }
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures > self.config.max_read_failures {
                        let err = AppError::ReadThresholdExceeded {
                            attempts: consecutive_failures,
                            limit: self.config.max_read_failures,
                        };
                        error!("{}", err);
                        self.phase.set(SessionPhase::Failed);
                        return Err(err);
                    }
                    if self.throttle.allow(READ_FAILURE_KEY) {
                        warn!(
                            "Serial read failed ({}/{}): {}",
                            consecutive_failures, self.config.max_read_failures, e
                        );
                    }
                }
            }

            if !pace.is_zero() {
                thread::sleep(pace);
            }
        }

        self.phase.set(SessionPhase::Stopped);
        info!("Control loop stopped");
        Ok(())
    }
}

/// Resolve the endpoint, open the serial link, and run the control loop.
///
/// The endpoint index is validated and activated before the serial device is
/// touched; an invalid selection never opens the link.
pub fn run_session(
    catalog: &dyn EndpointCatalog,
    selection: usize,
    serial: &SerialConfig,
    control: ControlConfig,
    phase: PhaseCell,
    cancel: &CancellationToken,
) -> Result<()> {
    let count = catalog.list().len();
    if selection >= count {
        let err = AppError::InvalidSelection {
            index: selection,
            count,
        };
        error!("{}", err);
        phase.set(SessionPhase::Failed);
        return Err(err);
    }

    let sink = match catalog.activate(selection) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Failed to activate endpoint {}: {}", selection, e);
            phase.set(SessionPhase::Failed);
            return Err(e);
        }
    };

    match sink.get_scalar() {
        Ok(level) => info!("Current volume for {}: {:.1}%", sink.name(), level * 100.0),
        Err(e) => warn!("Failed to read current volume: {}", e),
    }

    let link = match SerialLink::open(serial) {
        Ok(link) => link,
        Err(e) => {
            error!("{}", e);
            phase.set(SessionPhase::Failed);
            return Err(e);
        }
    };
    info!(
        "Serial link opened: {} @ {} baud, driving {}",
        serial.device,
        serial.baud_rate,
        sink.name()
    );

    ControlLoop::new(link, sink, control, phase).run(cancel)
}

/// A control session running on a dedicated blocking task.
///
/// The host stays responsive and cancels cooperatively through the token
/// passed at start; the serial device and the endpoint handle are owned by
/// the task and released when the loop exits, on every path.
pub struct ControlSession {
    phase: PhaseCell,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl ControlSession {
    /// Spawn the session task. Endpoint resolution and serial open happen on
    /// the task, so startup failures surface through [`ControlSession::join`].
    pub fn start(
        catalog: Box<dyn EndpointCatalog + Send>,
        selection: usize,
        serial: SerialConfig,
        control: ControlConfig,
        cancel: CancellationToken,
    ) -> Self {
        let phase = PhaseCell::new();
        let task_phase = phase.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::task::spawn_blocking(move || {
            run_session(
                catalog.as_ref(),
                selection,
                &serial,
                control,
                task_phase,
                &task_cancel,
            )
        });

        Self {
            phase,
            cancel,
            handle,
        }
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> SessionPhase {
        self.phase.get()
    }

    /// Request cooperative shutdown
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session to finish and surface its terminal result.
    pub async fn join(self) -> Result<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(AppError::Internal(format!("control task failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::EndpointInfo;
    use crate::serial::RawSample;

    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    enum Event {
        Sample(&'static [u8]),
        Fail,
    }

    /// Scripted sample source; cancels the loop when the script runs out.
    struct ScriptSource {
        events: VecDeque<Event>,
        cancel: CancellationToken,
        drops: Arc<AtomicUsize>,
    }

    impl ScriptSource {
        fn new(events: Vec<Event>, cancel: CancellationToken) -> (Self, Arc<AtomicUsize>) {
            let drops = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    events: events.into(),
                    cancel,
                    drops: drops.clone(),
                },
                drops,
            )
        }
    }

    impl SampleSource for ScriptSource {
        fn read_sample(&mut self) -> Result<RawSample> {
            match self.events.pop_front() {
                Some(Event::Sample(bytes)) => Ok(RawSample::from_bytes(bytes)),
                Some(Event::Fail) => Err(AppError::Read("scripted failure".to_string())),
                None => {
                    self.cancel.cancel();
                    Err(AppError::Read("script exhausted".to_string()))
                }
            }
        }
    }

    impl Drop for ScriptSource {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Sink recording every successful apply
    #[derive(Clone, Default)]
    struct RecordingSink {
        calls: Arc<Mutex<Vec<f64>>>,
        fail_next: Arc<AtomicBool>,
    }

    impl VolumeSink for RecordingSink {
        fn name(&self) -> &str {
            "test endpoint"
        }

        fn get_scalar(&self) -> Result<f64> {
            Ok(self.calls.lock().last().copied().unwrap_or(0.0))
        }

        fn set_scalar(&mut self, level: f64) -> Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(AppError::Endpoint {
                    endpoint: "test endpoint".to_string(),
                    reason: "busy".to_string(),
                });
            }
            self.calls.lock().push(level);
            Ok(())
        }
    }

    fn test_config() -> ControlConfig {
        ControlConfig {
            pace_ms: 0,
            ..Default::default()
        }
    }

    fn run_scripted(
        events: Vec<Event>,
        config: ControlConfig,
        sink: RecordingSink,
    ) -> (Result<()>, SessionPhase, Arc<AtomicUsize>) {
        let cancel = CancellationToken::new();
        let (source, drops) = ScriptSource::new(events, cancel.clone());
        let phase = PhaseCell::new();
        let result = ControlLoop::new(source, Box::new(sink), config, phase.clone()).run(&cancel);
        (result, phase.get(), drops)
    }

    #[test]
    fn test_first_sample_applies_once() {
        let sink = RecordingSink::default();
        let (result, phase, _) = run_scripted(
            vec![Event::Sample(b"512\r\n")],
            test_config(),
            sink.clone(),
        );

        assert!(result.is_ok());
        assert_eq!(phase, SessionPhase::Stopped);

        let calls = sink.calls.lock();
        assert_eq!(calls.len(), 1);
        assert!((calls[0] - 512.0 / 1023.0).abs() < 1e-9);
    }

    #[test]
    fn test_jitter_below_threshold_is_suppressed() {
        let sink = RecordingSink::default();
        let (result, _, _) = run_scripted(
            vec![
                Event::Sample(b"512\r\n"),
                Event::Sample(b"513\r\n"),
                Event::Sample(b"512\r\n"),
            ],
            test_config(),
            sink.clone(),
        );

        assert!(result.is_ok());
        // Adjacent ADC steps move the level by ~0.00098, under the threshold
        assert_eq!(sink.calls.lock().len(), 1);
    }

    #[test]
    fn test_same_level_applies_exactly_once() {
        let sink = RecordingSink::default();
        let (result, _, _) = run_scripted(
            vec![Event::Sample(b"512"), Event::Sample(b"512")],
            test_config(),
            sink.clone(),
        );

        assert!(result.is_ok());
        assert_eq!(sink.calls.lock().len(), 1);
    }

    #[test]
    fn test_large_swings_all_apply() {
        let sink = RecordingSink::default();
        let (result, _, _) = run_scripted(
            vec![
                Event::Sample(b"0"),
                Event::Sample(b"1023"),
                Event::Sample(b"0"),
            ],
            test_config(),
            sink.clone(),
        );

        assert!(result.is_ok());
        assert_eq!(*sink.calls.lock(), vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_read_failures_past_threshold_fail_the_session() {
        let sink = RecordingSink::default();
        let events: Vec<Event> = (0..11).map(|_| Event::Fail).collect();
        let (result, phase, drops) = run_scripted(events, test_config(), sink.clone());

        match result {
            Err(AppError::ReadThresholdExceeded { attempts, limit }) => {
                assert_eq!(attempts, 11);
                assert_eq!(limit, 10);
            }
            other => panic!("expected ReadThresholdExceeded, got {:?}", other),
        }
        assert_eq!(phase, SessionPhase::Failed);
        assert!(sink.calls.lock().is_empty());
        // The link is released exactly once, with the loop
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_counter_resets_on_successful_read() {
        let sink = RecordingSink::default();
        let mut events: Vec<Event> = (0..5).map(|_| Event::Fail).collect();
        events.push(Event::Sample(b"512"));
        events.extend((0..6).map(|_| Event::Fail));
        let (result, phase, _) = run_scripted(events, test_config(), sink.clone());

        // 5 + 6 failures with a success in between never exceed the limit
        assert!(result.is_ok());
        assert_eq!(phase, SessionPhase::Stopped);
        assert_eq!(sink.calls.lock().len(), 1);
    }

    #[test]
    fn test_apply_failure_retries_on_next_sample() {
        let sink = RecordingSink::default();
        sink.fail_next.store(true, Ordering::SeqCst);
        let (result, _, _) = run_scripted(
            vec![Event::Sample(b"512"), Event::Sample(b"512")],
            test_config(),
            sink.clone(),
        );

        assert!(result.is_ok());
        // First apply failed and left no state, so the identical second
        // sample still applies
        let calls = sink.calls.lock();
        assert_eq!(calls.len(), 1);
        assert!((calls[0] - 512.0 / 1023.0).abs() < 1e-9);
    }

    #[test]
    fn test_cancelled_loop_stops_without_reading() {
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (source, drops) = ScriptSource::new(vec![Event::Sample(b"512")], cancel.clone());
        let phase = PhaseCell::new();
        let result =
            ControlLoop::new(source, Box::new(sink.clone()), test_config(), phase.clone())
                .run(&cancel);

        assert!(result.is_ok());
        assert_eq!(phase.get(), SessionPhase::Stopped);
        assert!(sink.calls.lock().is_empty());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    struct StubCatalog {
        infos: Vec<EndpointInfo>,
        sink: RecordingSink,
        fail_activation: bool,
    }

    impl StubCatalog {
        fn new(count: usize) -> Self {
            let infos = (0..count)
                .map(|i| EndpointInfo {
                    name: format!("Master {}", i),
                    description: format!("Test Card - Master {}", i),
                    card_index: i as i32,
                    selem_index: 0,
                })
                .collect();
            Self {
                infos,
                sink: RecordingSink::default(),
                fail_activation: false,
            }
        }
    }

    impl EndpointCatalog for StubCatalog {
        fn list(&self) -> &[EndpointInfo] {
            &self.infos
        }

        fn activate(&self, index: usize) -> Result<Box<dyn VolumeSink>> {
            if self.fail_activation {
                return Err(AppError::Endpoint {
                    endpoint: self.infos[index].description.clone(),
                    reason: "activation refused".to_string(),
                });
            }
            Ok(Box::new(self.sink.clone()))
        }
    }

    fn missing_serial_config() -> SerialConfig {
        SerialConfig {
            device: "/dev/volknob-test-does-not-exist".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_selection_fails_before_serial_open() {
        let catalog = StubCatalog::new(2);
        let phase = PhaseCell::new();
        let result = run_session(
            &catalog,
            5,
            &missing_serial_config(),
            test_config(),
            phase.clone(),
            &CancellationToken::new(),
        );

        // The selection is rejected before the serial device is touched,
        // so the error is a selection error rather than a connection error
        match result {
            Err(AppError::InvalidSelection { index, count }) => {
                assert_eq!(index, 5);
                assert_eq!(count, 2);
            }
            other => panic!("expected InvalidSelection, got {:?}", other),
        }
        assert_eq!(phase.get(), SessionPhase::Failed);
    }

    #[test]
    fn test_activation_failure_fails_the_session() {
        let mut catalog = StubCatalog::new(1);
        catalog.fail_activation = true;
        let phase = PhaseCell::new();
        let result = run_session(
            &catalog,
            0,
            &missing_serial_config(),
            test_config(),
            phase.clone(),
            &CancellationToken::new(),
        );

        assert!(matches!(result, Err(AppError::Endpoint { .. })));
        assert_eq!(phase.get(), SessionPhase::Failed);
    }

    #[test]
    fn test_serial_open_failure_follows_activation() {
        let catalog = StubCatalog::new(1);
        let phase = PhaseCell::new();
        let result = run_session(
            &catalog,
            0,
            &missing_serial_config(),
            test_config(),
            phase.clone(),
            &CancellationToken::new(),
        );

        match result {
            Err(ref e @ AppError::Connection { .. }) => assert_eq!(e.exit_code(), 2),
            other => panic!("expected Connection, got {:?}", other),
        }
        assert_eq!(phase.get(), SessionPhase::Failed);
    }

    #[tokio::test]
    async fn test_session_task_surfaces_terminal_error() {
        let session = ControlSession::start(
            Box::new(StubCatalog::new(1)),
            0,
            missing_serial_config(),
            test_config(),
            CancellationToken::new(),
        );
        session.cancel();

        // The open failure beats the cancellation; the phase settles on Failed
        for _ in 0..100 {
            if session.phase() == SessionPhase::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.phase(), SessionPhase::Failed);

        let result = session.join().await;
        assert!(matches!(result, Err(AppError::Connection { .. })));
    }
}
