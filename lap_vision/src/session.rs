// THEORY:
// The `session` module is the concurrent runtime around the synchronous pipeline.
// It is what a camera shell talks to: frames are pushed in from the capture
// callback, control calls arrive from the UI, and lap events flow back out.
//
// Key architectural principles:
// 1.  **Latest-only delivery**: The camera never waits on analysis. Frames land in
//     a single-slot mailbox; a frame that is still waiting when the next one
//     arrives is replaced and counted as dropped. At most one frame is ever in
//     flight through the pipeline.
// 2.  **One frame worker**: A single task takes frames from the mailbox and runs
//     the pipeline on the blocking pool, so CPU-heavy analysis never stalls the
//     async executor.
// 3.  **Independent clock**: A ticker task advances the session clock on its own
//     period, decoupled from frame arrival, so the displayed time stays live even
//     when no frames are being analyzed.
// 4.  **Single ownership point**: The lap timer, its clock, the diagnostics log and
//     the frame counters live behind one mutex. The worker and the ticker only
//     touch them under that lock, and the UI reads them through a snapshot.
//     Lock order is always pipeline first, then core.

use crate::core_modules::background_model::{BackgroundModel, GaussianMixtureModel};
use crate::core_modules::frame::RawFrameBuf;
use crate::core_modules::lap_timer::{Crossing, LapRecord, LapTimer, TimerConfig, TimerState};
use crate::core_modules::motion_scorer::{DenseFlowEstimator, MotionEstimator, MotionSample};
use crate::pipeline::{ConfigError, MotionPipeline, PipelineConfig, Report};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

/// Configuration of a complete timing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub pipeline: PipelineConfig,
    pub timer: TimerConfig,
    /// Frame diagnostics kept for the current session; oldest are evicted first.
    pub diagnostics_capacity: usize,
    /// Events buffered per subscriber before slow subscribers start lagging.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            timer: TimerConfig::default(),
            diagnostics_capacity: 4096,
            event_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;
        self.validate_runtime()
    }

    fn validate_runtime(&self) -> Result<(), ConfigError> {
        if self.timer.tick_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "timer.tick_interval",
                expected: "positive",
                value: 0.0,
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::OutOfRange {
                field: "event_capacity",
                expected: "positive",
                value: 0.0,
            });
        }
        Ok(())
    }
}

/// Notifications for the UI shell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionEvent {
    /// An accepted crossing, including the one that starts the session.
    CarDetected {
        magnitude: f64,
        change_ratio: f64,
        elapsed: Duration,
    },
    LapRecorded(LapRecord),
    StateChanged(TimerState),
}

/// Per-frame log entry kept while a session is running.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameDiagnostic {
    /// Index of the lap that was open when the frame was analyzed.
    pub lap_index: usize,
    pub lap_elapsed: Duration,
    pub magnitude: f64,
    pub change_ratio: f64,
    /// Whether the frame produced an accepted crossing.
    pub car_passed: bool,
    pub total_elapsed: Duration,
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: TimerState,
    pub elapsed: Duration,
    pub current_lap_elapsed: Duration,
    pub laps: Vec<LapRecord>,
    pub average_lap: Duration,
    pub fastest_lap: Duration,
    pub last_magnitude: f64,
    pub last_change_ratio: f64,
    pub target_lap_count: u32,
    pub frames_handled: u64,
    pub frames_dropped: u64,
    pub frames_rejected: u64,
}

/// What happened to a pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDelivery {
    /// Waiting for the worker.
    Queued,
    /// Waiting for the worker; an older undelivered frame was discarded.
    Replaced,
    /// The session is not armed; the frame was discarded.
    Ignored,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Timing state guarded as one unit.
struct Core {
    timer: LapTimer,
    diagnostics: VecDeque<FrameDiagnostic>,
    diagnostics_capacity: usize,
    last_sample: Option<MotionSample>,
    frames_handled: u64,
    frames_dropped: u64,
    frames_rejected: u64,
}

impl Core {
    fn new(config: &SessionConfig) -> Self {
        Self {
            timer: LapTimer::new(config.timer.clone()),
            diagnostics: VecDeque::new(),
            diagnostics_capacity: config.diagnostics_capacity,
            last_sample: None,
            frames_handled: 0,
            frames_dropped: 0,
            frames_rejected: 0,
        }
    }

    fn clear_session_data(&mut self) {
        self.diagnostics.clear();
        self.last_sample = None;
    }

    /// Feeds one pipeline report into the timer and the diagnostics log.
    fn record(
        &mut self,
        report: &Report,
        captured_at: Instant,
        events: &broadcast::Sender<SessionEvent>,
    ) {
        self.frames_handled += 1;
        let Some(sample) = report.sample().copied() else {
            return;
        };
        self.last_sample = Some(sample);

        let before = self.timer.state();
        // The lap this frame falls in, read before a crossing can close it.
        let open_lap = (self.timer.lap_count(), self.timer.lap_elapsed_at(captured_at));
        let crossing = match report.event() {
            Some(event) => self.timer.on_detection(event, captured_at),
            None => Crossing::NotArmed,
        };
        self.timer.tick(captured_at);

        if crossing.is_accepted() {
            let _ = events.send(SessionEvent::CarDetected {
                magnitude: sample.magnitude,
                change_ratio: sample.change_ratio,
                elapsed: self.timer.elapsed(),
            });
        }
        match crossing {
            Crossing::SessionStarted => {
                let _ = events.send(SessionEvent::StateChanged(TimerState::Running));
            }
            Crossing::Lap { record, finished } => {
                let _ = events.send(SessionEvent::LapRecorded(record));
                if finished {
                    let _ = events.send(SessionEvent::StateChanged(TimerState::Stopping));
                    let _ = events.send(SessionEvent::StateChanged(TimerState::Stopped));
                }
            }
            Crossing::Debounced { .. } | Crossing::NotArmed => {}
        }

        if before == TimerState::Running || self.timer.state() == TimerState::Running {
            self.log_diagnostic(sample, crossing.is_accepted(), open_lap);
        }
    }

    fn log_diagnostic(
        &mut self,
        sample: MotionSample,
        car_passed: bool,
        (lap_index, lap_elapsed): (usize, Duration),
    ) {
        if self.diagnostics_capacity == 0 {
            return;
        }
        if self.diagnostics.len() == self.diagnostics_capacity {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(FrameDiagnostic {
            lap_index,
            lap_elapsed,
            magnitude: sample.magnitude,
            change_ratio: sample.change_ratio,
            car_passed,
            total_elapsed: self.timer.elapsed(),
        });
    }

    fn snapshot(&self) -> SessionSnapshot {
        let timer = &self.timer;
        SessionSnapshot {
            state: timer.state(),
            elapsed: timer.elapsed(),
            current_lap_elapsed: timer.current_lap_elapsed(),
            laps: timer.laps().to_vec(),
            average_lap: timer.average_lap(),
            fastest_lap: timer.fastest_lap(),
            last_magnitude: self.last_sample.map_or(0.0, |s| s.magnitude),
            last_change_ratio: self.last_sample.map_or(0.0, |s| s.change_ratio),
            target_lap_count: timer.config().target_lap_count,
            frames_handled: self.frames_handled,
            frames_dropped: self.frames_dropped,
            frames_rejected: self.frames_rejected,
        }
    }
}

struct Shared<B, E> {
    pipeline: Mutex<MotionPipeline<B, E>>,
    core: Mutex<Core>,
    slot: Mutex<Option<RawFrameBuf>>,
    frame_ready: Notify,
    events: broadcast::Sender<SessionEvent>,
}

impl<B: BackgroundModel, E: MotionEstimator> Shared<B, E> {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Runs one frame through the pipeline and the timer. Blocking.
    fn handle_frame(&self, frame: RawFrameBuf) {
        let mut pipeline = lock(&self.pipeline);
        if !lock(&self.core).timer.state().is_armed() {
            lock(&self.core).frames_dropped += 1;
            return;
        }

        let result = pipeline.process(&frame.as_raw());
        let mut core = lock(&self.core);
        match result {
            Ok(report) => core.record(&report, frame.captured_at, &self.events),
            // Already logged by the pipeline.
            Err(_) => core.frames_rejected += 1,
        }
    }
}

/// A running lap-timing session.
///
/// Must be created inside a tokio runtime; the frame worker is spawned on
/// construction and the clock ticker on `start`.
pub struct LapSession<B = GaussianMixtureModel, E = DenseFlowEstimator> {
    shared: Arc<Shared<B, E>>,
    worker: JoinHandle<()>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    tick_interval: Duration,
}

impl LapSession {
    /// A session with the default background model and dense flow estimator.
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let pipeline = MotionPipeline::new(config.pipeline.clone())?;
        Self::with_pipeline(pipeline, config)
    }
}

impl<B, E> LapSession<B, E>
where
    B: BackgroundModel + 'static,
    E: MotionEstimator + 'static,
{
    /// A session around an assembled pipeline. The `pipeline` section of
    /// `config` is not used.
    pub fn with_pipeline(
        pipeline: MotionPipeline<B, E>,
        config: SessionConfig,
    ) -> Result<Self, ConfigError> {
        config.validate_runtime()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        let shared = Arc::new(Shared {
            pipeline: Mutex::new(pipeline),
            core: Mutex::new(Core::new(&config)),
            slot: Mutex::new(None),
            frame_ready: Notify::new(),
            events,
        });
        let worker = tokio::spawn(Self::run_worker(Arc::clone(&shared)));
        Ok(Self {
            shared,
            worker,
            ticker: Mutex::new(None),
            tick_interval: config.timer.tick_interval,
        })
    }

    async fn run_worker(shared: Arc<Shared<B, E>>) {
        loop {
            shared.frame_ready.notified().await;
            let Some(frame) = lock(&shared.slot).take() else {
                continue;
            };
            let job = Arc::clone(&shared);
            if let Err(err) = tokio::task::spawn_blocking(move || job.handle_frame(frame)).await {
                error!(error = %err, "frame analysis task failed");
            }
        }
    }

    async fn run_ticker(shared: Arc<Shared<B, E>>, period: Duration) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if !lock(&shared.core).timer.tick(Instant::now()) {
                debug!("session no longer armed, ticker exiting");
                break;
            }
        }
    }

    async fn stop_ticker(&self) {
        let handle = lock(&self.ticker).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Hands a frame to the worker, replacing any frame still waiting.
    pub fn push_frame(&self, frame: RawFrameBuf) -> FrameDelivery {
        if !lock(&self.shared.core).timer.state().is_armed() {
            lock(&self.shared.core).frames_dropped += 1;
            return FrameDelivery::Ignored;
        }
        let replaced = lock(&self.shared.slot).replace(frame).is_some();
        if replaced {
            lock(&self.shared.core).frames_dropped += 1;
        }
        self.shared.frame_ready.notify_one();
        if replaced {
            FrameDelivery::Replaced
        } else {
            FrameDelivery::Queued
        }
    }

    /// Arms a fresh session from any state. Laps, the clock and the background
    /// model all start over.
    pub async fn start(&self) {
        self.stop_ticker().await;
        {
            let mut pipeline = lock(&self.shared.pipeline);
            pipeline.reset();
            let mut core = lock(&self.shared.core);
            core.clear_session_data();
            core.timer.start();
        }
        *lock(&self.shared.slot) = None;
        self.shared.emit(SessionEvent::StateChanged(TimerState::AwaitingFirstCross));
        info!("session armed, waiting for the first crossing");

        let ticker = tokio::spawn(Self::run_ticker(Arc::clone(&self.shared), self.tick_interval));
        *lock(&self.ticker) = Some(ticker);
    }

    /// Stops an armed session. A no-op otherwise.
    pub async fn stop(&self) {
        let stopping = lock(&self.shared.core).timer.begin_stop(Instant::now());
        if stopping {
            self.shared.emit(SessionEvent::StateChanged(TimerState::Stopping));
        }
        self.stop_ticker().await;
        if stopping {
            let mut core = lock(&self.shared.core);
            core.timer.finish_stop();
            info!(
                laps = core.timer.lap_count(),
                elapsed = ?core.timer.elapsed(),
                "session stopped"
            );
            drop(core);
            self.shared.emit(SessionEvent::StateChanged(TimerState::Stopped));
        }
    }

    /// Back to `Idle`: clears laps, the clock, the background model, the
    /// diagnostics and the frame counters.
    pub async fn reset(&self) {
        self.stop_ticker().await;
        let changed = {
            let mut pipeline = lock(&self.shared.pipeline);
            pipeline.reset();
            let mut core = lock(&self.shared.core);
            let changed = core.timer.state() != TimerState::Idle;
            core.timer.reset();
            core.clear_session_data();
            core.frames_handled = 0;
            core.frames_dropped = 0;
            core.frames_rejected = 0;
            changed
        };
        *lock(&self.shared.slot) = None;
        if changed {
            self.shared.emit(SessionEvent::StateChanged(TimerState::Idle));
        }
    }

    pub fn set_threshold(&self, threshold: f64) -> bool {
        lock(&self.shared.pipeline).set_threshold(threshold)
    }

    pub fn set_target_lap_count(&self, target: u32) {
        lock(&self.shared.core).timer.set_target_lap_count(target);
    }

    pub fn set_min_lap_interval(&self, interval: Duration) {
        lock(&self.shared.core).timer.set_min_lap_interval(interval);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        lock(&self.shared.core).snapshot()
    }

    /// Frame diagnostics of the current session, oldest first.
    pub fn diagnostics(&self) -> Vec<FrameDiagnostic> {
        lock(&self.shared.core).diagnostics.iter().copied().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Stops the session and waits for the background tasks to finish.
    pub async fn shutdown(mut self) {
        self.stop().await;
        self.worker.abort();
        let _ = (&mut self.worker).await;
    }
}

impl<B, E> Drop for LapSession<B, E> {
    fn drop(&mut self) {
        self.worker.abort();
        if let Some(ticker) = lock(&self.ticker).take() {
            ticker.abort();
        }
    }
}
