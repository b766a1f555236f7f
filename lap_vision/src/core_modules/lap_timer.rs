// THEORY:
// The `lap_timer` module is the session's state machine. It is the only place that
// decides what a detection *means*: the start of the session, a completed lap, or
// a duplicate trigger of a crossing that was already counted.
//
// Key architectural principles:
// 1.  **Explicit states**: `Idle -> AwaitingFirstCross -> Running -> Stopping ->
//     Stopped`. Every transition is a method; calls that make no sense in the
//     current state are quiet no-ops rather than errors.
// 2.  **Lap boundaries, not timestamps**: The first crossing only starts the clock.
//     Every later accepted crossing closes the open lap at the current elapsed time
//     and opens the next one there.
// 3.  **Debounce**: One physical pass spans several frames. Crossings closer than
//     `min_lap_interval` to the last accepted boundary are reported as debounced.
// 4.  **Injected time**: All methods take the `Instant` to treat as "now". The
//     runtime passes real capture times; tests pass synthetic ones.

use crate::core_modules::detection_gate::DetectionEvent;
use crate::core_modules::session_clock::SessionClock;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Lifecycle of a timing session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerState {
    #[default]
    Idle,
    AwaitingFirstCross,
    Running,
    Stopping,
    Stopped,
}

impl TimerState {
    /// Whether detections are consumed in this state.
    pub fn is_armed(self) -> bool {
        matches!(self, TimerState::AwaitingFirstCross | TimerState::Running)
    }
}

/// Lap timing rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Shortest accepted lap. Expressed in seconds in serialized form.
    #[serde(with = "seconds")]
    pub min_lap_interval: Duration,
    /// Laps after which the session stops on its own; `0` for no limit.
    pub target_lap_count: u32,
    /// Period of the clock ticker.
    #[serde(with = "seconds")]
    pub tick_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            min_lap_interval: Duration::from_millis(800),
            target_lap_count: 0,
            tick_interval: Duration::from_millis(10),
        }
    }
}

/// One completed lap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LapRecord {
    /// Zero-based, assigned in crossing order.
    pub index: usize,
    #[serde(with = "seconds")]
    pub duration: Duration,
    /// Motion magnitude of the crossing that closed the lap.
    pub magnitude: f64,
    pub change_ratio: f64,
}

/// What a detection did to the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Crossing {
    /// The timer was not waiting for crossings.
    NotArmed,
    /// First crossing: the clock started, no lap was recorded.
    SessionStarted,
    /// Too soon after the last accepted crossing.
    Debounced { since_last: Duration },
    /// A lap was recorded; `finished` is set when it reached the target.
    Lap { record: LapRecord, finished: bool },
}

impl Crossing {
    /// Whether the crossing was accepted (started the session or closed a lap).
    pub fn is_accepted(&self) -> bool {
        matches!(self, Crossing::SessionStarted | Crossing::Lap { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LapTimer {
    config: TimerConfig,
    state: TimerState,
    clock: SessionClock,
    laps: Vec<LapRecord>,
    /// Elapsed time at which the open lap began.
    lap_started_at: Duration,
}

impl LapTimer {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    /// Arms a fresh session from any state, discarding previous laps.
    pub fn start(&mut self) {
        self.clear();
        self.transition(TimerState::AwaitingFirstCross);
    }

    /// Back to `Idle` with everything cleared.
    pub fn reset(&mut self) {
        self.clear();
        self.transition(TimerState::Idle);
    }

    fn clear(&mut self) {
        self.clock.reset();
        self.laps.clear();
        self.lap_started_at = Duration::ZERO;
    }

    fn transition(&mut self, next: TimerState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "timer state change");
            self.state = next;
        }
    }

    /// Feeds one detection observed at `now`.
    pub fn on_detection(&mut self, event: &DetectionEvent, now: Instant) -> Crossing {
        match self.state {
            TimerState::AwaitingFirstCross => {
                self.clock.start(now);
                self.lap_started_at = Duration::ZERO;
                self.transition(TimerState::Running);
                info!(magnitude = event.magnitude, "first crossing, session started");
                Crossing::SessionStarted
            }
            TimerState::Running => {
                // Lap boundaries sit at the crossing's own instant, not at the
                // latest tick.
                let at = self.clock.offset(now);
                self.clock.tick(now);
                let since_last = at.saturating_sub(self.lap_started_at);
                if since_last < self.config.min_lap_interval {
                    debug!(?since_last, "crossing debounced");
                    return Crossing::Debounced { since_last };
                }
                let record = LapRecord {
                    index: self.laps.len(),
                    duration: since_last,
                    magnitude: event.magnitude,
                    change_ratio: event.change_ratio,
                };
                self.laps.push(record);
                self.lap_started_at = at;
                info!(
                    lap = record.index,
                    duration = ?record.duration,
                    magnitude = record.magnitude,
                    "lap recorded"
                );

                let target = self.config.target_lap_count;
                let finished = target > 0 && self.laps.len() >= target as usize;
                if finished {
                    info!(target, "target lap count reached");
                    self.stop(now);
                }
                Crossing::Lap { record, finished }
            }
            TimerState::Idle | TimerState::Stopping | TimerState::Stopped => Crossing::NotArmed,
        }
    }

    /// Advances the clock. Returns `false` once ticking is no longer needed.
    pub fn tick(&mut self, now: Instant) -> bool {
        self.clock.tick(now);
        self.state.is_armed()
    }

    /// First half of a stop: halts the clock and enters `Stopping`.
    /// Returns `false` (no-op) unless a session is armed.
    pub fn begin_stop(&mut self, now: Instant) -> bool {
        if !self.state.is_armed() {
            return false;
        }
        self.clock.halt(now);
        self.transition(TimerState::Stopping);
        true
    }

    /// Second half of a stop: `Stopping -> Stopped`.
    pub fn finish_stop(&mut self) {
        if self.state == TimerState::Stopping {
            self.transition(TimerState::Stopped);
        }
    }

    /// Stops an armed session. A no-op in any other state.
    pub fn stop(&mut self, now: Instant) -> bool {
        let stopping = self.begin_stop(now);
        self.finish_stop();
        stopping
    }

    pub fn set_min_lap_interval(&mut self, interval: Duration) {
        self.config.min_lap_interval = interval;
    }

    /// Takes effect for the next recorded lap.
    pub fn set_target_lap_count(&mut self, target: u32) {
        self.config.target_lap_count = target;
    }

    /// Total elapsed session time.
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    /// Time spent in the open lap.
    pub fn current_lap_elapsed(&self) -> Duration {
        self.clock.elapsed().saturating_sub(self.lap_started_at)
    }

    /// Time spent in the open lap as of `now`, ignoring later ticks.
    pub fn lap_elapsed_at(&self, now: Instant) -> Duration {
        self.clock.offset(now).saturating_sub(self.lap_started_at)
    }

    pub fn laps(&self) -> &[LapRecord] {
        &self.laps
    }

    pub fn lap_count(&self) -> usize {
        self.laps.len()
    }

    /// Mean lap duration; zero without laps.
    pub fn average_lap(&self) -> Duration {
        if self.laps.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.laps.iter().map(|lap| lap.duration).sum();
        total / self.laps.len() as u32
    }

    /// Shortest lap duration; zero without laps.
    pub fn fastest_lap(&self) -> Duration {
        self.laps
            .iter()
            .map(|lap| lap.duration)
            .min()
            .unwrap_or(Duration::ZERO)
    }
}

/// Serde adapter for durations written as fractional seconds.
mod seconds {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
