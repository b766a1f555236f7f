// THEORY:
// The `motion_scorer` module turns two consecutive foreground extractions into a
// single number: how much did the foreground move? It is the bridge between the
// per-pixel world of the background model and the per-frame world of the gate.
//
// Key architectural principles:
// 1.  **Estimator seam**: The "how" of measuring motion lives behind the
//     `MotionEstimator` trait. The default estimator runs dense optical flow over
//     the masked intensity images and reports the length of the mean displacement
//     vector. A cheaper frame-difference estimator exists for low-power targets.
// 2.  **Reliability policy**: The "when" is owned by `MotionScorer`. Samples taken
//     while the background model is still settling (warm-up) or while most of the
//     frame is changing at once (camera shake) are marked unreliable. The estimator
//     is not even run for them, but the frame still counts towards warm-up.
// 3.  **Resync on geometry change**: If consecutive masks disagree in size, the
//     scorer reports `InsufficientData` and restarts its warm-up; the next frame
//     becomes the new baseline.

use crate::core_modules::background_model::ForegroundMask;
use crate::core_modules::optical_flow::{DenseFlow, FlowConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Reliability policy of the scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Frames after a reset during which samples are not trusted.
    pub warmup_frames: u32,
    /// Change ratio above which a frame is attributed to camera shake.
    pub shake_ratio: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            warmup_frames: 30,
            shake_ratio: 0.2,
        }
    }
}

/// Why a sample must not trigger a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    WarmingUp,
    CameraShake,
}

/// Motion measurement of one analyzed frame pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    /// Motion score; `0` for unreliable samples.
    pub magnitude: f64,
    /// Fraction of the current frame flagged as foreground.
    pub change_ratio: f64,
    pub reliability: Reliability,
}

impl MotionSample {
    pub fn is_reliable(&self) -> bool {
        self.reliability == Reliability::Reliable
    }
}

impl fmt::Display for MotionSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "speed:{:.2} diff:{:.2}", self.magnitude, self.change_ratio)
    }
}

/// Why no sample could be produced for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsufficientData {
    /// First frame since reset; there is nothing to compare against.
    NoBaseline,
    /// The working resolution changed between frames.
    DimensionMismatch {
        previous: (u32, u32),
        current: (u32, u32),
    },
}

/// Result of scoring one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreOutcome {
    Sample(MotionSample),
    InsufficientData(InsufficientData),
}

/// Measures motion between two foreground extractions of equal size.
pub trait MotionEstimator: Send {
    fn estimate(&mut self, prev: &ForegroundMask, curr: &ForegroundMask) -> f64;
}

/// Mean-vector magnitude of the dense optical flow between masked intensities.
///
/// The magnitude only grows with the displacement while the displacement stays
/// within reach of the pyramid. Working images whose shorter side is under
/// 64 px get no coarse level, so large jumps there score low.
#[derive(Debug, Clone, Default)]
pub struct DenseFlowEstimator {
    flow: DenseFlow,
}

impl DenseFlowEstimator {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            flow: DenseFlow::new(config),
        }
    }
}

impl MotionEstimator for DenseFlowEstimator {
    fn estimate(&mut self, prev: &ForegroundMask, curr: &ForegroundMask) -> f64 {
        self.flow
            .calc(&prev.masked_intensity(), &curr.masked_intensity())
            .mean_magnitude()
    }
}

/// Mean of the min-max normalized absolute difference of the raw intensities.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameDifferenceEstimator;

impl MotionEstimator for FrameDifferenceEstimator {
    fn estimate(&mut self, prev: &ForegroundMask, curr: &ForegroundMask) -> f64 {
        let diff: Vec<u8> = prev
            .intensity()
            .as_raw()
            .iter()
            .zip(curr.intensity().as_raw())
            .map(|(&a, &b)| a.abs_diff(b))
            .collect();
        let (Some(&min), Some(&max)) = (diff.iter().min(), diff.iter().max()) else {
            return 0.0;
        };
        if max == min {
            return 0.0;
        }
        let span = (max - min) as f64;
        let total: f64 = diff
            .iter()
            .map(|&d| (d - min) as f64 * 255.0 / span)
            .sum();
        total / diff.len() as f64
    }
}

/// Applies the reliability policy around a `MotionEstimator`.
#[derive(Debug, Clone)]
pub struct MotionScorer<E = DenseFlowEstimator> {
    config: ScoringConfig,
    estimator: E,
    frames_seen: u32,
}

impl MotionScorer<DenseFlowEstimator> {
    pub fn new(config: ScoringConfig, flow: FlowConfig) -> Self {
        Self::with_estimator(config, DenseFlowEstimator::new(flow))
    }
}

impl<E: MotionEstimator> MotionScorer<E> {
    pub fn with_estimator(config: ScoringConfig, estimator: E) -> Self {
        Self {
            config,
            estimator,
            frames_seen: 0,
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn estimator(&self) -> &E {
        &self.estimator
    }

    /// Frames scored since the last reset, including skipped ones.
    pub fn frames_seen(&self) -> u32 {
        self.frames_seen
    }

    /// Scores `curr` against the previous extraction, if any.
    pub fn score(&mut self, prev: Option<&ForegroundMask>, curr: &ForegroundMask) -> ScoreOutcome {
        self.frames_seen = self.frames_seen.saturating_add(1);

        let Some(prev) = prev else {
            return ScoreOutcome::InsufficientData(InsufficientData::NoBaseline);
        };
        if prev.dimensions() != curr.dimensions() {
            self.frames_seen = 1;
            return ScoreOutcome::InsufficientData(InsufficientData::DimensionMismatch {
                previous: prev.dimensions(),
                current: curr.dimensions(),
            });
        }

        let change_ratio = curr.change_ratio();
        let reliability = if self.frames_seen <= self.config.warmup_frames {
            Reliability::WarmingUp
        } else if change_ratio > self.config.shake_ratio {
            Reliability::CameraShake
        } else {
            Reliability::Reliable
        };

        let magnitude = match reliability {
            Reliability::Reliable => self.estimator.estimate(prev, curr),
            _ => {
                trace!(?reliability, change_ratio, frame = self.frames_seen, "unreliable sample");
                0.0
            }
        };
        ScoreOutcome::Sample(MotionSample {
            magnitude,
            change_ratio,
            reliability,
        })
    }

    /// Restarts the warm-up period.
    pub fn reset(&mut self) {
        self.frames_seen = 0;
    }
}
