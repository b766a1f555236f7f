//! Thresholding of motion samples into "car passed" events.

use crate::core_modules::motion_scorer::MotionSample;
use tracing::warn;

/// A positive "object crossed" signal for one analyzed frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionEvent {
    /// Motion magnitude that triggered the event.
    pub magnitude: f64,
    pub change_ratio: f64,
}

/// Stateless threshold on reliable motion samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionGate {
    threshold: f64,
}

impl DetectionGate {
    pub const DEFAULT_THRESHOLD: f64 = 0.5;

    pub fn new(threshold: f64) -> Self {
        let mut gate = Self::default();
        gate.set_threshold(threshold);
        gate
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Changes the sensitivity. Only positive values are accepted, so a still
    /// scene (magnitude 0) can never fire.
    pub fn set_threshold(&mut self, threshold: f64) -> bool {
        if !(threshold > 0.0) {
            warn!(threshold, "ignoring invalid detection threshold");
            return false;
        }
        self.threshold = threshold;
        true
    }

    /// An event iff the sample is reliable and at or above the threshold.
    pub fn evaluate(&self, sample: &MotionSample) -> Option<DetectionEvent> {
        if !sample.is_reliable() || sample.magnitude < self.threshold {
            return None;
        }
        Some(DetectionEvent {
            magnitude: sample.magnitude,
            change_ratio: sample.change_ratio,
        })
    }
}

impl Default for DetectionGate {
    fn default() -> Self {
        Self {
            threshold: Self::DEFAULT_THRESHOLD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::motion_scorer::Reliability;

    fn sample(magnitude: f64, reliability: Reliability) -> MotionSample {
        MotionSample {
            magnitude,
            change_ratio: 0.1,
            reliability,
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        let gate = DetectionGate::new(0.5);
        assert_eq!(gate.evaluate(&sample(0.49, Reliability::Reliable)), None);
        let event = gate.evaluate(&sample(0.5, Reliability::Reliable)).unwrap();
        assert_eq!(event.magnitude, 0.5);
        assert_eq!(event.change_ratio, 0.1);
    }

    #[test]
    fn unreliable_samples_never_fire() {
        let gate = DetectionGate::new(0.01);
        assert_eq!(gate.evaluate(&sample(9.0, Reliability::WarmingUp)), None);
        assert_eq!(gate.evaluate(&sample(9.0, Reliability::CameraShake)), None);
    }

    #[test]
    fn invalid_thresholds_are_ignored() {
        let mut gate = DetectionGate::default();
        assert!(!gate.set_threshold(f64::NAN));
        assert!(!gate.set_threshold(-1.0));
        assert!(!gate.set_threshold(0.0));
        assert_eq!(gate.threshold(), DetectionGate::DEFAULT_THRESHOLD);
        assert!(gate.set_threshold(2.0));
        assert_eq!(gate.threshold(), 2.0);
    }

    #[test]
    fn still_scene_never_fires() {
        let gate = DetectionGate::new(0.0);
        assert_eq!(gate.threshold(), DetectionGate::DEFAULT_THRESHOLD);
        let smallest = DetectionGate::new(f64::MIN_POSITIVE);
        assert_eq!(smallest.evaluate(&sample(0.0, Reliability::Reliable)), None);
        assert!(smallest.evaluate(&sample(1e-6, Reliability::Reliable)).is_some());
    }
}
