// THEORY:
// The `pipeline` module is the top-level synchronous API of the vision engine. It
// chains the stages of `core_modules` into one call per camera frame:
//
//     raw planes -> FrameConverter -> BackgroundModel -> MotionScorer -> DetectionGate
//
// and answers a single question per frame: did the car just cross?
//
// The pipeline owns the only cross-frame state of the detection path (the
// background model, the previous foreground extraction and the scorer's warm-up
// counter), so `reset` is all it takes to start over. It knows nothing about time
// or laps; that is the job of the `LapTimer`, driven by the `session` runtime or
// by any caller that prefers to run the loop itself.

use crate::core_modules::background_model::{
    BackgroundConfig, BackgroundModel, ForegroundMask, GaussianMixtureModel,
};
use crate::core_modules::detection_gate::DetectionGate;
use crate::core_modules::frame::{ColorRange, Frame, FrameConverter, FrameError, RawFrame};
use crate::core_modules::motion_scorer::{
    DenseFlowEstimator, MotionEstimator, MotionScorer, ScoreOutcome, ScoringConfig,
};
use crate::core_modules::optical_flow::FlowConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

// Re-export key data structures for the public API.
pub use crate::core_modules::detection_gate::DetectionEvent;
pub use crate::core_modules::motion_scorer::{InsufficientData, MotionSample, Reliability};

/// A configuration value outside its valid range.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be {expected}, got {value}")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
        value: f64,
    },
}

impl ConfigError {
    fn out_of_range(field: &'static str, expected: &'static str, value: impl Into<f64>) -> Self {
        ConfigError::OutOfRange {
            field,
            expected,
            value: value.into(),
        }
    }
}

/// Configuration for the MotionPipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Quantization of incoming YUV samples.
    pub color_range: ColorRange,
    pub background: BackgroundConfig,
    pub flow: FlowConfig,
    pub scoring: ScoringConfig,
    /// Minimum motion magnitude reported as a crossing.
    pub detection_threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            color_range: ColorRange::default(),
            background: BackgroundConfig::default(),
            flow: FlowConfig::default(),
            scoring: ScoringConfig::default(),
            detection_threshold: DetectionGate::DEFAULT_THRESHOLD,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bg = &self.background;
        if !(bg.scale > 0.0 && bg.scale <= 1.0) {
            return Err(ConfigError::out_of_range("background.scale", "in (0, 1]", bg.scale));
        }
        if !(bg.learning_rate >= 0.0 && bg.learning_rate <= 1.0) {
            return Err(ConfigError::out_of_range(
                "background.learning_rate",
                "in [0, 1]",
                bg.learning_rate,
            ));
        }
        if bg.max_modes == 0 || bg.max_modes > u8::MAX as usize {
            return Err(ConfigError::out_of_range(
                "background.max_modes",
                "in 1..=255",
                bg.max_modes as f64,
            ));
        }
        if !(bg.var_min > 0.0 && bg.var_min <= bg.var_max) {
            return Err(ConfigError::out_of_range(
                "background.var_min",
                "positive and at most var_max",
                bg.var_min,
            ));
        }
        if bg.kernel_size % 2 == 0 || bg.kernel_size > 511 {
            return Err(ConfigError::out_of_range(
                "background.kernel_size",
                "odd and at most 511",
                bg.kernel_size,
            ));
        }

        let flow = &self.flow;
        if !(flow.pyramid_scale > 0.0 && flow.pyramid_scale < 1.0) {
            return Err(ConfigError::out_of_range(
                "flow.pyramid_scale",
                "in (0, 1)",
                flow.pyramid_scale,
            ));
        }
        if flow.poly_n < 3 || flow.poly_n % 2 == 0 {
            return Err(ConfigError::out_of_range("flow.poly_n", "odd and at least 3", flow.poly_n));
        }
        if !(flow.poly_sigma > 0.0) {
            return Err(ConfigError::out_of_range("flow.poly_sigma", "positive", flow.poly_sigma));
        }
        if flow.window_size == 0 || flow.iterations == 0 {
            return Err(ConfigError::out_of_range(
                "flow.window_size/iterations",
                "positive",
                flow.window_size.min(flow.iterations),
            ));
        }

        if !(self.scoring.shake_ratio >= 0.0 && self.scoring.shake_ratio <= 1.0) {
            return Err(ConfigError::out_of_range(
                "scoring.shake_ratio",
                "in [0, 1]",
                self.scoring.shake_ratio,
            ));
        }
        if !(self.detection_threshold > 0.0) {
            return Err(ConfigError::out_of_range(
                "detection_threshold",
                "positive",
                self.detection_threshold,
            ));
        }
        Ok(())
    }
}

/// The output of the pipeline for a single frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Report {
    /// No sample could be taken; the frame became the new baseline.
    Skipped(InsufficientData),
    /// The frame was scored; `event` is set when the car crossed.
    Analyzed {
        sample: MotionSample,
        event: Option<DetectionEvent>,
    },
}

impl Report {
    pub fn event(&self) -> Option<&DetectionEvent> {
        match self {
            Report::Analyzed { event, .. } => event.as_ref(),
            Report::Skipped(_) => None,
        }
    }

    pub fn sample(&self) -> Option<&MotionSample> {
        match self {
            Report::Analyzed { sample, .. } => Some(sample),
            Report::Skipped(_) => None,
        }
    }
}

/// The per-frame detection engine.
pub struct MotionPipeline<B = GaussianMixtureModel, E = DenseFlowEstimator> {
    converter: FrameConverter,
    background: B,
    scorer: MotionScorer<E>,
    gate: DetectionGate,
    previous: Option<ForegroundMask>,
    last_sample: Option<MotionSample>,
}

impl MotionPipeline {
    /// Builds the default stage stack after validating `config`.
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let scorer = MotionScorer::new(config.scoring, config.flow);
        Ok(Self::with_components(
            FrameConverter::new(config.color_range),
            GaussianMixtureModel::new(config.background),
            scorer,
            DetectionGate::new(config.detection_threshold),
        ))
    }
}

impl<B: BackgroundModel, E: MotionEstimator> MotionPipeline<B, E> {
    /// Assembles a pipeline from explicit stages.
    pub fn with_components(
        converter: FrameConverter,
        background: B,
        scorer: MotionScorer<E>,
        gate: DetectionGate,
    ) -> Self {
        Self {
            converter,
            background,
            scorer,
            gate,
            previous: None,
            last_sample: None,
        }
    }

    /// Converts and analyzes one raw camera frame.
    ///
    /// A frame that cannot be converted is rejected without touching any state.
    pub fn process(&mut self, raw: &RawFrame<'_>) -> Result<Report, FrameError> {
        let frame = self.converter.convert(raw).map_err(|err| {
            warn!(error = %err, width = raw.width, height = raw.height, "frame rejected");
            err
        })?;
        Ok(self.analyze(&frame))
    }

    /// Analyzes one already converted frame.
    pub fn analyze(&mut self, frame: &Frame) -> Report {
        let current = self.background.update(frame);
        let outcome = self.scorer.score(self.previous.as_ref(), &current);
        self.previous = Some(current);

        match outcome {
            ScoreOutcome::InsufficientData(reason) => {
                debug!(?reason, "frame used as new baseline");
                Report::Skipped(reason)
            }
            ScoreOutcome::Sample(sample) => {
                self.last_sample = Some(sample);
                Report::Analyzed {
                    sample,
                    event: self.gate.evaluate(&sample),
                }
            }
        }
    }

    /// Whether the car crossed in this frame.
    pub fn car_detected(&mut self, raw: &RawFrame<'_>) -> Result<bool, FrameError> {
        Ok(self.process(raw)?.event().is_some())
    }

    /// Forgets the background, the baseline frame and the warm-up progress.
    pub fn reset(&mut self) {
        self.background.reset();
        self.scorer.reset();
        self.previous = None;
        self.last_sample = None;
    }

    /// Most recent scored sample, for diagnostics.
    pub fn last_sample(&self) -> Option<&MotionSample> {
        self.last_sample.as_ref()
    }

    pub fn set_threshold(&mut self, threshold: f64) -> bool {
        self.gate.set_threshold(threshold)
    }

    pub fn threshold(&self) -> f64 {
        self.gate.threshold()
    }

    pub fn background(&self) -> &B {
        &self.background
    }

    pub fn scorer(&self) -> &MotionScorer<E> {
        &self.scorer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::{Plane, PixelFormat};
    use image::{GrayImage, Luma, Rgb, RgbImage};

    /// Background model that marks pixels brighter than 128 as foreground.
    #[derive(Default)]
    struct ThresholdModel {
        resets: usize,
    }

    impl BackgroundModel for ThresholdModel {
        fn update(&mut self, frame: &Frame) -> ForegroundMask {
            let intensity = frame.luminance_image();
            let mask = GrayImage::from_fn(intensity.width(), intensity.height(), |x, y| {
                Luma([if intensity.get_pixel(x, y).0[0] > 128 { 255 } else { 0 }])
            });
            ForegroundMask::new(mask, intensity)
        }

        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    /// Estimator reporting the change in foreground size between frames.
    struct AreaDelta;

    impl MotionEstimator for AreaDelta {
        fn estimate(&mut self, prev: &ForegroundMask, curr: &ForegroundMask) -> f64 {
            curr.foreground_pixels().abs_diff(prev.foreground_pixels()) as f64
        }
    }

    fn pipeline(warmup_frames: u32) -> MotionPipeline<ThresholdModel, AreaDelta> {
        let scoring = ScoringConfig {
            warmup_frames,
            shake_ratio: 0.5,
        };
        MotionPipeline::with_components(
            FrameConverter::default(),
            ThresholdModel::default(),
            MotionScorer::with_estimator(scoring, AreaDelta),
            DetectionGate::new(3.0),
        )
    }

    fn scene(width: u32, height: u32, bright: u32) -> Frame {
        Frame::from_rgb(RgbImage::from_fn(width, height, |x, y| {
            let lit = x < bright && y < bright;
            Rgb([if lit { 255 } else { 0 }; 3])
        }))
    }

    #[test]
    fn first_frame_is_a_baseline() {
        let mut pipeline = pipeline(0);
        assert_eq!(
            pipeline.analyze(&scene(10, 10, 0)),
            Report::Skipped(InsufficientData::NoBaseline)
        );
        assert!(pipeline.last_sample().is_none());
    }

    #[test]
    fn identical_frames_produce_no_event() {
        let mut pipeline = pipeline(0);
        pipeline.analyze(&scene(10, 10, 2));
        let report = pipeline.analyze(&scene(10, 10, 2));
        assert_eq!(report.sample().map(|s| s.magnitude), Some(0.0));
        assert_eq!(report.event(), None);
    }

    #[test]
    fn growing_foreground_fires_an_event() {
        let mut pipeline = pipeline(0);
        pipeline.analyze(&scene(10, 10, 0));
        let report = pipeline.analyze(&scene(10, 10, 2));
        let event = report.event().copied().unwrap();
        assert_eq!(event.magnitude, 4.0);
        assert_eq!(event.change_ratio, 0.04);
        assert_eq!(pipeline.last_sample().unwrap().magnitude, 4.0);
    }

    #[test]
    fn warmup_suppresses_events() {
        let mut pipeline = pipeline(2);
        pipeline.analyze(&scene(10, 10, 0));
        let report = pipeline.analyze(&scene(10, 10, 3));
        assert_eq!(report.event(), None);
        assert_eq!(
            report.sample().map(|s| s.reliability),
            Some(Reliability::WarmingUp)
        );
    }

    #[test]
    fn geometry_change_resynchronizes() {
        let mut pipeline = pipeline(0);
        pipeline.analyze(&scene(10, 10, 0));
        assert!(matches!(
            pipeline.analyze(&scene(12, 12, 0)),
            Report::Skipped(InsufficientData::DimensionMismatch { .. })
        ));
        assert!(pipeline.analyze(&scene(12, 12, 3)).event().is_some());
    }

    #[test]
    fn rejected_frames_leave_state_untouched() {
        let mut pipeline = pipeline(0);
        pipeline.analyze(&scene(4, 4, 0));
        let data = [0u8; 16];
        let raw = RawFrame::new(4, 4, PixelFormat::Unrecognized(7), vec![Plane::packed(&data, 4)]);
        assert!(matches!(
            pipeline.process(&raw),
            Err(FrameError::UnsupportedFormat(_))
        ));
        // The baseline from the first frame is still in place.
        assert!(pipeline.analyze(&scene(4, 4, 0)).sample().is_some());
    }

    #[test]
    fn raw_frames_are_converted_and_scored() {
        let mut pipeline = pipeline(0);
        // Full-white luma with neutral chroma, I420 layout.
        let mut planes = vec![235u8; 16];
        planes.extend([128u8; 8]);
        let raw = RawFrame::new(4, 4, PixelFormat::I420, vec![Plane::packed(&planes, 4)]);
        assert!(!pipeline.car_detected(&raw).unwrap());
        assert!(!pipeline.car_detected(&raw).unwrap());
        assert_eq!(pipeline.last_sample().unwrap().change_ratio, 1.0);
    }

    #[test]
    fn reset_starts_over() {
        let mut pipeline = pipeline(0);
        pipeline.analyze(&scene(10, 10, 0));
        pipeline.analyze(&scene(10, 10, 3));
        pipeline.reset();
        assert_eq!(pipeline.background().resets, 1);
        assert_eq!(pipeline.scorer().frames_seen(), 0);
        assert!(pipeline.last_sample().is_none());
        assert_eq!(
            pipeline.analyze(&scene(10, 10, 3)),
            Report::Skipped(InsufficientData::NoBaseline)
        );
    }

    #[test]
    fn threshold_updates_are_validated() {
        let mut pipeline = MotionPipeline::new(PipelineConfig::default()).unwrap();
        assert_eq!(pipeline.threshold(), 0.5);
        assert!(!pipeline.set_threshold(-2.0));
        assert!(!pipeline.set_threshold(0.0));
        assert!(pipeline.set_threshold(1.25));
        assert_eq!(pipeline.threshold(), 1.25);
    }

    #[test]
    fn config_validation() {
        assert_eq!(PipelineConfig::default().validate(), Ok(()));

        let mut config = PipelineConfig::default();
        config.background.kernel_size = 4;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.flow.pyramid_scale = 1.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.detection_threshold = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.detection_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.background.kernel_size = 513;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_configs_are_refused_before_any_frame() {
        let mut config = PipelineConfig::default();
        config.background.max_modes = 0;
        assert!(matches!(
            MotionPipeline::new(config),
            Err(ConfigError::OutOfRange {
                field: "background.max_modes",
                ..
            })
        ));

        let mut config = PipelineConfig::default();
        config.background.var_min = 80.0;
        config.background.var_max = 10.0;
        assert!(matches!(
            MotionPipeline::new(config),
            Err(ConfigError::OutOfRange {
                field: "background.var_min",
                ..
            })
        ));

        let mut pipeline = MotionPipeline::new(PipelineConfig::default()).unwrap();
        let frame = scene(16, 16, 0);
        assert!(pipeline.analyze(&frame).sample().is_none());
        assert!(pipeline.analyze(&frame).sample().is_some());
    }

    #[test]
    fn config_from_partial_json() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{ "detection_threshold": 0.8, "scoring": { "warmup_frames": 10 } }"#,
        )
        .unwrap();
        assert_eq!(config.detection_threshold, 0.8);
        assert_eq!(config.scoring.warmup_frames, 10);
        assert_eq!(config.scoring.shake_ratio, 0.2);
        assert_eq!(config.background, BackgroundConfig::default());
    }
}
