// THEORY:
// The `background_model` module is the temporal memory of the vision system. Where
// the camera is fixed and the car is small, "what moved" is best answered by
// learning what the empty track looks like and flagging every pixel that no longer
// fits that picture.
//
// Key architectural principles:
// 1.  **Per-pixel mixture**: Every working pixel keeps up to `max_modes` Gaussian
//     modes (weight, mean, variance) of its intensity. Modes are kept sorted by
//     weight; the heaviest ones whose cumulative weight stays under
//     `background_ratio` describe the background.
// 2.  **Online learning**: There is no training phase. Each `update` nudges the
//     matching mode towards the new sample with the configured learning rate, decays
//     the others, and spawns a fresh low-weight mode when nothing matches. Slow
//     lighting drift is absorbed; a car passing is too fast to be learned.
// 3.  **Cheap working image**: Frames are downscaled and reduced to luminance before
//     modeling, trading resolution for throughput.
// 4.  **Clean masks**: The raw classification is opened (erode, then dilate) with a
//     small ellipse so isolated sensor noise never reaches the motion scorer.
// 5.  **Swappable**: The pipeline only sees the `BackgroundModel` trait, so tests can
//     inject deterministic models.

use crate::core_modules::frame::Frame;
use crate::core_modules::morphology::{self, BACKGROUND, FOREGROUND};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::morphology::Mask;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tunables of the Gaussian-mixture background model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Downscale factor applied to every frame before modeling.
    pub scale: f32,
    /// Fraction by which each frame moves the model towards the new sample.
    pub learning_rate: f32,
    /// Maximum number of Gaussian modes per pixel.
    pub max_modes: usize,
    /// Squared Mahalanobis distance under which a sample counts as background.
    pub var_threshold: f32,
    /// Squared Mahalanobis distance under which a sample updates an existing mode.
    pub var_threshold_gen: f32,
    /// Cumulative weight of the modes that make up the background.
    pub background_ratio: f32,
    /// Variance assigned to freshly spawned modes.
    pub var_init: f32,
    pub var_min: f32,
    pub var_max: f32,
    /// Weight pruning pressure; lets unused modes die out.
    pub complexity_reduction: f32,
    /// Side of the elliptical structuring element used to clean the mask.
    pub kernel_size: u32,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            scale: 0.5,
            learning_rate: 0.002,
            max_modes: 5,
            var_threshold: 16.0,
            var_threshold_gen: 9.0,
            background_ratio: 0.9,
            var_init: 15.0,
            var_min: 4.0,
            var_max: 75.0,
            complexity_reduction: 0.05,
            kernel_size: 5,
        }
    }
}

impl BackgroundConfig {
    /// Size of the working image for a frame of the given size.
    pub fn working_size(&self, width: u32, height: u32) -> (u32, u32) {
        let scaled = |side: u32| ((side as f32 * self.scale).round() as u32).max(1);
        (scaled(width), scaled(height))
    }
}

/// The foreground extraction of one frame.
///
/// `mask` holds binary membership flags (`0`/`255`). `intensity` is the working
/// luminance image the mask was computed from; both share the working resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ForegroundMask {
    mask: GrayImage,
    intensity: GrayImage,
    foreground_pixels: usize,
}

impl ForegroundMask {
    /// Pairs a binary mask with its working intensity image.
    ///
    /// # Panics
    /// If the two images differ in size.
    pub fn new(mask: GrayImage, intensity: GrayImage) -> Self {
        assert_eq!(
            mask.dimensions(),
            intensity.dimensions(),
            "mask and intensity image must share dimensions"
        );
        let foreground_pixels = mask.as_raw().iter().filter(|&&v| v == FOREGROUND).count();
        Self {
            mask,
            intensity,
            foreground_pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.mask.width()
    }

    pub fn height(&self) -> u32 {
        self.mask.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.mask.dimensions()
    }

    pub fn mask(&self) -> &GrayImage {
        &self.mask
    }

    pub fn intensity(&self) -> &GrayImage {
        &self.intensity
    }

    pub fn is_foreground(&self, x: u32, y: u32) -> bool {
        self.mask.get_pixel(x, y).0[0] == FOREGROUND
    }

    pub fn foreground_pixels(&self) -> usize {
        self.foreground_pixels
    }

    /// Fraction of working pixels flagged as foreground.
    pub fn change_ratio(&self) -> f64 {
        let total = self.mask.as_raw().len();
        if total == 0 {
            return 0.0;
        }
        self.foreground_pixels as f64 / total as f64
    }

    /// The intensity image with every background pixel zeroed.
    pub fn masked_intensity(&self) -> GrayImage {
        let (width, height) = self.dimensions();
        GrayImage::from_fn(width, height, |x, y| {
            if self.is_foreground(x, y) {
                *self.intensity.get_pixel(x, y)
            } else {
                Luma([BACKGROUND])
            }
        })
    }
}

/// An adaptive model of the static scene.
pub trait BackgroundModel: Send {
    /// Learns from `frame` and returns its foreground extraction.
    fn update(&mut self, frame: &Frame) -> ForegroundMask;

    /// Discards everything learned; the next `update` starts a fresh model.
    fn reset(&mut self);
}

/// One Gaussian mode of a pixel's intensity distribution.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Gaussian {
    weight: f32,
    mean: f32,
    variance: f32,
}

/// Per-pixel adaptive Gaussian mixture (MOG2-style) over luminance.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMixtureModel {
    config: BackgroundConfig,
    element: Mask,
    /// Working resolution the mode storage was allocated for.
    dimensions: Option<(u32, u32)>,
    /// `max_modes` slots per pixel, heaviest first.
    modes: Vec<Gaussian>,
    /// Number of live modes per pixel.
    mode_counts: Vec<u8>,
    frames_seen: u64,
}

impl GaussianMixtureModel {
    /// Builds an empty model. Out-of-range tunables never panic: a model without
    /// modes flags every pixel, and inverted variance bounds pin the variance to
    /// `var_max`. `PipelineConfig::validate` rejects both up front.
    pub fn new(config: BackgroundConfig) -> Self {
        let element = morphology::ellipse(config.kernel_size);
        Self {
            config,
            element,
            dimensions: None,
            modes: Vec::new(),
            mode_counts: Vec::new(),
            frames_seen: 0,
        }
    }

    pub fn config(&self) -> &BackgroundConfig {
        &self.config
    }

    /// Working resolution of the current model, if it has seen a frame.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Downscaled luminance image the model works on.
    pub fn working_intensity(&self, frame: &Frame) -> GrayImage {
        let gray = frame.luminance_image();
        let (width, height) = self.config.working_size(gray.width(), gray.height());
        if (width, height) == gray.dimensions() {
            return gray;
        }
        imageops::resize(&gray, width, height, FilterType::Triangle)
    }

    /// Classifies every pixel of `intensity` and learns from it. Returns the
    /// raw (uncleaned) mask.
    pub fn apply(&mut self, intensity: &GrayImage) -> GrayImage {
        let dimensions = intensity.dimensions();
        if self.dimensions != Some(dimensions) {
            if let Some((old_w, old_h)) = self.dimensions {
                debug!(
                    old_width = old_w,
                    old_height = old_h,
                    width = dimensions.0,
                    height = dimensions.1,
                    "working resolution changed, starting a fresh background model"
                );
            }
            self.allocate(dimensions);
        }
        self.frames_seen += 1;

        let samples = intensity.as_raw();
        let mut mask = vec![BACKGROUND; samples.len()];
        for (index, &sample) in samples.iter().enumerate() {
            if !self.learn_pixel(index, sample as f32) {
                mask[index] = FOREGROUND;
            }
        }
        GrayImage::from_raw(dimensions.0, dimensions.1, mask)
            .unwrap_or_else(|| GrayImage::new(dimensions.0, dimensions.1))
    }

    fn allocate(&mut self, (width, height): (u32, u32)) {
        let pixels = (width * height) as usize;
        self.dimensions = Some((width, height));
        let slots = self.config.max_modes.min(u8::MAX as usize);
        self.modes = vec![Gaussian::default(); pixels * slots];
        self.mode_counts = vec![0; pixels];
    }

    /// Updates the mixture of one pixel and reports whether the sample was background.
    fn learn_pixel(&mut self, index: usize, sample: f32) -> bool {
        let cfg = &self.config;
        let alpha = cfg.learning_rate;
        let keep = 1.0 - alpha;
        let prune = -alpha * cfg.complexity_reduction;
        let slots = cfg.max_modes.min(u8::MAX as usize);
        if slots == 0 {
            return false;
        }
        let modes = &mut self.modes[index * slots..(index + 1) * slots];
        let mut count = self.mode_counts[index] as usize;

        let mut background = false;
        let mut fits = false;
        let mut total_weight = 0.0f32;

        let mut mode = 0;
        while mode < count {
            let mut weight = keep * modes[mode].weight + prune;
            let mut slot = mode;
            if !fits {
                let variance = modes[mode].variance;
                let diff = modes[mode].mean - sample;
                let dist2 = diff * diff;
                if total_weight < cfg.background_ratio && dist2 < cfg.var_threshold * variance {
                    background = true;
                }
                if dist2 < cfg.var_threshold_gen * variance {
                    fits = true;
                    weight += alpha;
                    let k = alpha / weight;
                    modes[mode].mean -= k * diff;
                    modes[mode].variance =
                        (variance + k * (dist2 - variance)).max(cfg.var_min).min(cfg.var_max);
                    while slot > 0 && weight >= modes[slot - 1].weight {
                        modes.swap(slot, slot - 1);
                        slot -= 1;
                    }
                }
            }
            modes[slot].weight = weight.max(0.0);
            total_weight += modes[slot].weight;
            mode += 1;
        }

        // Drop modes that decayed to nothing. They sit at the tail.
        while count > 0 && modes[count - 1].weight <= 0.0 {
            count -= 1;
        }
        if total_weight > 0.0 {
            for mode in &mut modes[..count] {
                mode.weight /= total_weight;
            }
        }

        if !fits && alpha > 0.0 {
            let slot = if count == slots {
                slots - 1
            } else {
                count += 1;
                count - 1
            };
            if count == 1 {
                modes[slot].weight = 1.0;
            } else {
                modes[slot].weight = alpha;
                for mode in &mut modes[..count - 1] {
                    mode.weight *= keep;
                }
            }
            modes[slot].mean = sample;
            modes[slot].variance = cfg.var_init;
            let mut slot = slot;
            while slot > 0 && alpha >= modes[slot - 1].weight {
                modes.swap(slot, slot - 1);
                slot -= 1;
            }
        }

        self.mode_counts[index] = count as u8;
        background
    }
}

impl Default for GaussianMixtureModel {
    fn default() -> Self {
        Self::new(BackgroundConfig::default())
    }
}

impl BackgroundModel for GaussianMixtureModel {
    fn update(&mut self, frame: &Frame) -> ForegroundMask {
        let intensity = self.working_intensity(frame);
        let raw = self.apply(&intensity);
        let cleaned = morphology::open(&raw, &self.element);
        ForegroundMask::new(cleaned, intensity)
    }

    fn reset(&mut self) {
        self.dimensions = None;
        self.modes.clear();
        self.mode_counts.clear();
        self.frames_seen = 0;
    }
}
