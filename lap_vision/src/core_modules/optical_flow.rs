// THEORY:
// The `optical_flow` module estimates a dense displacement field between two
// intensity images with the polynomial-expansion method (Farnebäck).
//
// Key architectural principles:
// 1.  **Polynomial expansion**: Each neighborhood is approximated by a quadratic
//     polynomial `f(p) = pᵀAp + bᵀp + c`, fitted by Gaussian-weighted least
//     squares. The fit is a fixed linear filter, so it is precomputed once as six
//     correlation kernels.
// 2.  **Displacement from coefficients**: If the second image is the first shifted
//     by `d`, then `b₂ = b₁ - 2Ad`. Every pixel solves the 2x2 system `A d = Δb`,
//     with the normal equations averaged over a Gaussian window for stability.
// 3.  **Coarse to fine**: A Gaussian pyramid lets large motions be found at low
//     resolution and refined at the next finer level, where the upsampled flow is
//     the prior for the next round of iterations.
// 4.  **Row bands**: Expansion and per-pixel updates are independent per row, so
//     they are computed in parallel horizontal bands, one per available core.

use image::imageops::interpolate_bilinear;
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::filter::gaussian_blur_f32;
use nalgebra::{Matrix6, Vector6};
use serde::{Deserialize, Serialize};
use std::thread;
use tracing::warn;

/// Single-channel floating point image.
pub type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Images below this pixel count are processed on the calling thread.
const PARALLEL_MIN_PIXELS: usize = 16_384;
/// Pyramid levels whose shorter side would drop below this are not built.
const PYRAMID_MIN_SIDE: f32 = 32.0;
/// Regularizer added to the determinant of each per-pixel system.
const DET_EPSILON: f32 = 1e-3;

/// Parameters of the dense flow estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Ratio between consecutive pyramid levels, in `(0, 1)`.
    pub pyramid_scale: f32,
    /// Number of levels below the full-resolution one.
    pub levels: u32,
    /// Side of the averaging window, in pixels.
    pub window_size: u32,
    /// Refinement iterations per pyramid level.
    pub iterations: u32,
    /// Radius of the polynomial expansion neighborhood.
    pub poly_n: u32,
    /// Standard deviation of the expansion weights.
    pub poly_sigma: f32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            pyramid_scale: 0.5,
            levels: 3,
            window_size: 15,
            iterations: 3,
            poly_n: 5,
            poly_sigma: 1.2,
        }
    }
}

/// A dense displacement field, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    width: u32,
    height: u32,
    dx: Vec<f32>,
    dy: Vec<f32>,
}

impl FlowField {
    pub fn zeros(width: u32, height: u32) -> Self {
        let len = (width * height) as usize;
        Self {
            width,
            height,
            dx: vec![0.0; len],
            dy: vec![0.0; len],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> (f32, f32) {
        let index = (y * self.width + x) as usize;
        (self.dx[index], self.dy[index])
    }

    /// Average displacement over all pixels.
    pub fn mean_vector(&self) -> (f64, f64) {
        let len = self.dx.len();
        if len == 0 {
            return (0.0, 0.0);
        }
        let sum_x: f64 = self.dx.iter().map(|&v| v as f64).sum();
        let sum_y: f64 = self.dy.iter().map(|&v| v as f64).sum();
        (sum_x / len as f64, sum_y / len as f64)
    }

    /// Euclidean length of the mean displacement vector.
    pub fn mean_magnitude(&self) -> f64 {
        let (x, y) = self.mean_vector();
        x.hypot(y)
    }

    /// Bilinear resize of both channels, with every vector multiplied by `gain`.
    fn resized(&self, width: u32, height: u32, gain: f32) -> Self {
        let resize = |channel: &[f32]| -> Vec<f32> {
            FloatImage::from_raw(self.width, self.height, channel.to_vec())
                .map(|plane| resample(&plane, width, height).into_raw())
                .unwrap_or_else(|| vec![0.0; (width * height) as usize])
                .into_iter()
                .map(|v| v * gain)
                .collect()
        };
        Self {
            width,
            height,
            dx: resize(&self.dx),
            dy: resize(&self.dy),
        }
    }
}

/// Polynomial coefficients of one pixel: `[bx, by, axx, ayy, axy]`.
type Expansion = [f32; 5];

/// Dense Farnebäck optical flow.
#[derive(Debug, Clone)]
pub struct DenseFlow {
    config: FlowConfig,
    radius: i32,
    /// One entry per neighborhood offset, row-major over `[-radius, radius]²`:
    /// the contribution of that tap to `[bx, by, axx, ayy, axy]`.
    kernels: Vec<Expansion>,
}

impl DenseFlow {
    pub fn new(config: FlowConfig) -> Self {
        let radius = config.poly_n.max(1) as i32;
        let kernels = expansion_kernels(radius, config.poly_sigma);
        Self {
            config,
            radius,
            kernels,
        }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Flow that carries `prev` onto `next`. Both images must have equal size.
    pub fn calc(&self, prev: &GrayImage, next: &GrayImage) -> FlowField {
        assert_eq!(
            prev.dimensions(),
            next.dimensions(),
            "flow needs images of equal size"
        );
        let (width, height) = prev.dimensions();
        if width == 0 || height == 0 {
            return FlowField::zeros(width, height);
        }

        let prev = to_float(prev);
        let next = to_float(next);
        let levels = self.pyramid_depth(width, height);
        let mut flow: Option<FlowField> = None;

        for level in (0..=levels).rev() {
            let scale = self.config.pyramid_scale.powi(level as i32);
            let prev_level = pyramid_level(&prev, scale);
            let next_level = pyramid_level(&next, scale);
            let (w, h) = prev_level.dimensions();

            let mut current = match flow.take() {
                Some(coarse) => coarse.resized(w, h, 1.0 / self.config.pyramid_scale),
                None => FlowField::zeros(w, h),
            };

            let r0 = self.expand(&prev_level);
            let r1 = self.expand(&next_level);
            for _ in 0..self.config.iterations.max(1) {
                current = self.refine(&r0, &r1, &current);
            }
            flow = Some(current);
        }

        flow.unwrap_or_else(|| FlowField::zeros(width, height))
    }

    fn pyramid_depth(&self, width: u32, height: u32) -> u32 {
        let mut scale = 1.0f32;
        let mut depth = 0;
        while depth < self.config.levels {
            scale *= self.config.pyramid_scale;
            if width as f32 * scale < PYRAMID_MIN_SIDE || height as f32 * scale < PYRAMID_MIN_SIDE {
                break;
            }
            depth += 1;
        }
        depth
    }

    /// Polynomial expansion of every pixel, with replicated borders.
    fn expand(&self, image: &FloatImage) -> Vec<Expansion> {
        let (width, height) = image.dimensions();
        let (w, h) = (width as i32, height as i32);
        let raw = image.as_raw();
        let radius = self.radius;
        let side = (2 * radius + 1) as usize;

        let mut out = vec![[0.0; 5]; raw.len()];
        for_each_row_band(&mut out, width as usize, |x, y, slot| {
            let (x, y) = (x as i32, y as i32);
            let mut acc = [0.0f32; 5];
            for j in -radius..=radius {
                let sy = (y + j).clamp(0, h - 1);
                let row = (sy * w) as usize;
                for i in -radius..=radius {
                    let sx = (x + i).clamp(0, w - 1);
                    let value = raw[row + sx as usize];
                    if value == 0.0 {
                        continue;
                    }
                    let tap = (j + radius) as usize * side + (i + radius) as usize;
                    let kernel = &self.kernels[tap];
                    for (a, k) in acc.iter_mut().zip(kernel) {
                        *a += k * value;
                    }
                }
            }
            *slot = acc;
        });
        out
    }

    /// One update of the displacement field given both expansions.
    fn refine(&self, r0: &[Expansion], r1: &[Expansion], flow: &FlowField) -> FlowField {
        let (width, height) = (flow.width, flow.height);
        let (w, h) = (width as usize, height as usize);

        // Per-pixel normal equations: [g11, g12, g22, h1, h2].
        let mut terms = vec![[0.0f32; 5]; w * h];
        for_each_row_band(&mut terms, w, |x, y, slot| {
            let index = y * w + x;
            let (dx, dy) = (flow.dx[index], flow.dy[index]);
            let p0 = &r0[index];
            let p1 = sample_expansion(r1, w, h, x as f32 + dx, y as f32 + dy);

            let a11 = (p0[2] + p1[2]) * 0.5;
            let a22 = (p0[3] + p1[3]) * 0.5;
            let a12 = (p0[4] + p1[4]) * 0.25;

            let b1 = -0.5 * (p1[0] - p0[0]) + a11 * dx + a12 * dy;
            let b2 = -0.5 * (p1[1] - p0[1]) + a12 * dx + a22 * dy;

            *slot = [
                a11 * a11 + a12 * a12,
                a12 * (a11 + a22),
                a12 * a12 + a22 * a22,
                a11 * b1 + a12 * b2,
                a12 * b1 + a22 * b2,
            ];
        });

        let sigma = (self.config.window_size.max(1) as f32 * 0.3).max(0.1);
        let smoothed: Vec<FloatImage> = (0..5)
            .map(|channel| {
                let plane = FloatImage::from_fn(width, height, |x, y| {
                    Luma([terms[y as usize * w + x as usize][channel]])
                });
                gaussian_blur_f32(&plane, sigma)
            })
            .collect();
        let [g11, g12, g22, h1, h2] = [0, 1, 2, 3, 4].map(|c| smoothed[c].as_raw());

        let mut dx = vec![0.0; w * h];
        let mut dy = vec![0.0; w * h];
        for index in 0..w * h {
            let det = g11[index] * g22[index] - g12[index] * g12[index] + DET_EPSILON;
            if det.abs() < f32::EPSILON {
                continue;
            }
            dx[index] = (g22[index] * h1[index] - g12[index] * h2[index]) / det;
            dy[index] = (g11[index] * h2[index] - g12[index] * h1[index]) / det;
        }
        FlowField {
            width,
            height,
            dx,
            dy,
        }
    }
}

impl Default for DenseFlow {
    fn default() -> Self {
        Self::new(FlowConfig::default())
    }
}

/// Least-squares fit of `[1, x, y, x², y², xy]` under Gaussian weights, folded
/// into one correlation kernel per coefficient we keep.
fn expansion_kernels(radius: i32, sigma: f32) -> Vec<Expansion> {
    let sigma = sigma.max(f32::EPSILON) as f64;
    let taps: Vec<(f64, Vector6<f64>)> = (-radius..=radius)
        .flat_map(|j| (-radius..=radius).map(move |i| (i as f64, j as f64)))
        .map(|(x, y)| {
            let weight = (-(x * x + y * y) / (2.0 * sigma * sigma)).exp();
            (weight, Vector6::new(1.0, x, y, x * x, y * y, x * y))
        })
        .collect();

    let gram = taps
        .iter()
        .fold(Matrix6::zeros(), |acc, (w, basis)| acc + basis * basis.transpose() * *w);
    let Some(inverse) = gram.try_inverse() else {
        warn!(radius, sigma, "polynomial expansion basis is singular, flow disabled");
        return vec![[0.0; 5]; taps.len()];
    };

    taps.iter()
        .map(|(w, basis)| {
            let c = inverse * (basis * *w);
            [c[1] as f32, c[2] as f32, c[3] as f32, c[4] as f32, c[5] as f32]
        })
        .collect()
}

fn to_float(image: &GrayImage) -> FloatImage {
    FloatImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([image.get_pixel(x, y).0[0] as f32])
    })
}

/// The pyramid level at `scale` of the full-resolution image.
fn pyramid_level(image: &FloatImage, scale: f32) -> FloatImage {
    if scale >= 1.0 {
        return image.clone();
    }
    let sigma = (1.0 / scale - 1.0) * 0.5;
    let blurred = gaussian_blur_f32(image, sigma);
    let width = ((image.width() as f32 * scale).round() as u32).max(1);
    let height = ((image.height() as f32 * scale).round() as u32).max(1);
    resample(&blurred, width, height)
}

/// Bilinear resize with pixel centers aligned.
///
/// `imageops::resize` clamps `f32` samples to `[0, 1]`, which would flatten both
/// intensities and signed flow, so this goes through `interpolate_bilinear`.
fn resample(image: &FloatImage, width: u32, height: u32) -> FloatImage {
    let (src_w, src_h) = image.dimensions();
    let sx = src_w as f32 / width as f32;
    let sy = src_h as f32 / height as f32;
    let (max_x, max_y) = (src_w.saturating_sub(1) as f32, src_h.saturating_sub(1) as f32);
    FloatImage::from_fn(width, height, |x, y| {
        let fx = ((x as f32 + 0.5) * sx - 0.5).clamp(0.0, max_x);
        let fy = ((y as f32 + 0.5) * sy - 0.5).clamp(0.0, max_y);
        interpolate_bilinear(image, fx, fy).unwrap_or(Luma([0.0]))
    })
}

/// Bilinear taps of a multi-channel expansion, which has no `Pixel` type.
fn bilinear_taps(w: usize, h: usize, fx: f32, fy: f32) -> [(usize, f32); 4] {
    let fx = fx.clamp(0.0, (w - 1) as f32);
    let fy = fy.clamp(0.0, (h - 1) as f32);
    let (x0, y0) = (fx.floor() as usize, fy.floor() as usize);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (tx, ty) = (fx - x0 as f32, fy - y0 as f32);
    [
        (y0 * w + x0, (1.0 - tx) * (1.0 - ty)),
        (y0 * w + x1, tx * (1.0 - ty)),
        (y1 * w + x0, (1.0 - tx) * ty),
        (y1 * w + x1, tx * ty),
    ]
}

fn sample_expansion(src: &[Expansion], w: usize, h: usize, fx: f32, fy: f32) -> Expansion {
    let mut out = [0.0; 5];
    for (index, weight) in bilinear_taps(w, h, fx, fy) {
        for (o, v) in out.iter_mut().zip(&src[index]) {
            *o += v * weight;
        }
    }
    out
}

/// Calls `fill(x, y, slot)` for every element of the row-major buffer `out`,
/// splitting the rows into parallel bands for large images.
fn for_each_row_band<T, F>(out: &mut [T], width: usize, fill: F)
where
    T: Send,
    F: Fn(usize, usize, &mut T) + Sync,
{
    if width == 0 || out.is_empty() {
        return;
    }
    let height = out.len() / width;
    let bands = if out.len() < PARALLEL_MIN_PIXELS {
        1
    } else {
        num_cpus::get().clamp(1, height)
    };
    let band_rows = height.div_ceil(bands);

    let run = |first_row: usize, band: &mut [T]| {
        for (offset, slot) in band.iter_mut().enumerate() {
            fill(offset % width, first_row + offset / width, slot);
        }
    };

    if bands == 1 {
        run(0, out);
        return;
    }
    thread::scope(|scope| {
        for (band_index, band) in out.chunks_mut(band_rows * width).enumerate() {
            let run = &run;
            scope.spawn(move || run(band_index * band_rows, band));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian_bump(size: u32, cx: f32, cy: f32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let (dx, dy) = (x as f32 - cx, y as f32 - cy);
            let value = 200.0 * (-(dx * dx + dy * dy) / (2.0 * 36.0)).exp();
            Luma([value.round() as u8])
        })
    }

    #[test]
    fn identical_frames_have_no_flow() {
        let flow = DenseFlow::default();
        let image = gaussian_bump(64, 32.0, 32.0);
        let field = flow.calc(&image, &image);
        assert_eq!(field.mean_vector(), (0.0, 0.0));
        assert_eq!(field.mean_magnitude(), 0.0);
    }

    #[test]
    fn blank_frames_have_no_flow() {
        let flow = DenseFlow::default();
        let blank = GrayImage::new(40, 30);
        assert_eq!(flow.calc(&blank, &blank).mean_magnitude(), 0.0);
    }

    #[test]
    fn larger_shifts_give_larger_magnitudes() {
        let flow = DenseFlow::default();
        let base = gaussian_bump(64, 30.0, 32.0);
        let magnitudes: Vec<f64> = [1.0, 2.0, 3.0]
            .iter()
            .map(|shift| {
                let moved = gaussian_bump(64, 30.0 + shift, 32.0);
                let field = flow.calc(&base, &moved);
                let (mean_x, _) = field.mean_vector();
                assert!(mean_x > 0.0, "rightward shift should give positive flow");
                field.mean_magnitude()
            })
            .collect();
        assert!(magnitudes[0] > 0.0);
        assert!(magnitudes[1] > magnitudes[0], "{magnitudes:?}");
        assert!(magnitudes[2] > magnitudes[1], "{magnitudes:?}");
    }

    #[test]
    fn bump_center_tracks_the_shift() {
        let flow = DenseFlow::default();
        let base = gaussian_bump(64, 30.0, 32.0);
        let moved = gaussian_bump(64, 32.0, 32.0);
        let (dx, dy) = flow.calc(&base, &moved).get(31, 32);
        assert!(dx > 1.0 && dx < 3.0, "dx = {dx}");
        assert!(dy.abs() < 0.5, "dy = {dy}");
    }

    #[test]
    fn pyramid_stops_at_minimum_side() {
        let flow = DenseFlow::default();
        assert_eq!(flow.pyramid_depth(32, 24), 0);
        assert_eq!(flow.pyramid_depth(64, 64), 1);
        assert_eq!(flow.pyramid_depth(320, 240), 2);
        assert_eq!(flow.pyramid_depth(640, 480), 3);
    }

    #[test]
    fn upsampling_scales_vectors() {
        let mut field = FlowField::zeros(4, 4);
        field.dx.iter_mut().for_each(|v| *v = 1.0);
        let up = field.resized(8, 8, 2.0);
        assert_eq!(up.width(), 8);
        assert!(up.dx.iter().all(|&v| (v - 2.0).abs() < 1e-6));
        assert!(up.dy.iter().all(|&v| v == 0.0));

        // Signed vectors survive resampling.
        let mut field = FlowField::zeros(4, 4);
        field.dx.iter_mut().for_each(|v| *v = -3.0);
        let up = field.resized(8, 8, 2.0);
        assert!(up.dx.iter().all(|&v| (v + 6.0).abs() < 1e-5));
    }

    #[test]
    fn pyramid_levels_keep_intensity_range() {
        let image = to_float(&GrayImage::from_pixel(64, 48, Luma([200])));
        let level = pyramid_level(&image, 0.5);
        assert_eq!(level.dimensions(), (32, 24));
        assert!(level.pixels().all(|p| (p.0[0] - 200.0).abs() < 1e-2));
    }

    #[test]
    fn parallel_bands_match_serial_fill() {
        let width = 200;
        let mut out = vec![0usize; width * 100];
        for_each_row_band(&mut out, width, |x, y, slot| *slot = y * width + x);
        assert!(out.iter().enumerate().all(|(i, &v)| i == v));
    }
}
