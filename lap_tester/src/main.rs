//! lap_tester: replays a directory of still frames through the lap timing
//! pipeline with a simulated camera clock and prints the recorded laps.

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use image::RgbImage;
use lap_vision::core_modules::background_model::GaussianMixtureModel;
use lap_vision::core_modules::detection_gate::DetectionGate;
use lap_vision::core_modules::frame::{
    ColorRange, FrameConverter, PixelFormat, PlaneBuf, RawFrameBuf,
};
use lap_vision::core_modules::lap_timer::{Crossing, LapRecord, LapTimer};
use lap_vision::core_modules::motion_scorer::{
    FrameDifferenceEstimator, MotionEstimator, MotionScorer,
};
use lap_vision::pipeline::MotionPipeline;
use lap_vision::session::SessionConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Estimator {
    /// Dense optical flow over the foreground (default).
    Flow,
    /// Normalized frame differencing, for low-power targets.
    Diff,
}

#[derive(Debug, Parser)]
#[command(name = "lap_tester")]
#[command(about = "Replay still frames through the lap timing pipeline")]
#[command(version)]
struct Cli {
    /// Directory of frames, processed in file name order.
    input: PathBuf,

    /// Simulated camera frame rate.
    #[arg(long, default_value = "30.0")]
    fps: f64,

    /// Session configuration (JSON). Missing fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Motion threshold for a crossing.
    #[arg(long)]
    threshold: Option<f64>,

    /// Stop after this many laps (0 = no limit).
    #[arg(long)]
    target_laps: Option<u32>,

    /// Shortest accepted lap, in seconds.
    #[arg(long)]
    min_lap_interval: Option<f64>,

    #[arg(long, value_enum, default_value = "flow")]
    estimator: Estimator,

    /// Write the recorded laps as JSON.
    #[arg(long)]
    json: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // --- 1. Configuration ---
    let config = load_config(&cli)?;
    config.validate().context("invalid session configuration")?;
    if !(cli.fps > 0.0) {
        bail!("--fps must be positive, got {}", cli.fps);
    }

    // --- 2. Frame Discovery ---
    let frames = list_frames(&cli.input)?;
    if frames.is_empty() {
        bail!("no frames found in {}", cli.input.display());
    }
    info!(frames = frames.len(), fps = cli.fps, "replaying frames");

    // --- 3. Pipeline Initialization & Replay ---
    let outcome = match cli.estimator {
        Estimator::Flow => {
            let pipeline = MotionPipeline::new(config.pipeline.clone())?;
            replay(pipeline, &config, &frames, cli.fps)?
        }
        Estimator::Diff => {
            let pipeline = MotionPipeline::with_components(
                FrameConverter::new(config.pipeline.color_range),
                GaussianMixtureModel::new(config.pipeline.background.clone()),
                MotionScorer::with_estimator(
                    config.pipeline.scoring.clone(),
                    FrameDifferenceEstimator,
                ),
                DetectionGate::new(config.pipeline.detection_threshold),
            );
            replay(pipeline, &config, &frames, cli.fps)?
        }
    };

    // --- 4. Output ---
    if let Some(path) = &cli.json {
        let json = serde_json::to_string_pretty(&outcome.laps).context("serializing laps")?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "laps written");
    }
    print_summary(&outcome);
    Ok(())
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => SessionConfig::default(),
    };
    if let Some(threshold) = cli.threshold {
        config.pipeline.detection_threshold = threshold;
    }
    if let Some(target) = cli.target_laps {
        config.timer.target_lap_count = target;
    }
    if let Some(secs) = cli.min_lap_interval {
        config.timer.min_lap_interval = Duration::try_from_secs_f64(secs)
            .context("--min-lap-interval must be a non-negative number")?;
    }
    Ok(config)
}

fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if is_image {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

/// Outcome of a replay.
struct Replay {
    laps: Vec<LapRecord>,
    elapsed: Duration,
    average: Duration,
    fastest: Duration,
    frames: usize,
    rejected: usize,
}

fn replay<E: MotionEstimator>(
    mut pipeline: MotionPipeline<GaussianMixtureModel, E>,
    config: &SessionConfig,
    frames: &[PathBuf],
    fps: f64,
) -> Result<Replay> {
    let mut timer = LapTimer::new(config.timer.clone());
    timer.start();

    let origin = Instant::now();
    let period = Duration::from_secs_f64(1.0 / fps);
    let range = config.pipeline.color_range;
    let mut now = origin;
    let mut processed = 0;
    let mut rejected = 0;

    for (index, path) in frames.iter().enumerate() {
        if !timer.state().is_armed() {
            debug!(index, "session stopped, remaining frames skipped");
            break;
        }
        now = origin + period * index as u32;
        let image = image::open(path)
            .with_context(|| format!("decoding {}", path.display()))?
            .to_rgb8();
        let raw = encode_i420(&image, range, now);
        processed += 1;

        let report = match pipeline.process(&raw.as_raw()) {
            Ok(report) => report,
            Err(err) => {
                warn!(frame = %path.display(), error = %err, "frame rejected");
                rejected += 1;
                continue;
            }
        };
        if let Some(event) = report.event() {
            match timer.on_detection(event, now) {
                Crossing::SessionStarted => println!("frame {index:>6}: start"),
                Crossing::Lap { record, .. } => println!(
                    "frame {index:>6}: lap {:>3}  {:>8.3}s  ({})",
                    record.index + 1,
                    record.duration.as_secs_f64(),
                    report.sample().map(|s| s.to_string()).unwrap_or_default(),
                ),
                Crossing::Debounced { since_last } => {
                    debug!(index, ?since_last, "duplicate crossing ignored")
                }
                Crossing::NotArmed => {}
            }
        }
        timer.tick(now);
    }
    timer.stop(now);

    Ok(Replay {
        laps: timer.laps().to_vec(),
        elapsed: timer.elapsed(),
        average: timer.average_lap(),
        fastest: timer.fastest_lap(),
        frames: processed,
        rejected,
    })
}

/// Packs an RGB image as a single-plane I420 buffer (BT.601), as a camera
/// would deliver it.
fn encode_i420(image: &RgbImage, range: ColorRange, captured_at: Instant) -> RawFrameBuf {
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));

    let mut data = vec![0u8; w * h + 2 * cw * ch];
    let (luma, chroma) = data.split_at_mut(w * h);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    for (x, y, pixel) in image.enumerate_pixels() {
        let [r, g, b] = pixel.0.map(|c| c as f64);
        luma[y as usize * w + x as usize] = to_byte(match range {
            ColorRange::Limited => 16.0 + (65.481 * r + 128.553 * g + 24.966 * b) / 255.0,
            ColorRange::Full => 0.299 * r + 0.587 * g + 0.114 * b,
        });
    }
    for cy in 0..ch {
        for cx in 0..cw {
            // Average the 2x2 block, clipped at odd borders.
            let mut sum = [0.0f64; 3];
            let mut count = 0.0;
            for y in (2 * cy)..(2 * cy + 2).min(h) {
                for x in (2 * cx)..(2 * cx + 2).min(w) {
                    let pixel = image.get_pixel(x as u32, y as u32).0;
                    for (s, c) in sum.iter_mut().zip(pixel) {
                        *s += c as f64;
                    }
                    count += 1.0;
                }
            }
            let [r, g, b] = sum.map(|s| s / count);
            let (u, v) = match range {
                ColorRange::Limited => (
                    128.0 + (-37.797 * r - 74.203 * g + 112.0 * b) / 255.0,
                    128.0 + (112.0 * r - 93.786 * g - 18.214 * b) / 255.0,
                ),
                ColorRange::Full => (
                    128.0 - 0.168736 * r - 0.331264 * g + 0.5 * b,
                    128.0 + 0.5 * r - 0.418688 * g - 0.081312 * b,
                ),
            };
            u_plane[cy * cw + cx] = to_byte(u);
            v_plane[cy * cw + cx] = to_byte(v);
        }
    }

    let planes = vec![PlaneBuf::packed(data, w)];
    RawFrameBuf::captured_at(width, height, PixelFormat::I420, planes, captured_at)
}

fn to_byte(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn print_summary(replay: &Replay) {
    println!();
    println!("{:>5}  {:>10}  {:>9}  {:>7}", "lap", "time (s)", "magnitude", "change");
    for lap in &replay.laps {
        println!(
            "{:>5}  {:>10.3}  {:>9.2}  {:>7.3}",
            lap.index + 1,
            lap.duration.as_secs_f64(),
            lap.magnitude,
            lap.change_ratio
        );
    }
    println!();
    println!("frames analyzed : {} ({} rejected)", replay.frames, replay.rejected);
    println!("laps            : {}", replay.laps.len());
    println!("total time      : {:.3}s", replay.elapsed.as_secs_f64());
    println!("average lap     : {:.3}s", replay.average.as_secs_f64());
    println!("fastest lap     : {:.3}s", replay.fastest.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use lap_vision::core_modules::frame::FrameConverter;

    #[test]
    fn i420_encoding_survives_conversion() {
        // Color edges on chroma block boundaries.
        let image = RgbImage::from_fn(6, 4, |x, _| {
            if x < 4 {
                Rgb([200, 40, 40])
            } else {
                Rgb([30, 90, 220])
            }
        });
        let raw = encode_i420(&image, ColorRange::Limited, Instant::now());
        let frame = FrameConverter::new(ColorRange::Limited)
            .convert(&raw.as_raw())
            .unwrap();
        for (x, y, pixel) in image.enumerate_pixels() {
            let decoded = frame.as_rgb().get_pixel(x, y);
            for (a, b) in pixel.0.iter().zip(decoded.0) {
                assert!(a.abs_diff(b) <= 4, "pixel ({x}, {y}): {pixel:?} vs {decoded:?}");
            }
        }
    }

    #[test]
    fn command_line_overrides_the_config() {
        let cli = Cli::parse_from([
            "lap_tester",
            "frames",
            "--threshold",
            "1.5",
            "--target-laps",
            "3",
            "--min-lap-interval",
            "2.0",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.pipeline.detection_threshold, 1.5);
        assert_eq!(config.timer.target_lap_count, 3);
        assert_eq!(config.timer.min_lap_interval, Duration::from_secs(2));
        assert_eq!(cli.estimator, Estimator::Flow);
    }
}
