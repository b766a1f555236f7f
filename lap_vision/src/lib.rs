// THEORY:
// This file is the main entry point for the `lap_vision` library crate.
//
// The crate turns a fixed camera looking at a track into a lap timer. It exposes
// three layers, each usable on its own:
//
// - `core_modules`: the individual stages (frame conversion, background model,
//   optical flow, motion scoring, detection gate, lap timer).
// - `pipeline`: `MotionPipeline`, the synchronous "did the car just cross?" API
//   that chains the detection stages for one frame at a time.
// - `session`: `LapSession`, the tokio runtime that owns a frame worker, a clock
//   ticker and the lap timer, and talks to a camera/UI shell through frame pushes,
//   control calls, snapshots and an event stream.

pub mod core_modules;
pub mod pipeline;
pub mod session;

pub use pipeline::{ConfigError, MotionPipeline, PipelineConfig, Report};
pub use session::{LapSession, SessionConfig, SessionEvent, SessionSnapshot};
