// THEORY:
// This file is the main entry point for the `streak_eraser` library crate.
// It follows the standard Rust convention of using `lib.rs` to define the public
// API that will be exposed to external consumers (like the bundled command-line
// runner).
//
// The primary goal is to export the `StreakEraser` and its associated data
// structures (`PipelineConfig`, `RunSummary`, etc.) as the high-level interface
// for the whole engine. The detection, grouping, classification and
// reconciliation layers live in `core_modules` and stay usable on their own,
// which is how the tests exercise them.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use error::{EraserError, Result};
pub use pipeline::{PipelineConfig, RunSummary, StreakEraser};
