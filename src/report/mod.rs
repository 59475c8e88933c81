//! Batch aggregation and the plain-text report.

pub mod render;
pub mod summary;

pub use render::render_text;
pub use summary::{summarize, BatchReport, CategoryMean, FailureModeCount, RunStats};
