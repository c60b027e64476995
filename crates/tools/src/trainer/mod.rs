//! Streaming PGN training pipeline.

pub mod encoder;
pub mod pgn;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod stats;

pub use encoder::{BOARD_WIDTH, CoordinateEncoder, GameEncoder, MOVE_SPACE};
pub use pgn::{FilterReason, GameRecord, GameResult, RawGame};
pub use pipeline::{PipelineOutcome, TrainerConfig, TrainingPipeline};
pub use progress::ProgressReporter;
pub use report::TrainingReport;
pub use stats::{PipelineStats, StatsSnapshot};
