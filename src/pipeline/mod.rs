//! Segment processing: worker pool, per-monitor lanes, OCR seam, privacy pause.

pub mod controller;
pub mod lane;
pub mod ocr;
pub mod pool;
pub mod queue;
pub mod retry;

pub use controller::PipelineController;
pub use ocr::{recognize_with_timeout, OcrEngine, OcrOutcome};
pub use pool::WorkerPool;
pub use queue::LaneQueue;
pub use retry::{backoff_delay, with_backoff};
