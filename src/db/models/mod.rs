pub mod segment_log;
pub mod span;
pub mod sweep;

pub use segment_log::{SegmentLogEntry, SegmentOutcomeCounts};
pub use span::Span;
pub use sweep::{SweepRecord, SweepStatus};
