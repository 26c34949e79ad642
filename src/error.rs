use std::path::PathBuf;

use thiserror::Error;

use crate::models::DataClass;

/// Failure taxonomy for the frame-to-event pipeline.
///
/// Ambiguous scene classifications are deliberately absent: they resolve to
/// `ChangeType::None` and never surface as errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("OCR for frame {frame_id} exceeded {timeout_ms}ms")]
    OcrTimeout { frame_id: String, timeout_ms: u64 },

    #[error("storage write failed after {attempts} attempt(s): {reason}")]
    StorageWrite { attempts: u32, reason: String },

    #[error("retention sweep for {data_class} interrupted at boundary {boundary_ts}")]
    RetentionSweepInterrupted {
        data_class: DataClass,
        boundary_ts: i64,
    },

    #[error("lane for monitor {monitor_id} exceeded queue depth limit {limit}")]
    QueueDepthExceeded { monitor_id: u32, limit: usize },

    #[error("pipeline is paused")]
    Paused,

    #[error("lane for monitor {monitor_id} is shut down")]
    LaneClosed { monitor_id: u32 },

    #[error("frame at {ts_ns} is not after {last_ts_ns} on monitor {monitor_id}")]
    OutOfOrderFrame {
        monitor_id: u32,
        ts_ns: i64,
        last_ts_ns: i64,
    },

    #[error("span {span_id} overlaps existing span {existing_id} of kind {kind}")]
    SpanOverlap {
        span_id: String,
        existing_id: String,
        kind: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    pub fn decode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PipelineError::Decode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that only affect a single frame and leave the lane running.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            PipelineError::Decode { .. }
                | PipelineError::OcrTimeout { .. }
                | PipelineError::OutOfOrderFrame { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_local_errors() {
        assert!(PipelineError::decode("/tmp/a.png", "truncated").is_frame_local());
        assert!(!PipelineError::Paused.is_frame_local());
        assert!(!PipelineError::StorageWrite {
            attempts: 3,
            reason: "disk full".into()
        }
        .is_frame_local());
    }

    #[test]
    fn messages_name_the_subject() {
        let err = PipelineError::QueueDepthExceeded {
            monitor_id: 2,
            limit: 8,
        };
        assert_eq!(
            err.to_string(),
            "lane for monitor 2 exceeded queue depth limit 8"
        );
    }
}
