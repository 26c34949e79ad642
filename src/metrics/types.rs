use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::SegmentOutcomeCounts;
use crate::models::SegmentState;

/// Per-segment processing figures, recorded when a segment reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMetrics {
    pub segment_id: String,
    pub monitor_id: u32,
    pub finished_at: DateTime<Utc>,
    pub outcome: SegmentState,
    pub frames_sampled: u64,
    pub frames_kept: u64,
    pub decode_errors: u64,
    pub ocr_timeouts: u64,
    pub events: u64,
    pub storage_attempts: u32,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineCounters {
    pub segments_finished: u64,
    pub frames_sampled: u64,
    pub frames_kept: u64,
    pub frames_dropped: u64,
    pub decode_errors: u64,
    pub ocr_timeouts: u64,
    pub events_emitted: u64,
}

/// Aggregate health, the only failure surface shown to users.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub taken_at: DateTime<Utc>,
    pub last_hour: SegmentOutcomeCounts,
    pub counters: PipelineCounters,
    pub system: SystemMetrics,
    pub paused: bool,
    pub recent_segments: Vec<SegmentMetrics>,
}

impl HealthSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "{} segment(s) failed in the last hour, {} persisted, {} discarded",
            self.last_hour.failed, self.last_hour.persisted, self.last_hour.discarded
        )
    }
}
