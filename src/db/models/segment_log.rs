use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::SegmentState;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentLogEntry {
    pub segment_id: String,
    pub monitor_id: u32,
    pub state: SegmentState,
    pub error: Option<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// Terminal outcomes within a time window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentOutcomeCounts {
    pub persisted: u64,
    pub failed: u64,
    pub discarded: u64,
}
