use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CursorKind {
    Click,
    Move,
}

/// Input telemetry from the external input-event collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CursorEvent {
    pub ts_ns: i64,
    pub monitor_id: u32,
    pub kind: CursorKind,
    /// Position in frame pixel coordinates.
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub target_window: String,
}
