use std::fmt;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Identity of a retained frame: `"{monitor_id}:{ts_ns}"`.
///
/// Timestamps are strictly increasing per monitor, so the id is unique and
/// is reproduced exactly when a segment is replayed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub String);

impl FrameId {
    pub fn new(monitor_id: u32, ts_ns: i64) -> Self {
        FrameId(format!("{monitor_id}:{ts_ns}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FrameId {
    fn from(value: &str) -> Self {
        FrameId(value.to_string())
    }
}

/// A still sampled from a segment, not yet decoded.
#[derive(Debug, Clone)]
pub struct SampledFrame {
    pub index: u32,
    pub ts_ns: i64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OcrStatus {
    Ok,
    TimedOut,
    Failed,
}

impl OcrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrStatus::Ok => "ok",
            OcrStatus::TimedOut => "timed_out",
            OcrStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "ok" => Ok(OcrStatus::Ok),
            "timed_out" => Ok(OcrStatus::TimedOut),
            "failed" => Ok(OcrStatus::Failed),
            other => Err(anyhow!("unknown ocr status '{other}'")),
        }
    }
}

/// Row of the `frames` fact table. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameRecord {
    pub frame_id: FrameId,
    pub ts_ns: i64,
    pub monitor_id: u32,
    pub segment_id: String,
    pub path: String,
    pub phash: u64,
    pub entropy: f64,
    pub width: u32,
    pub height: u32,
    pub app_name: String,
    pub window_title: String,
    pub ocr_status: OcrStatus,
}

impl FrameRecord {
    /// The pHash rendered as the 16 hex digit `phash16` column.
    pub fn phash16(&self) -> String {
        format!("{:016x}", self.phash)
    }

    pub fn parse_phash16(value: &str) -> Result<u64> {
        u64::from_str_radix(value, 16).map_err(|err| anyhow!("invalid phash16 '{value}': {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_id_is_deterministic() {
        assert_eq!(FrameId::new(1, 42), FrameId::new(1, 42));
        assert_eq!(FrameId::new(3, 1_000).as_str(), "3:1000");
    }

    #[test]
    fn phash16_is_zero_padded() {
        let record = FrameRecord {
            frame_id: FrameId::new(0, 1),
            ts_ns: 1,
            monitor_id: 0,
            segment_id: "s".into(),
            path: "/tmp/f.png".into(),
            phash: 0xab,
            entropy: 1.5,
            width: 10,
            height: 10,
            app_name: String::new(),
            window_title: String::new(),
            ocr_status: OcrStatus::Ok,
        };
        assert_eq!(record.phash16(), "00000000000000ab");
        assert_eq!(FrameRecord::parse_phash16(&record.phash16()).unwrap(), 0xab);
    }
}
