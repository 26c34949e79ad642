use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::FrameId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Cut,
    Fade,
    Motion,
    ContentChange,
    None,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Cut => "cut",
            ChangeType::Fade => "fade",
            ChangeType::Motion => "motion",
            ChangeType::ContentChange => "content_change",
            ChangeType::None => "none",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "cut" => Ok(ChangeType::Cut),
            "fade" => Ok(ChangeType::Fade),
            "motion" => Ok(ChangeType::Motion),
            "content_change" => Ok(ChangeType::ContentChange),
            "none" => Ok(ChangeType::None),
            other => Err(anyhow!("unknown change type '{other}'")),
        }
    }

    pub fn is_retained(&self) -> bool {
        !matches!(self, ChangeType::None)
    }
}

/// The three raw signals measured between two consecutive frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SceneSignals {
    pub ssim: f64,
    pub phash_distance: u32,
    pub entropy_delta: f64,
}

/// Row of the `scene_changes` fact table. Only non-`none` changes are stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneChange {
    /// Empty for the first frame of a lane, which has no predecessor.
    pub from_frame_id: Option<FrameId>,
    pub to_frame_id: FrameId,
    pub ts_ns: i64,
    pub monitor_id: u32,
    pub ssim: f64,
    pub phash_distance: u32,
    pub entropy_delta: f64,
    pub change_type: ChangeType,
    pub confidence: f64,
}
