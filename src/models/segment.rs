use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Active application context attached to a capture segment by the recorder.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WindowContext {
    pub app_name: String,
    pub window_title: String,
}

/// A fixed-duration video segment handed over by the capture subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDescriptor {
    pub segment_id: String,
    pub monitor_id: u32,
    pub file_path: PathBuf,
    /// Nanoseconds since the unix epoch.
    pub t_start: i64,
    pub t_end: i64,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default)]
    pub window: Option<WindowContext>,
}

fn default_codec() -> String {
    "h264/yuv420p".into()
}

impl SegmentDescriptor {
    pub fn duration_ns(&self) -> i64 {
        (self.t_end - self.t_start).max(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Arrived,
    Extracting,
    Detecting,
    AwaitingOcr,
    Analyzing,
    Persisted,
    Failed,
    /// Dropped by a privacy pause before anything was persisted for it.
    Discarded,
}

impl SegmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentState::Arrived => "arrived",
            SegmentState::Extracting => "extracting",
            SegmentState::Detecting => "detecting",
            SegmentState::AwaitingOcr => "awaiting_ocr",
            SegmentState::Analyzing => "analyzing",
            SegmentState::Persisted => "persisted",
            SegmentState::Failed => "failed",
            SegmentState::Discarded => "discarded",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "arrived" => Ok(SegmentState::Arrived),
            "extracting" => Ok(SegmentState::Extracting),
            "detecting" => Ok(SegmentState::Detecting),
            "awaiting_ocr" => Ok(SegmentState::AwaitingOcr),
            "analyzing" => Ok(SegmentState::Analyzing),
            "persisted" => Ok(SegmentState::Persisted),
            "failed" => Ok(SegmentState::Failed),
            "discarded" => Ok(SegmentState::Discarded),
            other => Err(anyhow!("unknown segment state '{other}'")),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SegmentState::Persisted | SegmentState::Failed | SegmentState::Discarded
        )
    }

    /// The state that follows this one on the happy path.
    pub fn next(&self) -> Option<SegmentState> {
        match self {
            SegmentState::Arrived => Some(SegmentState::Extracting),
            SegmentState::Extracting => Some(SegmentState::Detecting),
            SegmentState::Detecting => Some(SegmentState::AwaitingOcr),
            SegmentState::AwaitingOcr => Some(SegmentState::Analyzing),
            SegmentState::Analyzing => Some(SegmentState::Persisted),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, target: SegmentState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match target {
            SegmentState::Failed | SegmentState::Discarded => true,
            other => self.next() == Some(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_linear() {
        let mut state = SegmentState::Arrived;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            assert!(state.can_transition_to(next));
            state = next;
            visited.push(state);
        }
        assert_eq!(state, SegmentState::Persisted);
        assert_eq!(visited.len(), 6);
    }

    #[test]
    fn failure_reachable_from_any_non_terminal_state() {
        for state in [
            SegmentState::Arrived,
            SegmentState::Extracting,
            SegmentState::Detecting,
            SegmentState::AwaitingOcr,
            SegmentState::Analyzing,
        ] {
            assert!(state.can_transition_to(SegmentState::Failed));
        }
        assert!(!SegmentState::Persisted.can_transition_to(SegmentState::Failed));
        assert!(!SegmentState::Detecting.can_transition_to(SegmentState::Persisted));
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            SegmentState::Arrived,
            SegmentState::AwaitingOcr,
            SegmentState::Discarded,
        ] {
            assert_eq!(SegmentState::parse(state.as_str()).unwrap(), state);
        }
        assert!(SegmentState::parse("bogus").is_err());
    }
}
