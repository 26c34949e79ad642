use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::FrameId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FieldChange,
    Navigation,
    CursorAction,
    ErrorBanner,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FieldChange => "field_change",
            EventType::Navigation => "navigation",
            EventType::CursorAction => "cursor_action",
            EventType::ErrorBanner => "error_banner",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "field_change" => Ok(EventType::FieldChange),
            "navigation" => Ok(EventType::Navigation),
            "cursor_action" => Ok(EventType::CursorAction),
            "error_banner" => Ok(EventType::ErrorBanner),
            other => Err(anyhow!("unknown event type '{other}'")),
        }
    }
}

/// Row of the `events` fact table. Immutable once written.
///
/// `evidence_frames` may name frames that retention has since expired; such
/// dangling references are expected and are not repaired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub event_id: String,
    pub ts_ns: i64,
    pub monitor_id: u32,
    pub event_type: EventType,
    pub target: String,
    pub value_from: Option<String>,
    pub value_to: Option<String>,
    pub confidence: f64,
    pub evidence_frames: Vec<FrameId>,
}

impl EventRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ts_ns: i64,
        monitor_id: u32,
        event_type: EventType,
        target: impl Into<String>,
        value_from: Option<String>,
        value_to: Option<String>,
        confidence: f64,
        evidence_frames: Vec<FrameId>,
    ) -> Self {
        let target = target.into();
        let event_id = derive_event_id(
            monitor_id,
            event_type,
            &target,
            ts_ns,
            value_from.as_deref(),
            value_to.as_deref(),
        );
        Self {
            event_id,
            ts_ns,
            monitor_id,
            event_type,
            target,
            value_from,
            value_to,
            confidence: confidence.clamp(0.0, 1.0),
            evidence_frames,
        }
    }
}

/// Content-derived UUIDv5, so replaying a segment yields the same ids.
fn derive_event_id(
    monitor_id: u32,
    event_type: EventType,
    target: &str,
    ts_ns: i64,
    value_from: Option<&str>,
    value_to: Option<&str>,
) -> String {
    let key = format!(
        "{monitor_id}\u{1f}{}\u{1f}{target}\u{1f}{ts_ns}\u{1f}{}\u{1f}{}",
        event_type.as_str(),
        value_from.unwrap_or(""),
        value_to.unwrap_or(""),
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}
