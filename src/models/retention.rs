use std::fmt;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    RawFrame,
    Ocr,
    Event,
    Span,
}

impl DataClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataClass::RawFrame => "raw_frame",
            DataClass::Ocr => "ocr",
            DataClass::Event => "event",
            DataClass::Span => "span",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "raw_frame" => Ok(DataClass::RawFrame),
            "ocr" => Ok(DataClass::Ocr),
            "event" => Ok(DataClass::Event),
            "span" => Ok(DataClass::Span),
            other => Err(anyhow!("unknown data class '{other}'")),
        }
    }

    /// Spans are derived summaries and never expire.
    pub fn is_expirable(&self) -> bool {
        !matches!(self, DataClass::Span)
    }
}

impl fmt::Display for DataClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RetentionPolicy {
    pub data_class: DataClass,
    pub max_age_secs: u64,
    /// The policy is inactive before this instant.
    #[serde(default)]
    pub applies_from: Option<DateTime<Utc>>,
}

impl RetentionPolicy {
    pub fn new(data_class: DataClass, max_age_secs: u64) -> Self {
        Self {
            data_class,
            max_age_secs,
            applies_from: None,
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.applies_from.map(|from| now >= from).unwrap_or(true)
    }

    /// Rows strictly older than the returned nanosecond timestamp expire.
    pub fn boundary_ns(&self, now: DateTime<Utc>) -> i64 {
        let now_ns = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let age_ns = i64::try_from(self.max_age_secs)
            .ok()
            .and_then(|secs| secs.checked_mul(1_000_000_000))
            .unwrap_or(i64::MAX);
        now_ns.saturating_sub(age_ns)
    }
}

/// One line of the retention sweep result log. `rows_before` and
/// `rows_after` count only rows older than `boundary_ts`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepOutcome {
    pub data_class: DataClass,
    pub rows_deleted: u64,
    pub boundary_ts: i64,
    pub rows_before: u64,
    pub rows_after: u64,
    pub resumed: bool,
}

impl SweepOutcome {
    /// Nothing older than the boundary survived, and everything counted
    /// before the sweep was deleted by it.
    pub fn is_consistent(&self) -> bool {
        self.rows_after == 0 && self.rows_deleted == self.rows_before
    }
}
