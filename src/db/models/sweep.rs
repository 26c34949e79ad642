use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::DataClass;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    Started,
    Completed,
    /// Never completed; a later sweep of the same class finished instead.
    Superseded,
}

impl SweepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepStatus::Started => "started",
            SweepStatus::Completed => "completed",
            SweepStatus::Superseded => "superseded",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "started" => Ok(SweepStatus::Started),
            "completed" => Ok(SweepStatus::Completed),
            "superseded" => Ok(SweepStatus::Superseded),
            other => Err(anyhow!("unknown sweep status '{other}'")),
        }
    }
}

/// One row of the retention sweep log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SweepRecord {
    pub id: i64,
    pub data_class: DataClass,
    pub boundary_ts: i64,
    pub status: SweepStatus,
    pub rows_before: u64,
    pub rows_deleted: Option<u64>,
    pub rows_after: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
