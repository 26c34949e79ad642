use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    helpers::{format_datetime, parse_datetime, to_u32},
    models::{SegmentLogEntry, SegmentOutcomeCounts},
    Database,
};
use crate::models::{SegmentDescriptor, SegmentState};

pub const INTERRUPTED_REASON: &str = "interrupted";

fn row_to_entry(row: &Row) -> Result<SegmentLogEntry> {
    Ok(SegmentLogEntry {
        segment_id: row.get("segment_id")?,
        monitor_id: to_u32(row.get("monitor_id")?, "monitor_id")?,
        state: SegmentState::parse(&row.get::<_, String>("state")?)?,
        error: row.get("error")?,
        attempts: to_u32(row.get("attempts")?, "attempts")?,
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?, "updated_at")?,
    })
}

impl Database {
    /// Records a segment as `arrived`. A segment seen before (replay) starts
    /// over with its attempt counter incremented.
    pub async fn record_segment_arrival(&self, segment: &SegmentDescriptor) -> Result<()> {
        let segment = segment.clone();
        self.execute(move |conn| {
            let now = format_datetime(&Utc::now());
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO segments (segment_id, monitor_id, file_path, t_start, t_end, state, error, attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, 1, ?7, ?7)
                 ON CONFLICT(segment_id) DO UPDATE SET
                     state = excluded.state,
                     error = NULL,
                     attempts = attempts + 1,
                     updated_at = excluded.updated_at",
                params![
                    segment.segment_id,
                    segment.monitor_id,
                    segment.file_path.to_string_lossy().into_owned(),
                    segment.t_start,
                    segment.t_end,
                    SegmentState::Arrived.as_str(),
                    now,
                ],
            )
            .with_context(|| format!("failed to record segment {}", segment.segment_id))?;
            tx.execute(
                "INSERT INTO segment_transitions (segment_id, state, error, at) VALUES (?1, ?2, NULL, ?3)",
                params![segment.segment_id, SegmentState::Arrived.as_str(), now],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Applies one state machine transition; illegal transitions are rejected.
    pub async fn transition_segment(
        &self,
        segment_id: &str,
        to: SegmentState,
        error: Option<String>,
    ) -> Result<()> {
        let segment_id = segment_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT state FROM segments WHERE segment_id = ?1",
                    params![segment_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                bail!("segment {segment_id} is unknown");
            };
            let current = SegmentState::parse(&current)?;
            if !current.can_transition_to(to) {
                bail!(
                    "segment {segment_id} cannot move from {} to {}",
                    current.as_str(),
                    to.as_str()
                );
            }

            let now = format_datetime(&Utc::now());
            tx.execute(
                "UPDATE segments SET state = ?1, error = ?2, updated_at = ?3 WHERE segment_id = ?4",
                params![to.as_str(), error, now, segment_id],
            )?;
            tx.execute(
                "INSERT INTO segment_transitions (segment_id, state, error, at) VALUES (?1, ?2, ?3, ?4)",
                params![segment_id, to.as_str(), error, now],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_segment(&self, segment_id: &str) -> Result<Option<SegmentLogEntry>> {
        let segment_id = segment_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT segment_id, monitor_id, state, error, attempts, updated_at
                 FROM segments WHERE segment_id = ?1",
            )?;
            let mut rows = stmt.query(params![segment_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_entry(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// States a segment has passed through, oldest first.
    pub async fn segment_history(&self, segment_id: &str) -> Result<Vec<SegmentState>> {
        let segment_id = segment_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT state FROM segment_transitions WHERE segment_id = ?1 ORDER BY id",
            )?;
            let mut rows = stmt.query(params![segment_id])?;
            let mut states = Vec::new();
            while let Some(row) = rows.next()? {
                states.push(SegmentState::parse(&row.get::<_, String>(0)?)?);
            }
            Ok(states)
        })
        .await
    }

    /// Terminal outcomes reached at or after `since`.
    pub async fn segment_outcomes_since(&self, since: DateTime<Utc>) -> Result<SegmentOutcomeCounts> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT state, COUNT(*) FROM segments
                 WHERE updated_at >= ?1 AND state IN ('persisted', 'failed', 'discarded')
                 GROUP BY state",
            )?;
            let mut rows = stmt.query(params![format_datetime(&since)])?;
            let mut counts = SegmentOutcomeCounts::default();
            while let Some(row) = rows.next()? {
                let count = row.get::<_, i64>(1)?.max(0) as u64;
                match SegmentState::parse(&row.get::<_, String>(0)?)? {
                    SegmentState::Persisted => counts.persisted = count,
                    SegmentState::Failed => counts.failed = count,
                    SegmentState::Discarded => counts.discarded = count,
                    _ => {}
                }
            }
            Ok(counts)
        })
        .await
    }

    /// Segments of a monitor that have not (or not yet) been persisted. Their
    /// frames, if any reached disk, must not seed a lane restore.
    pub async fn unpersisted_segments(&self, monitor_id: u32) -> Result<BTreeSet<String>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT segment_id FROM segments WHERE monitor_id = ?1 AND state != 'persisted'",
            )?;
            let rows = stmt.query_map(params![monitor_id], |row| row.get(0))?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
        .await
    }

    /// Marks every non-terminal segment as failed. Called once at startup,
    /// when nothing can still be processing them.
    pub async fn recover_interrupted_segments(&self) -> Result<Vec<String>> {
        self.execute(|conn| {
            let tx = conn.transaction()?;
            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT segment_id FROM segments
                     WHERE state NOT IN ('persisted', 'failed', 'discarded')
                     ORDER BY segment_id",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };

            let now = format_datetime(&Utc::now());
            for id in &ids {
                tx.execute(
                    "UPDATE segments SET state = 'failed', error = ?1, updated_at = ?2 WHERE segment_id = ?3",
                    params![INTERRUPTED_REASON, now, id],
                )?;
                tx.execute(
                    "INSERT INTO segment_transitions (segment_id, state, error, at) VALUES (?1, 'failed', ?2, ?3)",
                    params![id, INTERRUPTED_REASON, now],
                )?;
            }
            tx.commit()?;
            Ok(ids)
        })
        .await
    }
}
