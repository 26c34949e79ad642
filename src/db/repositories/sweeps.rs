use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Row};

use crate::db::{
    helpers::{format_datetime, parse_datetime, parse_optional_datetime, to_i64, to_u64},
    models::{SweepRecord, SweepStatus},
    Database,
};
use crate::models::DataClass;

const SWEEP_COLUMNS: &str =
    "id, data_class, boundary_ts, status, rows_before, rows_deleted, rows_after, started_at, completed_at";

fn row_to_sweep(row: &Row) -> Result<SweepRecord> {
    Ok(SweepRecord {
        id: row.get("id")?,
        data_class: DataClass::parse(&row.get::<_, String>("data_class")?)?,
        boundary_ts: row.get("boundary_ts")?,
        status: SweepStatus::parse(&row.get::<_, String>("status")?)?,
        rows_before: to_u64(row.get("rows_before")?, "rows_before")?,
        rows_deleted: row
            .get::<_, Option<i64>>("rows_deleted")?
            .map(|v| to_u64(v, "rows_deleted"))
            .transpose()?,
        rows_after: row
            .get::<_, Option<i64>>("rows_after")?
            .map(|v| to_u64(v, "rows_after"))
            .transpose()?,
        started_at: parse_datetime(&row.get::<_, String>("started_at")?, "started_at")?,
        completed_at: parse_optional_datetime(row.get("completed_at")?, "completed_at")?,
    })
}

impl Database {
    /// Checkpoints the start of a sweep before anything is deleted.
    pub async fn begin_sweep(&self, class: DataClass, boundary_ts: i64, rows_before: u64) -> Result<i64> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO retention_sweeps (data_class, boundary_ts, status, rows_before, started_at)
                 VALUES (?1, ?2, 'started', ?3, ?4)",
                params![
                    class.as_str(),
                    boundary_ts,
                    to_i64(rows_before)?,
                    format_datetime(&Utc::now()),
                ],
            )
            .with_context(|| format!("failed to checkpoint {class} sweep"))?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Marks the sweep completed and closes out any older checkpoints of the
    /// same class that were never finished. Returns how many were superseded.
    pub async fn complete_sweep(&self, sweep_id: i64, rows_deleted: u64, rows_after: u64) -> Result<usize> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let completed_at = format_datetime(&Utc::now());
            tx.execute(
                "UPDATE retention_sweeps
                 SET status = 'completed', rows_deleted = ?1, rows_after = ?2, completed_at = ?3
                 WHERE id = ?4",
                params![to_i64(rows_deleted)?, to_i64(rows_after)?, completed_at, sweep_id],
            )
            .with_context(|| format!("failed to complete sweep {sweep_id}"))?;
            let superseded = tx
                .execute(
                    "UPDATE retention_sweeps
                     SET status = 'superseded', completed_at = ?1
                     WHERE status = 'started' AND id < ?2
                       AND data_class = (SELECT data_class FROM retention_sweeps WHERE id = ?2)",
                    params![completed_at, sweep_id],
                )
                .with_context(|| format!("failed to supersede sweeps older than {sweep_id}"))?;
            tx.commit()?;
            Ok(superseded)
        })
        .await
    }

    /// Most recent sweep of `class` that was checkpointed but never completed.
    pub async fn unfinished_sweep(&self, class: DataClass) -> Result<Option<SweepRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SWEEP_COLUMNS} FROM retention_sweeps
                 WHERE data_class = ?1 AND status = 'started'
                 ORDER BY id DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query(params![class.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_sweep(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Newest first.
    pub async fn sweep_log(&self, limit: u32) -> Result<Vec<SweepRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SWEEP_COLUMNS} FROM retention_sweeps ORDER BY id DESC LIMIT ?1"
            ))?;
            let mut rows = stmt.query(params![limit])?;
            let mut sweeps = Vec::new();
            while let Some(row) = rows.next()? {
                sweeps.push(row_to_sweep(row)?);
            }
            Ok(sweeps)
        })
        .await
    }
}
