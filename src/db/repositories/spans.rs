use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{
    helpers::{format_datetime, parse_datetime, to_u32},
    models::Span,
    Database,
};
use crate::error::PipelineError;

const SPAN_COLUMNS: &str =
    "span_id, kind, monitor_id, t_start, t_end, closed, title, summary_md, tags, created_at, updated_at";

fn row_to_span(row: &Row) -> Result<Span> {
    let tags: String = row.get("tags")?;
    Ok(Span {
        span_id: row.get("span_id")?,
        kind: row.get("kind")?,
        monitor_id: to_u32(row.get("monitor_id")?, "monitor_id")?,
        t_start: row.get("t_start")?,
        t_end: row.get("t_end")?,
        closed: row.get::<_, i64>("closed")? != 0,
        title: row.get("title")?,
        summary_md: row.get("summary_md")?,
        tags: serde_json::from_str(&tags).context("failed to parse span tags")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?, "created_at")?,
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?, "updated_at")?,
    })
}

fn load_span(conn: &Connection, span_id: &str) -> Result<Option<Span>> {
    let mut stmt = conn.prepare(&format!("SELECT {SPAN_COLUMNS} FROM spans WHERE span_id = ?1"))?;
    let mut rows = stmt.query(params![span_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_span(row)?)),
        None => Ok(None),
    }
}

/// First span of the same kind and monitor, other than `exclude`, that
/// overlaps `[t_start, t_end)`.
fn find_overlap(
    conn: &Connection,
    kind: &str,
    monitor_id: u32,
    t_start: i64,
    t_end: i64,
    exclude: &str,
) -> Result<Option<String>> {
    let end = t_end.max(t_start + 1);
    conn.query_row(
        "SELECT span_id FROM spans
         WHERE kind = ?1 AND monitor_id = ?2 AND span_id != ?3
           AND t_start < ?4 AND MAX(t_end, t_start + 1) > ?5
         ORDER BY t_start
         LIMIT 1",
        params![kind, monitor_id, exclude, end, t_start],
        |row| row.get(0),
    )
    .optional()
    .context("failed to check span overlap")
}

fn overlap_error(span_id: &str, existing_id: String, kind: &str) -> anyhow::Error {
    PipelineError::SpanOverlap {
        span_id: span_id.to_string(),
        existing_id,
        kind: kind.to_string(),
    }
    .into()
}

impl Database {
    /// Inserts a span. Fails with `PipelineError::SpanOverlap` if another span
    /// of the same kind on the same monitor overlaps it.
    pub async fn insert_span(&self, span: &Span) -> Result<()> {
        let span = span.clone();
        self.execute(move |conn| {
            if span.t_end < span.t_start {
                bail!("span {} ends before it starts", span.span_id);
            }
            let tx = conn.transaction()?;
            if let Some(existing) =
                find_overlap(&tx, &span.kind, span.monitor_id, span.t_start, span.t_end, &span.span_id)?
            {
                return Err(overlap_error(&span.span_id, existing, &span.kind));
            }
            tx.execute(
                &format!("INSERT INTO spans ({SPAN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    span.span_id,
                    span.kind,
                    span.monitor_id,
                    span.t_start,
                    span.t_end,
                    span.closed,
                    span.title,
                    span.summary_md,
                    serde_json::to_string(&span.tags)?,
                    format_datetime(&span.created_at),
                    format_datetime(&span.updated_at),
                ],
            )
            .with_context(|| format!("failed to insert span {}", span.span_id))?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Moves the end of an open span forward and optionally replaces its
    /// title, summary and tags.
    pub async fn extend_span(
        &self,
        span_id: &str,
        t_end: i64,
        title: Option<String>,
        summary_md: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Span> {
        let span_id = span_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let Some(mut span) = load_span(&tx, &span_id)? else {
                bail!("span {span_id} not found");
            };
            if span.closed {
                bail!("span {span_id} is closed");
            }
            if t_end < span.t_end {
                bail!("span {span_id} cannot shrink from {} to {t_end}", span.t_end);
            }
            if let Some(existing) = find_overlap(&tx, &span.kind, span.monitor_id, span.t_start, t_end, &span_id)? {
                return Err(overlap_error(&span_id, existing, &span.kind));
            }

            span.t_end = t_end;
            if let Some(title) = title {
                span.title = title;
            }
            if let Some(summary_md) = summary_md {
                span.summary_md = summary_md;
            }
            if let Some(tags) = tags {
                span.tags = tags;
            }
            span.updated_at = Utc::now();

            tx.execute(
                "UPDATE spans
                 SET t_end = ?1, title = ?2, summary_md = ?3, tags = ?4, updated_at = ?5
                 WHERE span_id = ?6",
                params![
                    span.t_end,
                    span.title,
                    span.summary_md,
                    serde_json::to_string(&span.tags)?,
                    format_datetime(&span.updated_at),
                    span_id,
                ],
            )
            .with_context(|| format!("failed to extend span {span_id}"))?;
            tx.commit()?;
            Ok(span)
        })
        .await
    }

    /// Fixes `t_end`. Closing an already closed span is an error.
    pub async fn close_span(&self, span_id: &str, t_end: i64) -> Result<Span> {
        let span_id = span_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let Some(mut span) = load_span(&tx, &span_id)? else {
                bail!("span {span_id} not found");
            };
            if span.closed {
                bail!("span {span_id} is already closed");
            }
            if t_end < span.t_start {
                bail!("span {span_id} cannot end before it starts");
            }
            if let Some(existing) = find_overlap(&tx, &span.kind, span.monitor_id, span.t_start, t_end, &span_id)? {
                return Err(overlap_error(&span_id, existing, &span.kind));
            }

            span.t_end = t_end;
            span.closed = true;
            span.updated_at = Utc::now();
            tx.execute(
                "UPDATE spans SET t_end = ?1, closed = 1, updated_at = ?2 WHERE span_id = ?3",
                params![span.t_end, format_datetime(&span.updated_at), span_id],
            )
            .with_context(|| format!("failed to close span {span_id}"))?;
            tx.commit()?;
            Ok(span)
        })
        .await
    }

    pub async fn get_span(&self, span_id: &str) -> Result<Option<Span>> {
        let span_id = span_id.to_string();
        self.execute(move |conn| load_span(conn, &span_id)).await
    }

    /// Spans overlapping `[from_ts, to_ts)`, ordered by start time.
    pub async fn spans_in_range(
        &self,
        from_ts: i64,
        to_ts: i64,
        kind: Option<&str>,
        monitor_id: Option<u32>,
    ) -> Result<Vec<Span>> {
        let kind = kind.map(str::to_string);
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SPAN_COLUMNS} FROM spans
                 WHERE t_start < ?1 AND MAX(t_end, t_start + 1) > ?2
                   AND (?3 IS NULL OR kind = ?3)
                   AND (?4 IS NULL OR monitor_id = ?4)
                 ORDER BY t_start, span_id"
            ))?;
            let mut rows = stmt.query(params![to_ts, from_ts, kind, monitor_id])?;
            let mut spans = Vec::new();
            while let Some(row) = rows.next()? {
                spans.push(row_to_span(row)?);
            }
            Ok(spans)
        })
        .await
    }

    pub async fn count_spans(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM spans", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}
