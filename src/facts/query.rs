use std::collections::BTreeSet;

use anyhow::{anyhow, Result};

use crate::models::{EventRecord, FrameId, FrameRecord, OcrRecord, OcrStatus, SceneChange};

use super::format::FactTable;
use super::store::{read_batch, read_header, FactStore};

/// Splits a `"{monitor}:{ts_ns}"` frame id.
pub fn parse_frame_id(id: &FrameId) -> Result<(u32, i64)> {
    let (monitor, ts) = id
        .as_str()
        .split_once(':')
        .ok_or_else(|| anyhow!("malformed frame id '{id}'"))?;
    Ok((monitor.parse()?, ts.parse()?))
}

impl FactStore {
    pub fn frames_in_range(&self, monitor_id: Option<u32>, from_ts: i64, to_ts: i64) -> Result<Vec<FrameRecord>> {
        self.scan(monitor_id, from_ts, to_ts)
    }

    pub fn scene_changes_in_range(
        &self,
        monitor_id: Option<u32>,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<SceneChange>> {
        self.scan(monitor_id, from_ts, to_ts)
    }

    pub fn events_in_range(&self, monitor_id: Option<u32>, from_ts: i64, to_ts: i64) -> Result<Vec<EventRecord>> {
        self.scan(monitor_id, from_ts, to_ts)
    }

    pub fn ocr_in_range(&self, monitor_id: Option<u32>, from_ts: i64, to_ts: i64) -> Result<Vec<OcrRecord>> {
        self.scan(monitor_id, from_ts, to_ts)
    }

    pub fn ocr_for_frame(&self, frame_id: &FrameId) -> Result<Vec<OcrRecord>> {
        let (monitor_id, ts_ns) = parse_frame_id(frame_id)?;
        let rows: Vec<OcrRecord> = self.scan(Some(monitor_id), ts_ns, ts_ns.saturating_add(1))?;
        Ok(rows.into_iter().filter(|r| &r.frame_id == frame_id).collect())
    }

    pub fn frame(&self, frame_id: &FrameId) -> Result<Option<FrameRecord>> {
        let (monitor_id, ts_ns) = parse_frame_id(frame_id)?;
        let rows = self.frames_in_range(Some(monitor_id), ts_ns, ts_ns.saturating_add(1))?;
        Ok(rows.into_iter().find(|r| &r.frame_id == frame_id))
    }

    /// Most recent frame of a monitor, optionally restricted to one OCR status
    /// and to frames strictly before `before_ts`.
    pub fn latest_frame(
        &self,
        monitor_id: u32,
        status: Option<OcrStatus>,
        before_ts: Option<i64>,
    ) -> Result<Option<FrameRecord>> {
        self.latest_frame_excluding(monitor_id, status, before_ts, &BTreeSet::new())
    }

    /// `latest_frame`, ignoring frames written by the segments in `skip`.
    pub fn latest_frame_excluding(
        &self,
        monitor_id: u32,
        status: Option<OcrStatus>,
        before_ts: Option<i64>,
        skip: &BTreeSet<String>,
    ) -> Result<Option<FrameRecord>> {
        let before_ts = before_ts.unwrap_or(i64::MAX);
        let mut headers = Vec::new();
        for path in self.list_batches(FactTable::Frames, Some(monitor_id))? {
            let header = read_header(&path)?;
            if header.rows > 0 && header.min_ts < before_ts {
                headers.push((header.max_ts, path));
            }
        }
        headers.sort_by(|a, b| b.0.cmp(&a.0));

        let mut best: Option<FrameRecord> = None;
        for (max_ts, path) in headers {
            if best.as_ref().is_some_and(|b| b.ts_ns >= max_ts) {
                break;
            }
            let (_, rows) = read_batch::<FrameRecord>(&path)?;
            let candidate = rows
                .into_iter()
                .filter(|r| {
                    r.ts_ns < before_ts
                        && status.map_or(true, |s| r.ocr_status == s)
                        && !skip.contains(&r.segment_id)
                })
                .max_by_key(|r| r.ts_ns);
            if let Some(candidate) = candidate {
                if best.as_ref().map_or(true, |b| candidate.ts_ns > b.ts_ns) {
                    best = Some(candidate);
                }
            }
        }
        Ok(best)
    }

    /// Monitors that have at least one frame batch.
    pub fn monitors(&self) -> Result<Vec<u32>> {
        let mut monitors = Vec::new();
        for path in self.list_batches(FactTable::Frames, None)? {
            let header = read_header(&path)?;
            if !monitors.contains(&header.monitor_id) {
                monitors.push(header.monitor_id);
            }
        }
        monitors.sort_unstable();
        Ok(monitors)
    }
}
