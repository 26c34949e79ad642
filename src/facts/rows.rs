use anyhow::Result;

use crate::models::{
    ChangeType, EventRecord, EventType, FrameId, FrameRecord, OcrRecord, OcrStatus, RegionGeometry, RegionId,
    SceneChange,
};

use super::format::{Column, ColumnSet, FactTable};

/// A record type stored column-wise in one fact table.
pub trait FactRow: Sized + Clone + Send + 'static {
    const TABLE: FactTable;

    fn ts_ns(&self) -> i64;
    fn monitor_id(&self) -> u32;
    fn to_columns(rows: &[Self]) -> Result<ColumnSet>;
    fn from_columns(columns: ColumnSet) -> Result<Vec<Self>>;
}

fn ids(values: Vec<String>) -> impl Iterator<Item = FrameId> {
    values.into_iter().map(FrameId)
}

impl FactRow for FrameRecord {
    const TABLE: FactTable = FactTable::Frames;

    fn ts_ns(&self) -> i64 {
        self.ts_ns
    }

    fn monitor_id(&self) -> u32 {
        self.monitor_id
    }

    fn to_columns(rows: &[Self]) -> Result<ColumnSet> {
        let mut set = ColumnSet::new(rows.len());
        set.push("frame_id", Column::Str(rows.iter().map(|r| r.frame_id.0.clone()).collect()))?;
        set.push("ts_ns", Column::I64(rows.iter().map(|r| r.ts_ns).collect()))?;
        set.push("monitor_id", Column::U64(rows.iter().map(|r| u64::from(r.monitor_id)).collect()))?;
        set.push("segment_id", Column::Str(rows.iter().map(|r| r.segment_id.clone()).collect()))?;
        set.push("path", Column::Str(rows.iter().map(|r| r.path.clone()).collect()))?;
        set.push("phash16", Column::Str(rows.iter().map(FrameRecord::phash16).collect()))?;
        set.push("entropy", Column::f64s(rows.iter().map(|r| r.entropy)))?;
        set.push("width", Column::U64(rows.iter().map(|r| u64::from(r.width)).collect()))?;
        set.push("height", Column::U64(rows.iter().map(|r| u64::from(r.height)).collect()))?;
        set.push("app_name", Column::Str(rows.iter().map(|r| r.app_name.clone()).collect()))?;
        set.push("win_title", Column::Str(rows.iter().map(|r| r.window_title.clone()).collect()))?;
        set.push(
            "ocr_status",
            Column::Str(rows.iter().map(|r| r.ocr_status.as_str().to_string()).collect()),
        )?;
        Ok(set)
    }

    fn from_columns(mut c: ColumnSet) -> Result<Vec<Self>> {
        let frame_id = c.take_str("frame_id")?;
        let ts_ns = c.take_i64("ts_ns")?;
        let monitor_id = c.take_u32("monitor_id")?;
        let segment_id = c.take_str("segment_id")?;
        let path = c.take_str("path")?;
        let phash16 = c.take_str("phash16")?;
        let entropy = c.take_f64("entropy")?;
        let width = c.take_u32("width")?;
        let height = c.take_u32("height")?;
        let app_name = c.take_str("app_name")?;
        let win_title = c.take_str("win_title")?;
        let ocr_status = c.take_str("ocr_status")?;

        let mut rows = Vec::with_capacity(c.rows());
        for i in 0..c.rows() {
            rows.push(FrameRecord {
                frame_id: FrameId(frame_id[i].clone()),
                ts_ns: ts_ns[i],
                monitor_id: monitor_id[i],
                segment_id: segment_id[i].clone(),
                path: path[i].clone(),
                phash: FrameRecord::parse_phash16(&phash16[i])?,
                entropy: entropy[i],
                width: width[i],
                height: height[i],
                app_name: app_name[i].clone(),
                window_title: win_title[i].clone(),
                ocr_status: OcrStatus::parse(&ocr_status[i])?,
            });
        }
        Ok(rows)
    }
}

impl FactRow for SceneChange {
    const TABLE: FactTable = FactTable::SceneChanges;

    fn ts_ns(&self) -> i64 {
        self.ts_ns
    }

    fn monitor_id(&self) -> u32 {
        self.monitor_id
    }

    fn to_columns(rows: &[Self]) -> Result<ColumnSet> {
        let mut set = ColumnSet::new(rows.len());
        set.push(
            "from_frame_id",
            Column::OptStr(rows.iter().map(|r| r.from_frame_id.as_ref().map(|id| id.0.clone())).collect()),
        )?;
        set.push("to_frame_id", Column::Str(rows.iter().map(|r| r.to_frame_id.0.clone()).collect()))?;
        set.push("ts_ns", Column::I64(rows.iter().map(|r| r.ts_ns).collect()))?;
        set.push("monitor_id", Column::U64(rows.iter().map(|r| u64::from(r.monitor_id)).collect()))?;
        set.push("ssim", Column::f64s(rows.iter().map(|r| r.ssim)))?;
        set.push(
            "phash_distance",
            Column::U64(rows.iter().map(|r| u64::from(r.phash_distance)).collect()),
        )?;
        set.push("entropy_delta", Column::f64s(rows.iter().map(|r| r.entropy_delta)))?;
        set.push(
            "change_type",
            Column::Str(rows.iter().map(|r| r.change_type.as_str().to_string()).collect()),
        )?;
        set.push("confidence", Column::f64s(rows.iter().map(|r| r.confidence)))?;
        Ok(set)
    }

    fn from_columns(mut c: ColumnSet) -> Result<Vec<Self>> {
        let from = c.take_opt_str("from_frame_id")?;
        let to = c.take_str("to_frame_id")?;
        let ts_ns = c.take_i64("ts_ns")?;
        let monitor_id = c.take_u32("monitor_id")?;
        let ssim = c.take_f64("ssim")?;
        let distance = c.take_u32("phash_distance")?;
        let entropy_delta = c.take_f64("entropy_delta")?;
        let change_type = c.take_str("change_type")?;
        let confidence = c.take_f64("confidence")?;

        let mut rows = Vec::with_capacity(c.rows());
        for i in 0..c.rows() {
            rows.push(SceneChange {
                from_frame_id: from[i].clone().map(FrameId),
                to_frame_id: FrameId(to[i].clone()),
                ts_ns: ts_ns[i],
                monitor_id: monitor_id[i],
                ssim: ssim[i],
                phash_distance: distance[i],
                entropy_delta: entropy_delta[i],
                change_type: ChangeType::parse(&change_type[i])?,
                confidence: confidence[i],
            });
        }
        Ok(rows)
    }
}

impl FactRow for OcrRecord {
    const TABLE: FactTable = FactTable::Ocr;

    fn ts_ns(&self) -> i64 {
        self.ts_ns
    }

    fn monitor_id(&self) -> u32 {
        self.monitor_id
    }

    fn to_columns(rows: &[Self]) -> Result<ColumnSet> {
        let mut set = ColumnSet::new(rows.len());
        set.push("frame_id", Column::Str(rows.iter().map(|r| r.frame_id.0.clone()).collect()))?;
        set.push("ts_ns", Column::I64(rows.iter().map(|r| r.ts_ns).collect()))?;
        set.push("monitor_id", Column::U64(rows.iter().map(|r| u64::from(r.monitor_id)).collect()))?;
        set.push("region_id", Column::Str(rows.iter().map(|r| r.region_id.0.clone()).collect()))?;
        set.push("roi", Column::Str(rows.iter().map(|r| r.roi.to_roi()).collect()))?;
        set.push("text", Column::Str(rows.iter().map(|r| r.text.clone()).collect()))?;
        set.push("language", Column::Str(rows.iter().map(|r| r.language.clone()).collect()))?;
        set.push("confidence", Column::f64s(rows.iter().map(|r| r.confidence)))?;
        set.push("pii_filtered", Column::Bool(rows.iter().map(|r| r.pii_filtered).collect()))?;
        Ok(set)
    }

    fn from_columns(mut c: ColumnSet) -> Result<Vec<Self>> {
        let frame_id = c.take_str("frame_id")?;
        let ts_ns = c.take_i64("ts_ns")?;
        let monitor_id = c.take_u32("monitor_id")?;
        let region_id = c.take_str("region_id")?;
        let roi = c.take_str("roi")?;
        let text = c.take_str("text")?;
        let language = c.take_str("language")?;
        let confidence = c.take_f64("confidence")?;
        let pii_filtered = c.take_bool("pii_filtered")?;

        let mut rows = Vec::with_capacity(c.rows());
        for i in 0..c.rows() {
            let roi = RegionGeometry::parse_roi(&roi[i])
                .ok_or_else(|| anyhow::anyhow!("invalid roi '{}'", roi[i]))?;
            rows.push(OcrRecord {
                frame_id: FrameId(frame_id[i].clone()),
                ts_ns: ts_ns[i],
                monitor_id: monitor_id[i],
                region_id: RegionId(region_id[i].clone()),
                roi,
                text: text[i].clone(),
                language: language[i].clone(),
                confidence: confidence[i],
                pii_filtered: pii_filtered[i],
            });
        }
        Ok(rows)
    }
}

impl FactRow for EventRecord {
    const TABLE: FactTable = FactTable::Events;

    fn ts_ns(&self) -> i64 {
        self.ts_ns
    }

    fn monitor_id(&self) -> u32 {
        self.monitor_id
    }

    fn to_columns(rows: &[Self]) -> Result<ColumnSet> {
        let mut set = ColumnSet::new(rows.len());
        set.push("event_id", Column::Str(rows.iter().map(|r| r.event_id.clone()).collect()))?;
        set.push("ts_ns", Column::I64(rows.iter().map(|r| r.ts_ns).collect()))?;
        set.push("monitor_id", Column::U64(rows.iter().map(|r| u64::from(r.monitor_id)).collect()))?;
        set.push(
            "type",
            Column::Str(rows.iter().map(|r| r.event_type.as_str().to_string()).collect()),
        )?;
        set.push("target", Column::Str(rows.iter().map(|r| r.target.clone()).collect()))?;
        set.push("value_from", Column::OptStr(rows.iter().map(|r| r.value_from.clone()).collect()))?;
        set.push("value_to", Column::OptStr(rows.iter().map(|r| r.value_to.clone()).collect()))?;
        set.push("confidence", Column::f64s(rows.iter().map(|r| r.confidence)))?;
        set.push(
            "evidence_frames",
            Column::StrList(
                rows.iter()
                    .map(|r| r.evidence_frames.iter().map(|id| id.0.clone()).collect())
                    .collect(),
            ),
        )?;
        Ok(set)
    }

    fn from_columns(mut c: ColumnSet) -> Result<Vec<Self>> {
        let event_id = c.take_str("event_id")?;
        let ts_ns = c.take_i64("ts_ns")?;
        let monitor_id = c.take_u32("monitor_id")?;
        let event_type = c.take_str("type")?;
        let target = c.take_str("target")?;
        let value_from = c.take_opt_str("value_from")?;
        let value_to = c.take_opt_str("value_to")?;
        let confidence = c.take_f64("confidence")?;
        let evidence = c.take_str_list("evidence_frames")?;

        let mut rows = Vec::with_capacity(c.rows());
        for i in 0..c.rows() {
            // Built field by field: `EventRecord::new` would re-derive the id
            // and re-clamp the confidence.
            rows.push(EventRecord {
                event_id: event_id[i].clone(),
                ts_ns: ts_ns[i],
                monitor_id: monitor_id[i],
                event_type: EventType::parse(&event_type[i])?,
                target: target[i].clone(),
                value_from: value_from[i].clone(),
                value_to: value_to[i].clone(),
                confidence: confidence[i],
                evidence_frames: ids(evidence[i].clone()).collect(),
            });
        }
        Ok(rows)
    }
}
