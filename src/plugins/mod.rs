//! App-specific parsing over persisted OCR. Parsers run after the fact and
//! never feed back into the pipeline.

pub mod url;

pub use url::UrlParser;

use std::collections::BTreeMap;

use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::facts::FactStore;
use crate::models::{FrameId, FrameRecord, OcrRecord, RegionId};

/// A structured value read out of a frame's OCR text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParsedField {
    pub parser: String,
    pub frame_id: FrameId,
    pub ts_ns: i64,
    pub region_id: Option<RegionId>,
    pub key: String,
    pub value: String,
    pub confidence: f64,
}

pub trait AppParser: Send + Sync {
    fn name(&self) -> &str;

    /// Whether frames of `app_name` are worth handing to `parse`.
    fn applies_to(&self, app_name: &str) -> bool;

    fn parse(&self, frame: &FrameRecord, ocr: &[OcrRecord]) -> Vec<ParsedField>;
}

#[derive(Default)]
pub struct PluginHost {
    parsers: Vec<Box<dyn AppParser>>,
}

impl PluginHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Result<Self> {
        let mut host = Self::new();
        host.register(Box::new(UrlParser::new()?));
        Ok(host)
    }

    pub fn register(&mut self, parser: Box<dyn AppParser>) {
        self.parsers.push(parser);
    }

    pub fn parser_names(&self) -> Vec<&str> {
        self.parsers.iter().map(|p| p.name()).collect()
    }

    /// Runs every applicable parser over the frames persisted in
    /// `[from_ts, to_ts)`, in frame order.
    pub fn parse_range(
        &self,
        facts: &FactStore,
        monitor_id: Option<u32>,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<ParsedField>> {
        if self.parsers.is_empty() {
            return Ok(Vec::new());
        }

        let frames = facts.frames_in_range(monitor_id, from_ts, to_ts)?;
        let mut by_frame: BTreeMap<FrameId, Vec<OcrRecord>> = BTreeMap::new();
        for row in facts.ocr_in_range(monitor_id, from_ts, to_ts)? {
            by_frame.entry(row.frame_id.clone()).or_default().push(row);
        }

        let mut parsed = Vec::new();
        for frame in &frames {
            let Some(rows) = by_frame.get(&frame.frame_id) else {
                continue;
            };
            for parser in self.parsers.iter().filter(|p| p.applies_to(&frame.app_name)) {
                parsed.extend(parser.parse(frame, rows));
            }
        }
        debug!(
            "Parsed {} field(s) from {} frame(s) in [{from_ts}, {to_ts})",
            parsed.len(),
            frames.len()
        );
        Ok(parsed)
    }
}
