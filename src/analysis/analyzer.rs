use std::collections::BTreeMap;

use anyhow::Result;
use image::GrayImage;

use crate::models::{EventRecord, EventType, FrameId, FrameRecord, OcrFieldInput, OcrRecord, RegionGeometry, RegionId};
use crate::settings::AnalyzerSettings;

use super::banner::{BannerCandidate, BannerMatcher};
use super::region::{assign_region_ids, set_similarity};
use super::text::{normalize, similarity};

/// Last observation of one screen region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionState {
    pub geometry: RegionGeometry,
    pub text: String,
    pub confidence: f64,
    pub last_seen: FrameId,
    /// Retained frames since `last_seen` in which the region was absent.
    pub gap_frames: Vec<FrameId>,
}

#[derive(Debug, Clone)]
struct PreviousFrame {
    frame_id: FrameId,
    window_title: String,
}

/// One retained frame together with its OCR fields.
pub struct FrameInput<'a> {
    pub frame: &'a FrameRecord,
    pub fields: &'a [OcrFieldInput],
    pub luma: Option<&'a GrayImage>,
}

#[derive(Debug, Clone, Default)]
pub struct FrameAnalysis {
    pub ocr: Vec<OcrRecord>,
    pub events: Vec<EventRecord>,
}

/// Window-level identifier of a frame: the app name, or the monitor when the
/// recorder supplied no window context.
pub fn window_target(frame: &FrameRecord) -> String {
    if frame.app_name.is_empty() {
        format!("monitor:{}", frame.monitor_id)
    } else {
        frame.app_name.clone()
    }
}

/// Per-monitor OCR delta analyzer. Owned by exactly one lane.
pub struct DeltaAnalyzer {
    monitor_id: u32,
    settings: AnalyzerSettings,
    banner: BannerMatcher,
    regions: BTreeMap<RegionId, RegionState>,
    previous: Option<PreviousFrame>,
}

impl DeltaAnalyzer {
    pub fn new(monitor_id: u32, settings: AnalyzerSettings) -> Result<Self> {
        Ok(Self {
            monitor_id,
            settings,
            banner: BannerMatcher::new()?,
            regions: BTreeMap::new(),
            previous: None,
        })
    }

    /// Rebuilds lane state from the most recent persisted frame and its OCR rows.
    pub fn restore(
        monitor_id: u32,
        settings: AnalyzerSettings,
        frame: &FrameRecord,
        rows: &[OcrRecord],
    ) -> Result<Self> {
        let mut analyzer = Self::new(monitor_id, settings)?;
        for row in rows.iter().filter(|r| r.frame_id == frame.frame_id) {
            analyzer.regions.insert(
                row.region_id.clone(),
                RegionState {
                    geometry: row.roi,
                    text: row.text.clone(),
                    confidence: row.confidence,
                    last_seen: frame.frame_id.clone(),
                    gap_frames: Vec::new(),
                },
            );
        }
        analyzer.previous = Some(PreviousFrame {
            frame_id: frame.frame_id.clone(),
            window_title: frame.window_title.clone(),
        });
        Ok(analyzer)
    }

    pub fn monitor_id(&self) -> u32 {
        self.monitor_id
    }

    pub fn set_settings(&mut self, settings: AnalyzerSettings) {
        self.settings = settings;
    }

    pub fn region(&self, id: &RegionId) -> Option<&RegionState> {
        self.regions.get(id)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn observe(&mut self, input: FrameInput<'_>) -> FrameAnalysis {
        let frame = input.frame;
        let known: BTreeMap<RegionId, RegionGeometry> = self
            .regions
            .iter()
            .map(|(id, state)| (id.clone(), state.geometry))
            .collect();
        let assigned = assign_region_ids(
            input.fields,
            &known,
            self.settings.region_grid,
            self.settings.region_match_iou,
        );

        let ocr: Vec<OcrRecord> = assigned
            .iter()
            .map(|(id, field)| OcrRecord {
                frame_id: frame.frame_id.clone(),
                ts_ns: frame.ts_ns,
                monitor_id: frame.monitor_id,
                region_id: id.clone(),
                roi: field.geometry,
                text: field.text.clone(),
                language: field.language.clone(),
                confidence: field.confidence.clamp(0.0, 1.0),
                pii_filtered: field.pii_filtered,
            })
            .collect();
        let current: BTreeMap<&RegionId, &OcrRecord> = ocr.iter().map(|r| (&r.region_id, r)).collect();

        let mut events = Vec::new();
        let navigated = match &self.previous {
            Some(previous) => {
                let jaccard = set_similarity(self.regions.keys(), current.keys().copied());
                if jaccard < self.settings.navigation_threshold {
                    events.push(self.navigation(previous, frame, &current, jaccard));
                    true
                } else {
                    events.extend(self.field_changes(frame, &current));
                    false
                }
            }
            None => false,
        };
        events.extend(self.banners(&input, &current));

        self.advance(frame, &current, navigated);

        events.sort_by(|a, b| {
            (a.event_type, &a.target, &a.event_id).cmp(&(b.event_type, &b.target, &b.event_id))
        });
        FrameAnalysis { ocr, events }
    }

    fn navigation(
        &self,
        previous: &PreviousFrame,
        frame: &FrameRecord,
        current: &BTreeMap<&RegionId, &OcrRecord>,
        jaccard: f64,
    ) -> EventRecord {
        let removed = self
            .regions
            .iter()
            .filter(|(id, _)| !current.contains_key(id))
            .map(|(_, state)| state.confidence);
        let added = current
            .iter()
            .filter(|(id, _)| !self.regions.contains_key(**id))
            .map(|(_, record)| record.confidence);
        let weakest = removed.chain(added).fold(1.0, f64::min);
        let classification = 1.0 - jaccard;

        EventRecord::new(
            frame.ts_ns,
            frame.monitor_id,
            EventType::Navigation,
            window_target(frame),
            non_empty(&previous.window_title),
            non_empty(&frame.window_title),
            classification * weakest,
            vec![previous.frame_id.clone(), frame.frame_id.clone()],
        )
    }

    fn field_changes(
        &self,
        frame: &FrameRecord,
        current: &BTreeMap<&RegionId, &OcrRecord>,
    ) -> Vec<EventRecord> {
        let mut events = Vec::new();
        for (id, record) in current {
            let Some(state) = self.regions.get(*id) else {
                continue;
            };
            let before = normalize(&state.text);
            let after = normalize(&record.text);
            if before == after {
                continue;
            }

            let classification = 1.0 - self.settings.similarity_penalty * similarity(&before, &after);
            let geometric = (state.confidence * record.confidence).sqrt();
            let weakest = state.confidence.min(record.confidence);
            let confidence = (geometric * classification).min(weakest * classification);

            let mut evidence = Vec::with_capacity(state.gap_frames.len() + 2);
            evidence.push(state.last_seen.clone());
            evidence.extend(state.gap_frames.iter().cloned());
            evidence.push(frame.frame_id.clone());

            events.push(EventRecord::new(
                frame.ts_ns,
                frame.monitor_id,
                EventType::FieldChange,
                id.as_str(),
                Some(state.text.clone()),
                Some(record.text.clone()),
                confidence,
                evidence,
            ));
        }
        events
    }

    /// Banners are only considered for regions that appeared or whose text
    /// changed in this frame.
    fn banners(&self, input: &FrameInput<'_>, current: &BTreeMap<&RegionId, &OcrRecord>) -> Vec<EventRecord> {
        let frame = input.frame;
        let mut events = Vec::new();
        for (id, record) in current {
            let prior = self.regions.get(*id);
            if prior.is_some_and(|state| normalize(&state.text) == normalize(&record.text)) {
                continue;
            }

            let candidate = BannerCandidate {
                text: &record.text,
                geometry: &record.roi,
                frame_width: frame.width,
                frame_height: frame.height,
                luma: input.luma,
                is_new: prior.is_none(),
            };
            let Some(strength) = self.banner.strength(&candidate) else {
                continue;
            };
            if strength < self.settings.banner_min_strength {
                continue;
            }

            let weakest = prior.map_or(record.confidence, |state| state.confidence.min(record.confidence));
            let mut evidence = Vec::with_capacity(2);
            match (prior, &self.previous) {
                (Some(state), _) => evidence.push(state.last_seen.clone()),
                (None, Some(previous)) => evidence.push(previous.frame_id.clone()),
                (None, None) => {}
            }
            evidence.push(frame.frame_id.clone());

            events.push(EventRecord::new(
                frame.ts_ns,
                frame.monitor_id,
                EventType::ErrorBanner,
                id.as_str(),
                prior.map(|state| state.text.clone()),
                Some(record.text.clone()),
                weakest * strength,
                evidence,
            ));
        }
        events
    }

    fn advance(&mut self, frame: &FrameRecord, current: &BTreeMap<&RegionId, &OcrRecord>, navigated: bool) {
        if navigated {
            self.regions.clear();
        } else {
            let gap_limit = self.settings.region_gap_limit;
            self.regions.retain(|id, state| {
                if current.contains_key(id) {
                    return true;
                }
                state.gap_frames.push(frame.frame_id.clone());
                state.gap_frames.len() <= gap_limit
            });
        }

        for (id, record) in current {
            self.regions.insert(
                (*id).clone(),
                RegionState {
                    geometry: record.roi,
                    text: record.text.clone(),
                    confidence: record.confidence,
                    last_seen: frame.frame_id.clone(),
                    gap_frames: Vec::new(),
                },
            );
        }

        self.previous = Some(PreviousFrame {
            frame_id: frame.frame_id.clone(),
            window_title: frame.window_title.clone(),
        });
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
