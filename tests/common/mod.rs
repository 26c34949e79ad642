#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use image::{DynamicImage, GrayImage, Luma};

use screentrail_lib::db::SegmentLogEntry;
use screentrail_lib::error::PipelineError;
use screentrail_lib::extract::{collect_stills, FrameSource};
use screentrail_lib::models::{
    FrameId, OcrFieldInput, RegionGeometry, SampledFrame, SegmentDescriptor, SegmentState, WindowContext,
};
use screentrail_lib::pipeline::OcrEngine;
use screentrail_lib::settings::{PipelineSettings, SettingsStore};
use screentrail_lib::Screentrail;

pub const SEC: i64 = 1_000_000_000;
/// 2023-11-14T22:13:20Z
pub const BASE_TS: i64 = 1_700_000_000 * SEC;

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 200;

#[derive(Debug, Clone, Copy)]
pub enum Screen {
    Flat(u8),
    /// Coarse blocks of distinct grey levels; far from any flat screen.
    Blocks(u32),
    Broken,
}

impl Screen {
    fn write(&self, path: &Path) {
        match self {
            Screen::Flat(level) => {
                let img = GrayImage::from_pixel(WIDTH, HEIGHT, Luma([*level]));
                DynamicImage::ImageLuma8(img).save(path).unwrap();
            }
            Screen::Blocks(seed) => {
                let seed = *seed;
                let img = GrayImage::from_fn(WIDTH, HEIGHT, move |x, y| {
                    let (bx, by) = (x / 40, y / 40);
                    Luma([((bx * 37 + by * 91 + seed * 53) % 256) as u8])
                });
                DynamicImage::ImageLuma8(img).save(path).unwrap();
            }
            Screen::Broken => std::fs::write(path, b"not a png").unwrap(),
        }
    }
}

/// Frame source that writes scripted stills instead of decoding video.
#[derive(Default)]
pub struct ScriptedSource {
    screens: Mutex<HashMap<String, Vec<Screen>>>,
}

impl ScriptedSource {
    pub fn script(&self, segment_id: &str, screens: Vec<Screen>) {
        self.screens.lock().unwrap().insert(segment_id.to_string(), screens);
    }
}

impl FrameSource for ScriptedSource {
    fn sample(
        &self,
        segment: &SegmentDescriptor,
        fps: f64,
        out_dir: &Path,
    ) -> Result<Vec<SampledFrame>, PipelineError> {
        let screens = self
            .screens
            .lock()
            .unwrap()
            .get(&segment.segment_id)
            .cloned()
            .ok_or_else(|| PipelineError::decode(&segment.file_path, "no script"))?;
        for (index, screen) in screens.iter().enumerate() {
            screen.write(&out_dir.join(format!("{:06}.png", index + 1)));
        }
        collect_stills(out_dir, segment, fps)
    }
}

/// OCR engine answering from a per-frame script. Unscripted frames have no
/// text. Frames listed as gated block until `open_gate` is called.
#[derive(Default)]
pub struct ScriptedOcr {
    fields: Mutex<HashMap<FrameId, Vec<OcrFieldInput>>>,
    slow: Mutex<HashMap<FrameId, Duration>>,
    gated: Mutex<HashSet<FrameId>>,
    gate_open: AtomicBool,
}

impl ScriptedOcr {
    pub fn answer(&self, frame_id: FrameId, fields: Vec<OcrFieldInput>) {
        self.fields.lock().unwrap().insert(frame_id, fields);
    }

    pub fn delay(&self, frame_id: FrameId, delay: Duration) {
        self.slow.lock().unwrap().insert(frame_id, delay);
    }

    pub fn gate(&self, frame_id: FrameId) {
        self.gated.lock().unwrap().insert(frame_id);
    }

    pub fn open_gate(&self) {
        self.gate_open.store(true, Ordering::SeqCst);
    }
}

impl OcrEngine for ScriptedOcr {
    fn recognize(&self, frame_id: &FrameId, image_path: &Path) -> Result<Vec<OcrFieldInput>> {
        if !image_path.exists() {
            bail!("still {} vanished", image_path.display());
        }
        if self.gated.lock().unwrap().contains(frame_id) {
            while !self.gate_open.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        let delay = self.slow.lock().unwrap().get(frame_id).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(self.fields.lock().unwrap().get(frame_id).cloned().unwrap_or_default())
    }
}

pub fn field(x: u32, y: u32, w: u32, h: u32, text: &str, confidence: f64) -> OcrFieldInput {
    OcrFieldInput {
        geometry: RegionGeometry::new(x, y, w, h),
        text: text.to_string(),
        language: "en".to_string(),
        confidence,
        pii_filtered: false,
    }
}

/// Segment of `seconds` length; at 1 fps its stills land on whole seconds.
pub fn segment(id: &str, monitor_id: u32, t_start: i64, seconds: i64) -> SegmentDescriptor {
    SegmentDescriptor {
        segment_id: id.to_string(),
        monitor_id,
        file_path: format!("/videos/{id}.mp4").into(),
        t_start,
        t_end: t_start + seconds * SEC,
        codec: "h264/yuv420p".to_string(),
        window: None,
    }
}

pub fn with_window(mut segment: SegmentDescriptor, app: &str, title: &str) -> SegmentDescriptor {
    segment.window = Some(WindowContext {
        app_name: app.to_string(),
        window_title: title.to_string(),
    });
    segment
}

pub fn test_settings() -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.extraction_fps = 1.0;
    settings.worker_pool_size = 2;
    settings.ocr_timeout_ms = 2_000;
    settings.retention_interval_secs = 24 * 60 * 60;
    settings.storage_retry.base_delay_ms = 1;
    settings.storage_retry.max_delay_ms = 5;
    settings
}

pub struct Harness {
    pub app: Screentrail,
    pub source: Arc<ScriptedSource>,
    pub ocr: Arc<ScriptedOcr>,
}

pub async fn open(dir: &Path, settings: PipelineSettings) -> Harness {
    let source = Arc::new(ScriptedSource::default());
    let ocr = Arc::new(ScriptedOcr::default());
    let app = Screentrail::open_with_settings(
        dir,
        SettingsStore::ephemeral(settings).unwrap(),
        Arc::clone(&source) as Arc<dyn FrameSource>,
        Arc::clone(&ocr) as Arc<dyn OcrEngine>,
    )
    .await
    .unwrap();
    Harness { app, source, ocr }
}

pub async fn wait_for_state(app: &Screentrail, segment_id: &str, state: SegmentState) -> SegmentLogEntry {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let entry = app.db().get_segment(segment_id).await.unwrap();
        if let Some(entry) = entry {
            if entry.state == state {
                return entry;
            }
            assert!(
                !entry.state.is_terminal(),
                "segment {segment_id} ended as {:?}, expected {:?}: {:?}",
                entry.state,
                state,
                entry.error
            );
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "segment {segment_id} never reached {state:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Metrics are recorded just after the terminal transition.
pub async fn wait_for_finished(app: &Screentrail, segments: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while app.metrics().counters().await.segments_finished < segments {
        assert!(tokio::time::Instant::now() < deadline, "metrics never caught up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
