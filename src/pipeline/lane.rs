use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::analysis::{cursor_action, nearest_frame, window_target, DeltaAnalyzer, FrameInput, JoinFrame};
use crate::db::Database;
use crate::detect::{ChangeDetector, Observation};
use crate::error::PipelineError;
use crate::extract::{load_still, FrameSource};
use crate::facts::FactStore;
use crate::metrics::{MetricsCollector, SegmentMetrics};
use crate::models::{
    CursorEvent, CursorKind, EventRecord, FrameId, FrameRecord, OcrRecord, OcrStatus, SampledFrame, SceneChange,
    SegmentDescriptor, SegmentState,
};
use crate::settings::PipelineSettings;

use super::ocr::{recognize_with_timeout, OcrEngine, OcrOutcome};
use super::pool::WorkerPool;
use super::queue::LaneQueue;
use super::retry::with_backoff;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_alert, log_debug, log_error, log_info, log_warn};

/// Clicks buffered ahead of the segment that will cover them.
const MAX_PENDING_CLICKS: usize = 4096;

/// Collaborators shared by every lane.
#[derive(Clone)]
pub struct LaneShared {
    pub facts: Arc<FactStore>,
    pub db: Database,
    pub source: Arc<dyn FrameSource>,
    pub ocr: Arc<dyn OcrEngine>,
    pub pool: Arc<WorkerPool>,
    pub metrics: MetricsCollector,
    pub settings_rx: watch::Receiver<Arc<PipelineSettings>>,
    pub pause_rx: watch::Receiver<bool>,
}

enum Abort {
    Paused,
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for Abort {
    fn from(err: anyhow::Error) -> Self {
        Abort::Failed(err)
    }
}

impl From<PipelineError> for Abort {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Paused => Abort::Paused,
            other => Abort::Failed(other.into()),
        }
    }
}

#[derive(Debug, Default)]
struct SegmentStats {
    sampled: u64,
    kept: u64,
    decode_errors: u64,
    ocr_timeouts: u64,
    events: u64,
    storage_attempts: u32,
}

struct KeptFrame {
    still: SampledFrame,
    observation: Observation,
}

#[derive(Default)]
struct Detection {
    decode_errors: u64,
    kept: Vec<KeptFrame>,
}

/// Everything one segment contributes to the fact store.
#[derive(Default)]
struct SegmentBatch {
    /// Scratch stills to copy into the store, keyed by frame timestamp.
    images: Vec<(i64, PathBuf)>,
    frames: Vec<FrameRecord>,
    scene_changes: Vec<SceneChange>,
    ocr: Vec<OcrRecord>,
    events: Vec<EventRecord>,
}

/// Ordered processing lane of one monitor. Owns the monitor's detector and
/// region map; nothing else touches them.
pub struct Lane {
    monitor_id: u32,
    shared: LaneShared,
    queue: Arc<LaneQueue>,
    detector: Option<ChangeDetector>,
    analyzer: Option<DeltaAnalyzer>,
    /// Last retained frame of the previous persisted segment, for clicks
    /// that land just before the next segment's first frame.
    last_join: Option<JoinFrame>,
    clicks: Vec<CursorEvent>,
    /// End of the last persisted segment. A segment starting before it is a
    /// replay and must not see state from its own future.
    last_end: Option<i64>,
    needs_restore: bool,
}

impl Lane {
    pub fn new(monitor_id: u32, shared: LaneShared, queue: Arc<LaneQueue>) -> Self {
        Self {
            monitor_id,
            shared,
            queue,
            detector: None,
            analyzer: None,
            last_join: None,
            clicks: Vec::new(),
            last_end: None,
            needs_restore: true,
        }
    }

    pub async fn run(mut self, mut cursor_rx: mpsc::Receiver<CursorEvent>, cancel_token: CancellationToken) {
        log_info!("lane {} started", self.monitor_id);
        let queue = Arc::clone(&self.queue);
        let mut pause_rx = self.shared.pause_rx.clone();
        let mut cursor_open = true;
        let mut pause_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    log_info!("lane {} cancelled", self.monitor_id);
                    break;
                }
                next = queue.pop() => {
                    let Some(segment) = next else {
                        log_info!("lane {} drained", self.monitor_id);
                        break;
                    };
                    // Clicks sent before the segment was submitted belong to it.
                    while let Ok(event) = cursor_rx.try_recv() {
                        self.accept_cursor(event);
                    }
                    self.handle(segment).await;
                }
                event = cursor_rx.recv(), if cursor_open => match event {
                    Some(event) => self.accept_cursor(event),
                    None => cursor_open = false,
                },
                changed = pause_rx.changed(), if pause_open => {
                    if changed.is_err() {
                        pause_open = false;
                        continue;
                    }
                    if *pause_rx.borrow_and_update() {
                        log_info!("lane {} paused; dropping buffered state", self.monitor_id);
                        self.discard_buffers();
                    }
                }
            }
        }
    }

    fn is_paused(&self) -> bool {
        *self.shared.pause_rx.borrow()
    }

    fn accept_cursor(&mut self, event: CursorEvent) {
        if event.kind != CursorKind::Click || self.is_paused() {
            return;
        }
        if self.clicks.len() >= MAX_PENDING_CLICKS {
            log_warn!(
                "lane {} has {} pending clicks; dropping the oldest",
                self.monitor_id,
                self.clicks.len()
            );
            self.clicks.remove(0);
        }
        self.clicks.push(event);
    }

    /// Drops lane-local state after a pause. Resume rebuilds from storage.
    fn discard_buffers(&mut self) {
        self.clicks.clear();
        self.detector = None;
        self.analyzer = None;
        self.last_join = None;
        self.needs_restore = true;
    }

    async fn handle(&mut self, segment: SegmentDescriptor) {
        let started = Instant::now();
        let mut stats = SegmentStats::default();

        let outcome = match self.process(&segment, &mut stats).await {
            Ok(()) => {
                log_debug!(
                    "segment {} persisted: {} kept of {} sampled, {} event(s)",
                    segment.segment_id,
                    stats.kept,
                    stats.sampled,
                    stats.events
                );
                SegmentState::Persisted
            }
            Err(Abort::Paused) => {
                log_info!("segment {} discarded by privacy pause", segment.segment_id);
                self.discard_buffers();
                self.mark(&segment, SegmentState::Discarded, None).await;
                SegmentState::Discarded
            }
            Err(Abort::Failed(err)) => {
                self.needs_restore = true;
                let storage = matches!(
                    err.downcast_ref::<PipelineError>(),
                    Some(PipelineError::StorageWrite { .. })
                );
                if storage {
                    log_alert!("segment {} failed: {:#}", segment.segment_id, err);
                } else {
                    log_error!("segment {} failed: {:#}", segment.segment_id, err);
                }
                self.mark(&segment, SegmentState::Failed, Some(format!("{err:#}"))).await;
                SegmentState::Failed
            }
        };

        self.shared
            .metrics
            .record_segment(SegmentMetrics {
                segment_id: segment.segment_id.clone(),
                monitor_id: segment.monitor_id,
                finished_at: Utc::now(),
                outcome,
                frames_sampled: stats.sampled,
                frames_kept: stats.kept,
                decode_errors: stats.decode_errors,
                ocr_timeouts: stats.ocr_timeouts,
                events: stats.events,
                storage_attempts: stats.storage_attempts,
                total_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            })
            .await;
    }

    async fn mark(&self, segment: &SegmentDescriptor, state: SegmentState, error: Option<String>) {
        if let Err(err) = self.shared.db.transition_segment(&segment.segment_id, state, error).await {
            log_error!(
                "failed to record segment {} as {}: {err:?}",
                segment.segment_id,
                state.as_str()
            );
        }
    }

    async fn advance(&self, segment: &SegmentDescriptor, state: SegmentState) -> Result<(), Abort> {
        if self.is_paused() {
            return Err(Abort::Paused);
        }
        self.shared
            .db
            .transition_segment(&segment.segment_id, state, None)
            .await?;
        Ok(())
    }

    async fn process(&mut self, segment: &SegmentDescriptor, stats: &mut SegmentStats) -> Result<(), Abort> {
        let _permit = self.shared.pool.acquire().await?;
        let settings = self.shared.settings_rx.borrow().clone();

        if self.last_end.is_some_and(|end| segment.t_start < end) {
            log_info!("segment {} replays earlier input; rebuilding lane {}", segment.segment_id, self.monitor_id);
            self.needs_restore = true;
        }
        if self.needs_restore {
            self.restore(segment, &settings).await?;
        }
        if let Some(detector) = self.detector.as_mut() {
            detector.set_settings(settings.detector.clone());
        }
        if let Some(analyzer) = self.analyzer.as_mut() {
            analyzer.set_settings(settings.analyzer.clone());
        }

        self.advance(segment, SegmentState::Extracting).await?;
        let scratch = tempfile::Builder::new()
            .prefix("screentrail-")
            .tempdir()
            .context("failed to create scratch directory")?;
        let stills = self.extract(segment, settings.extraction_fps, scratch.path()).await?;
        stats.sampled = stills.len() as u64;

        self.advance(segment, SegmentState::Detecting).await?;
        let detection = self.detect(stills).await?;
        stats.decode_errors = detection.decode_errors;
        stats.kept = detection.kept.len() as u64;

        self.advance(segment, SegmentState::AwaitingOcr).await?;
        let timeout = Duration::from_millis(settings.ocr_timeout_ms);
        let recognized = self.recognize(detection.kept, timeout, stats).await?;

        self.advance(segment, SegmentState::Analyzing).await?;
        let (batch, next_join) = self.analyze(segment, recognized, &settings).await?;
        stats.events = batch.events.len() as u64;

        if self.is_paused() {
            return Err(Abort::Paused);
        }
        stats.storage_attempts = self.persist(segment, batch, &settings).await?;
        self.shared
            .db
            .transition_segment(&segment.segment_id, SegmentState::Persisted, None)
            .await?;

        if next_join.is_some() {
            self.last_join = next_join;
        }
        self.last_end = Some(segment.t_end);
        drop(scratch);
        Ok(())
    }

    /// Rebuilds the detector baseline and region map from the newest frames
    /// persisted before `segment`.
    async fn restore(&mut self, segment: &SegmentDescriptor, settings: &PipelineSettings) -> Result<()> {
        let facts = Arc::clone(&self.shared.facts);
        let monitor_id = self.monitor_id;
        let before = segment.t_start;
        let detector_settings = settings.detector.clone();
        let analyzer_settings = settings.analyzer.clone();
        let skip = self.shared.db.unpersisted_segments(monitor_id).await?;

        let (detector, analyzer, join) = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut detector = ChangeDetector::new(detector_settings);
            if let Some(frame) = facts.latest_frame_excluding(monitor_id, None, Some(before), &skip)? {
                match load_still(Path::new(&frame.path)) {
                    Ok(img) => {
                        detector.observe(frame.frame_id.clone(), frame.ts_ns, monitor_id, &img);
                    }
                    Err(err) => log_debug!("no detector baseline for {}: {}", frame.frame_id, err),
                }
            }

            let Some(frame) = facts.latest_frame_excluding(monitor_id, Some(OcrStatus::Ok), Some(before), &skip)? else {
                return Ok((detector, DeltaAnalyzer::new(monitor_id, analyzer_settings)?, None));
            };
            let rows = facts.ocr_for_frame(&frame.frame_id)?;
            let analyzer = DeltaAnalyzer::restore(monitor_id, analyzer_settings, &frame, &rows)?;
            let join = JoinFrame {
                frame_id: frame.frame_id.clone(),
                ts_ns: frame.ts_ns,
                window_target: window_target(&frame),
                regions: rows,
            };
            Ok((detector, analyzer, Some(join)))
        })
        .await
        .context("lane restore task panicked")??;

        log_info!(
            "lane {} restored: {} region(s), baseline {}",
            self.monitor_id,
            analyzer.region_count(),
            join.as_ref().map(|j| j.frame_id.as_str()).unwrap_or("none")
        );
        self.detector = Some(detector);
        self.analyzer = Some(analyzer);
        self.last_join = join;
        self.needs_restore = false;
        Ok(())
    }

    async fn extract(&self, segment: &SegmentDescriptor, fps: f64, dir: &Path) -> Result<Vec<SampledFrame>, Abort> {
        let source = Arc::clone(&self.shared.source);
        let segment = segment.clone();
        let dir = dir.to_path_buf();
        let stills = tokio::task::spawn_blocking(move || source.sample(&segment, fps, &dir))
            .await
            .context("frame extraction task panicked")??;
        Ok(stills)
    }

    async fn detect(&mut self, stills: Vec<SampledFrame>) -> Result<Detection, Abort> {
        let mut detector = self
            .detector
            .take()
            .ok_or_else(|| anyhow!("lane {} has no change detector", self.monitor_id))?;
        let paused = self.shared.pause_rx.clone();
        let monitor_id = self.monitor_id;

        let (detector, result) = tokio::task::spawn_blocking(move || {
            let result = detect_stills(&mut detector, monitor_id, stills, &paused);
            (detector, result)
        })
        .await
        .context("change detection task panicked")?;
        self.detector = Some(detector);
        result
    }

    async fn recognize(
        &self,
        kept: Vec<KeptFrame>,
        timeout: Duration,
        stats: &mut SegmentStats,
    ) -> Result<Vec<(KeptFrame, OcrOutcome)>, Abort> {
        let mut pause_rx = self.shared.pause_rx.clone();
        let mut recognized = Vec::with_capacity(kept.len());

        for frame in kept {
            let frame_id = frame.observation.change.to_frame_id.clone();
            let call = recognize_with_timeout(
                Arc::clone(&self.shared.ocr),
                frame_id.clone(),
                frame.still.path.clone(),
                timeout,
            );
            let outcome = tokio::select! {
                outcome = call => outcome,
                _ = wait_for_pause(&mut pause_rx) => return Err(Abort::Paused),
            };

            match &outcome {
                OcrOutcome::Fields(_) => {}
                OcrOutcome::TimedOut => {
                    stats.ocr_timeouts += 1;
                    let err = PipelineError::OcrTimeout {
                        frame_id: frame_id.to_string(),
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    };
                    log_warn!("{}; keeping frame without OCR", err);
                }
                OcrOutcome::Failed(reason) => {
                    log_warn!("OCR failed for frame {}: {}", frame_id, reason);
                }
            }
            recognized.push((frame, outcome));
        }
        Ok(recognized)
    }

    async fn analyze(
        &mut self,
        segment: &SegmentDescriptor,
        recognized: Vec<(KeptFrame, OcrOutcome)>,
        settings: &PipelineSettings,
    ) -> Result<(SegmentBatch, Option<JoinFrame>), Abort> {
        let mut analyzer = self
            .analyzer
            .take()
            .ok_or_else(|| anyhow!("lane {} has no delta analyzer", self.monitor_id))?;
        let clicks = self.take_clicks(segment.t_end);
        let previous = self.last_join.clone();
        let facts = Arc::clone(&self.shared.facts);
        let segment = segment.clone();
        let window_ns = i64::try_from(settings.analyzer.cursor_join_window_ms)
            .unwrap_or(i64::MAX)
            .saturating_mul(1_000_000);

        let (analyzer, output) = tokio::task::spawn_blocking(move || {
            let output = analyze_segment(&mut analyzer, &facts, &segment, recognized, previous, &clicks, window_ns);
            (analyzer, output)
        })
        .await
        .context("delta analysis task panicked")?;
        self.analyzer = Some(analyzer);
        Ok(output)
    }

    /// Removes and returns the buffered clicks that precede `t_end`.
    fn take_clicks(&mut self, t_end: i64) -> Vec<CursorEvent> {
        let (mut due, later): (Vec<_>, Vec<_>) = self.clicks.drain(..).partition(|c| c.ts_ns < t_end);
        self.clicks = later;
        due.sort_by_key(|c| c.ts_ns);
        due
    }

    async fn persist(
        &self,
        segment: &SegmentDescriptor,
        batch: SegmentBatch,
        settings: &PipelineSettings,
    ) -> Result<u32, Abort> {
        let batch = Arc::new(batch);
        let what = format!("persisting segment {}", segment.segment_id);
        let max_rows = settings.batch_max_rows;

        let written = with_backoff(&settings.storage_retry, &what, || {
            let facts = Arc::clone(&self.shared.facts);
            let batch = Arc::clone(&batch);
            let segment_id = segment.segment_id.clone();
            let monitor_id = segment.monitor_id;
            async move {
                tokio::task::spawn_blocking(move || write_batch(&facts, monitor_id, &segment_id, &batch, max_rows))
                    .await
                    .context("storage task panicked")?
            }
        })
        .await;

        match written {
            Ok(((), attempts)) => Ok(attempts),
            Err(err) => {
                let facts = Arc::clone(&self.shared.facts);
                let segment_id = segment.segment_id.clone();
                let monitor_id = segment.monitor_id;
                let rollback = tokio::task::spawn_blocking(move || roll_back_batch(&facts, monitor_id, &segment_id, &batch))
                    .await
                    .context("rollback task panicked");
                match rollback {
                    Ok(Ok(())) => {}
                    Ok(Err(rollback_err)) | Err(rollback_err) => log_alert!(
                        "segment {} left partial facts behind: {:#}",
                        segment.segment_id,
                        rollback_err
                    ),
                }
                Err(err.into())
            }
        }
    }
}

async fn wait_for_pause(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|paused| *paused).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn detect_stills(
    detector: &mut ChangeDetector,
    monitor_id: u32,
    stills: Vec<SampledFrame>,
    paused: &watch::Receiver<bool>,
) -> Result<Detection, Abort> {
    let mut detection = Detection::default();
    let mut last_ts: Option<i64> = None;

    for still in stills {
        if *paused.borrow() {
            return Err(Abort::Paused);
        }
        if let Some(last_ts_ns) = last_ts {
            if still.ts_ns <= last_ts_ns {
                let err = PipelineError::OutOfOrderFrame {
                    monitor_id,
                    ts_ns: still.ts_ns,
                    last_ts_ns,
                };
                log_warn!("skipping still {}: {}", still.path.display(), err);
                continue;
            }
        }
        last_ts = Some(still.ts_ns);

        let img = match load_still(&still.path) {
            Ok(img) => img,
            Err(err) => {
                log_error!("skipping undecodable frame: {}", err);
                detection.decode_errors += 1;
                continue;
            }
        };
        let frame_id = FrameId::new(monitor_id, still.ts_ns);
        let observation = detector.observe(frame_id, still.ts_ns, monitor_id, &img);
        if observation.is_retained() {
            detection.kept.push(KeptFrame { still, observation });
        }
    }
    Ok(detection)
}

fn analyze_segment(
    analyzer: &mut DeltaAnalyzer,
    facts: &FactStore,
    segment: &SegmentDescriptor,
    recognized: Vec<(KeptFrame, OcrOutcome)>,
    previous: Option<JoinFrame>,
    clicks: &[CursorEvent],
    window_ns: i64,
) -> (SegmentBatch, Option<JoinFrame>) {
    let window = segment.window.clone().unwrap_or_default();
    let mut batch = SegmentBatch::default();
    let mut joins: Vec<JoinFrame> = previous.into_iter().collect();
    let mut last_of_segment = None;

    for (kept, outcome) in recognized {
        let KeptFrame { still, observation } = kept;
        let (ocr_status, fields) = match outcome {
            OcrOutcome::Fields(fields) => (OcrStatus::Ok, fields),
            OcrOutcome::TimedOut => (OcrStatus::TimedOut, Vec::new()),
            OcrOutcome::Failed(_) => (OcrStatus::Failed, Vec::new()),
        };
        let record = FrameRecord {
            frame_id: observation.change.to_frame_id.clone(),
            ts_ns: still.ts_ns,
            monitor_id: segment.monitor_id,
            segment_id: segment.segment_id.clone(),
            path: facts
                .image_path(segment.monitor_id, still.ts_ns, &still.path)
                .to_string_lossy()
                .into_owned(),
            phash: observation.phash,
            entropy: observation.stats.entropy,
            width: observation.stats.width,
            height: observation.stats.height,
            app_name: window.app_name.clone(),
            window_title: window.window_title.clone(),
            ocr_status,
        };

        // Frames without OCR carry no evidence about the region set.
        let mut regions = Vec::new();
        if ocr_status == OcrStatus::Ok {
            let analysis = analyzer.observe(FrameInput {
                frame: &record,
                fields: &fields,
                luma: Some(&observation.stats.luma),
            });
            regions = analysis.ocr.clone();
            batch.ocr.extend(analysis.ocr);
            batch.events.extend(analysis.events);
        }

        let join = JoinFrame {
            frame_id: record.frame_id.clone(),
            ts_ns: record.ts_ns,
            window_target: window_target(&record),
            regions,
        };
        if ocr_status == OcrStatus::Ok {
            last_of_segment = Some(join.clone());
        }
        joins.push(join);
        batch.images.push((still.ts_ns, still.path));
        batch.scene_changes.push(observation.change);
        batch.frames.push(record);
    }

    for click in clicks {
        match nearest_frame(&joins, click.ts_ns, window_ns) {
            Some(index) => batch.events.extend(cursor_action(click, &joins[index], window_ns)),
            None => log_debug!(
                "click at {} on monitor {} has no frame within the join window",
                click.ts_ns,
                click.monitor_id
            ),
        }
    }

    batch.events.sort_by(|a, b| {
        a.ts_ns
            .cmp(&b.ts_ns)
            .then_with(|| a.event_type.cmp(&b.event_type))
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
    (batch, last_of_segment)
}

/// Frames land before the rows citing them, so evidence references exist at
/// write time.
fn write_batch(facts: &FactStore, monitor_id: u32, segment_id: &str, batch: &SegmentBatch, max_rows: usize) -> Result<()> {
    for (ts_ns, still) in &batch.images {
        facts.persist_image(monitor_id, *ts_ns, still)?;
    }
    facts.write_segment(monitor_id, segment_id, &batch.scene_changes, max_rows)?;
    facts.write_segment(monitor_id, segment_id, &batch.ocr, max_rows)?;
    facts.write_segment(monitor_id, segment_id, &batch.events, max_rows)?;
    // Frames go last: a restore only ever starts from a frame row.
    facts.write_segment(monitor_id, segment_id, &batch.frames, max_rows)?;
    Ok(())
}

/// Undoes whatever part of a segment reached the store.
fn roll_back_batch(facts: &FactStore, monitor_id: u32, segment_id: &str, batch: &SegmentBatch) -> Result<()> {
    facts.remove_segment(segment_id)?;
    for (ts_ns, still) in &batch.images {
        facts.remove_image(monitor_id, *ts_ns, still)?;
    }
    Ok(())
}
