use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::error::PipelineError;
use crate::extract::FrameSource;
use crate::facts::FactStore;
use crate::log_alert;
use crate::metrics::{HealthSnapshot, MetricsCollector};
use crate::models::{CursorEvent, SegmentDescriptor, SegmentState};
use crate::settings::PipelineSettings;

use super::lane::{Lane, LaneShared};
use super::ocr::OcrEngine;
use super::pool::WorkerPool;
use super::queue::LaneQueue;

const CURSOR_CHANNEL_CAPACITY: usize = 1024;

struct LaneHandle {
    queue: Arc<LaneQueue>,
    cursor_tx: mpsc::Sender<CursorEvent>,
    task: JoinHandle<()>,
}

/// Front door of the pipeline: routes segments and cursor telemetry to
/// per-monitor lanes, and owns the privacy pause.
pub struct PipelineController {
    shared: LaneShared,
    pause_tx: watch::Sender<bool>,
    lanes: Mutex<HashMap<u32, LaneHandle>>,
    cancel_token: CancellationToken,
    settings_task: Option<JoinHandle<()>>,
    started: bool,
}

impl PipelineController {
    pub fn new(
        facts: Arc<FactStore>,
        db: Database,
        source: Arc<dyn FrameSource>,
        ocr: Arc<dyn OcrEngine>,
        metrics: MetricsCollector,
        settings_rx: watch::Receiver<Arc<PipelineSettings>>,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new(settings_rx.borrow().worker_pool_size));
        let (pause_tx, pause_rx) = watch::channel(false);
        Self {
            shared: LaneShared {
                facts,
                db,
                source,
                ocr,
                pool,
                metrics,
                settings_rx,
                pause_rx,
            },
            pause_tx,
            lanes: Mutex::new(HashMap::new()),
            cancel_token: CancellationToken::new(),
            settings_task: None,
            started: false,
        }
    }

    /// Marks segments left mid-flight by a previous run as failed and starts
    /// following settings reloads.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            bail!("pipeline already started");
        }

        let recovered = self.shared.db.recover_interrupted_segments().await?;
        if !recovered.is_empty() {
            warn!(
                "Marked {} segment(s) interrupted by the previous run as failed",
                recovered.len()
            );
            let facts = Arc::clone(&self.shared.facts);
            let removed = tokio::task::spawn_blocking(move || -> Result<usize> {
                let mut removed = 0;
                for segment_id in &recovered {
                    removed += facts.remove_segment(segment_id)?;
                }
                Ok(removed)
            })
            .await
            .context("interrupted segment cleanup panicked")??;
            if removed > 0 {
                warn!("Removed {removed} partially written batch(es) of interrupted segments");
            }
        }

        let pool = Arc::clone(&self.shared.pool);
        let settings_rx = self.shared.settings_rx.clone();
        let token = self.cancel_token.child_token();
        self.settings_task = Some(tokio::spawn(follow_settings(pool, settings_rx, token)));
        self.started = true;
        info!("Pipeline started");
        Ok(())
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<u32, LaneHandle>> {
        match self.lanes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lane(&self, monitor_id: u32) -> (Arc<LaneQueue>, mpsc::Sender<CursorEvent>) {
        let mut lanes = self.lanes();
        let handle = lanes.entry(monitor_id).or_insert_with(|| {
            let settings = self.shared.settings_rx.borrow().clone();
            let queue = Arc::new(LaneQueue::new(
                monitor_id,
                settings.lane_queue_capacity,
                settings.queue_depth_limit,
            ));
            let (cursor_tx, cursor_rx) = mpsc::channel(CURSOR_CHANNEL_CAPACITY);
            let lane = Lane::new(monitor_id, self.shared.clone(), Arc::clone(&queue));
            let task = tokio::spawn(lane.run(cursor_rx, self.cancel_token.child_token()));
            info!("Opened lane for monitor {monitor_id}");
            LaneHandle {
                queue,
                cursor_tx,
                task,
            }
        });
        (Arc::clone(&handle.queue), handle.cursor_tx.clone())
    }

    /// Hands a segment to its monitor's lane. Blocks while the lane is full;
    /// fails when the pipeline is paused or the lane's depth limit evicts
    /// this segment.
    pub async fn submit(&self, segment: SegmentDescriptor) -> Result<()> {
        if !self.started {
            bail!("pipeline not started");
        }
        self.shared.db.record_segment_arrival(&segment).await?;

        if self.is_paused() {
            self.finish(&segment.segment_id, SegmentState::Discarded, None).await;
            return Err(PipelineError::Paused.into());
        }

        let (queue, _) = self.lane(segment.monitor_id);
        let segment_id = segment.segment_id.clone();
        match queue.push(segment).await {
            Ok(()) => Ok(()),
            Err(PipelineError::Paused) => {
                self.finish(&segment_id, SegmentState::Discarded, None).await;
                Err(PipelineError::Paused.into())
            }
            Err(err) => {
                if matches!(err, PipelineError::QueueDepthExceeded { .. }) {
                    log_alert!("segment {} failed: {}", segment_id, err);
                }
                self.finish(&segment_id, SegmentState::Failed, Some(err.to_string())).await;
                Err(err.into())
            }
        }
    }

    /// Forwards input telemetry to its monitor's lane. Dropped while paused.
    pub async fn submit_cursor(&self, event: CursorEvent) -> Result<()> {
        if !self.started {
            bail!("pipeline not started");
        }
        if self.is_paused() {
            return Ok(());
        }
        let monitor_id = event.monitor_id;
        let (_, cursor_tx) = self.lane(monitor_id);
        cursor_tx
            .send(event)
            .await
            .map_err(|_| anyhow!("lane for monitor {monitor_id} is shut down"))
    }

    /// Privacy pause: stops intake and drops every buffered segment. Returns
    /// how many queued segments were discarded.
    ///
    /// A segment already in flight checks the pause signal only between
    /// pipeline stages and before it is stored. If `resume` lands before the
    /// next check, the segment never sees the pause and completes normally.
    pub async fn pause(&self) -> usize {
        self.pause_tx.send_replace(true);
        let queues: Vec<Arc<LaneQueue>> = self.lanes().values().map(|h| Arc::clone(&h.queue)).collect();

        let mut discarded = 0;
        for queue in queues {
            for segment in queue.discard() {
                self.finish(&segment.segment_id, SegmentState::Discarded, None).await;
                discarded += 1;
            }
        }
        info!("Privacy pause engaged; {discarded} queued segment(s) discarded");
        discarded
    }

    /// Lanes rebuild their state from storage on the next segment. A segment
    /// that was in flight when `pause` was called may still complete if its
    /// lane had not reached a pause check yet.
    pub fn resume(&self) {
        self.pause_tx.send_replace(false);
        info!("Privacy pause lifted");
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    pub fn queue_depths(&self) -> HashMap<u32, usize> {
        self.lanes()
            .iter()
            .map(|(monitor_id, handle)| (*monitor_id, handle.queue.depth()))
            .collect()
    }

    pub fn pool_size(&self) -> usize {
        self.shared.pool.size()
    }

    pub async fn health(&self) -> Result<HealthSnapshot> {
        let since = Utc::now() - chrono::Duration::hours(1);
        let last_hour = self.shared.db.segment_outcomes_since(since).await?;
        Ok(self.shared.metrics.snapshot(last_hour, self.is_paused()).await)
    }

    async fn finish(&self, segment_id: &str, state: SegmentState, reason: Option<String>) {
        if let Err(err) = self.shared.db.transition_segment(segment_id, state, reason).await {
            error!("failed to record segment {segment_id} as {}: {err:?}", state.as_str());
        }
    }

    /// Closes every lane and waits up to `flush_timeout_ms` for buffered
    /// segments to drain before cancelling what is left.
    pub async fn shutdown(&mut self) -> Result<()> {
        let handles: Vec<(u32, LaneHandle)> = self.lanes().drain().collect();
        for (_, handle) in &handles {
            handle.queue.close();
        }

        let flush_timeout = Duration::from_millis(self.shared.settings_rx.borrow().flush_timeout_ms);
        let deadline = tokio::time::Instant::now() + flush_timeout;
        let mut result = Ok(());
        for (monitor_id, handle) in handles {
            let mut task = handle.task;
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(joined) => {
                    if let Err(err) = joined.with_context(|| format!("lane {monitor_id} failed to join")) {
                        result = Err(err);
                    }
                }
                Err(_) => {
                    // The abandoned segment stays non-terminal and is marked
                    // interrupted on the next start.
                    warn!("Lane {monitor_id} did not drain within {}ms; aborting", flush_timeout.as_millis());
                    task.abort();
                    let _ = task.await;
                }
            }
        }

        self.cancel_token.cancel();
        if let Some(task) = self.settings_task.take() {
            task.await.context("settings follower failed to join")?;
        }
        self.shared.pool.close();
        self.started = false;
        info!("Pipeline stopped");
        result
    }
}

async fn follow_settings(
    pool: Arc<WorkerPool>,
    mut settings_rx: watch::Receiver<Arc<PipelineSettings>>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            changed = settings_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let size = settings_rx.borrow_and_update().worker_pool_size;
                if size != pool.size() {
                    pool.resize(size);
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
}
