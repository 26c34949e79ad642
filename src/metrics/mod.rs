mod types;

pub use types::{HealthSnapshot, PipelineCounters, SegmentMetrics, SystemMetrics};

use std::sync::Arc;

use chrono::Utc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

use crate::db::SegmentOutcomeCounts;

const MAX_RECENT_SEGMENTS: usize = 20;

#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    recent_segments: Vec<SegmentMetrics>,
    counters: PipelineCounters,
    system: System,
    pid: Pid,
}

impl MetricsState {
    fn sample_system(&mut self) -> SystemMetrics {
        let pid = self.pid;
        self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        match self.system.process(pid) {
            Some(process) => SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            },
            None => SystemMetrics {
                cpu_percent: 0.0,
                memory_mb: 0.0,
            },
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // CPU usage is a delta; the first refresh sets the baseline.
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                recent_segments: Vec::with_capacity(MAX_RECENT_SEGMENTS),
                counters: PipelineCounters::default(),
                system,
                pid,
            })),
        }
    }

    pub async fn record_segment(&self, metrics: SegmentMetrics) {
        let mut state = self.inner.lock().await;

        let counters = &mut state.counters;
        counters.segments_finished += 1;
        counters.frames_sampled += metrics.frames_sampled;
        counters.frames_kept += metrics.frames_kept;
        counters.frames_dropped += metrics
            .frames_sampled
            .saturating_sub(metrics.frames_kept + metrics.decode_errors);
        counters.decode_errors += metrics.decode_errors;
        counters.ocr_timeouts += metrics.ocr_timeouts;
        counters.events_emitted += metrics.events;

        state.recent_segments.push(metrics);
        if state.recent_segments.len() > MAX_RECENT_SEGMENTS {
            state.recent_segments.remove(0);
        }
    }

    pub async fn counters(&self) -> PipelineCounters {
        self.inner.lock().await.counters.clone()
    }

    pub async fn snapshot(&self, last_hour: SegmentOutcomeCounts, paused: bool) -> HealthSnapshot {
        let mut state = self.inner.lock().await;
        let system = state.sample_system();
        HealthSnapshot {
            taken_at: Utc::now(),
            last_hour,
            counters: state.counters.clone(),
            system,
            paused,
            recent_segments: state.recent_segments.clone(),
        }
    }

    pub async fn reset(&self) {
        let mut state = self.inner.lock().await;
        state.recent_segments.clear();
        state.counters = PipelineCounters::default();
        state.sample_system();
    }
}
