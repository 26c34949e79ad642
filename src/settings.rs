use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{Arc, RwLock},
};
use tokio::sync::watch;

use crate::error::PipelineError;
use crate::models::{DataClass, RetentionPolicy};

const DAY_SECS: u64 = 24 * 60 * 60;

/// Change Detector thresholds. Distances are Hamming distances over 64 bits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorSettings {
    pub ssim_threshold: f64,
    /// SSIM below this is an unambiguous structural change.
    pub strong_ssim_threshold: f64,
    /// `high_distance_cutoff`: distances above this classify as a cut.
    pub cut_distance: u32,
    /// Lower bound of the fade band; the band ends at `cut_distance`.
    pub fade_distance_min: u32,
    pub motion_distance: u32,
    pub entropy_threshold: f64,
    /// Fraction of the remaining headroom added when two signals agree.
    pub agreement_boost: f64,
    /// Frames are compared at `reduced_size` x `reduced_size` luminance.
    pub reduced_size: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            ssim_threshold: 0.75,
            strong_ssim_threshold: 0.5,
            cut_distance: 24,
            fade_distance_min: 8,
            motion_distance: 10,
            entropy_threshold: 0.35,
            agreement_boost: 0.5,
            reduced_size: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalyzerSettings {
    /// Region-set Jaccard similarity below this is a navigation.
    pub navigation_threshold: f64,
    /// Weight of the text-similarity penalty applied to field changes.
    pub similarity_penalty: f64,
    /// Pixel quantum used to derive region ids from geometry.
    pub region_grid: u32,
    /// Minimum IoU for a new observation to reuse a known region id.
    pub region_match_iou: f64,
    /// Retained frames a region may go unobserved before it is forgotten.
    pub region_gap_limit: usize,
    pub banner_min_strength: f64,
    pub cursor_join_window_ms: u64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            navigation_threshold: 0.5,
            similarity_penalty: 0.5,
            region_grid: 16,
            region_match_iou: 0.5,
            region_gap_limit: 3,
            banner_min_strength: 0.5,
            cursor_join_window_ms: 1_500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageRetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for StorageRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    pub extraction_fps: f64,
    pub detector: DetectorSettings,
    pub analyzer: AnalyzerSettings,
    pub retention: Vec<RetentionPolicy>,
    pub retention_interval_secs: u64,
    pub worker_pool_size: usize,
    pub ocr_timeout_ms: u64,
    /// Segments a lane buffers before producers block.
    pub lane_queue_capacity: usize,
    /// Blocked producers a lane tolerates before failing the oldest.
    pub queue_depth_limit: usize,
    pub batch_max_rows: usize,
    pub flush_timeout_ms: u64,
    pub storage_retry: StorageRetrySettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            extraction_fps: 1.0,
            detector: DetectorSettings::default(),
            analyzer: AnalyzerSettings::default(),
            retention: vec![
                RetentionPolicy::new(DataClass::RawFrame, 14 * DAY_SECS),
                RetentionPolicy::new(DataClass::Ocr, 30 * DAY_SECS),
                RetentionPolicy::new(DataClass::Event, 90 * DAY_SECS),
            ],
            retention_interval_secs: 60 * 60,
            worker_pool_size: 2,
            ocr_timeout_ms: 5_000,
            lane_queue_capacity: 4,
            queue_depth_limit: 8,
            batch_max_rows: 512,
            flush_timeout_ms: 10_000,
            storage_retry: StorageRetrySettings::default(),
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: &str| Err(PipelineError::InvalidConfig(msg.to_string()));

        if !(self.extraction_fps > 0.0 && self.extraction_fps <= 60.0) {
            return invalid("extraction_fps must be in (0, 60]");
        }
        let d = &self.detector;
        if !(0.0..=1.0).contains(&d.ssim_threshold) || !(0.0..=1.0).contains(&d.strong_ssim_threshold) {
            return invalid("ssim thresholds must be in [0, 1]");
        }
        if d.cut_distance > 64 || d.fade_distance_min > d.cut_distance || d.motion_distance > 64 {
            return invalid("phash distances must satisfy fade_distance_min <= cut_distance <= 64");
        }
        if d.entropy_threshold <= 0.0 {
            return invalid("entropy_threshold must be positive");
        }
        if !(0.0..=1.0).contains(&d.agreement_boost) {
            return invalid("agreement_boost must be in [0, 1]");
        }
        if d.reduced_size < 8 || d.reduced_size > 512 {
            return invalid("reduced_size must be in [8, 512]");
        }
        let a = &self.analyzer;
        if !(0.0..=1.0).contains(&a.navigation_threshold) || !(0.0..=1.0).contains(&a.similarity_penalty) {
            return invalid("analyzer ratios must be in [0, 1]");
        }
        if a.region_grid == 0 {
            return invalid("region_grid must be positive");
        }
        if self.worker_pool_size == 0 {
            return invalid("worker_pool_size must be positive");
        }
        if self.lane_queue_capacity == 0 {
            return invalid("lane_queue_capacity must be positive");
        }
        if self.batch_max_rows == 0 {
            return invalid("batch_max_rows must be positive");
        }
        if self.storage_retry.max_attempts == 0 {
            return invalid("storage_retry.max_attempts must be positive");
        }
        Ok(())
    }

    pub fn policy_for(&self, class: DataClass) -> Option<&RetentionPolicy> {
        self.retention.iter().find(|p| p.data_class == class)
    }
}

/// Hot-reloadable settings backed by a JSON file.
pub struct SettingsStore {
    path: Option<PathBuf>,
    data: RwLock<Arc<PipelineSettings>>,
    tx: watch::Sender<Arc<PipelineSettings>>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str::<PipelineSettings>(&contents) {
                Ok(parsed) if parsed.validate().is_ok() => parsed,
                Ok(_) | Err(_) => {
                    warn!(
                        "Settings at {} are invalid; falling back to defaults",
                        path.display()
                    );
                    PipelineSettings::default()
                }
            }
        } else {
            PipelineSettings::default()
        };

        Ok(Self::build(Some(path), data))
    }

    /// A store that never touches the filesystem.
    pub fn ephemeral(settings: PipelineSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self::build(None, settings))
    }

    fn build(path: Option<PathBuf>, data: PipelineSettings) -> Self {
        let data = Arc::new(data);
        let (tx, _rx) = watch::channel(Arc::clone(&data));
        Self {
            path,
            data: RwLock::new(data),
            tx,
        }
    }

    pub fn current(&self) -> Arc<PipelineSettings> {
        match self.data.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<PipelineSettings>> {
        self.tx.subscribe()
    }

    pub fn update(&self, settings: PipelineSettings) -> Result<()> {
        settings.validate()?;
        self.persist(&settings)?;
        self.publish(settings);
        Ok(())
    }

    /// Re-read the backing file. On any error the current settings stay in force.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let data: PipelineSettings = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings at {}", path.display()))?;
        data.validate()?;
        self.publish(data);
        info!("Settings reloaded from {}", path.display());
        Ok(())
    }

    fn publish(&self, settings: PipelineSettings) {
        let settings = Arc::new(settings);
        {
            let mut guard = match self.data.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Arc::clone(&settings);
        }
        self.tx.send_replace(settings);
    }

    fn persist(&self, data: &PipelineSettings) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write settings to {}", path.display()))
    }
}
