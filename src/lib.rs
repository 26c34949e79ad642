pub mod analysis;
pub mod db;
pub mod detect;
pub mod error;
pub mod extract;
pub mod facts;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod plugins;
pub mod retention;
pub mod settings;
pub mod utils;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use db::Database;
use extract::FrameSource;
use facts::FactStore;
use metrics::{HealthSnapshot, MetricsCollector};
use models::{CursorEvent, SegmentDescriptor};
use pipeline::{OcrEngine, PipelineController};
use plugins::PluginHost;
use retention::{RetentionEngine, RetentionSweeper};
use settings::SettingsStore;

pub use error::PipelineError;

/// Initialise logging (reads RUST_LOG). Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

/// A running pipeline over one data directory: fact store, relational
/// store, segment lanes and the retention engine.
pub struct Screentrail {
    data_dir: PathBuf,
    settings: Arc<SettingsStore>,
    facts: Arc<FactStore>,
    db: Database,
    metrics: MetricsCollector,
    pipeline: PipelineController,
    retention: RetentionEngine,
    plugins: PluginHost,
}

impl Screentrail {
    /// Opens `data_dir` with settings from `data_dir/settings.json`.
    pub async fn open(
        data_dir: impl Into<PathBuf>,
        source: Arc<dyn FrameSource>,
        ocr: Arc<dyn OcrEngine>,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
        let settings = SettingsStore::new(data_dir.join("settings.json"))?;
        Self::open_with_settings(data_dir, settings, source, ocr).await
    }

    pub async fn open_with_settings(
        data_dir: impl Into<PathBuf>,
        settings: SettingsStore,
        source: Arc<dyn FrameSource>,
        ocr: Arc<dyn OcrEngine>,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
        info!("Screentrail starting in {}", data_dir.display());

        let settings = Arc::new(settings);
        let db = Database::new(data_dir.join("screentrail.sqlite3"))?;
        let facts = Arc::new(FactStore::open(data_dir.join("facts"))?);
        let metrics = MetricsCollector::new();

        let mut pipeline = PipelineController::new(
            Arc::clone(&facts),
            db.clone(),
            source,
            ocr,
            metrics.clone(),
            settings.subscribe(),
        );
        pipeline.start().await?;

        let mut retention = RetentionEngine::new(RetentionSweeper::new(Arc::clone(&facts), db.clone()));
        retention.start(settings.subscribe())?;

        Ok(Self {
            data_dir,
            settings,
            facts,
            db,
            metrics,
            pipeline,
            retention,
            plugins: PluginHost::with_builtin()?,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn facts(&self) -> &FactStore {
        &self.facts
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn pipeline(&self) -> &PipelineController {
        &self.pipeline
    }

    pub fn sweeper(&self) -> &RetentionSweeper {
        self.retention.sweeper()
    }

    pub fn plugins(&self) -> &PluginHost {
        &self.plugins
    }

    pub fn plugins_mut(&mut self) -> &mut PluginHost {
        &mut self.plugins
    }

    pub async fn submit(&self, segment: SegmentDescriptor) -> Result<()> {
        self.pipeline.submit(segment).await
    }

    pub async fn submit_cursor(&self, event: CursorEvent) -> Result<()> {
        self.pipeline.submit_cursor(event).await
    }

    pub async fn pause(&self) -> usize {
        self.pipeline.pause().await
    }

    pub fn resume(&self) {
        self.pipeline.resume();
    }

    pub async fn health(&self) -> Result<HealthSnapshot> {
        self.pipeline.health().await
    }

    /// Drains the lanes, then stops the retention engine.
    pub async fn shutdown(mut self) -> Result<()> {
        let drained = self.pipeline.shutdown().await;
        self.retention.stop().await?;
        info!("Screentrail stopped");
        drained
    }
}
