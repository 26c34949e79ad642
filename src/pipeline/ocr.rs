use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio::time::Duration;

use crate::models::{FrameId, OcrFieldInput};

/// External OCR collaborator. Primary/fallback engine selection and PII
/// masking happen behind this seam.
pub trait OcrEngine: Send + Sync + 'static {
    fn recognize(&self, frame_id: &FrameId, image_path: &Path) -> Result<Vec<OcrFieldInput>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum OcrOutcome {
    Fields(Vec<OcrFieldInput>),
    TimedOut,
    Failed(String),
}

/// Runs the engine on a blocking thread, giving up after `timeout`. A call
/// that times out keeps its thread until the engine returns; its result is
/// discarded.
pub async fn recognize_with_timeout(
    engine: Arc<dyn OcrEngine>,
    frame_id: FrameId,
    image_path: PathBuf,
    timeout: Duration,
) -> OcrOutcome {
    let task = tokio::task::spawn_blocking(move || engine.recognize(&frame_id, &image_path));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(fields))) => OcrOutcome::Fields(fields),
        Ok(Ok(Err(err))) => OcrOutcome::Failed(format!("{err:#}")),
        Ok(Err(join_err)) => OcrOutcome::Failed(format!("ocr worker panicked: {join_err}")),
        Err(_) => OcrOutcome::TimedOut,
    }
}
