use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::settings::PipelineSettings;

use super::sweep::RetentionSweeper;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

fn ticker(interval_secs: u64) -> Interval {
    let period = Duration::from_secs(interval_secs.max(1));
    // First sweep one period after start; startup is busy enough.
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Runs sweeps on the configured interval until cancelled. Independent of
/// the write path; a class whose sweep fails is retried on the next tick.
pub async fn retention_loop(
    sweeper: RetentionSweeper,
    mut settings_rx: watch::Receiver<Arc<PipelineSettings>>,
    cancel_token: CancellationToken,
) {
    let mut interval_secs = settings_rx.borrow().retention_interval_secs;
    let mut ticker = ticker(interval_secs);
    let mut settings_open = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let policies = settings_rx.borrow().retention.clone();
                let pass = sweeper.sweep_all(&policies, Utc::now()).await;
                log_info!(
                    "retention pass finished: {} sweep(s), {} row(s) deleted",
                    pass.outcomes.len(),
                    pass.rows_deleted()
                );
                if !pass.failures.is_empty() {
                    log_error!("retention pass: {} class(es) failed; retrying next tick", pass.failures.len());
                }
            }
            changed = settings_rx.changed(), if settings_open => {
                if changed.is_err() {
                    log_warn!("settings channel closed; keeping retention interval {}s", interval_secs);
                    settings_open = false;
                    continue;
                }
                let next = settings_rx.borrow_and_update().retention_interval_secs;
                if next != interval_secs {
                    log_info!("retention interval changed {}s -> {}s", interval_secs, next);
                    interval_secs = next;
                    ticker = self::ticker(interval_secs);
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("retention loop shutting down");
                break;
            }
        }
    }
}

pub struct RetentionEngine {
    sweeper: RetentionSweeper,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl RetentionEngine {
    pub fn new(sweeper: RetentionSweeper) -> Self {
        Self {
            sweeper,
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(&mut self, settings_rx: watch::Receiver<Arc<PipelineSettings>>) -> Result<()> {
        if self.handle.is_some() {
            bail!("retention engine already running");
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(retention_loop(
            self.sweeper.clone(),
            settings_rx,
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub fn sweeper(&self) -> &RetentionSweeper {
        &self.sweeper
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("retention loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}
