use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::db::Database;
use crate::error::PipelineError;
use crate::facts::{ExpireReport, FactStore, FactTable};
use crate::log_alert;
use crate::models::{DataClass, RetentionPolicy, SweepOutcome};

/// Outcomes of one pass over every policy, plus the classes that failed.
#[derive(Debug, Default)]
pub struct SweepPass {
    pub outcomes: Vec<SweepOutcome>,
    pub failures: Vec<(DataClass, anyhow::Error)>,
}

impl SweepPass {
    pub fn rows_deleted(&self) -> u64 {
        self.outcomes.iter().map(|o| o.rows_deleted).sum()
    }
}

/// Expires raw facts per retention policy.
///
/// Every sweep is checkpointed (class, boundary, rows before) before any row
/// is removed. A checkpoint without completion is resumed with its recorded
/// boundary, and deletion by boundary is idempotent, so an interrupted sweep
/// is safe to run again.
#[derive(Clone)]
pub struct RetentionSweeper {
    facts: Arc<FactStore>,
    db: Database,
}

impl RetentionSweeper {
    pub fn new(facts: Arc<FactStore>, db: Database) -> Self {
        Self { facts, db }
    }

    /// Sweeps every policy. A class that fails is alerted on and reported in
    /// the pass; the remaining classes are still swept.
    pub async fn sweep_all(&self, policies: &[RetentionPolicy], now: DateTime<Utc>) -> SweepPass {
        let mut pass = SweepPass::default();
        for policy in policies {
            match self.sweep(policy, now).await {
                Ok(outcomes) => pass.outcomes.extend(outcomes),
                Err(err) => {
                    log_alert!("{} retention sweep failed: {:#}", policy.data_class, err);
                    pass.failures.push((policy.data_class, err));
                }
            }
        }
        pass
    }

    /// Resumes any unfinished sweep of the policy's class, then sweeps up to
    /// the policy's current boundary.
    pub async fn sweep(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<Vec<SweepOutcome>> {
        let class = policy.data_class;
        if !class.is_expirable() {
            warn!("Ignoring retention policy for {class}: spans are kept indefinitely");
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::new();
        if let Some(pending) = self.db.unfinished_sweep(class).await? {
            info!(
                "Resuming interrupted {} sweep at boundary {}",
                class, pending.boundary_ts
            );
            outcomes.push(
                self.run(class, pending.boundary_ts, Some((pending.id, pending.rows_before)))
                    .await?,
            );
        }

        if !policy.is_active_at(now) {
            return Ok(outcomes);
        }
        outcomes.push(self.run(class, policy.boundary_ns(now), None).await?);
        Ok(outcomes)
    }

    async fn run(&self, class: DataClass, boundary_ts: i64, resume: Option<(i64, u64)>) -> Result<SweepOutcome> {
        let (sweep_id, rows_before, resumed) = match resume {
            Some((id, rows_before)) => (id, rows_before, true),
            None => {
                let rows_before = self.count_before(class, boundary_ts).await?;
                let id = self.db.begin_sweep(class, boundary_ts, rows_before).await?;
                (id, rows_before, false)
            }
        };

        let facts = Arc::clone(&self.facts);
        let report = tokio::task::spawn_blocking(move || expire_class(&facts, class, boundary_ts))
            .await
            .context("retention worker join failed")?
            .map_err(|err| {
                warn!("{class} sweep failed: {err:?}");
                PipelineError::RetentionSweepInterrupted {
                    data_class: class,
                    boundary_ts,
                }
            })?;

        // Rows appended during the sweep are newer than the boundary and stay
        // out of both counts.
        let rows_after = self.count_before(class, boundary_ts).await?;
        // A resumed sweep cannot know what its interrupted run removed.
        let rows_deleted = if resumed {
            rows_before.saturating_sub(rows_after)
        } else {
            report.rows_deleted
        };

        let outcome = SweepOutcome {
            data_class: class,
            rows_deleted,
            boundary_ts,
            rows_before,
            rows_after,
            resumed,
        };
        if !outcome.is_consistent() {
            log_alert!(
                "{} sweep left rows behind: before={} deleted={} after={}",
                class,
                rows_before,
                rows_deleted,
                rows_after
            );
        }

        let superseded = self.db.complete_sweep(sweep_id, rows_deleted, rows_after).await?;
        if superseded > 0 {
            info!("Closed {superseded} older unfinished {class} sweep(s)");
        }
        info!(
            "Retention sweep {}: deleted {} row(s) older than {} ({} -> {})",
            class, rows_deleted, boundary_ts, rows_before, rows_after
        );
        Ok(outcome)
    }

    async fn count_before(&self, class: DataClass, boundary_ts: i64) -> Result<u64> {
        let facts = Arc::clone(&self.facts);
        tokio::task::spawn_blocking(move || {
            let mut total = 0;
            for table in FactTable::for_class(class) {
                total += facts.count_rows_before(*table, boundary_ts)?;
            }
            Ok::<_, anyhow::Error>(total)
        })
        .await
        .context("retention count worker join failed")?
    }
}

fn expire_class(facts: &FactStore, class: DataClass, boundary_ts: i64) -> Result<ExpireReport> {
    let mut total = ExpireReport::default();
    for table in FactTable::for_class(class) {
        let report = facts.expire_before(*table, boundary_ts)?;
        total.rows_deleted += report.rows_deleted;
        total.batches_removed += report.batches_removed;
        total.batches_rewritten += report.batches_rewritten;
        total.frame_paths.extend(report.frame_paths);
    }

    // Images go after their rows so a crash never leaves a row without its still.
    for path in &total.frame_paths {
        remove_image(facts.root(), Path::new(path))?;
    }
    Ok(total)
}

fn remove_image(root: &Path, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() || !path.starts_with(root) {
        return Ok(());
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to remove frame image {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::open_temp;
    use crate::models::{FrameId, FrameRecord, OcrRecord, OcrStatus, RegionGeometry, RegionId};
    use chrono::TimeZone;

    const SEC: i64 = 1_000_000_000;
    const BOUNDARY: i64 = 5_000 * SEC;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(10_000, 0).unwrap()
    }

    fn policy(class: DataClass) -> RetentionPolicy {
        RetentionPolicy::new(class, 5_000)
    }

    fn ocr(ts: i64) -> OcrRecord {
        OcrRecord {
            frame_id: FrameId::new(0, ts),
            ts_ns: ts,
            monitor_id: 0,
            region_id: RegionId("r0_0_1x1".into()),
            roi: RegionGeometry::new(0, 0, 10, 10),
            text: format!("t{ts}"),
            language: "en".into(),
            confidence: 0.8,
            pii_filtered: false,
        }
    }

    fn frame(ts: i64) -> FrameRecord {
        FrameRecord {
            frame_id: FrameId::new(0, ts),
            ts_ns: ts,
            monitor_id: 0,
            segment_id: "old".into(),
            path: String::new(),
            phash: 1,
            entropy: 1.5,
            width: 640,
            height: 480,
            app_name: String::new(),
            window_title: String::new(),
            ocr_status: OcrStatus::Ok,
        }
    }

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, Arc<FactStore>, RetentionSweeper) {
        let facts_dir = tempfile::tempdir().unwrap();
        let (db_dir, db) = open_temp();
        let facts = Arc::new(FactStore::open(facts_dir.path()).unwrap());
        let sweeper = RetentionSweeper::new(Arc::clone(&facts), db);
        (facts_dir, db_dir, facts, sweeper)
    }

    #[tokio::test]
    async fn appends_during_a_sweep_do_not_skew_its_counts() {
        let (_facts_dir, _db_dir, facts, sweeper) = setup();
        assert_eq!(policy(DataClass::Ocr).boundary_ns(now()), BOUNDARY);
        for i in 0..20 {
            let rows: Vec<OcrRecord> = (0..10).map(|j| ocr(i * 10 + j + 1)).collect();
            facts.write_segment(0, &format!("old-{i}"), &rows, 4).unwrap();
        }
        facts.write_segment(0, "mixed", &[ocr(BOUNDARY - SEC), ocr(BOUNDARY + SEC)], 4).unwrap();

        let writer_facts = Arc::clone(&facts);
        let writer = std::thread::spawn(move || {
            for i in 0..40 {
                let rows: Vec<OcrRecord> = (0..5).map(|j| ocr(BOUNDARY + 10 * SEC + i * 10 + j)).collect();
                writer_facts.write_segment(0, &format!("recent-{i}"), &rows, 4).unwrap();
            }
        });
        let outcomes = sweeper.sweep(&policy(DataClass::Ocr), now()).await.unwrap();
        writer.join().unwrap();

        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes[0];
        assert_eq!(outcome.rows_before, 201);
        assert_eq!(outcome.rows_deleted, 201);
        assert_eq!(outcome.rows_after, 0);
        assert!(outcome.is_consistent());
        assert_eq!(facts.count_rows(FactTable::Ocr).unwrap(), 201);

        let log = sweeper.db.sweep_log(5).await.unwrap();
        assert_eq!(log[0].rows_deleted, Some(201));
        assert_eq!(log[0].rows_after, Some(0));
    }

    #[tokio::test]
    async fn failing_class_does_not_stop_the_others() {
        let (facts_dir, _db_dir, facts, sweeper) = setup();
        facts.write_segment(0, "mixed", &[ocr(1), ocr(BOUNDARY + 1)], 8).unwrap();
        facts.write_segment(0, "old", &[frame(1), frame(2)], 8).unwrap();
        // The straddling OCR batch cannot be rewritten while its temp path is taken.
        let blocker = facts_dir.path().join("ocr").join("m0").join("mixed-00000.tmp");
        fs::create_dir(&blocker).unwrap();

        let policies = [policy(DataClass::Ocr), policy(DataClass::RawFrame)];
        let pass = sweeper.sweep_all(&policies, now()).await;
        assert_eq!(pass.failures.len(), 1);
        assert_eq!(pass.failures[0].0, DataClass::Ocr);
        assert!(matches!(
            pass.failures[0].1.downcast_ref::<PipelineError>(),
            Some(PipelineError::RetentionSweepInterrupted { data_class: DataClass::Ocr, .. })
        ));
        assert_eq!(pass.outcomes.len(), 1);
        assert_eq!(pass.outcomes[0].data_class, DataClass::RawFrame);
        assert_eq!(pass.rows_deleted(), 2);
        assert_eq!(facts.count_rows(FactTable::Frames).unwrap(), 0);
        assert!(sweeper.db.unfinished_sweep(DataClass::Ocr).await.unwrap().is_some());

        fs::remove_dir(&blocker).unwrap();
        let pass = sweeper.sweep_all(&policies, now()).await;
        assert!(pass.failures.is_empty());
        let resumed: Vec<&SweepOutcome> = pass.outcomes.iter().filter(|o| o.resumed).collect();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].rows_deleted, 1);
        assert_eq!(facts.count_rows(FactTable::Ocr).unwrap(), 1);
        assert!(sweeper.db.unfinished_sweep(DataClass::Ocr).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resuming_closes_out_older_checkpoints() {
        let (_facts_dir, _db_dir, facts, sweeper) = setup();
        facts.write_segment(0, "old", &[ocr(1), ocr(2)], 8).unwrap();
        let stale = sweeper.db.begin_sweep(DataClass::Ocr, 1, 0).await.unwrap();
        let pending = sweeper.db.begin_sweep(DataClass::Ocr, BOUNDARY, 2).await.unwrap();

        let outcomes = sweeper.sweep(&policy(DataClass::Ocr), now()).await.unwrap();
        assert!(outcomes[0].resumed);
        assert_eq!(outcomes[0].rows_deleted, 2);
        assert!(sweeper.db.unfinished_sweep(DataClass::Ocr).await.unwrap().is_none());

        let log = sweeper.db.sweep_log(10).await.unwrap();
        let status = |id: i64| log.iter().find(|s| s.id == id).unwrap().status;
        assert_eq!(status(pending), crate::db::SweepStatus::Completed);
        assert_eq!(status(stale), crate::db::SweepStatus::Superseded);
    }
}
