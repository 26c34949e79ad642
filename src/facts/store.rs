use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, warn};

use crate::models::{EventRecord, FrameRecord, OcrRecord, SceneChange};

use super::format::{decode_batch, decode_header, encode_batch, BatchHeader, FactTable, BATCH_EXTENSION, FORMAT_VERSION, MAGIC};
use super::rows::FactRow;

const TMP_EXTENSION: &str = "tmp";

#[derive(Debug, Clone)]
pub struct BatchInfo {
    pub path: PathBuf,
    pub header: BatchHeader,
}

/// Result of expiring one table up to a boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpireReport {
    pub rows_deleted: u64,
    pub batches_removed: u64,
    pub batches_rewritten: u64,
    /// Image paths of expired frame rows.
    pub frame_paths: Vec<String>,
}

/// Append-only columnar fact store rooted at a directory.
///
/// Layout: `{root}/{table}/m{monitor}/{segment}-{seq}.stf`, plus retained
/// stills under `{root}/images/m{monitor}/`. Batch names are a function of
/// (table, monitor, segment, seq), so replaying a segment overwrites its
/// batches instead of duplicating rows.
pub struct FactStore {
    root: PathBuf,
}

impl FactStore {
    /// Opens (creating if needed) the store and removes leftovers of
    /// interrupted writes.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for table in FactTable::ALL {
            let dir = root.join(table.as_str());
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create fact directory {}", dir.display()))?;
        }
        fs::create_dir_all(root.join("images"))?;

        let store = Self { root };
        let removed = store.remove_partial_writes()?;
        if removed > 0 {
            warn!("Removed {removed} partially written fact batch(es)");
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_dir(&self, monitor_id: u32) -> PathBuf {
        self.root.join("images").join(format!("m{monitor_id}"))
    }

    /// Where `persist_image` puts the still of `source` taken at `ts_ns`.
    pub fn image_path(&self, monitor_id: u32, ts_ns: i64, source: &Path) -> PathBuf {
        let ext = source.extension().and_then(|e| e.to_str()).unwrap_or("png");
        self.image_dir(monitor_id).join(format!("{ts_ns}.{ext}"))
    }

    /// Copies a retained still into the store and returns its durable path.
    pub fn persist_image(&self, monitor_id: u32, ts_ns: i64, source: &Path) -> Result<PathBuf> {
        fs::create_dir_all(self.image_dir(monitor_id))?;
        let target = self.image_path(monitor_id, ts_ns, source);
        let bytes = fs::read(source).with_context(|| format!("Failed to read still {}", source.display()))?;
        write_atomic(&target, &bytes)?;
        Ok(target)
    }

    pub fn batch_path(&self, table: FactTable, monitor_id: u32, segment_id: &str, seq: u32) -> PathBuf {
        self.monitor_dir(table, monitor_id)
            .join(format!("{}-{seq:05}.{BATCH_EXTENSION}", sanitize(segment_id)))
    }

    fn monitor_dir(&self, table: FactTable, monitor_id: u32) -> PathBuf {
        self.root.join(table.as_str()).join(format!("m{monitor_id}"))
    }

    /// Writes all rows of one segment for one table, split into batches of at
    /// most `max_rows`. Every batch is durable before this returns.
    pub fn write_segment<R: FactRow>(
        &self,
        monitor_id: u32,
        segment_id: &str,
        rows: &[R],
        max_rows: usize,
    ) -> Result<Vec<BatchInfo>> {
        let max_rows = max_rows.max(1);
        let mut written = Vec::new();
        for (seq, chunk) in rows.chunks(max_rows).enumerate() {
            let seq = u32::try_from(seq).context("Too many batches for one segment")?;
            written.push(self.write_batch(monitor_id, segment_id, seq, chunk)?);
        }

        // A replay may produce fewer batches than an earlier attempt.
        let next_seq = u32::try_from(written.len()).context("Too many batches for one segment")?;
        self.remove_batches_from(R::TABLE, monitor_id, segment_id, next_seq)?;
        Ok(written)
    }

    fn write_batch<R: FactRow>(&self, monitor_id: u32, segment_id: &str, seq: u32, rows: &[R]) -> Result<BatchInfo> {
        let path = self.batch_path(R::TABLE, monitor_id, segment_id, seq);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let header = header_for(R::TABLE, monitor_id, segment_id, seq, rows);
        let bytes = encode_batch(header, &R::to_columns(rows)?)?;
        write_atomic(&path, &bytes)?;
        let header = read_header(&path)?;
        debug!("Wrote {} row(s) to {}", header.rows, path.display());
        Ok(BatchInfo { path, header })
    }

    fn remove_batches_from(&self, table: FactTable, monitor_id: u32, segment_id: &str, from_seq: u32) -> Result<usize> {
        let mut seq = from_seq;
        let mut removed = 0;
        loop {
            let path = self.batch_path(table, monitor_id, segment_id, seq);
            if !path.exists() {
                return Ok(removed);
            }
            fs::remove_file(&path).with_context(|| format!("Failed to remove stale batch {}", path.display()))?;
            removed += 1;
            seq += 1;
        }
    }

    /// Removes every batch a segment wrote, on any monitor, together with the
    /// stills its frame rows point at. Returns the number of batches removed.
    pub fn remove_segment(&self, segment_id: &str) -> Result<usize> {
        let mut removed = 0;
        for table in FactTable::ALL {
            for dir in subdirs(&self.root.join(table.as_str()))? {
                let monitor_id = match dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_prefix('m'))
                    .and_then(|n| n.parse::<u32>().ok())
                {
                    Some(id) => id,
                    None => continue,
                };
                if table == FactTable::Frames {
                    let mut seq = 0;
                    loop {
                        let path = self.batch_path(table, monitor_id, segment_id, seq);
                        if !path.exists() {
                            break;
                        }
                        let (_, rows) = read_batch::<FrameRecord>(&path)?;
                        for row in rows {
                            let still = Path::new(&row.path);
                            if still.starts_with(&self.root) {
                                remove_file_if_present(still)?;
                            }
                        }
                        seq += 1;
                    }
                }
                removed += self.remove_batches_from(table, monitor_id, segment_id, 0)?;
            }
        }
        if removed > 0 {
            debug!("Removed {removed} batch(es) of segment {segment_id}");
        }
        Ok(removed)
    }

    /// Removes the persisted still `persist_image` would have written.
    pub fn remove_image(&self, monitor_id: u32, ts_ns: i64, source: &Path) -> Result<()> {
        remove_file_if_present(&self.image_path(monitor_id, ts_ns, source))
    }

    /// Completed batch files of `table`, sorted by path. In-flight `.tmp`
    /// files are never listed.
    pub fn list_batches(&self, table: FactTable, monitor_id: Option<u32>) -> Result<Vec<PathBuf>> {
        let dirs = match monitor_id {
            Some(id) => vec![self.monitor_dir(table, id)],
            None => subdirs(&self.root.join(table.as_str()))?,
        };

        let mut batches = Vec::new();
        for dir in dirs {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) == Some(BATCH_EXTENSION) {
                    batches.push(path);
                }
            }
        }
        batches.sort();
        Ok(batches)
    }

    /// Rows of `R` with `from_ts <= ts < to_ts`, ordered by timestamp.
    pub fn scan<R: FactRow>(&self, monitor_id: Option<u32>, from_ts: i64, to_ts: i64) -> Result<Vec<R>> {
        let mut rows = Vec::new();
        for path in self.list_batches(R::TABLE, monitor_id)? {
            let header = match read_header(&path) {
                Ok(header) => header,
                Err(err) if is_missing(&err) => continue,
                Err(err) => return Err(err),
            };
            if header.rows == 0 || header.max_ts < from_ts || header.min_ts >= to_ts {
                continue;
            }
            let batch = match read_batch::<R>(&path) {
                Ok((_, batch)) => batch,
                // Removed by a concurrent retention sweep.
                Err(err) if is_missing(&err) => continue,
                Err(err) => return Err(err),
            };
            rows.extend(batch.into_iter().filter(|r| r.ts_ns() >= from_ts && r.ts_ns() < to_ts));
        }
        rows.sort_by_key(|r| r.ts_ns());
        Ok(rows)
    }

    pub fn count_rows(&self, table: FactTable) -> Result<u64> {
        let mut total = 0;
        for path in self.list_batches(table, None)? {
            total += read_header(&path)?.rows;
        }
        Ok(total)
    }

    /// Rows of `table` with `ts < boundary`. Batches written while counting
    /// only matter if they hold rows that old.
    pub fn count_rows_before(&self, table: FactTable, boundary: i64) -> Result<u64> {
        match table {
            FactTable::Frames => self.count_below::<FrameRecord>(boundary),
            FactTable::SceneChanges => self.count_below::<SceneChange>(boundary),
            FactTable::Ocr => self.count_below::<OcrRecord>(boundary),
            FactTable::Events => self.count_below::<EventRecord>(boundary),
        }
    }

    fn count_below<R: FactRow>(&self, boundary: i64) -> Result<u64> {
        let mut total = 0;
        for path in self.list_batches(R::TABLE, None)? {
            let header = match read_header(&path) {
                Ok(header) => header,
                Err(err) if is_missing(&err) => continue,
                Err(err) => return Err(err),
            };
            if header.rows == 0 || header.min_ts >= boundary {
                continue;
            }
            if header.max_ts < boundary {
                total += header.rows;
                continue;
            }
            let rows = match read_batch::<R>(&path) {
                Ok((_, rows)) => rows,
                Err(err) if is_missing(&err) => continue,
                Err(err) => return Err(err),
            };
            total += rows.iter().filter(|r| r.ts_ns() < boundary).count() as u64;
        }
        Ok(total)
    }

    /// Deletes every row of `table` with `ts < boundary`. Batches wholly below
    /// the boundary are removed; straddling batches are rewritten in place.
    /// Running it again with the same boundary deletes nothing.
    pub fn expire_before(&self, table: FactTable, boundary: i64) -> Result<ExpireReport> {
        match table {
            FactTable::Frames => self.expire_rows::<FrameRecord>(boundary, |row, report| {
                report.frame_paths.push(row.path.clone());
            }),
            FactTable::SceneChanges => self.expire_rows::<SceneChange>(boundary, |_, _| {}),
            FactTable::Ocr => self.expire_rows::<OcrRecord>(boundary, |_, _| {}),
            FactTable::Events => self.expire_rows::<EventRecord>(boundary, |_, _| {}),
        }
    }

    fn expire_rows<R: FactRow>(
        &self,
        boundary: i64,
        mut on_expired: impl FnMut(&R, &mut ExpireReport),
    ) -> Result<ExpireReport> {
        let mut report = ExpireReport::default();
        for path in self.list_batches(R::TABLE, None)? {
            let header = read_header(&path)?;
            if header.rows == 0 || header.min_ts >= boundary {
                continue;
            }

            let (header, rows) = read_batch::<R>(&path)?;
            let (expired, kept): (Vec<R>, Vec<R>) = rows.into_iter().partition(|r| r.ts_ns() < boundary);
            for row in &expired {
                on_expired(row, &mut report);
            }
            report.rows_deleted += expired.len() as u64;

            if kept.is_empty() {
                fs::remove_file(&path).with_context(|| format!("Failed to remove batch {}", path.display()))?;
                sync_dir(&path)?;
                report.batches_removed += 1;
            } else {
                let rewritten = header_for(R::TABLE, header.monitor_id, &header.segment_id, header.seq, &kept);
                let bytes = encode_batch(rewritten, &R::to_columns(&kept)?)?;
                write_atomic(&path, &bytes)?;
                report.batches_rewritten += 1;
            }
        }
        Ok(report)
    }

    fn remove_partial_writes(&self) -> Result<usize> {
        let mut removed = 0;
        let mut dirs = vec![self.root.join("images")];
        for table in FactTable::ALL {
            dirs.push(self.root.join(table.as_str()));
        }
        while let Some(dir) = dirs.pop() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    dirs.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some(TMP_EXTENSION) {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn header_for<R: FactRow>(table: FactTable, monitor_id: u32, segment_id: &str, seq: u32, rows: &[R]) -> BatchHeader {
    BatchHeader {
        version: FORMAT_VERSION,
        table,
        monitor_id,
        segment_id: segment_id.to_string(),
        seq,
        rows: rows.len() as u64,
        min_ts: rows.iter().map(R::ts_ns).min().unwrap_or(0),
        max_ts: rows.iter().map(R::ts_ns).max().unwrap_or(0),
        columns: Vec::new(),
    }
}

/// Reads only the header of a batch file.
pub fn read_header(path: &Path) -> Result<BatchHeader> {
    let mut file = File::open(path).with_context(|| format!("Failed to open batch {}", path.display()))?;
    let mut prefix = [0u8; 8];
    file.read_exact(&mut prefix)
        .with_context(|| format!("Failed to read batch {}", path.display()))?;
    if &prefix[..4] != MAGIC {
        bail!("{} is not a fact batch", path.display());
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&prefix[4..]);
    let mut buf = prefix.to_vec();
    buf.resize(8 + u32::from_le_bytes(len_bytes) as usize, 0);
    file.read_exact(&mut buf[8..])
        .with_context(|| format!("Truncated batch header in {}", path.display()))?;
    Ok(decode_header(&buf)?.0)
}

pub fn read_batch<R: FactRow>(path: &Path) -> Result<(BatchHeader, Vec<R>)> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read batch {}", path.display()))?;
    let (header, columns) = decode_batch(&bytes).with_context(|| format!("Corrupt batch {}", path.display()))?;
    if header.table != R::TABLE {
        bail!("{} holds {} rows, not {}", path.display(), header.table.as_str(), R::TABLE.as_str());
    }
    Ok((header, R::from_columns(columns)?))
}

/// Write to a sibling `.tmp`, fsync, rename over the target, fsync the directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(TMP_EXTENSION);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("Failed to publish {}", path.display()))?;
    sync_dir(path)
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn remove_file_if_present(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

fn sanitize(segment_id: &str) -> String {
    segment_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn is_missing(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, FrameId, OcrStatus};

    fn frame(monitor: u32, ts: i64) -> FrameRecord {
        FrameRecord {
            frame_id: FrameId::new(monitor, ts),
            ts_ns: ts,
            monitor_id: monitor,
            segment_id: "seg-a".into(),
            path: format!("/img/{ts}.png"),
            phash: 0xdead_beef_0000_0001,
            entropy: 0.1 + 0.2,
            width: 1920,
            height: 1080,
            app_name: "Terminal".into(),
            window_title: "zsh — 80×24".into(),
            ocr_status: OcrStatus::Ok,
        }
    }

    #[test]
    fn frames_round_trip_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path()).unwrap();
        let rows: Vec<_> = (0..5).map(|i| frame(1, 100 + i)).collect();
        store.write_segment(1, "seg-a", &rows, 2).unwrap();

        let back: Vec<FrameRecord> = store.scan(Some(1), i64::MIN, i64::MAX).unwrap();
        assert_eq!(back, rows);
        assert_eq!(back[0].entropy.to_bits(), (0.1f64 + 0.2).to_bits());
        assert_eq!(store.list_batches(FactTable::Frames, Some(1)).unwrap().len(), 3);
    }

    #[test]
    fn removing_a_segment_drops_its_batches_and_stills() {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path()).unwrap();
        let source = dir.path().join("still.png");
        fs::write(&source, b"png").unwrap();
        let image = store.persist_image(1, 100, &source).unwrap();

        let mut rows: Vec<_> = (0..3).map(|i| frame(1, 100 + i)).collect();
        rows[0].path = image.to_string_lossy().into_owned();
        store.write_segment(1, "seg-a", &rows, 2).unwrap();
        store.write_segment(2, "seg-b", &[frame(2, 7)], 8).unwrap();

        assert_eq!(store.remove_segment("seg-a").unwrap(), 2);
        assert!(!image.exists());
        assert!(store.list_batches(FactTable::Frames, Some(1)).unwrap().is_empty());
        assert_eq!(store.count_rows(FactTable::Frames).unwrap(), 1);
        assert_eq!(store.remove_segment("seg-a").unwrap(), 0);
    }

    #[test]
    fn events_round_trip_with_optional_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path()).unwrap();
        let rows = vec![
            EventRecord::new(5, 0, EventType::Navigation, "Mail", None, Some("Inbox".into()), 0.3, vec![]),
            EventRecord::new(
                6,
                0,
                EventType::FieldChange,
                "r1_1_2x1",
                Some("a".into()),
                Some("b".into()),
                1.0 / 3.0,
                vec![FrameId::new(0, 5), FrameId::new(0, 6)],
            ),
        ];
        store.write_segment(0, "s", &rows, 512).unwrap();
        let back: Vec<EventRecord> = store.scan(None, 0, 10).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn replay_overwrites_instead_of_duplicating() {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path()).unwrap();
        let rows: Vec<_> = (0..6).map(|i| frame(2, i)).collect();
        store.write_segment(2, "seg-a", &rows, 2).unwrap();
        store.write_segment(2, "seg-a", &rows, 4).unwrap();

        assert_eq!(store.count_rows(FactTable::Frames).unwrap(), 6);
        assert_eq!(store.list_batches(FactTable::Frames, Some(2)).unwrap().len(), 2);
    }

    #[test]
    fn open_removes_partial_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path()).unwrap();
        store.write_segment(0, "s", &[frame(0, 1)], 8).unwrap();
        let leftover = store.batch_path(FactTable::Frames, 0, "s", 1).with_extension("tmp");
        fs::write(&leftover, b"STF1garbage").unwrap();

        let reopened = FactStore::open(dir.path()).unwrap();
        assert!(!leftover.exists());
        assert_eq!(reopened.count_rows(FactTable::Frames).unwrap(), 1);
    }

    #[test]
    fn expiry_is_idempotent_and_rewrites_straddling_batches() {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path()).unwrap();
        store.write_segment(0, "old", &[frame(0, 1), frame(0, 2)], 8).unwrap();
        store.write_segment(0, "mixed", &[frame(0, 9), frame(0, 11)], 8).unwrap();
        assert_eq!(store.count_rows_before(FactTable::Frames, 10).unwrap(), 3);
        assert_eq!(store.count_rows_before(FactTable::Frames, 1).unwrap(), 0);

        let first = store.expire_before(FactTable::Frames, 10).unwrap();
        assert_eq!(first.rows_deleted, 3);
        assert_eq!(first.batches_removed, 1);
        assert_eq!(first.batches_rewritten, 1);
        assert_eq!(first.frame_paths.len(), 3);

        let second = store.expire_before(FactTable::Frames, 10).unwrap();
        assert_eq!(second.rows_deleted, 0);
        assert_eq!(store.count_rows_before(FactTable::Frames, 10).unwrap(), 0);

        let left: Vec<FrameRecord> = store.scan(None, i64::MIN, i64::MAX).unwrap();
        assert_eq!(left.iter().map(|f| f.ts_ns).collect::<Vec<_>>(), vec![11]);
    }
}
