use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::DataClass;

pub const MAGIC: &[u8; 4] = b"STF1";
pub const FORMAT_VERSION: u32 = 1;
pub const BATCH_EXTENSION: &str = "stf";
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FactTable {
    Frames,
    SceneChanges,
    Ocr,
    Events,
}

impl FactTable {
    pub const ALL: [FactTable; 4] = [
        FactTable::Frames,
        FactTable::SceneChanges,
        FactTable::Ocr,
        FactTable::Events,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactTable::Frames => "frames",
            FactTable::SceneChanges => "scene_changes",
            FactTable::Ocr => "ocr",
            FactTable::Events => "events",
        }
    }

    pub fn data_class(&self) -> DataClass {
        match self {
            FactTable::Frames | FactTable::SceneChanges => DataClass::RawFrame,
            FactTable::Ocr => DataClass::Ocr,
            FactTable::Events => DataClass::Event,
        }
    }

    pub fn for_class(class: DataClass) -> &'static [FactTable] {
        match class {
            DataClass::RawFrame => &[FactTable::Frames, FactTable::SceneChanges],
            DataClass::Ocr => &[FactTable::Ocr],
            DataClass::Event => &[FactTable::Events],
            DataClass::Span => &[],
        }
    }
}

/// One column of a batch. Floats travel as their IEEE-754 bit patterns so a
/// round-trip through the text encoding is exact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum Column {
    I64(Vec<i64>),
    U64(Vec<u64>),
    F64Bits(Vec<u64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
    OptStr(Vec<Option<String>>),
    StrList(Vec<Vec<String>>),
}

impl Column {
    pub fn f64s(values: impl IntoIterator<Item = f64>) -> Self {
        Column::F64Bits(values.into_iter().map(f64::to_bits).collect())
    }

    pub fn len(&self) -> usize {
        match self {
            Column::I64(v) => v.len(),
            Column::U64(v) | Column::F64Bits(v) => v.len(),
            Column::Bool(v) => v.len(),
            Column::Str(v) => v.len(),
            Column::OptStr(v) => v.len(),
            Column::StrList(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> &'static str {
        match self {
            Column::I64(_) => "i64",
            Column::U64(_) => "u64",
            Column::F64Bits(_) => "f64",
            Column::Bool(_) => "bool",
            Column::Str(_) => "str",
            Column::OptStr(_) => "opt_str",
            Column::StrList(_) => "str_list",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    pub offset: u64,
    pub len: u64,
}

/// Uncompressed batch header, readable without touching column data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchHeader {
    pub version: u32,
    pub table: FactTable,
    pub monitor_id: u32,
    pub segment_id: String,
    pub seq: u32,
    pub rows: u64,
    pub min_ts: i64,
    pub max_ts: i64,
    pub columns: Vec<ColumnMeta>,
}

/// Named columns of equal length.
#[derive(Debug, Default)]
pub struct ColumnSet {
    rows: usize,
    columns: BTreeMap<String, Column>,
}

macro_rules! take_column {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        pub fn $fn_name(&mut self, name: &str) -> Result<Vec<$ty>> {
            match self.columns.remove(name) {
                Some(Column::$variant(values)) => Ok(values),
                Some(other) => bail!("column '{name}' has kind {}", other.kind()),
                None => bail!("missing column '{name}'"),
            }
        }
    };
}

impl ColumnSet {
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            columns: BTreeMap::new(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn push(&mut self, name: &str, column: Column) -> Result<()> {
        if column.len() != self.rows {
            bail!(
                "column '{name}' has {} values, expected {}",
                column.len(),
                self.rows
            );
        }
        self.columns.insert(name.to_string(), column);
        Ok(())
    }

    take_column!(take_i64, I64, i64);
    take_column!(take_u64, U64, u64);
    take_column!(take_bool, Bool, bool);
    take_column!(take_str, Str, String);
    take_column!(take_opt_str, OptStr, Option<String>);
    take_column!(take_str_list, StrList, Vec<String>);

    pub fn take_f64(&mut self, name: &str) -> Result<Vec<f64>> {
        match self.columns.remove(name) {
            Some(Column::F64Bits(bits)) => Ok(bits.into_iter().map(f64::from_bits).collect()),
            Some(other) => bail!("column '{name}' has kind {}", other.kind()),
            None => bail!("missing column '{name}'"),
        }
    }

    pub fn take_u32(&mut self, name: &str) -> Result<Vec<u32>> {
        self.take_u64(name)?
            .into_iter()
            .map(|v| u32::try_from(v).map_err(|_| anyhow!("column '{name}' value {v} overflows u32")))
            .collect()
    }
}

/// Encodes a batch: magic, header length (u32 LE), JSON header, then one
/// zstd-compressed JSON blob per column.
pub fn encode_batch(mut header: BatchHeader, columns: &ColumnSet) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    header.columns.clear();
    header.rows = columns.rows as u64;
    for (name, column) in &columns.columns {
        let raw = serde_json::to_vec(column)?;
        let compressed = zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)
            .with_context(|| format!("Failed to compress column '{name}'"))?;
        header.columns.push(ColumnMeta {
            name: name.clone(),
            offset: body.len() as u64,
            len: compressed.len() as u64,
        });
        body.extend_from_slice(&compressed);
    }

    let header_bytes = serde_json::to_vec(&header)?;
    let header_len = u32::try_from(header_bytes.len()).context("Batch header too large")?;

    let mut out = Vec::with_capacity(8 + header_bytes.len() + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parses the header and returns it with the offset where column data begins.
pub fn decode_header(bytes: &[u8]) -> Result<(BatchHeader, usize)> {
    if bytes.len() < 8 || &bytes[..4] != MAGIC {
        bail!("not a fact batch");
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[4..8]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    let body_start = 8 + header_len;
    if bytes.len() < body_start {
        bail!("truncated batch header");
    }
    let header: BatchHeader = serde_json::from_slice(&bytes[8..body_start]).context("Invalid batch header")?;
    if header.version != FORMAT_VERSION {
        bail!("unsupported batch version {}", header.version);
    }
    Ok((header, body_start))
}

pub fn decode_batch(bytes: &[u8]) -> Result<(BatchHeader, ColumnSet)> {
    let (header, body_start) = decode_header(bytes)?;
    let body = &bytes[body_start..];
    let mut columns = ColumnSet::new(usize::try_from(header.rows)?);

    for meta in &header.columns {
        let start = usize::try_from(meta.offset)?;
        let end = start
            .checked_add(usize::try_from(meta.len)?)
            .filter(|end| *end <= body.len())
            .ok_or_else(|| anyhow!("column '{}' runs past end of batch", meta.name))?;
        let raw = zstd::decode_all(&body[start..end])
            .with_context(|| format!("Failed to decompress column '{}'", meta.name))?;
        let column: Column = serde_json::from_slice(&raw)
            .with_context(|| format!("Invalid column '{}'", meta.name))?;
        columns.push(&meta.name, column)?;
    }

    Ok((header, columns))
}
