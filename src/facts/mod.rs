//! Append-only columnar fact tables: frames, scene changes, OCR, events.

pub mod format;
pub mod query;
pub mod rows;
pub mod store;

pub use format::{BatchHeader, Column, ColumnSet, FactTable};
pub use rows::FactRow;
pub use store::{read_batch, read_header, BatchInfo, ExpireReport, FactStore};
