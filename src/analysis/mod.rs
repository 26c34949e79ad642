//! OCR Delta Analyzer: turns per-frame OCR fields into field change,
//! navigation, cursor and error banner events.

pub mod analyzer;
pub mod banner;
pub mod cursor;
pub mod region;
pub mod text;

pub use analyzer::{window_target, DeltaAnalyzer, FrameAnalysis, FrameInput, RegionState};
pub use banner::{BannerCandidate, BannerMatcher};
pub use cursor::{cursor_action, nearest_frame, JoinFrame};
pub use region::{assign_region_ids, quantized_id, set_similarity};
pub use text::{normalize, similarity};
