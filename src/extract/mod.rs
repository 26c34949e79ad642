//! Frame Extractor: samples segments into stills and measures them.

pub mod source;
pub mod stats;

pub use source::{collect_stills, FfmpegFrameSource, FrameSource};
pub use stats::{load_still, luminance_entropy, reduce_luma, region_contrast, FrameStats};
