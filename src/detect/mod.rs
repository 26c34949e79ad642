//! Change Detector: fuses SSIM, pHash distance and entropy delta to decide
//! which frames are kept.

pub mod classify;
pub mod detector;
pub mod phash;
pub mod ssim;

pub use classify::{assess, classify, confidence};
pub use detector::{ChangeDetector, Observation};
pub use phash::{hamming_distance, PerceptualHasher};
pub use ssim::ssim;
