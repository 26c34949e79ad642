use image::{imageops, imageops::FilterType, DynamicImage, GrayImage};

use crate::extract::FrameStats;
use crate::models::{ChangeType, FrameId, SceneChange, SceneSignals};
use crate::settings::DetectorSettings;

use super::classify::assess;
use super::phash::{hamming_distance, PerceptualHasher};
use super::ssim::ssim;

/// Comparison baseline: the last frame that decoded successfully, whether
/// or not it was retained.
struct Baseline {
    frame_id: FrameId,
    luma: GrayImage,
    phash: u64,
    entropy: f64,
}

/// Result of observing one decoded frame.
#[derive(Debug, Clone)]
pub struct Observation {
    pub stats: FrameStats,
    pub phash: u64,
    pub change: SceneChange,
}

impl Observation {
    pub fn is_retained(&self) -> bool {
        self.change.change_type.is_retained()
    }
}

/// Stateful per-lane scene change detector.
pub struct ChangeDetector {
    settings: DetectorSettings,
    hasher: PerceptualHasher,
    baseline: Option<Baseline>,
}

impl ChangeDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self {
            settings,
            hasher: PerceptualHasher::new(),
            baseline: None,
        }
    }

    /// Thresholds take effect from the next observed frame.
    pub fn set_settings(&mut self, settings: DetectorSettings) {
        self.settings = settings;
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }

    pub fn reset(&mut self) {
        self.baseline = None;
    }

    pub fn observe(
        &mut self,
        frame_id: FrameId,
        ts_ns: i64,
        monitor_id: u32,
        img: &DynamicImage,
    ) -> Observation {
        let stats = FrameStats::from_image(img, self.settings.reduced_size);
        let phash = self.hasher.hash(&stats.luma);

        let change = match &self.baseline {
            None => SceneChange {
                from_frame_id: None,
                to_frame_id: frame_id.clone(),
                ts_ns,
                monitor_id,
                ssim: 0.0,
                phash_distance: 64,
                entropy_delta: stats.entropy,
                change_type: ChangeType::Cut,
                confidence: 1.0,
            },
            Some(baseline) => {
                let signals = self.signals_against(baseline, &stats, phash);
                let (change_type, confidence) = assess(&signals, &self.settings);
                SceneChange {
                    from_frame_id: Some(baseline.frame_id.clone()),
                    to_frame_id: frame_id.clone(),
                    ts_ns,
                    monitor_id,
                    ssim: signals.ssim,
                    phash_distance: signals.phash_distance,
                    entropy_delta: signals.entropy_delta,
                    change_type,
                    confidence,
                }
            }
        };

        self.baseline = Some(Baseline {
            frame_id,
            luma: stats.luma.clone(),
            phash,
            entropy: stats.entropy,
        });

        Observation {
            stats,
            phash,
            change,
        }
    }

    fn signals_against(&self, baseline: &Baseline, stats: &FrameStats, phash: u64) -> SceneSignals {
        let ssim_value = if baseline.luma.dimensions() == stats.luma.dimensions() {
            ssim(&baseline.luma, &stats.luma)
        } else {
            let (w, h) = stats.luma.dimensions();
            let rescaled = imageops::resize(&baseline.luma, w, h, FilterType::Triangle);
            ssim(&rescaled, &stats.luma)
        };

        SceneSignals {
            ssim: ssim_value,
            phash_distance: hamming_distance(baseline.phash, phash),
            entropy_delta: (stats.entropy - baseline.entropy).abs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    fn screen(seed: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(320, 200, move |x, y| {
            let v = ((x / 20 + y / 20 + seed) % 2 * 200 + 20) as u8;
            Rgb([v, v, v])
        }))
    }

    #[test]
    fn first_frame_is_retained_baseline() {
        let mut detector = ChangeDetector::new(DetectorSettings::default());
        let obs = detector.observe(FrameId::new(0, 1), 1, 0, &screen(0));
        assert!(obs.is_retained());
        assert!(obs.change.from_frame_id.is_none());
        assert!(detector.has_baseline());
    }

    #[test]
    fn identical_frames_are_dropped() {
        let mut detector = ChangeDetector::new(DetectorSettings::default());
        detector.observe(FrameId::new(0, 1), 1, 0, &screen(0));
        let obs = detector.observe(FrameId::new(0, 2), 2, 0, &screen(0));

        assert_eq!(obs.change.ssim, 1.0);
        assert_eq!(obs.change.phash_distance, 0);
        assert_eq!(obs.change.change_type, ChangeType::None);
        assert!(!obs.is_retained());
        assert_eq!(obs.change.from_frame_id, Some(FrameId::new(0, 1)));
    }

    #[test]
    fn dropped_frame_becomes_baseline() {
        let mut detector = ChangeDetector::new(DetectorSettings::default());
        detector.observe(FrameId::new(0, 1), 1, 0, &screen(0));
        detector.observe(FrameId::new(0, 2), 2, 0, &screen(0));
        let obs = detector.observe(FrameId::new(0, 3), 3, 0, &screen(0));
        assert_eq!(obs.change.from_frame_id, Some(FrameId::new(0, 2)));
    }

    #[test]
    fn inverted_screen_is_a_change() {
        let mut detector = ChangeDetector::new(DetectorSettings::default());
        detector.observe(FrameId::new(0, 1), 1, 0, &screen(0));
        let obs = detector.observe(FrameId::new(0, 2), 2, 0, &screen(1));
        assert!(obs.change.ssim < 0.5);
        assert!(obs.change.confidence >= 0.2);
    }

    #[test]
    fn dialog_appearing_raises_entropy_delta() {
        let mut detector = ChangeDetector::new(DetectorSettings::default());
        let blank = DynamicImage::ImageLuma8(GrayImage::from_pixel(128, 128, Luma([240])));
        let dialog = DynamicImage::ImageLuma8(GrayImage::from_fn(128, 128, |x, y| {
            if (32..96).contains(&x) && (32..96).contains(&y) {
                Luma([((x * 7 + y * 13) % 200) as u8])
            } else {
                Luma([240])
            }
        }));
        detector.observe(FrameId::new(0, 1), 1, 0, &blank);
        let obs = detector.observe(FrameId::new(0, 2), 2, 0, &dialog);
        assert!(obs.change.entropy_delta > 0.35);
        assert!(obs.is_retained());
    }

    #[test]
    fn reset_forgets_baseline() {
        let mut detector = ChangeDetector::new(DetectorSettings::default());
        detector.observe(FrameId::new(0, 1), 1, 0, &screen(0));
        detector.reset();
        let obs = detector.observe(FrameId::new(0, 2), 2, 0, &screen(0));
        assert!(obs.change.from_frame_id.is_none());
    }
}
