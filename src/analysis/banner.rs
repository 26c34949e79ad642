use anyhow::{Context, Result};
use image::GrayImage;
use regex::Regex;

use crate::extract::region_contrast;
use crate::models::RegionGeometry;

const STRONG_KEYWORD: f64 = 0.6;
const WEAK_KEYWORD: f64 = 0.35;
const PLACEMENT_BONUS: f64 = 0.2;
const CONTRAST_BONUS: f64 = 0.15;
const NEW_REGION_BONUS: f64 = 0.1;
/// Luminance standard deviation at which a region counts as high contrast.
const HIGH_CONTRAST_STD: f64 = 48.0;

/// Heuristic matcher for alert-like overlays: error banners, modals, toasts.
pub struct BannerMatcher {
    strong: Regex,
    weak: Regex,
}

/// Everything the matcher looks at for one OCR region.
pub struct BannerCandidate<'a> {
    pub text: &'a str,
    pub geometry: &'a RegionGeometry,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Reduced luminance of the frame the region was read from.
    pub luma: Option<&'a GrayImage>,
    /// Region was not part of the previous frame's region set.
    pub is_new: bool,
}

impl BannerMatcher {
    pub fn new() -> Result<Self> {
        let strong = Regex::new(
            r"(?i)\b(error|failed|failure|fatal|exception|denied|invalid|cannot|can't|unable to|crash(ed)?|rejected)\b",
        )
        .context("Failed to compile strong banner pattern")?;
        let weak = Regex::new(
            r"(?i)\b(warning|alert|attention|problem|try again|not found|timed out|timeout|expired|unavailable|oops|not allowed)\b",
        )
        .context("Failed to compile weak banner pattern")?;
        Ok(Self { strong, weak })
    }

    /// Pattern-match strength in (0, 1], or `None` when the text carries no
    /// alert-like phrasing at all.
    pub fn strength(&self, candidate: &BannerCandidate<'_>) -> Option<f64> {
        let mut strength = if self.strong.is_match(candidate.text) {
            STRONG_KEYWORD
        } else if self.weak.is_match(candidate.text) {
            WEAK_KEYWORD
        } else {
            return None;
        };

        if is_top_or_center(candidate.geometry, candidate.frame_width, candidate.frame_height) {
            strength += PLACEMENT_BONUS;
        }
        if let Some(luma) = candidate.luma {
            let std = scaled_contrast(
                luma,
                candidate.geometry,
                candidate.frame_width,
                candidate.frame_height,
            );
            if std.is_some_and(|std| std >= HIGH_CONTRAST_STD) {
                strength += CONTRAST_BONUS;
            }
        }
        if candidate.is_new {
            strength += NEW_REGION_BONUS;
        }

        Some(strength.min(1.0))
    }
}

fn is_top_or_center(geometry: &RegionGeometry, frame_width: u32, frame_height: u32) -> bool {
    if frame_width == 0 || frame_height == 0 {
        return false;
    }
    let (cx, cy) = geometry.center();
    let w = f64::from(frame_width);
    let h = f64::from(frame_height);
    let near_top = cy < h * 0.2;
    let centered = (cx - w / 2.0).abs() < w * 0.25 && (cy - h / 2.0).abs() < h * 0.2;
    near_top || centered
}

/// Standard deviation of the region's luminance, measured on the reduced image.
fn scaled_contrast(
    luma: &GrayImage,
    geometry: &RegionGeometry,
    frame_width: u32,
    frame_height: u32,
) -> Option<f64> {
    if frame_width == 0 || frame_height == 0 {
        return None;
    }
    let sx = f64::from(luma.width()) / f64::from(frame_width);
    let sy = f64::from(luma.height()) / f64::from(frame_height);
    let x0 = (f64::from(geometry.x) * sx).floor() as u32;
    let y0 = (f64::from(geometry.y) * sy).floor() as u32;
    let x1 = (f64::from(geometry.x + geometry.width) * sx).ceil() as u32;
    let y1 = (f64::from(geometry.y + geometry.height) * sy).ceil() as u32;
    region_contrast(luma, x0, y0, x1.max(x0 + 1), y1.max(y0 + 1)).map(|(_, std)| std)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn candidate<'a>(text: &'a str, geometry: &'a RegionGeometry, is_new: bool) -> BannerCandidate<'a> {
        BannerCandidate {
            text,
            geometry,
            frame_width: 1000,
            frame_height: 1000,
            luma: None,
            is_new,
        }
    }

    #[test]
    fn plain_text_is_not_a_banner() {
        let matcher = BannerMatcher::new().unwrap();
        let g = RegionGeometry::new(0, 0, 100, 20);
        assert_eq!(matcher.strength(&candidate("Inbox (3)", &g, true)), None);
    }

    #[test]
    fn strong_keyword_at_top_scores_higher_than_weak_at_bottom() {
        let matcher = BannerMatcher::new().unwrap();
        let top = RegionGeometry::new(300, 20, 400, 30);
        let bottom = RegionGeometry::new(10, 950, 200, 30);
        let strong = matcher
            .strength(&candidate("Error: payment failed", &top, true))
            .unwrap();
        let weak = matcher
            .strength(&candidate("Warning: low disk", &bottom, false))
            .unwrap();
        assert!((strong - 0.9).abs() < 1e-12);
        assert!((weak - 0.35).abs() < 1e-12);
    }

    #[test]
    fn high_contrast_region_gets_bonus() {
        let matcher = BannerMatcher::new().unwrap();
        let luma = GrayImage::from_fn(64, 64, |x, _| if x % 2 == 0 { Luma([0]) } else { Luma([255]) });
        let g = RegionGeometry::new(10, 900, 300, 60);
        let mut c = candidate("Unable to save", &g, false);
        let without = matcher.strength(&c).unwrap();
        c.luma = Some(&luma);
        let with = matcher.strength(&c).unwrap();
        assert!((with - without - CONTRAST_BONUS).abs() < 1e-12);
    }
}
