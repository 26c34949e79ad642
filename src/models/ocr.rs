use std::fmt;

use serde::{Deserialize, Serialize};

use super::FrameId;

/// Axis-aligned region of interest in frame pixel coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RegionGeometry {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionGeometry {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn center(&self) -> (f64, f64) {
        (
            f64::from(self.x) + f64::from(self.width) / 2.0,
            f64::from(self.y) + f64::from(self.height) / 2.0,
        )
    }

    pub fn contains(&self, px: f64, py: f64) -> bool {
        px >= f64::from(self.x)
            && py >= f64::from(self.y)
            && px < f64::from(self.x) + f64::from(self.width)
            && py < f64::from(self.y) + f64::from(self.height)
    }

    /// Intersection over union, 0.0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &RegionGeometry) -> f64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        let inter = u64::from(x2 - x1) * u64::from(y2 - y1);
        let union = self.area() + other.area() - inter;
        if union == 0 {
            0.0
        } else {
            inter as f64 / union as f64
        }
    }

    /// `"x,y,wxh"`, the `roi` column encoding.
    pub fn to_roi(&self) -> String {
        format!("{},{},{}x{}", self.x, self.y, self.width, self.height)
    }

    pub fn parse_roi(value: &str) -> Option<Self> {
        let mut parts = value.split(',');
        let x = parts.next()?.parse().ok()?;
        let y = parts.next()?.parse().ok()?;
        let (w, h) = parts.next()?.split_once('x')?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(x, y, w.parse().ok()?, h.parse().ok()?))
    }
}

/// Stable identity of a screen region across frames of the same layout.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(pub String);

impl RegionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One recognised text region as delivered by the external OCR engine.
///
/// PII masking has already been applied upstream; `pii_filtered` records
/// whether the masker altered the text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OcrFieldInput {
    pub geometry: RegionGeometry,
    pub text: String,
    #[serde(default)]
    pub language: String,
    pub confidence: f64,
    #[serde(default)]
    pub pii_filtered: bool,
}

/// Row of the `ocr` fact table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OcrRecord {
    pub frame_id: FrameId,
    pub ts_ns: i64,
    pub monitor_id: u32,
    pub region_id: RegionId,
    pub roi: RegionGeometry,
    pub text: String,
    pub language: String,
    pub confidence: f64,
    pub pii_filtered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = RegionGeometry::new(10, 10, 20, 20);
        assert!((a.iou(&a) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = RegionGeometry::new(0, 0, 10, 10);
        let b = RegionGeometry::new(10, 10, 10, 10);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn roi_encoding_round_trips() {
        let g = RegionGeometry::new(4, 8, 120, 16);
        assert_eq!(g.to_roi(), "4,8,120x16");
        assert_eq!(RegionGeometry::parse_roi(&g.to_roi()), Some(g));
        assert_eq!(RegionGeometry::parse_roi("4,8"), None);
    }
}
