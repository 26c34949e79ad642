use std::path::Path;

use image::{imageops::FilterType, DynamicImage, GrayImage};

use crate::error::PipelineError;

/// Basic statistics of a decoded still at the reduced comparison resolution.
#[derive(Debug, Clone)]
pub struct FrameStats {
    pub width: u32,
    pub height: u32,
    pub luma: GrayImage,
    pub entropy: f64,
}

impl FrameStats {
    pub fn from_image(img: &DynamicImage, reduced_size: u32) -> Self {
        let luma = reduce_luma(img, reduced_size);
        let entropy = luminance_entropy(&luma);
        Self {
            width: img.width(),
            height: img.height(),
            luma,
            entropy,
        }
    }
}

pub fn load_still(path: &Path) -> Result<DynamicImage, PipelineError> {
    let img = image::open(path).map_err(|err| PipelineError::decode(path, err))?;
    if img.width() == 0 || img.height() == 0 {
        return Err(PipelineError::decode(path, "zero-sized image"));
    }
    Ok(img)
}

pub fn reduce_luma(img: &DynamicImage, size: u32) -> GrayImage {
    img.resize_exact(size, size, FilterType::Triangle).to_luma8()
}

/// Shannon entropy, in bits, of the 256-bin luminance histogram.
pub fn luminance_entropy(luma: &GrayImage) -> f64 {
    let mut hist = [0u64; 256];
    for pixel in luma.pixels() {
        hist[pixel.0[0] as usize] += 1;
    }

    let total: u64 = hist.iter().sum();
    if total == 0 {
        return 0.0;
    }

    let total = total as f64;
    hist.iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Mean and standard deviation of luminance inside a rectangle of `luma`.
pub fn region_contrast(luma: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) -> Option<(f64, f64)> {
    let x1 = x1.min(luma.width());
    let y1 = y1.min(luma.height());
    if x0 >= x1 || y0 >= y1 {
        return None;
    }

    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0.0;
    for y in y0..y1 {
        for x in x0..x1 {
            let v = f64::from(luma.get_pixel(x, y).0[0]);
            sum += v;
            sum_sq += v * v;
            n += 1.0;
        }
    }
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    Some((mean, variance.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn flat_image_has_zero_entropy() {
        let img = GrayImage::from_pixel(16, 16, Luma([90]));
        assert_eq!(luminance_entropy(&img), 0.0);
    }

    #[test]
    fn two_level_image_has_one_bit() {
        let img = GrayImage::from_fn(16, 16, |x, _| if x < 8 { Luma([0]) } else { Luma([255]) });
        assert!((luminance_entropy(&img) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn stats_use_reduced_size() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(300, 200, Luma([10])));
        let stats = FrameStats::from_image(&img, 64);
        assert_eq!((stats.width, stats.height), (300, 200));
        assert_eq!(stats.luma.dimensions(), (64, 64));
    }

    #[test]
    fn contrast_of_split_region() {
        let img = GrayImage::from_fn(10, 10, |x, _| if x < 5 { Luma([0]) } else { Luma([200]) });
        let (mean, std) = region_contrast(&img, 0, 0, 10, 10).unwrap();
        assert!((mean - 100.0).abs() < 1e-9);
        assert!((std - 100.0).abs() < 1e-9);
        assert!(region_contrast(&img, 5, 5, 5, 9).is_none());
    }

    #[test]
    fn missing_file_is_decode_error() {
        let err = load_still(Path::new("/nonexistent/frame.png")).unwrap_err();
        assert!(matches!(err, PipelineError::Decode { .. }));
    }
}
