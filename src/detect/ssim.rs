use image::GrayImage;

const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);
const WINDOW: u32 = 8;

/// Mean structural similarity over overlapping 8x8 luminance windows,
/// clamped to [0, 1]. Both images must have the same dimensions.
pub fn ssim(a: &GrayImage, b: &GrayImage) -> f64 {
    if a.dimensions() != b.dimensions() {
        return 0.0;
    }
    let (w, h) = a.dimensions();
    let window = WINDOW.min(w).min(h);
    if window == 0 {
        return 1.0;
    }
    let stride = (window / 2).max(1);

    let mut total = 0.0;
    let mut count = 0u64;
    let mut y = 0;
    while y + window <= h {
        let mut x = 0;
        while x + window <= w {
            total += window_ssim(a, b, x, y, window);
            count += 1;
            x += stride;
        }
        y += stride;
    }

    if count == 0 {
        return 1.0;
    }
    (total / count as f64).clamp(0.0, 1.0)
}

fn window_ssim(a: &GrayImage, b: &GrayImage, x0: u32, y0: u32, window: u32) -> f64 {
    let n = f64::from(window * window);
    let mut sum_a = 0.0;
    let mut sum_b = 0.0;
    for y in y0..y0 + window {
        for x in x0..x0 + window {
            sum_a += f64::from(a.get_pixel(x, y).0[0]);
            sum_b += f64::from(b.get_pixel(x, y).0[0]);
        }
    }
    let mu_a = sum_a / n;
    let mu_b = sum_b / n;

    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut cov = 0.0;
    for y in y0..y0 + window {
        for x in x0..x0 + window {
            let da = f64::from(a.get_pixel(x, y).0[0]) - mu_a;
            let db = f64::from(b.get_pixel(x, y).0[0]) - mu_b;
            var_a += da * da;
            var_b += db * db;
            cov += da * db;
        }
    }
    var_a /= n;
    var_b /= n;
    cov /= n;

    let numerator = (2.0 * mu_a * mu_b + C1) * (2.0 * cov + C2);
    let denominator = (mu_a * mu_a + mu_b * mu_b + C1) * (var_a + var_b + C2);
    numerator / denominator
}
