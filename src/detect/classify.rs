use crate::models::{ChangeType, SceneSignals};
use crate::settings::DetectorSettings;

const W_SSIM: f64 = 0.4;
const W_PHASH: f64 = 0.4;
const W_ENTROPY: f64 = 0.2;

/// First matching rule wins. Anything unmatched, including ambiguous
/// mixtures of signals, resolves to `ChangeType::None`.
pub fn classify(signals: &SceneSignals, cfg: &DetectorSettings) -> ChangeType {
    let structural = signals.ssim < cfg.ssim_threshold;
    let distance = signals.phash_distance;

    if structural && distance > cfg.cut_distance {
        return ChangeType::Cut;
    }
    if structural
        && distance >= cfg.fade_distance_min
        && distance <= cfg.cut_distance
        && signals.entropy_delta < cfg.entropy_threshold
    {
        return ChangeType::Fade;
    }
    if !structural && distance > cfg.motion_distance {
        return ChangeType::Motion;
    }
    if signals.entropy_delta > cfg.entropy_threshold {
        return ChangeType::ContentChange;
    }
    ChangeType::None
}

/// Weighted fusion of the three signals in [0, 1], non-decreasing in
/// `1 - ssim`, `phash_distance` and `entropy_delta` individually.
pub fn confidence(signals: &SceneSignals, cfg: &DetectorSettings) -> f64 {
    let ssim_term = (1.0 - signals.ssim).clamp(0.0, 1.0);
    let phash_term = (f64::from(signals.phash_distance) / 64.0).clamp(0.0, 1.0);
    let entropy_term = (signals.entropy_delta / cfg.entropy_threshold).clamp(0.0, 1.0);

    let base = (W_SSIM * ssim_term + W_PHASH * phash_term + W_ENTROPY * entropy_term).clamp(0.0, 1.0);

    if strong_signal_count(signals, cfg) >= 2 {
        (cfg.agreement_boost + base * (1.0 - cfg.agreement_boost)).clamp(0.0, 1.0)
    } else {
        base
    }
}

fn strong_signal_count(signals: &SceneSignals, cfg: &DetectorSettings) -> usize {
    [
        signals.ssim < cfg.strong_ssim_threshold,
        signals.phash_distance > cfg.cut_distance,
        signals.entropy_delta >= 2.0 * cfg.entropy_threshold,
    ]
    .iter()
    .filter(|&&strong| strong)
    .count()
}

pub fn assess(signals: &SceneSignals, cfg: &DetectorSettings) -> (ChangeType, f64) {
    (classify(signals, cfg), confidence(signals, cfg))
}
