use crate::models::{CursorEvent, CursorKind, EventRecord, EventType, FrameId, OcrRecord};

/// A retained frame as seen by the cursor join.
#[derive(Debug, Clone)]
pub struct JoinFrame {
    pub frame_id: FrameId,
    pub ts_ns: i64,
    /// Window-level target used when the click lands outside every region.
    pub window_target: String,
    pub regions: Vec<OcrRecord>,
}

/// Index of the frame nearest to `ts_ns` within `window_ns`, if any.
/// `frames` must be ordered by timestamp; ties go to the earlier frame.
pub fn nearest_frame(frames: &[JoinFrame], ts_ns: i64, window_ns: i64) -> Option<usize> {
    let split = frames.partition_point(|f| f.ts_ns < ts_ns);
    let before = split.checked_sub(1);
    let after = (split < frames.len()).then_some(split);

    let best = match (before, after) {
        (Some(b), Some(a)) => {
            let db = ts_ns - frames[b].ts_ns;
            let da = frames[a].ts_ns - ts_ns;
            if db <= da {
                b
            } else {
                a
            }
        }
        (Some(b), None) => b,
        (None, Some(a)) => a,
        (None, None) => return None,
    };

    ((frames[best].ts_ns - ts_ns).abs() <= window_ns).then_some(best)
}

/// Builds the `cursor_action` for a click joined to `frame`.
///
/// Classification confidence falls off linearly with the time gap. A click
/// inside an OCR region targets that region and is additionally capped by
/// the region's OCR confidence.
pub fn cursor_action(click: &CursorEvent, frame: &JoinFrame, window_ns: i64) -> Option<EventRecord> {
    if click.kind != CursorKind::Click {
        return None;
    }

    let gap = (frame.ts_ns - click.ts_ns).abs() as f64;
    let proximity = if window_ns <= 0 {
        1.0
    } else {
        (1.0 - gap / window_ns as f64).clamp(0.0, 1.0)
    };

    // Smallest region wins when regions nest.
    let hit = frame
        .regions
        .iter()
        .filter(|r| r.roi.contains(click.x, click.y))
        .min_by(|a, b| {
            a.roi
                .area()
                .cmp(&b.roi.area())
                .then_with(|| a.region_id.cmp(&b.region_id))
        });

    let position = format!("click@{:.0},{:.0}", click.x, click.y);
    let event = match hit {
        Some(region) => EventRecord::new(
            click.ts_ns,
            click.monitor_id,
            EventType::CursorAction,
            region.region_id.as_str(),
            Some(region.text.clone()),
            Some(position),
            proximity.min(region.confidence),
            vec![frame.frame_id.clone()],
        ),
        None => {
            let target = if click.target_window.is_empty() {
                frame.window_target.clone()
            } else {
                click.target_window.clone()
            };
            EventRecord::new(
                click.ts_ns,
                click.monitor_id,
                EventType::CursorAction,
                target,
                None,
                Some(position),
                proximity,
                vec![frame.frame_id.clone()],
            )
        }
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RegionGeometry, RegionId};

    const MS: i64 = 1_000_000;

    fn frame(ts_ms: i64, regions: Vec<OcrRecord>) -> JoinFrame {
        JoinFrame {
            frame_id: FrameId::new(0, ts_ms * MS),
            ts_ns: ts_ms * MS,
            window_target: "Browser".into(),
            regions,
        }
    }

    fn region(id: &str, geometry: RegionGeometry, text: &str, confidence: f64) -> OcrRecord {
        OcrRecord {
            frame_id: FrameId::new(0, 0),
            ts_ns: 0,
            monitor_id: 0,
            region_id: RegionId(id.into()),
            roi: geometry,
            text: text.into(),
            language: "en".into(),
            confidence,
            pii_filtered: false,
        }
    }

    fn click(ts_ms: i64, x: f64, y: f64) -> CursorEvent {
        CursorEvent {
            ts_ns: ts_ms * MS,
            monitor_id: 0,
            kind: CursorKind::Click,
            x,
            y,
            target_window: String::new(),
        }
    }

    #[test]
    fn nearest_frame_respects_window() {
        let frames = vec![frame(0, vec![]), frame(1_000, vec![]), frame(3_000, vec![])];
        assert_eq!(nearest_frame(&frames, 400 * MS, 500 * MS), Some(0));
        assert_eq!(nearest_frame(&frames, 700 * MS, 500 * MS), Some(1));
        assert_eq!(nearest_frame(&frames, 500 * MS, 500 * MS), Some(0));
        assert_eq!(nearest_frame(&frames, 2_000 * MS, 500 * MS), None);
        assert_eq!(nearest_frame(&[], 0, 500 * MS), None);
    }

    #[test]
    fn click_in_region_targets_region() {
        let f = frame(
            1_000,
            vec![region("submit", RegionGeometry::new(100, 100, 80, 20), "Submit", 0.7)],
        );
        let event = cursor_action(&click(1_000, 120.0, 110.0), &f, 1_500 * MS).unwrap();
        assert_eq!(event.target, "submit");
        assert_eq!(event.value_from.as_deref(), Some("Submit"));
        assert!(event.confidence <= 0.7);
        assert_eq!(event.evidence_frames, vec![f.frame_id.clone()]);
    }

    #[test]
    fn click_outside_regions_targets_window() {
        let f = frame(1_000, vec![]);
        let event = cursor_action(&click(1_750, 5.0, 5.0), &f, 1_500 * MS).unwrap();
        assert_eq!(event.target, "Browser");
        assert!((event.confidence - 0.5).abs() < 1e-12);
    }

    #[test]
    fn moves_are_ignored() {
        let mut c = click(0, 0.0, 0.0);
        c.kind = CursorKind::Move;
        assert!(cursor_action(&c, &frame(0, vec![]), MS).is_none());
    }
}
