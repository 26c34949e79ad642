mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use screentrail_lib::error::PipelineError;
use screentrail_lib::facts::FactTable;
use screentrail_lib::models::{CursorEvent, CursorKind, EventType, FrameId, OcrStatus, SegmentState};

const CLOCK: (u32, u32, u32, u32) = (260, 10, 50, 20);

fn title_and_clock(clock: &str) -> Vec<screentrail_lib::models::OcrFieldInput> {
    vec![
        field(10, 10, 120, 20, "Inbox", 0.9),
        field(CLOCK.0, CLOCK.1, CLOCK.2, CLOCK.3, clock, 0.9),
    ]
}

#[tokio::test]
async fn clock_tick_yields_exactly_one_field_change() {
    let dir = tempfile::tempdir().unwrap();
    let h = open(dir.path(), test_settings()).await;

    let f0 = FrameId::new(0, BASE_TS);
    let f1 = FrameId::new(0, BASE_TS + SEC);
    h.source.script("seg-a", vec![Screen::Flat(30), Screen::Blocks(1)]);
    h.ocr.answer(f0.clone(), title_and_clock("12:01"));
    h.ocr.answer(f1.clone(), title_and_clock("12:02"));

    h.app.submit(segment("seg-a", 0, BASE_TS, 2)).await.unwrap();
    wait_for_state(&h.app, "seg-a", SegmentState::Persisted).await;

    let events = h.app.facts().events_in_range(Some(0), BASE_TS, BASE_TS + 10 * SEC).unwrap();
    assert_eq!(events.len(), 1, "{events:?}");
    let event = &events[0];
    assert_eq!(event.event_type, EventType::FieldChange);
    assert_eq!(event.value_from.as_deref(), Some("12:01"));
    assert_eq!(event.value_to.as_deref(), Some("12:02"));
    assert_eq!(event.evidence_frames, vec![f0.clone(), f1.clone()]);
    assert!(event.confidence > 0.0 && event.confidence <= 0.9);

    let frames = h.app.facts().frames_in_range(Some(0), BASE_TS, BASE_TS + 10 * SEC).unwrap();
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| std::path::Path::new(&f.path).is_file()));
    assert_eq!(h.app.facts().ocr_for_frame(&f1).unwrap().len(), 2);

    let history = h.app.db().segment_history("seg-a").await.unwrap();
    assert_eq!(
        history,
        vec![
            SegmentState::Arrived,
            SegmentState::Extracting,
            SegmentState::Detecting,
            SegmentState::AwaitingOcr,
            SegmentState::Analyzing,
            SegmentState::Persisted,
        ]
    );

    wait_for_finished(&h.app, 1).await;
    let health = h.app.health().await.unwrap();
    assert_eq!(health.last_hour.persisted, 1);
    assert_eq!(health.counters.frames_kept, 2);

    h.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn near_duplicates_are_dropped_and_evidence_spans_the_gap() {
    let dir = tempfile::tempdir().unwrap();
    let h = open(dir.path(), test_settings()).await;

    let f0 = FrameId::new(0, BASE_TS);
    let f2 = FrameId::new(0, BASE_TS + 2 * SEC);
    h.source
        .script("seg-dup", vec![Screen::Flat(30), Screen::Flat(30), Screen::Blocks(2)]);
    h.ocr.answer(f0.clone(), title_and_clock("12:01"));
    h.ocr.answer(FrameId::new(0, BASE_TS + SEC), title_and_clock("12:02"));
    h.ocr.answer(f2.clone(), title_and_clock("12:03"));

    h.app.submit(segment("seg-dup", 0, BASE_TS, 3)).await.unwrap();
    wait_for_state(&h.app, "seg-dup", SegmentState::Persisted).await;

    let frames = h.app.facts().frames_in_range(Some(0), BASE_TS, BASE_TS + 10 * SEC).unwrap();
    let ids: Vec<&FrameId> = frames.iter().map(|f| &f.frame_id).collect();
    assert_eq!(ids, vec![&f0, &f2]);

    let events = h.app.facts().events_in_range(Some(0), BASE_TS, BASE_TS + 10 * SEC).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].value_from.as_deref(), Some("12:01"));
    assert_eq!(events[0].value_to.as_deref(), Some("12:03"));
    assert_eq!(events[0].evidence_frames, vec![f0, f2]);

    h.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn replaced_window_is_one_navigation_without_field_changes() {
    let dir = tempfile::tempdir().unwrap();
    let h = open(dir.path(), test_settings()).await;

    let f0 = FrameId::new(0, BASE_TS);
    let f1 = FrameId::new(0, BASE_TS + SEC);
    h.source.script("seg-nav", vec![Screen::Flat(30), Screen::Blocks(3)]);
    h.ocr.answer(
        f0.clone(),
        vec![
            field(10, 10, 120, 20, "Inbox", 0.9),
            field(10, 50, 200, 20, "Meeting at 3", 0.8),
            field(10, 90, 200, 20, "Invoice #42", 0.85),
        ],
    );
    h.ocr.answer(
        f1.clone(),
        vec![
            field(40, 140, 100, 16, "def main():", 0.7),
            field(40, 170, 100, 16, "print(x)", 0.75),
        ],
    );

    let seg = with_window(segment("seg-nav", 0, BASE_TS, 2), "Editor", "main.py");
    h.app.submit(seg).await.unwrap();
    wait_for_state(&h.app, "seg-nav", SegmentState::Persisted).await;

    let events = h.app.facts().events_in_range(Some(0), BASE_TS, BASE_TS + 10 * SEC).unwrap();
    assert_eq!(events.len(), 1, "{events:?}");
    assert_eq!(events[0].event_type, EventType::Navigation);
    assert_eq!(events[0].target, "Editor");
    assert_eq!(events[0].evidence_frames, vec![f0, f1]);
    assert!(events[0].confidence <= 0.7);

    h.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn ocr_timeout_keeps_frame_and_lane_moves_on() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings();
    settings.ocr_timeout_ms = 50;
    let h = open(dir.path(), settings).await;

    let slow = FrameId::new(0, BASE_TS + SEC);
    h.source.script("seg-slow", vec![Screen::Flat(30), Screen::Blocks(1)]);
    h.ocr.answer(FrameId::new(0, BASE_TS), title_and_clock("12:01"));
    h.ocr.answer(slow.clone(), title_and_clock("12:02"));
    h.ocr.delay(slow.clone(), Duration::from_millis(600));

    h.source
        .script("seg-next", vec![Screen::Flat(60), Screen::Blocks(4)]);

    h.app.submit(segment("seg-slow", 0, BASE_TS, 2)).await.unwrap();
    h.app
        .submit(segment("seg-next", 0, BASE_TS + 2 * SEC, 2))
        .await
        .unwrap();
    wait_for_state(&h.app, "seg-slow", SegmentState::Persisted).await;
    wait_for_state(&h.app, "seg-next", SegmentState::Persisted).await;

    let frame = h.app.facts().frame(&slow).unwrap().unwrap();
    assert_eq!(frame.ocr_status, OcrStatus::TimedOut);
    assert!(h.app.facts().ocr_for_frame(&slow).unwrap().is_empty());
    let seg_slow_events = h.app.facts().events_in_range(Some(0), BASE_TS, BASE_TS + 2 * SEC).unwrap();
    assert!(seg_slow_events.iter().all(|e| e.event_type != EventType::FieldChange));

    wait_for_finished(&h.app, 2).await;
    assert_eq!(h.app.metrics().counters().await.ocr_timeouts, 1);

    h.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn click_targets_region_under_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let h = open(dir.path(), test_settings()).await;

    let f1 = FrameId::new(0, BASE_TS + SEC);
    h.source.script("seg-click", vec![Screen::Flat(30), Screen::Blocks(1)]);
    h.ocr.answer(FrameId::new(0, BASE_TS), title_and_clock("12:01"));
    h.ocr.answer(f1.clone(), title_and_clock("12:02"));

    let click = CursorEvent {
        ts_ns: BASE_TS + SEC + 100_000_000,
        monitor_id: 0,
        kind: CursorKind::Click,
        x: 285.0,
        y: 20.0,
        target_window: "Mail".into(),
    };
    let hover = CursorEvent {
        kind: CursorKind::Move,
        ..click.clone()
    };
    h.app.submit_cursor(hover).await.unwrap();
    h.app.submit_cursor(click).await.unwrap();
    h.app.submit(segment("seg-click", 0, BASE_TS, 2)).await.unwrap();
    wait_for_state(&h.app, "seg-click", SegmentState::Persisted).await;

    let events = h.app.facts().events_in_range(Some(0), BASE_TS, BASE_TS + 10 * SEC).unwrap();
    let clicks: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::CursorAction)
        .collect();
    assert_eq!(clicks.len(), 1, "{events:?}");

    let clock_region = h
        .app
        .facts()
        .ocr_for_frame(&f1)
        .unwrap()
        .into_iter()
        .find(|r| r.text == "12:02")
        .unwrap();
    assert_eq!(clicks[0].target, clock_region.region_id.as_str());
    assert_eq!(clicks[0].value_from.as_deref(), Some("12:02"));
    assert_eq!(clicks[0].evidence_frames, vec![f1]);
    assert!(clicks[0].confidence <= 0.9);

    h.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn undecodable_input_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let h = open(dir.path(), test_settings()).await;

    // No script: the source reports the segment as unreadable.
    h.app.submit(segment("seg-missing", 0, BASE_TS, 2)).await.unwrap();
    h.source
        .script("seg-broken", vec![Screen::Flat(30), Screen::Broken, Screen::Blocks(2)]);
    h.app
        .submit(segment("seg-broken", 0, BASE_TS + 2 * SEC, 3))
        .await
        .unwrap();

    let missing = wait_for_state(&h.app, "seg-missing", SegmentState::Failed).await;
    assert!(missing.error.unwrap().contains("no script"));
    wait_for_state(&h.app, "seg-broken", SegmentState::Persisted).await;

    let frames = h
        .app
        .facts()
        .frames_in_range(Some(0), BASE_TS, BASE_TS + 10 * SEC)
        .unwrap();
    assert_eq!(frames.len(), 2);

    wait_for_finished(&h.app, 2).await;
    let health = h.app.health().await.unwrap();
    assert_eq!(health.last_hour.failed, 1);
    assert_eq!(health.counters.decode_errors, 1);
    assert!(health.summary().starts_with("1 segment(s) failed in the last hour"));

    h.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn storage_exhaustion_fails_segment_and_lane_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings();
    settings.storage_retry.max_attempts = 2;
    let h = open(dir.path(), settings).await;

    // A file where the monitor's frame directory should be.
    let blocker = dir.path().join("facts").join("frames").join("m0");
    std::fs::write(&blocker, b"").unwrap();

    h.source.script("seg-doomed", vec![Screen::Flat(30)]);
    h.app.submit(segment("seg-doomed", 0, BASE_TS, 1)).await.unwrap();
    let failed = wait_for_state(&h.app, "seg-doomed", SegmentState::Failed).await;
    assert!(failed.error.unwrap().contains("after 2 attempt(s)"));

    std::fs::remove_file(&blocker).unwrap();
    h.source.script("seg-after", vec![Screen::Blocks(5)]);
    h.app
        .submit(segment("seg-after", 0, BASE_TS + SEC, 1))
        .await
        .unwrap();
    wait_for_state(&h.app, "seg-after", SegmentState::Persisted).await;
    assert_eq!(h.app.facts().count_rows(FactTable::Frames).unwrap(), 1);

    h.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_write_leaves_no_facts_for_the_next_restore() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings();
    settings.storage_retry.max_attempts = 2;
    let h = open(dir.path(), settings).await;

    let f0 = FrameId::new(0, BASE_TS);
    let f2 = FrameId::new(0, BASE_TS + 2 * SEC);
    h.source.script("good", vec![Screen::Flat(30)]);
    h.ocr.answer(f0.clone(), title_and_clock("12:01"));
    h.app.submit(segment("good", 0, BASE_TS, 1)).await.unwrap();
    wait_for_state(&h.app, "good", SegmentState::Persisted).await;

    // "good" emitted no events, so the monitor's event directory does not exist yet.
    let blocker = dir.path().join("facts").join("events").join("m0");
    std::fs::write(&blocker, b"").unwrap();
    h.source.script("doomed", vec![Screen::Blocks(1)]);
    h.ocr.answer(FrameId::new(0, BASE_TS + SEC), title_and_clock("12:02"));
    h.app.submit(segment("doomed", 0, BASE_TS + SEC, 1)).await.unwrap();
    wait_for_state(&h.app, "doomed", SegmentState::Failed).await;

    let facts = h.app.facts();
    assert_eq!(facts.count_rows(FactTable::Frames).unwrap(), 1);
    assert_eq!(facts.count_rows(FactTable::Ocr).unwrap(), 2);
    assert!(facts
        .scene_changes_in_range(Some(0), BASE_TS + SEC, BASE_TS + 2 * SEC)
        .unwrap()
        .is_empty());
    assert!(!facts.image_path(0, BASE_TS + SEC, std::path::Path::new("x.png")).exists());

    std::fs::remove_file(&blocker).unwrap();
    h.source.script("after", vec![Screen::Blocks(2)]);
    h.ocr.answer(f2.clone(), title_and_clock("12:03"));
    h.app.submit(segment("after", 0, BASE_TS + 2 * SEC, 1)).await.unwrap();
    wait_for_state(&h.app, "after", SegmentState::Persisted).await;

    let events = h.app.facts().events_in_range(Some(0), BASE_TS, BASE_TS + 10 * SEC).unwrap();
    assert_eq!(events.len(), 1, "{events:?}");
    assert_eq!(events[0].event_type, EventType::FieldChange);
    assert_eq!(events[0].value_from.as_deref(), Some("12:01"));
    assert_eq!(events[0].value_to.as_deref(), Some("12:03"));
    assert_eq!(events[0].evidence_frames, vec![f0, f2]);

    h.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn replaying_a_segment_overwrites_instead_of_duplicating() {
    let dir = tempfile::tempdir().unwrap();
    let h = open(dir.path(), test_settings()).await;

    h.source.script("seg-r", vec![Screen::Flat(30), Screen::Blocks(1)]);
    h.ocr.answer(FrameId::new(0, BASE_TS), title_and_clock("12:01"));
    h.ocr.answer(FrameId::new(0, BASE_TS + SEC), title_and_clock("12:02"));

    h.app.submit(segment("seg-r", 0, BASE_TS, 2)).await.unwrap();
    wait_for_state(&h.app, "seg-r", SegmentState::Persisted).await;
    let first = h.app.facts().events_in_range(Some(0), BASE_TS, BASE_TS + 10 * SEC).unwrap();

    h.app.submit(segment("seg-r", 0, BASE_TS, 2)).await.unwrap();
    let entry = wait_for_state(&h.app, "seg-r", SegmentState::Persisted).await;
    assert_eq!(entry.attempts, 2);

    let second = h.app.facts().events_in_range(Some(0), BASE_TS, BASE_TS + 10 * SEC).unwrap();
    assert_eq!(first, second);
    assert_eq!(h.app.facts().count_rows(FactTable::Frames).unwrap(), 2);
    assert_eq!(h.app.facts().count_rows(FactTable::Ocr).unwrap(), 4);

    h.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn monitors_run_in_separate_lanes() {
    let dir = tempfile::tempdir().unwrap();
    let h = open(dir.path(), test_settings()).await;

    h.source.script("left", vec![Screen::Flat(30), Screen::Blocks(1)]);
    h.source.script("right", vec![Screen::Flat(90)]);
    h.app.submit(segment("left", 0, BASE_TS, 2)).await.unwrap();
    h.app.submit(segment("right", 1, BASE_TS, 1)).await.unwrap();
    wait_for_state(&h.app, "left", SegmentState::Persisted).await;
    wait_for_state(&h.app, "right", SegmentState::Persisted).await;

    let facts = h.app.facts();
    assert_eq!(facts.frames_in_range(Some(0), 0, i64::MAX).unwrap().len(), 2);
    assert_eq!(facts.frames_in_range(Some(1), 0, i64::MAX).unwrap().len(), 1);
    assert_eq!(facts.monitors().unwrap(), vec![0, 1]);

    h.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn privacy_pause_discards_unpersisted_work() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings();
    settings.worker_pool_size = 1;
    settings.ocr_timeout_ms = 10_000;
    let h = open(dir.path(), settings).await;

    let held = FrameId::new(0, BASE_TS);
    h.source.script("in-flight", vec![Screen::Flat(30)]);
    h.ocr.gate(held.clone());
    h.source.script("queued", vec![Screen::Blocks(1)]);

    h.app.submit(segment("in-flight", 0, BASE_TS, 1)).await.unwrap();
    wait_for_state(&h.app, "in-flight", SegmentState::AwaitingOcr).await;
    h.app.submit(segment("queued", 0, BASE_TS + SEC, 1)).await.unwrap();

    assert_eq!(h.app.pause().await, 1);
    wait_for_state(&h.app, "in-flight", SegmentState::Discarded).await;
    wait_for_state(&h.app, "queued", SegmentState::Discarded).await;

    h.source.script("while-paused", vec![Screen::Flat(50)]);
    let err = h
        .app
        .submit(segment("while-paused", 0, BASE_TS + 2 * SEC, 1))
        .await
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::Paused)));
    wait_for_state(&h.app, "while-paused", SegmentState::Discarded).await;
    assert_eq!(h.app.facts().count_rows(FactTable::Frames).unwrap(), 0);

    h.ocr.open_gate();
    h.app.resume();
    h.source.script("after", vec![Screen::Blocks(2)]);
    h.app.submit(segment("after", 0, BASE_TS + 3 * SEC, 1)).await.unwrap();
    wait_for_state(&h.app, "after", SegmentState::Persisted).await;
    let frames = h.app.facts().frames_in_range(Some(0), 0, i64::MAX).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].segment_id, "after");

    let health = h.app.health().await.unwrap();
    assert_eq!(health.last_hour.discarded, 3);
    assert!(!health.paused);

    h.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn resume_before_the_lane_checks_lets_in_flight_work_finish() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings();
    settings.worker_pool_size = 1;
    settings.ocr_timeout_ms = 10_000;
    let h = open(dir.path(), settings).await;

    let held = FrameId::new(0, BASE_TS);
    h.source.script("in-flight", vec![Screen::Flat(30)]);
    h.ocr.gate(held.clone());
    h.ocr.answer(held.clone(), vec![field(260, 10, 50, 20, "12:01", 0.9)]);
    h.app.submit(segment("in-flight", 0, BASE_TS, 1)).await.unwrap();
    wait_for_state(&h.app, "in-flight", SegmentState::AwaitingOcr).await;

    // No await between the two calls: the lane never observes the pause.
    assert_eq!(h.app.pause().await, 0);
    h.app.resume();
    h.ocr.open_gate();

    wait_for_state(&h.app, "in-flight", SegmentState::Persisted).await;
    let frames = h.app.facts().frames_in_range(Some(0), 0, i64::MAX).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].frame_id, held);

    h.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn queue_depth_limit_fails_oldest_blocked_segment() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings();
    settings.worker_pool_size = 1;
    settings.lane_queue_capacity = 1;
    settings.queue_depth_limit = 1;
    settings.ocr_timeout_ms = 10_000;
    let h = Arc::new(open(dir.path(), settings).await);

    for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
        let screen = if i % 2 == 0 { Screen::Flat(30) } else { Screen::Blocks(i as u32) };
        h.source.script(id, vec![screen]);
    }
    h.ocr.gate(FrameId::new(0, BASE_TS));

    h.app.submit(segment("a", 0, BASE_TS, 1)).await.unwrap();
    wait_for_state(&h.app, "a", SegmentState::AwaitingOcr).await;
    h.app.submit(segment("b", 0, BASE_TS + SEC, 1)).await.unwrap();

    let blocked_c = {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.app.submit(segment("c", 0, BASE_TS + 2 * SEC, 1)).await })
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.app.pipeline().queue_depths().get(&0).copied() != Some(2) {
        assert!(tokio::time::Instant::now() < deadline, "c never blocked");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let blocked_d = {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.app.submit(segment("d", 0, BASE_TS + 3 * SEC, 1)).await })
    };

    let err = blocked_c.await.unwrap().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::QueueDepthExceeded { monitor_id: 0, limit: 1 })
    ));
    let failed = wait_for_state(&h.app, "c", SegmentState::Failed).await;
    assert!(failed.error.unwrap().contains("queue depth limit"));

    h.ocr.open_gate();
    blocked_d.await.unwrap().unwrap();
    for id in ["a", "b", "d"] {
        wait_for_state(&h.app, id, SegmentState::Persisted).await;
    }
}
