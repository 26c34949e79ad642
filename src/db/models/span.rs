use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A summarised activity interval on one monitor's timeline.
///
/// Spans of the same `kind` on the same monitor never overlap. `t_end` moves
/// forward while the span is open and is fixed once it is closed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub span_id: String,
    pub kind: String,
    pub monitor_id: u32,
    pub t_start: i64,
    pub t_end: i64,
    pub closed: bool,
    pub title: String,
    pub summary_md: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Span {
    pub fn open(span_id: impl Into<String>, kind: impl Into<String>, monitor_id: u32, t_start: i64) -> Self {
        let now = Utc::now();
        Self {
            span_id: span_id.into(),
            kind: kind.into(),
            monitor_id,
            t_start,
            t_end: t_start,
            closed: false,
            title: String::new(),
            summary_md: String::new(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// An open span under a fresh random id.
    pub fn start(kind: impl Into<String>, monitor_id: u32, t_start: i64) -> Self {
        Self::open(Uuid::new_v4().to_string(), kind, monitor_id, t_start)
    }

    /// Half-open `[t_start, t_end)`; a zero-length span still occupies its instant.
    pub fn overlaps(&self, t_start: i64, t_end: i64) -> bool {
        let own_end = self.t_end.max(self.t_start + 1);
        let other_end = t_end.max(t_start + 1);
        self.t_start < other_end && t_start < own_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_spans_do_not_overlap() {
        let mut span = Span::open("a", "focus", 0, 10);
        span.t_end = 20;
        assert!(!span.overlaps(20, 30));
        assert!(span.overlaps(19, 30));
        assert!(span.overlaps(15, 15));
    }

    #[test]
    fn started_spans_get_distinct_ids() {
        let a = Span::start("focus", 0, 1);
        let b = Span::start("focus", 0, 1);
        assert_ne!(a.span_id, b.span_id);
        assert!(!a.closed);
    }
}
