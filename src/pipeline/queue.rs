use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::{oneshot, Notify};

use crate::error::PipelineError;
use crate::models::SegmentDescriptor;

struct Waiter {
    segment: SegmentDescriptor,
    admitted: oneshot::Sender<Result<(), PipelineError>>,
}

#[derive(Default)]
struct QueueState {
    queued: VecDeque<SegmentDescriptor>,
    /// Producers blocked on a full queue, oldest first.
    waiting: VecDeque<Waiter>,
    closed: bool,
}

/// Bounded per-monitor segment queue.
///
/// A full queue blocks producers instead of dropping segments. Once more than
/// `depth_limit` producers are blocked, the oldest one is released with
/// `QueueDepthExceeded`.
pub struct LaneQueue {
    monitor_id: u32,
    capacity: usize,
    depth_limit: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl LaneQueue {
    pub fn new(monitor_id: u32, capacity: usize, depth_limit: usize) -> Self {
        Self {
            monitor_id,
            capacity: capacity.max(1),
            depth_limit,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queued plus blocked segments.
    pub fn depth(&self) -> usize {
        let state = self.lock();
        state.queued.len() + state.waiting.len()
    }

    /// Enqueues `segment`, waiting while the lane is full.
    pub async fn push(&self, segment: SegmentDescriptor) -> Result<(), PipelineError> {
        let admitted = {
            let mut state = self.lock();
            if state.closed {
                return Err(PipelineError::LaneClosed {
                    monitor_id: self.monitor_id,
                });
            }
            if state.waiting.is_empty() && state.queued.len() < self.capacity {
                state.queued.push_back(segment);
                self.notify.notify_one();
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            state.waiting.push_back(Waiter {
                segment,
                admitted: tx,
            });
            if state.waiting.len() > self.depth_limit {
                if let Some(oldest) = state.waiting.pop_front() {
                    let _ = oldest.admitted.send(Err(PipelineError::QueueDepthExceeded {
                        monitor_id: self.monitor_id,
                        limit: self.depth_limit,
                    }));
                }
            }
            rx
        };

        match admitted.await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::LaneClosed {
                monitor_id: self.monitor_id,
            }),
        }
    }

    /// Next segment in arrival order; `None` once the queue is closed and
    /// fully drained.
    pub async fn pop(&self) -> Option<SegmentDescriptor> {
        loop {
            {
                let mut state = self.lock();
                Self::admit_waiters(&mut state, self.capacity);
                if let Some(segment) = state.queued.pop_front() {
                    Self::admit_waiters(&mut state, self.capacity);
                    return Some(segment);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn admit_waiters(state: &mut QueueState, capacity: usize) {
        while state.queued.len() < capacity {
            let Some(waiter) = state.waiting.pop_front() else {
                break;
            };
            // A producer that gave up no longer owns a segment in the lane.
            if waiter.admitted.send(Ok(())).is_ok() {
                state.queued.push_back(waiter.segment);
            }
        }
    }

    /// Drops everything buffered. Blocked producers are released with
    /// `Paused`; the queued segments are returned so their state can be
    /// recorded.
    pub fn discard(&self) -> Vec<SegmentDescriptor> {
        let mut state = self.lock();
        for waiter in state.waiting.drain(..) {
            let _ = waiter.admitted.send(Err(PipelineError::Paused));
        }
        state.queued.drain(..).collect()
    }

    /// Stops accepting segments. Buffered and blocked segments still drain.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    fn segment(id: &str) -> SegmentDescriptor {
        SegmentDescriptor {
            segment_id: id.into(),
            monitor_id: 0,
            file_path: PathBuf::from(format!("/tmp/{id}.mp4")),
            t_start: 0,
            t_end: 1,
            codec: "h264/yuv420p".into(),
            window: None,
        }
    }

    #[tokio::test]
    async fn pops_in_arrival_order() {
        let queue = LaneQueue::new(0, 4, 4);
        for id in ["a", "b", "c"] {
            queue.push(segment(id)).await.unwrap();
        }
        for id in ["a", "b", "c"] {
            assert_eq!(queue.pop().await.unwrap().segment_id, id);
        }
    }

    #[tokio::test]
    async fn full_queue_blocks_producer_until_pop() {
        let queue = Arc::new(LaneQueue::new(0, 1, 4));
        queue.push(segment("a")).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(segment("b")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.depth(), 2);

        assert_eq!(queue.pop().await.unwrap().segment_id, "a");
        producer.await.unwrap().unwrap();
        assert_eq!(queue.pop().await.unwrap().segment_id, "b");
    }

    #[tokio::test]
    async fn exceeding_depth_limit_fails_oldest_blocked_producer() {
        let queue = Arc::new(LaneQueue::new(3, 1, 1));
        queue.push(segment("a")).await.unwrap();

        let first = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(segment("b")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(segment("c")).await })
        };

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::QueueDepthExceeded { monitor_id: 3, limit: 1 }
        ));

        assert_eq!(queue.pop().await.unwrap().segment_id, "a");
        second.await.unwrap().unwrap();
        assert_eq!(queue.pop().await.unwrap().segment_id, "c");
    }

    #[tokio::test]
    async fn discard_releases_blocked_producers() {
        let queue = Arc::new(LaneQueue::new(0, 1, 4));
        queue.push(segment("a")).await.unwrap();
        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(segment("b")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let dropped = queue.discard();
        assert_eq!(dropped.len(), 1);
        assert!(matches!(blocked.await.unwrap(), Err(PipelineError::Paused)));
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = LaneQueue::new(0, 2, 2);
        queue.push(segment("a")).await.unwrap();
        queue.close();
        assert!(queue.push(segment("b")).await.is_err());
        assert_eq!(queue.pop().await.unwrap().segment_id, "a");
        assert!(timeout(Duration::from_secs(1), queue.pop()).await.unwrap().is_none());
    }
}
