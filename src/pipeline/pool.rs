use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::info;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded pool of segment workers shared by all lanes, resizable at runtime.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: Mutex<usize>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size: Mutex::new(size),
        }
    }

    pub fn size(&self) -> usize {
        match self.size.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .context("worker pool closed")
    }

    /// Growing takes effect at once; shrinking retires permits as running
    /// workers release them.
    pub fn resize(&self, new_size: usize) {
        let new_size = new_size.max(1);
        let mut size = match self.size.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if new_size == *size {
            return;
        }

        if new_size > *size {
            self.semaphore.add_permits(new_size - *size);
        } else {
            let surplus = u32::try_from(*size - new_size).unwrap_or(u32::MAX);
            let semaphore = Arc::clone(&self.semaphore);
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(surplus).await {
                    permits.forget();
                }
            });
        }
        info!("Worker pool resized {} -> {}", *size, new_size);
        *size = new_size;
    }

    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grows_and_shrinks() {
        let pool = WorkerPool::new(2);
        let held = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 1);

        pool.resize(4);
        assert_eq!(pool.available(), 3);

        pool.resize(1);
        drop(held);
        // Retirement happens on a spawned task.
        for _ in 0..50 {
            if pool.available() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.size(), 1);
    }
}
