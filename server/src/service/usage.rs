use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error};

use crate::database::usage_record::{NewUsageRecord, UsageRecord};
use crate::database::Db;

const QUEUE_CAPACITY: usize = 1024;
const BATCH_SIZE: usize = 64;
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

struct RecorderInner {
    queue: Mutex<VecDeque<NewUsageRecord>>,
    notify: Notify,
    dropped: AtomicU64,
    capacity: usize,
}

/// Decouples usage persistence from the request hot path. Producers do a
/// short lock-push-notify; a single writer task drains batches and commits
/// each batch in one transaction. Overflow drops the oldest queued record
/// and counts it; the pipeline is never backpressured.
#[derive(Clone)]
pub struct UsageRecorder {
    inner: Arc<RecorderInner>,
}

impl UsageRecorder {
    pub fn spawn(db: Db) -> Self {
        Self::spawn_with_capacity(db, QUEUE_CAPACITY)
    }

    /// Queue without a writer task; overflow behaviour is testable without
    /// racing the drain loop.
    #[cfg(test)]
    fn detached(capacity: usize) -> Self {
        UsageRecorder {
            inner: Arc::new(RecorderInner {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
                capacity,
            }),
        }
    }

    pub fn spawn_with_capacity(db: Db, capacity: usize) -> Self {
        let inner = Arc::new(RecorderInner {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            capacity,
        });

        let writer = inner.clone();
        tokio::spawn(async move {
            loop {
                let batch = {
                    let mut queue = writer.queue.lock().expect("usage queue poisoned");
                    let take = queue.len().min(BATCH_SIZE);
                    queue.drain(..take).collect::<Vec<_>>()
                };

                if batch.is_empty() {
                    tokio::select! {
                        _ = writer.notify.notified() => {}
                        _ = tokio::time::sleep(FLUSH_INTERVAL) => {}
                    }
                    continue;
                }

                let db = db.clone();
                let written = tokio::task::spawn_blocking(move || {
                    UsageRecord::insert_batch(&db, &batch)
                })
                .await;
                match written {
                    Ok(Ok(n)) => debug!(records = n, "flushed usage batch"),
                    Ok(Err(e)) => error!(error = %e, "usage batch write failed"),
                    Err(e) => error!(error = %e, "usage writer task panicked"),
                }

                // A full queue drains back-to-back; otherwise wait for the
                // next push or the flush tick.
                let backlog = writer.queue.lock().expect("usage queue poisoned").len();
                if backlog < BATCH_SIZE {
                    tokio::select! {
                        _ = writer.notify.notified() => {}
                        _ = tokio::time::sleep(FLUSH_INTERVAL) => {}
                    }
                }
            }
        });

        UsageRecorder { inner }
    }

    pub fn record(&self, record: NewUsageRecord) {
        {
            let mut queue = self.inner.queue.lock().expect("usage queue poisoned");
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(record);
        }
        self.inner.notify.notify_one();
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.lock().expect("usage queue poisoned").len()
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}
