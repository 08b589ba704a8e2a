use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::api::error::ApiError;
use crate::api::request::{CacheConfig, HttpRequest};
use crate::clock::Clock;
use crate::storage::{KeyValueStorage, StructuredStorage};

/// Well-known storage key holding the serialized queue.
pub const QUEUE_STORAGE_KEY: &str = "api_request_queue";

/// Default replay attempts before a request is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A mutating request captured while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: String,
    pub http: HttpRequest,
    pub cache_config: CacheConfig,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// A request that used up its retry budget and was dropped.
#[derive(Debug, Clone)]
pub struct PermanentFailure {
    pub request: QueuedRequest,
    pub error: String,
}

/// Outcome of one `drain` pass.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Requests replayed successfully and removed.
    pub succeeded: Vec<QueuedRequest>,
    /// Requests that failed but stay queued for the next drain.
    pub retained: usize,
    /// Requests dropped after exhausting their retries.
    pub failed: Vec<PermanentFailure>,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.retained == 0 && self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.retained + self.failed.len()
    }
}

/// Resets the drain flag however the drain ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Durable FIFO of mutating requests awaiting replay.
///
/// The whole queue is rewritten to storage after every change. It lives in
/// the key-value tier and moves to structured storage when it outgrows the
/// quota. Only one process is expected to write it.
pub struct RequestQueue {
    items: Mutex<VecDeque<QueuedRequest>>,
    persistent: Arc<dyn KeyValueStorage>,
    structured: Arc<dyn StructuredStorage>,
    /// Serializes writes so the stored copy is never older than the last change.
    persist_lock: tokio::sync::Mutex<()>,
    overflowed: AtomicBool,
    draining: AtomicBool,
    max_retries: u32,
    clock: Arc<dyn Clock>,
}

impl RequestQueue {
    /// Restore the queue persisted by a previous session, if any.
    pub async fn load(
        persistent: Arc<dyn KeyValueStorage>,
        structured: Arc<dyn StructuredStorage>,
        max_retries: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (items, overflowed) = Self::read_stored(&persistent, &structured).await;
        if !items.is_empty() {
            info!(count = items.len(), "Restored queued requests");
        }

        Self {
            items: Mutex::new(items),
            persistent,
            structured,
            persist_lock: tokio::sync::Mutex::new(()),
            overflowed: AtomicBool::new(overflowed),
            draining: AtomicBool::new(false),
            max_retries: max_retries.max(1),
            clock,
        }
    }

    async fn read_stored(
        persistent: &Arc<dyn KeyValueStorage>,
        structured: &Arc<dyn StructuredStorage>,
    ) -> (VecDeque<QueuedRequest>, bool) {
        let (raw, overflowed) = match persistent.get_item(QUEUE_STORAGE_KEY) {
            Ok(Some(raw)) => (Some(raw), false),
            Ok(None) => (None, false),
            Err(e) => {
                warn!(error = %e, "Failed to read request queue");
                (None, false)
            }
        };

        let (raw, overflowed) = match raw {
            Some(raw) => (Some(raw), overflowed),
            None => match structured.get(QUEUE_STORAGE_KEY).await {
                Ok(raw) => {
                    let found = raw.is_some();
                    (raw, found)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read overflowed request queue");
                    (None, false)
                }
            },
        };

        let Some(raw) = raw else {
            return (VecDeque::new(), overflowed);
        };
        match serde_json::from_str(&raw) {
            Ok(items) => (items, overflowed),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable request queue");
                (VecDeque::new(), overflowed)
            }
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<QueuedRequest>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> String {
        format!(
            "q_{}_{:08x}",
            self.clock.now().timestamp_millis(),
            rand::random::<u32>()
        )
    }

    /// Append a request and persist the queue. Returns the queue id.
    pub async fn enqueue(&self, http: HttpRequest, cache_config: CacheConfig) -> String {
        let request = QueuedRequest {
            id: self.next_id(),
            http,
            cache_config,
            enqueued_at: self.clock.now(),
            retry_count: 0,
        };
        let id = request.id.clone();

        debug!(id = %id, method = request.http.method.as_str(), url = %request.http.url, "Queued request");
        self.items().push_back(request);
        self.persist().await;
        id
    }

    /// Write the current queue to storage. Failures are logged, never returned.
    async fn persist(&self) {
        let _writer = self.persist_lock.lock().await;

        let serialized = {
            let items = self.items();
            serde_json::to_string(&*items)
        };
        let serialized = match serialized {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to serialize request queue");
                return;
            }
        };

        match self.persistent.set_item(QUEUE_STORAGE_KEY, &serialized) {
            Ok(()) => {
                if self.overflowed.swap(false, Ordering::AcqRel) {
                    if let Err(e) = self.structured.delete(QUEUE_STORAGE_KEY).await {
                        warn!(error = %e, "Failed to remove overflowed request queue");
                    }
                }
            }
            Err(e) if e.is_quota_exceeded() => {
                debug!(bytes = serialized.len(), "Request queue overflows key-value storage");
                if let Err(e) = self.persistent.remove_item(QUEUE_STORAGE_KEY) {
                    warn!(error = %e, "Failed to remove stale request queue copy");
                }
                match self.structured.put(QUEUE_STORAGE_KEY, serialized).await {
                    Ok(()) => self.overflowed.store(true, Ordering::Release),
                    Err(e) => error!(error = %e, "Failed to persist request queue"),
                }
            }
            Err(e) => error!(error = %e, "Failed to persist request queue"),
        }
    }

    /// Replay every queued request in enqueue order.
    ///
    /// Each request is attempted once. Success removes it; failure bumps its
    /// retry count and drops it once the count reaches the retry budget. A
    /// failing request never stops the ones behind it. Requests enqueued
    /// while draining wait for the next drain. If a drain is already running
    /// this returns an empty report.
    pub async fn drain<F, Fut>(&self, replay: F) -> DrainReport
    where
        F: Fn(QueuedRequest) -> Fut,
        Fut: Future<Output = Result<(), ApiError>>,
    {
        let mut report = DrainReport::default();
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Queue drain already in progress");
            return report;
        }
        let _guard = DrainGuard(&self.draining);

        let batch: Vec<QueuedRequest> = self.items().iter().cloned().collect();
        if batch.is_empty() {
            return report;
        }
        info!(count = batch.len(), "Replaying queued requests");

        for request in batch {
            let outcome = replay(request.clone()).await;

            {
                let mut items = self.items();
                let Some(pos) = items.iter().position(|r| r.id == request.id) else {
                    // Removed while its replay was in flight
                    continue;
                };

                match outcome {
                    Ok(()) => {
                        if let Some(done) = items.remove(pos) {
                            debug!(id = %done.id, "Replayed queued request");
                            report.succeeded.push(done);
                        }
                    }
                    Err(e) => {
                        items[pos].retry_count += 1;
                        let retries = items[pos].retry_count;
                        if retries >= self.max_retries {
                            if let Some(dropped) = items.remove(pos) {
                                error!(
                                    id = %dropped.id,
                                    url = %dropped.http.url,
                                    retries,
                                    error = %e,
                                    "Dropping queued request after exhausting retries"
                                );
                                report.failed.push(PermanentFailure {
                                    request: dropped,
                                    error: e.to_string(),
                                });
                            }
                        } else {
                            warn!(id = %request.id, retry = retries, error = %e, "Queued request replay failed");
                            report.retained += 1;
                        }
                    }
                }
            }

            self.persist().await;
        }

        info!(
            succeeded = report.succeeded.len(),
            retained = report.retained,
            failed = report.failed.len(),
            "Queue drain finished"
        );
        report
    }

    /// Snapshot of the queued requests, oldest first.
    pub fn pending(&self) -> Vec<QueuedRequest> {
        self.items().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Drop a queued request without replaying it.
    pub async fn remove(&self, id: &str) -> Option<QueuedRequest> {
        let removed = {
            let mut items = self.items();
            let pos = items.iter().position(|r| r.id == id)?;
            items.remove(pos)
        };
        self.persist().await;
        removed
    }

    pub async fn clear(&self) {
        self.items().clear();
        self.persist().await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{MemoryKeyValueStorage, MemoryStructuredStorage};
    use serde_json::json;

    struct Backends {
        kv: Arc<MemoryKeyValueStorage>,
        structured: Arc<MemoryStructuredStorage>,
    }

    impl Backends {
        fn new(quota: usize) -> Self {
            Self {
                kv: Arc::new(MemoryKeyValueStorage::with_quota(quota)),
                structured: Arc::new(MemoryStructuredStorage::new()),
            }
        }

        async fn queue(&self) -> RequestQueue {
            RequestQueue::load(
                self.kv.clone(),
                self.structured.clone(),
                DEFAULT_MAX_RETRIES,
                Arc::new(ManualClock::default()),
            )
            .await
        }

        fn stored_len(&self) -> usize {
            let raw = self.kv.get_item(QUEUE_STORAGE_KEY).unwrap().unwrap();
            serde_json::from_str::<Vec<QueuedRequest>>(&raw).unwrap().len()
        }
    }

    fn patch(id: u32) -> HttpRequest {
        HttpRequest::patch(format!("/books/{}", id), json!({"title": "X"}))
    }

    #[tokio::test]
    async fn test_enqueue_persists_every_change() {
        let backends = Backends::new(1024 * 1024);
        let queue = backends.queue().await;

        let id = queue.enqueue(patch(1), CacheConfig::none()).await;
        assert!(id.starts_with("q_"));
        assert_eq!(backends.stored_len(), 1);

        queue.enqueue(patch(2), CacheConfig::none()).await;
        assert_eq!(backends.stored_len(), 2);

        queue.remove(&id).await;
        assert_eq!(backends.stored_len(), 1);
    }

    #[tokio::test]
    async fn test_drain_replays_in_fifo_order() {
        let backends = Backends::new(1024 * 1024);
        let queue = backends.queue().await;
        for i in 1..=3 {
            queue.enqueue(patch(i), CacheConfig::none()).await;
        }

        let seen = Mutex::new(Vec::new());
        let report = queue
            .drain(|req| {
                seen.lock().unwrap().push(req.http.url.clone());
                async { Ok(()) }
            })
            .await;

        assert_eq!(*seen.lock().unwrap(), vec!["/books/1", "/books/2", "/books/3"]);
        assert_eq!(report.succeeded.len(), 3);
        assert!(queue.is_empty());
        assert_eq!(backends.stored_len(), 0);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let backends = Backends::new(1024 * 1024);
        let queue = backends.queue().await;
        queue.enqueue(patch(42), CacheConfig::none()).await;

        let fail = || async { Err(ApiError::Timeout) };

        let first = queue.drain(|_| fail()).await;
        assert_eq!(first.retained, 1);
        assert_eq!(queue.pending()[0].retry_count, 1);

        let second = queue.drain(|_| fail()).await;
        assert_eq!(second.retained, 1);
        assert_eq!(queue.pending()[0].retry_count, 2);

        let third = queue.drain(|_| async { Ok(()) }).await;
        assert_eq!(third.succeeded.len(), 1);
        assert!(third.failed.is_empty());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_request_is_reported_and_dropped() {
        let backends = Backends::new(1024 * 1024);
        let queue = backends.queue().await;
        queue.enqueue(patch(1), CacheConfig::none()).await;
        queue.enqueue(patch(2), CacheConfig::none()).await;

        for _ in 0..2 {
            queue
                .drain(|req| async move {
                    if req.http.url == "/books/1" {
                        Err(ApiError::ServerError { status: 500, message: "boom".into() })
                    } else {
                        Err(ApiError::Timeout)
                    }
                })
                .await;
        }

        // Third failure for /books/1; /books/2 recovers
        let report = queue
            .drain(|req| async move {
                if req.http.url == "/books/1" {
                    Err(ApiError::ServerError { status: 500, message: "boom".into() })
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].request.http.url, "/books/1");
        assert!(report.failed[0].error.contains("boom"));
        assert_eq!(report.succeeded.len(), 1);
        assert!(queue.is_empty());

        let again = queue.drain(|_| async { Ok(()) }).await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_queue_survives_reload() {
        let backends = Backends::new(1024 * 1024);
        {
            let queue = backends.queue().await;
            queue
                .enqueue(patch(1), CacheConfig::invalidating("books", Some("7")))
                .await;
        }

        let reloaded = backends.queue().await;
        let pending = reloaded.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].http, patch(1));
        assert_eq!(pending[0].cache_config.invalidate_pattern.as_deref(), Some("books"));
    }

    #[tokio::test]
    async fn test_oversized_queue_moves_to_structured_storage() {
        let backends = Backends::new(400);
        let queue = backends.queue().await;
        for i in 0..5 {
            queue.enqueue(patch(i), CacheConfig::none()).await;
        }

        assert!(backends.kv.get_item(QUEUE_STORAGE_KEY).unwrap().is_none());
        assert!(backends.structured.get(QUEUE_STORAGE_KEY).await.unwrap().is_some());

        let reloaded = backends.queue().await;
        assert_eq!(reloaded.len(), 5);

        // Shrinking back under the quota moves it back
        reloaded.clear().await;
        assert_eq!(backends.stored_len(), 0);
        assert!(backends.structured.get(QUEUE_STORAGE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_stored_queue_starts_empty() {
        let backends = Backends::new(1024 * 1024);
        backends.kv.set_item(QUEUE_STORAGE_KEY, "{not json").unwrap();

        let queue = backends.queue().await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_drains_are_coalesced() {
        let backends = Backends::new(1024 * 1024);
        let queue = backends.queue().await;
        queue.enqueue(patch(1), CacheConfig::none()).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = tokio::sync::Mutex::new(Some(release_rx));
        let release_rx = &release_rx;

        let first = queue.drain(move |_| async move {
            if let Some(rx) = release_rx.lock().await.take() {
                let _ = rx.await;
            }
            Ok(())
        });
        let second = async {
            tokio::task::yield_now().await;
            let report = queue.drain(|_| async { Ok(()) }).await;
            let _ = release_tx.send(());
            report
        };

        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.succeeded.len(), 1);
        assert!(second.is_empty());
    }
}
