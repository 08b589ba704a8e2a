//! Cache-aware façade over the backend API.
//!
//! `CachedApiService::request` is the single entry point: it serves fresh
//! cache hits, falls back to stale data when the network is unavailable,
//! queues mutations while offline and replays them on reconnect.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, CacheMetrics, CacheType};
use crate::clock::SystemClock;
use crate::config::Config;
use crate::queue::{DrainReport, QueuedRequest, RequestQueue};

use super::connectivity::Connectivity;
use super::endpoints;
use super::error::ApiError;
use super::request::{ApiResponse, CacheConfig, CacheTarget, HttpRequest};
use super::transport::{HttpTransport, ReqwestTransport};

/// Buffered replay reports per subscriber before the oldest are dropped.
const REPORT_CHANNEL_CAPACITY: usize = 16;

const QUEUED_MESSAGE: &str = "Saved offline. The change will sync when the connection is restored.";

/// What a replay needs, cloneable into background tasks.
#[derive(Clone)]
struct Replayer {
    transport: Arc<dyn HttpTransport>,
    cache: Arc<CacheManager>,
    queue: Arc<RequestQueue>,
}

impl Replayer {
    /// Drain the queue, applying each replayed mutation's invalidation.
    async fn drain(&self) -> DrainReport {
        let transport = &self.transport;
        let cache = &self.cache;
        self.queue
            .drain(move |request| async move {
                transport.call(&request.http).await?;
                if let Some(pattern) = request.cache_config.invalidate_pattern.as_deref() {
                    cache
                        .invalidate(pattern, request.cache_config.invalidate_user.as_deref())
                        .await;
                }
                Ok::<(), ApiError>(())
            })
            .await
    }
}

pub struct CachedApiService {
    replayer: Replayer,
    connectivity: Connectivity,
    reports: broadcast::Sender<DrainReport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sweep_interval: std::time::Duration,
    prefetch_limit: usize,
}

impl CachedApiService {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        cache: Arc<CacheManager>,
        queue: Arc<RequestQueue>,
        connectivity: Connectivity,
        config: &Config,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            replayer: Replayer {
                transport,
                cache,
                queue,
            },
            connectivity,
            reports,
            tasks: Mutex::new(Vec::new()),
            sweep_interval: config.sweep_interval(),
            prefetch_limit: config.prefetch_limit,
        }
    }

    /// Build the production stack: reqwest transport, file and SQLite backed
    /// cache under the storage dir, and the persisted request queue.
    pub async fn open(config: &Config, token: Option<String>) -> Result<Self> {
        let mut transport = ReqwestTransport::new(&config.api_base_url, config.request_timeout())?;
        transport.set_token(token);

        let cache = Arc::new(CacheManager::open(config)?);
        let queue = RequestQueue::load(
            cache.persistent_storage(),
            cache.structured_storage(),
            config.max_replay_retries,
            Arc::new(SystemClock),
        )
        .await;

        Ok(Self::new(
            Arc::new(transport),
            cache,
            Arc::new(queue),
            Connectivity::default(),
            config,
        ))
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.replayer.cache
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.replayer.queue
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    // ===== Lifecycle =====

    /// Rebuild the overflow index, start the expiry sweeper and begin
    /// watching connectivity. Calling it again while running does nothing.
    pub async fn start(&self) {
        if !self.lock_tasks().is_empty() {
            debug!("Service already started");
            return;
        }

        self.replayer.cache.rebuild_overflow_index().await;

        let sweeper = self.replayer.cache.spawn_sweeper(self.sweep_interval);
        let watcher = self.spawn_connectivity_watcher();

        let mut tasks = self.lock_tasks();
        if !tasks.is_empty() {
            // Lost a race with a concurrent start
            sweeper.abort();
            watcher.abort();
            return;
        }
        tasks.push(sweeper);
        tasks.push(watcher);
        info!("Cached API service started");
    }

    /// Stop background work. In-flight requests are not cancelled.
    pub fn stop(&self) {
        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.abort();
        }
        info!("Cached API service stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replays the queue whenever the flag is (or becomes) online with
    /// requests pending.
    fn spawn_connectivity_watcher(&self) -> JoinHandle<()> {
        let replayer = self.replayer.clone();
        let reports = self.reports.clone();
        let mut rx = self.connectivity.subscribe();

        tokio::spawn(async move {
            loop {
                let online = *rx.borrow_and_update();
                if online && !replayer.queue.is_empty() {
                    let report = replayer.drain().await;
                    if !report.is_empty() {
                        // No subscribers is fine
                        let _ = reports.send(report);
                    }
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Reports from automatic replays on reconnect.
    pub fn subscribe_replay_reports(&self) -> broadcast::Receiver<DrainReport> {
        self.reports.subscribe()
    }

    /// Replay queued requests now. Does nothing while offline.
    pub async fn process_queue(&self) -> DrainReport {
        if !self.is_online() {
            debug!("Offline, not replaying queued requests");
            return DrainReport::default();
        }
        self.replayer.drain().await
    }

    // ===== Requests =====

    /// Perform `http` with the caching behaviour described by `cache_config`.
    ///
    /// Fresh cache hits skip the network. Offline, a GET is served from any
    /// retained cache copy and a mutation is queued. Online, a failed GET
    /// degrades to a retained copy when one exists; other errors propagate.
    pub async fn request(
        &self,
        http: HttpRequest,
        cache_config: CacheConfig,
    ) -> Result<ApiResponse, ApiError> {
        let mutating = http.method.is_mutating();
        if mutating && cache_config.use_cache {
            return Err(ApiError::NotCacheable(http.method.as_str()));
        }
        let key = cache_config.target.as_ref().map(CacheTarget::key);
        let cache = &self.replayer.cache;

        if cache_config.use_cache {
            if let Some(ref key) = key {
                if let Some(data) = cache.get_key(key).await {
                    return Ok(ApiResponse::Cache {
                        data,
                        stale: false,
                        error: None,
                    });
                }
            }
        }

        if !self.is_online() {
            if mutating {
                let queue_id = self.replayer.queue.enqueue(http, cache_config).await;
                return Ok(ApiResponse::Queued {
                    queue_id,
                    message: QUEUED_MESSAGE.to_string(),
                });
            }
            if let Some(ref key) = key {
                if let Some(entry) = cache.get_stale_key(key).await {
                    debug!(key = %key, "Offline, serving cached copy");
                    return Ok(ApiResponse::Cache {
                        data: entry.value,
                        stale: true,
                        error: None,
                    });
                }
            }
            return Err(ApiError::NoConnectivity);
        }

        match self.replayer.transport.call(&http).await {
            Ok(data) => {
                if mutating {
                    if let Some(ref pattern) = cache_config.invalidate_pattern {
                        cache
                            .invalidate(pattern, cache_config.invalidate_user.as_deref())
                            .await;
                    }
                } else if cache_config.use_cache {
                    if let Some(ref key) = key {
                        cache.set_key(key, data.clone(), cache_config.ttl()).await;
                    }
                }
                Ok(ApiResponse::Network { data })
            }
            Err(e) => {
                if !mutating {
                    if let Some(ref key) = key {
                        if let Some(entry) = cache.get_stale_key(key).await {
                            warn!(key = %key, error = %e, "Request failed, serving stale cache");
                            return Ok(ApiResponse::Cache {
                                data: entry.value,
                                stale: true,
                                error: Some(e.to_string()),
                            });
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn send(&self, (http, cache_config): (HttpRequest, CacheConfig)) -> Result<ApiResponse, ApiError> {
        self.request(http, cache_config).await
    }

    // ===== Books =====

    pub async fn get_books(&self, user_id: &str, filters: &Value) -> Result<ApiResponse, ApiError> {
        self.send(endpoints::books(user_id, filters)).await
    }

    pub async fn get_book(&self, user_id: &str, book_id: &str) -> Result<ApiResponse, ApiError> {
        self.send(endpoints::book(user_id, book_id)).await
    }

    pub async fn create_book(&self, user_id: &str, book: Value) -> Result<ApiResponse, ApiError> {
        self.send(endpoints::create_book(user_id, book)).await
    }

    pub async fn update_book(
        &self,
        user_id: &str,
        book_id: &str,
        updates: Value,
    ) -> Result<ApiResponse, ApiError> {
        self.send(endpoints::update_book(user_id, book_id, updates)).await
    }

    pub async fn delete_book(&self, user_id: &str, book_id: &str) -> Result<ApiResponse, ApiError> {
        self.send(endpoints::delete_book(user_id, book_id)).await
    }

    pub async fn get_cover(&self, book_id: &str) -> Result<ApiResponse, ApiError> {
        self.send(endpoints::cover(book_id)).await
    }

    // ===== Sessions, notes, stats =====

    pub async fn get_reading_sessions(&self, user_id: &str, limit: usize) -> Result<ApiResponse, ApiError> {
        self.send(endpoints::reading_sessions(user_id, limit)).await
    }

    pub async fn create_reading_session(&self, user_id: &str, session: Value) -> Result<ApiResponse, ApiError> {
        self.send(endpoints::create_reading_session(user_id, session)).await
    }

    pub async fn get_notes(&self, user_id: &str, book_id: Option<&str>) -> Result<ApiResponse, ApiError> {
        self.send(endpoints::notes(user_id, book_id)).await
    }

    pub async fn create_note(&self, user_id: &str, note: Value) -> Result<ApiResponse, ApiError> {
        self.send(endpoints::create_note(user_id, note)).await
    }

    pub async fn get_stats(&self, user_id: &str) -> Result<ApiResponse, ApiError> {
        self.send(endpoints::stats(user_id)).await
    }

    // ===== Cache utilities =====

    /// Fetch the recent books list and recent sessions in parallel.
    /// Failures are logged and skipped. Returns how many succeeded.
    pub async fn prefetch_data(&self, user_id: &str) -> usize {
        let targets = vec![
            endpoints::books(user_id, &json!({ "limit": self.prefetch_limit })),
            endpoints::reading_sessions(user_id, endpoints::RECENT_SESSIONS_LIMIT),
        ];

        let results = join_all(targets.into_iter().map(|target| self.send(target))).await;

        let mut fetched = 0;
        for result in results {
            match result {
                Ok(_) => fetched += 1,
                Err(e) => warn!(user_id, error = %e, "Prefetch failed"),
            }
        }
        debug!(user_id, fetched, "Prefetch finished");
        fetched
    }

    pub async fn warm_cache(&self, user_id: &str, priorities: &[CacheType]) -> usize {
        self.replayer
            .cache
            .warm_cache(self.replayer.transport.as_ref(), user_id, priorities)
            .await
    }

    pub async fn clear_user_cache(&self, user_id: &str) -> usize {
        self.replayer.cache.clear_user(user_id).await
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.replayer.cache.metrics()
    }

    pub fn pending_requests(&self) -> Vec<QueuedRequest> {
        self.replayer.queue.pending()
    }
}

impl Drop for CachedApiService {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MockTransport;
    use crate::clock::ManualClock;
    use crate::queue::QUEUE_STORAGE_KEY;
    use crate::storage::{MemoryKeyValueStorage, MemoryStructuredStorage};
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    struct Harness {
        service: CachedApiService,
        transport: Arc<MockTransport>,
        clock: ManualClock,
    }

    async fn harness() -> Harness {
        let config = Config::default();
        let clock = ManualClock::default();
        let transport = Arc::new(MockTransport::new());
        let cache = Arc::new(CacheManager::new(
            &config,
            Arc::new(MemoryKeyValueStorage::new()),
            Arc::new(MemoryStructuredStorage::new()),
            Arc::new(clock.clone()),
        ));
        let queue = RequestQueue::load(
            cache.persistent_storage(),
            cache.structured_storage(),
            config.max_replay_retries,
            Arc::new(clock.clone()),
        )
        .await;

        let service = CachedApiService::new(
            transport.clone(),
            cache,
            Arc::new(queue),
            Connectivity::new(true),
            &config,
        );
        Harness {
            service,
            transport,
            clock,
        }
    }

    fn stored_queue_len(service: &CachedApiService) -> usize {
        let raw = service
            .cache()
            .persistent_storage()
            .get_item(QUEUE_STORAGE_KEY)
            .unwrap()
            .unwrap();
        serde_json::from_str::<Vec<QueuedRequest>>(&raw).unwrap().len()
    }

    #[tokio::test]
    async fn test_fresh_hit_skips_network() {
        let h = harness().await;
        h.transport.respond("/books/42", json!({"id": 42}));

        let first = h.service.get_book("7", "42").await.unwrap();
        assert_eq!(first, ApiResponse::Network { data: json!({"id": 42}) });

        let second = h.service.get_book("7", "42").await.unwrap();
        assert!(second.is_from_cache());
        assert!(!second.is_stale());
        assert_eq!(h.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_fallback_on_network_failure() {
        let h = harness().await;
        h.transport.respond("/books/42", json!({"title": "Dune"}));
        let config = CacheConfig::cached(CacheType::Books, "42", Some("7"))
            .with_ttl(Duration::milliseconds(100));

        h.service
            .request(HttpRequest::get("/books/42"), config.clone())
            .await
            .unwrap();

        h.clock.advance(Duration::milliseconds(150));
        h.transport.set_down(true);

        let response = h
            .service
            .request(HttpRequest::get("/books/42"), config)
            .await
            .unwrap();
        match response {
            ApiResponse::Cache { data, stale, error } => {
                assert_eq!(data, json!({"title": "Dune"}));
                assert!(stale);
                assert!(error.unwrap().contains("connection refused"));
            }
            other => panic!("expected stale cache response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_error_without_cache_propagates() {
        let h = harness().await;
        h.transport.fail("/stats", || ApiError::ServerError {
            status: 503,
            message: "down".into(),
        });

        let err = h.service.get_stats("7").await.unwrap_err();
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn test_offline_mutation_is_queued() {
        let h = harness().await;
        h.service.connectivity().set_online(false);

        let response = h
            .service
            .update_book("7", "42", json!({"title": "X"}))
            .await
            .unwrap();

        assert!(response.is_queued());
        assert!(response.queue_id().unwrap().starts_with("q_"));
        assert_eq!(h.service.pending_requests().len(), 1);
        assert_eq!(stored_queue_len(&h.service), 1);
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_read_serves_retained_copy() {
        let h = harness().await;
        h.transport.respond("/stats", json!({"pages": 300}));
        h.service.get_stats("7").await.unwrap();

        h.clock.advance(Duration::hours(1));
        h.service.connectivity().set_online(false);

        let response = h.service.get_stats("7").await.unwrap();
        assert!(response.is_stale());
        assert_eq!(response.data(), Some(&json!({"pages": 300})));
    }

    #[tokio::test]
    async fn test_offline_without_cache_fails() {
        let h = harness().await;
        h.service.connectivity().set_online(false);

        let err = h.service.get_notes("7", None).await.unwrap_err();
        assert!(matches!(err, ApiError::NoConnectivity));
    }

    #[tokio::test]
    async fn test_mutation_invalidates_matching_entries() {
        let h = harness().await;
        h.transport.respond("/books", json!([{"id": 1}]));
        h.transport.respond("/stats", json!({}));
        h.service.get_books("7", &json!({"status": "reading"})).await.unwrap();
        h.service.get_stats("7").await.unwrap();

        h.service.create_book("7", json!({"title": "New"})).await.unwrap();

        let metrics = h.service.cache_metrics();
        assert_eq!(metrics.invalidations, 1);

        let books = h.service.get_books("7", &json!({"status": "reading"})).await.unwrap();
        assert!(!books.is_from_cache());
        let stats = h.service.get_stats("7").await.unwrap();
        assert!(stats.is_from_cache());
    }

    #[tokio::test]
    async fn test_caching_a_mutation_is_rejected() {
        let h = harness().await;
        let err = h
            .service
            .request(
                HttpRequest::post("/books", json!({})),
                CacheConfig::cached(CacheType::Books, "new", Some("7")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotCacheable("POST")));
    }

    #[tokio::test]
    async fn test_reconnect_replays_queue() {
        let h = harness().await;
        h.service.start().await;
        let mut reports = h.service.subscribe_replay_reports();

        h.service.connectivity().set_online(false);
        h.service.update_book("7", "42", json!({"title": "X"})).await.unwrap();
        h.service.delete_book("7", "43").await.unwrap();
        assert_eq!(h.service.pending_requests().len(), 2);

        h.service.connectivity().set_online(true);
        let report = tokio::time::timeout(StdDuration::from_secs(5), reports.recv())
            .await
            .expect("replay report")
            .unwrap();

        assert_eq!(report.succeeded.len(), 2);
        assert!(h.service.pending_requests().is_empty());
        let urls: Vec<_> = h.transport.calls().into_iter().map(|r| r.url).collect();
        assert_eq!(urls, vec!["/books/42", "/books/43"]);

        h.service.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_sweeps_immediately_and_periodically() {
        let h = harness().await;
        let cache = h.service.cache();
        cache
            .set(CacheType::Books, "1", json!(1), Some("7"), Some(Duration::seconds(1)))
            .await;
        h.clock.advance(Duration::seconds(2));
        assert_eq!(cache.store().memory_len(), 1);

        h.service.start().await;
        tokio::time::sleep(StdDuration::from_millis(1)).await;
        assert_eq!(cache.store().memory_len(), 0);

        cache
            .set(CacheType::Notes, "1", json!(2), Some("7"), Some(Duration::seconds(1)))
            .await;
        h.clock.advance(Duration::seconds(2));
        tokio::time::sleep(StdDuration::from_secs(300)).await;
        assert_eq!(cache.store().memory_len(), 1);

        // Default sweep interval is ten minutes
        tokio::time::sleep(StdDuration::from_secs(301)).await;
        assert_eq!(cache.store().memory_len(), 0);

        h.service.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_automatic_replay() {
        let h = harness().await;
        h.service.start().await;
        assert_eq!(h.service.connectivity().watcher_count(), 1);
        let mut reports = h.service.subscribe_replay_reports();

        h.service.connectivity().set_online(false);
        h.service.update_book("7", "42", json!({"title": "X"})).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(1)).await;

        h.service.stop();
        tokio::time::sleep(StdDuration::from_millis(1)).await;
        assert_eq!(h.service.connectivity().watcher_count(), 0);

        h.service.connectivity().set_online(true);
        tokio::time::sleep(StdDuration::from_secs(60)).await;

        assert_eq!(h.transport.call_count(), 0);
        assert_eq!(h.service.pending_requests().len(), 1);
        assert!(matches!(
            reports.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_process_queue_applies_invalidation() {
        let h = harness().await;
        h.transport.respond("/notes", json!([]));
        h.service.get_notes("7", None).await.unwrap();

        h.service.connectivity().set_online(false);
        h.service.create_note("7", json!({"text": "hi"})).await.unwrap();

        h.service.connectivity().set_online(true);
        let report = h.service.process_queue().await;
        assert_eq!(report.succeeded.len(), 1);

        let notes = h.service.get_notes("7", None).await.unwrap();
        assert!(!notes.is_from_cache());
    }

    #[tokio::test]
    async fn test_prefetch_tolerates_failures() {
        let h = harness().await;
        h.transport.respond("/books", json!([]));
        h.transport.fail("/reading-sessions", || ApiError::Timeout);

        let fetched = h.service.prefetch_data("7").await;
        assert_eq!(fetched, 1);
        assert_eq!(h.transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_clear_user_cache() {
        let h = harness().await;
        h.transport.respond("/stats", json!({}));
        h.service.get_stats("7").await.unwrap();

        h.service.clear_user_cache("7").await;

        let stats = h.service.get_stats("7").await.unwrap();
        assert!(!stats.is_from_cache());
    }
}
