// Request coordinator - turns bursty render-driven requests into a bounded
// stream of engine calls
//
// Features:
// - Strictly increasing tokens; responses that no longer match the latest
//   token for their key are discarded (last-writer-wins by issuance order)
// - Per-key debouncing: only the last request in a burst is issued
// - Concurrency ceiling via semaphore; excess requests queue
// - Hard per-request timeout
// - Graceful teardown via CancellationToken: all pending timers cancelled,
//   all outstanding tokens rejected immediately

use crate::config::CoordinatorConfig;
use crate::decimate::engine::{DecimatedSeries, DecimationBackend};
use crate::types::{EntityId, TelemetryError, TelemetryResult, TimeWindow};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

/// Outcome delivered to the requesting caller
pub type CoordinatorResult = TelemetryResult<DecimatedSeries>;

/// Identity of a request for debounce/stale-rejection purposes.
///
/// Unrelated concurrent requests (different entities, window or width) must
/// not cancel each other, so the key is the full tuple with entity ids
/// normalized to a sorted, deduplicated list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    entity_ids: Vec<EntityId>,
    window: TimeWindow,
    width_px: u32,
}

impl RequestKey {
    fn new(mut entity_ids: Vec<EntityId>, window: TimeWindow, width_px: u32) -> Self {
        entity_ids.sort();
        entity_ids.dedup();
        Self {
            entity_ids,
            window,
            width_px,
        }
    }
}

struct DebounceHandle {
    token: u64,
    cancel: CancellationToken,
}

/// Cheap to clone; clones share the same token counter, debounce state
/// and concurrency ceiling.
#[derive(Clone)]
pub struct RequestCoordinator {
    backend: Arc<dyn DecimationBackend>,
    config: CoordinatorConfig,
    next_token: Arc<AtomicU64>,
    /// At most one pending debounce timer per key
    debounces: Arc<Mutex<HashMap<RequestKey, DebounceHandle>>>,
    /// Most recently issued token per key, for stale-response rejection;
    /// entries are retired when their request resolves
    latest: Arc<Mutex<HashMap<RequestKey, u64>>>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl RequestCoordinator {
    pub fn new(backend: Arc<dyn DecimationBackend>, config: CoordinatorConfig) -> Self {
        let max_concurrent = config.quality.max_concurrent_requests();
        Self {
            backend,
            config,
            next_token: Arc::new(AtomicU64::new(0)),
            debounces: Arc::new(Mutex::new(HashMap::new())),
            latest: Arc::new(Mutex::new(HashMap::new())),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Issue a decimation request. Returns immediately with a receiver so
    /// the caller can keep rendering stale data while waiting.
    ///
    /// A newer request for the same key supersedes this one: the receiver
    /// then resolves to `Err(Superseded)`.
    pub fn request_decimation(
        &self,
        entity_ids: Vec<EntityId>,
        window: TimeWindow,
        width_px: u32,
    ) -> oneshot::Receiver<CoordinatorResult> {
        let (reply_tx, reply_rx) = oneshot::channel();

        if let Err(e) = window.validate() {
            reply_tx.send(Err(e)).ok();
            return reply_rx;
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;

        if self.shutdown.is_cancelled() {
            reply_tx.send(Err(TelemetryError::Cancelled(token))).ok();
            return reply_rx;
        }

        let key = RequestKey::new(entity_ids.clone(), window, width_px);
        let cancel = CancellationToken::new();

        {
            let mut debounces = self.debounces.lock();
            if let Some(prev) = debounces.insert(
                key.clone(),
                DebounceHandle {
                    token,
                    cancel: cancel.clone(),
                },
            ) {
                prev.cancel.cancel();
                log::debug!("Request {} superseded pending request {}", token, prev.token);
            }
        }
        self.latest.lock().insert(key.clone(), token);

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator
                .run_request(key, token, cancel, entity_ids, window, width_px, reply_tx)
                .await;
        });

        reply_rx
    }

    /// Bypass path: no debounce, no ceiling, no stale tracking. Used by
    /// callers falling back after a timeout or needing an immediate answer.
    pub async fn decimate_direct(
        &self,
        entity_ids: Vec<EntityId>,
        window: TimeWindow,
        width_px: u32,
    ) -> CoordinatorResult {
        window.validate()?;
        let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        self.backend
            .decimate(token, entity_ids, window, width_px)
            .await
    }

    /// Cancel all pending debounce timers and reject all outstanding
    /// requests. The coordinator accepts no further work afterwards.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut debounces = self.debounces.lock();
        for (_, handle) in debounces.drain() {
            handle.cancel.cancel();
        }
        self.latest.lock().clear();
        log::info!("Request coordinator shut down");
    }

    /// Number of requests currently holding an engine slot
    pub fn in_flight(&self) -> usize {
        self.config.quality.max_concurrent_requests() - self.semaphore.available_permits()
    }

    pub fn pending_debounces(&self) -> usize {
        self.debounces.lock().len()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_request(
        self,
        key: RequestKey,
        token: u64,
        cancel: CancellationToken,
        entity_ids: Vec<EntityId>,
        window: TimeWindow,
        width_px: u32,
        reply: oneshot::Sender<CoordinatorResult>,
    ) {
        // Debounce: wait out the burst window, unless superseded first
        tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => {
                reply.send(Err(TelemetryError::Cancelled(token))).ok();
                return;
            }
            _ = cancel.cancelled() => {
                reply.send(Err(TelemetryError::Superseded(token))).ok();
                return;
            }
            _ = tokio::time::sleep(self.config.quality.debounce()) => {}
        }

        // Clear our debounce entry if it is still ours
        {
            let mut debounces = self.debounces.lock();
            if debounces.get(&key).map(|h| h.token) == Some(token) {
                debounces.remove(&key);
            }
        }

        // Concurrency ceiling: queue here rather than firing immediately
        let permit = tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => {
                reply.send(Err(TelemetryError::Cancelled(token))).ok();
                return;
            }
            _ = cancel.cancelled() => {
                reply.send(Err(TelemetryError::Superseded(token))).ok();
                return;
            }
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    reply.send(Err(TelemetryError::ChannelClosed)).ok();
                    return;
                }
            }
        };

        let outcome = tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => Err(TelemetryError::Cancelled(token)),
            result = tokio::time::timeout(
                self.config.request_timeout(),
                self.backend.decimate(token, entity_ids, window, width_px),
            ) => match result {
                Ok(r) => r,
                Err(_) => {
                    log::warn!(
                        "Engine request {} timed out after {}ms",
                        token,
                        self.config.request_timeout_ms
                    );
                    Err(TelemetryError::RequestTimeout(token))
                }
            }
        };
        drop(permit);

        reply.send(self.apply_if_latest(&key, token, outcome)).ok();
    }

    /// Last-writer-wins by issuance order: a response is applied only if
    /// its token is still the most recently issued one for the key, even
    /// when responses arrive out of order.
    ///
    /// Applying a response retires its key's tracking entry, so the map
    /// only ever holds keys with an unresolved request.
    fn apply_if_latest(
        &self,
        key: &RequestKey,
        token: u64,
        outcome: CoordinatorResult,
    ) -> CoordinatorResult {
        let mut latest = self.latest.lock();
        match latest.get(key).copied() {
            Some(current) if current == token => {
                latest.remove(key);
                outcome
            }
            current => {
                log::debug!(
                    "Discarding stale response for token {} (latest is {:?})",
                    token,
                    current
                );
                Err(TelemetryError::Superseded(token))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, QualityMode};
    use crate::decimate::engine::DecimationEngine;
    use crate::types::Reading;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Backend that never answers, for timeout and queuing tests
    struct StallBackend;

    #[async_trait]
    impl DecimationBackend for StallBackend {
        async fn decimate(
            &self,
            _token: u64,
            _entity_ids: Vec<EntityId>,
            _window: TimeWindow,
            _width_px: u32,
        ) -> CoordinatorResult {
            tokio::time::sleep(Duration::from_secs(86_400)).await;
            unreachable!("stall backend never completes");
        }
    }

    async fn seeded_backend() -> Arc<DecimationEngine> {
        let engine = DecimationEngine::new_inline(EngineConfig {
            max_points: 20_000,
            ..Default::default()
        });
        engine.register(1, "s1").await.unwrap();
        let readings: Vec<Reading> = (0..10_000).map(|t| Reading::new(t, t as f64)).collect();
        engine.append(2, "s1", readings).await.unwrap();
        Arc::new(engine)
    }

    fn coordinator(backend: Arc<dyn DecimationBackend>, quality: QualityMode) -> RequestCoordinator {
        RequestCoordinator::new(
            backend,
            CoordinatorConfig {
                quality,
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_last_request() {
        let coordinator = coordinator(seeded_backend().await, QualityMode::Balanced);
        let ids = vec!["s1".to_string()];
        let window = TimeWindow::new(0, 20_000);

        let first = coordinator.request_decimation(ids.clone(), window, 800);
        let second = coordinator.request_decimation(ids, window, 800);

        assert!(matches!(
            first.await.unwrap(),
            Err(TelemetryError::Superseded(_))
        ));
        let series = second.await.unwrap().unwrap();
        assert!(series["s1"].len() <= 1600);
        assert_eq!(coordinator.pending_debounces(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_do_not_cancel_each_other() {
        let coordinator = coordinator(seeded_backend().await, QualityMode::Balanced);
        let ids = vec!["s1".to_string()];

        let a = coordinator.request_decimation(ids.clone(), TimeWindow::new(0, 5_000), 800);
        let b = coordinator.request_decimation(ids, TimeWindow::new(0, 20_000), 800);

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_response_rejected_by_token() {
        let coordinator = coordinator(seeded_backend().await, QualityMode::Balanced);
        let key = RequestKey::new(vec!["s1".to_string()], TimeWindow::new(0, 100), 800);

        coordinator.latest.lock().insert(key.clone(), 2);

        // An older token resolving after a newer one was issued is dropped
        let stale = coordinator.apply_if_latest(&key, 1, Ok(DecimatedSeries::new()));
        assert!(matches!(stale, Err(TelemetryError::Superseded(1))));

        let current = coordinator.apply_if_latest(&key, 2, Ok(DecimatedSeries::new()));
        assert!(current.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_requests_leave_no_tracking_state() {
        let coordinator = coordinator(seeded_backend().await, QualityMode::Balanced);

        // A pan session: every request is a distinct key
        for i in 0..50 {
            let rx = coordinator.request_decimation(
                vec!["s1".to_string()],
                TimeWindow::new(i * 100, (i + 1) * 100),
                800,
            );
            rx.await.unwrap().unwrap();
        }

        assert_eq!(coordinator.latest.lock().len(), 0);
        assert_eq!(coordinator.pending_debounces(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let coordinator = coordinator(Arc::new(StallBackend), QualityMode::Quality);
        let rx = coordinator.request_decimation(
            vec!["s1".to_string()],
            TimeWindow::new(0, 100),
            800,
        );

        assert!(matches!(
            rx.await.unwrap(),
            Err(TelemetryError::RequestTimeout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling_queues_excess() {
        // Performance mode: at most 2 in flight
        let coordinator = coordinator(Arc::new(StallBackend), QualityMode::Performance);
        let ids = vec!["s1".to_string()];

        let _a = coordinator.request_decimation(ids.clone(), TimeWindow::new(0, 1), 100);
        let _b = coordinator.request_decimation(ids.clone(), TimeWindow::new(0, 2), 100);
        let _c = coordinator.request_decimation(ids, TimeWindow::new(0, 3), 100);

        // Let the spawned tasks register their debounce sleeps first, then
        // fire the timers and let the tasks reach the engine
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(Duration::from_millis(400)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(coordinator.in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_everything() {
        let coordinator = coordinator(Arc::new(StallBackend), QualityMode::Balanced);
        let pending =
            coordinator.request_decimation(vec!["s1".to_string()], TimeWindow::new(0, 1), 100);

        coordinator.shutdown();

        assert!(matches!(
            pending.await.unwrap(),
            Err(TelemetryError::Cancelled(_))
        ));
        assert_eq!(coordinator.pending_debounces(), 0);

        // New work is rejected immediately
        let late =
            coordinator.request_decimation(vec!["s1".to_string()], TimeWindow::new(0, 1), 100);
        assert!(matches!(
            late.await.unwrap(),
            Err(TelemetryError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_decimate_direct_bypasses_debounce() {
        let coordinator = coordinator(seeded_backend().await, QualityMode::Balanced);
        let series = coordinator
            .decimate_direct(vec!["s1".to_string()], TimeWindow::new(0, 20_000), 800)
            .await
            .unwrap();
        assert!(!series["s1"].is_empty());
    }
}
