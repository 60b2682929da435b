// Decimation engine with a dedicated compute thread
//
// The primary backend is a plain OS thread owning the series store and
// serving token-addressed requests over a channel, so large reductions
// never block the caller's thread. Communication is strictly
// message-passing: the thread only ever receives copies of readings,
// never a live buffer.
//
// If the thread cannot be created, the engine falls back to an in-line
// synchronous backend implementing the identical interface, and stays
// there for the rest of the session rather than retrying per request.

use crate::config::EngineConfig;
use crate::decimate::stride::{point_budget, stride_decimate};
use crate::series::{SeriesStore, StoreMetrics};
use crate::types::{
    DecimatedPoint, EntityId, Reading, TelemetryError, TelemetryResult, TimeWindow,
};
use async_trait::async_trait;
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashMap;
use std::thread;
use tokio::sync::oneshot;

/// Decimated output, one point array per requested entity
pub type DecimatedSeries = HashMap<EntityId, Vec<DecimatedPoint>>;

/// A request to the engine. Every variant carries the caller's token,
/// which is echoed back on the response for stale-response matching.
#[derive(Debug, Clone)]
pub enum EngineRequest {
    Register {
        token: u64,
        entity_id: EntityId,
    },
    Append {
        token: u64,
        entity_id: EntityId,
        readings: Vec<Reading>,
    },
    Decimate {
        token: u64,
        entity_ids: Vec<EntityId>,
        window: TimeWindow,
        width_px: u32,
    },
    RawSlice {
        token: u64,
        entity_id: EntityId,
        window: TimeWindow,
    },
    Reset {
        token: u64,
        entity_id: Option<EntityId>,
    },
    Stats {
        token: u64,
    },
}

impl EngineRequest {
    pub fn token(&self) -> u64 {
        match self {
            EngineRequest::Register { token, .. }
            | EngineRequest::Append { token, .. }
            | EngineRequest::Decimate { token, .. }
            | EngineRequest::RawSlice { token, .. }
            | EngineRequest::Reset { token, .. }
            | EngineRequest::Stats { token } => *token,
        }
    }
}

/// Successful response payload
#[derive(Debug)]
pub enum EnginePayload {
    Registered,
    Appended {
        /// False when the entity had no registration and the readings
        /// were dropped
        accepted: bool,
    },
    Decimated {
        series: DecimatedSeries,
    },
    RawSlice {
        points: Vec<Reading>,
    },
    ResetDone,
    Stats {
        metrics: StoreMetrics,
    },
}

/// Response for one request. An `Err` result rejects the pending caller;
/// it must be treated as "no data available", not as fatal.
#[derive(Debug)]
pub struct EngineResponse {
    pub token: u64,
    pub result: TelemetryResult<EnginePayload>,
}

struct WorkerMessage {
    request: EngineRequest,
    reply: oneshot::Sender<EngineResponse>,
}

enum Backend {
    /// Dedicated compute thread owning the store
    Worker { tx: Sender<WorkerMessage> },
    /// Synchronous in-line fallback, same algorithm, same interface
    Inline { store: Mutex<SeriesStore> },
}

/// Abstraction over the decimation call used by the request coordinator,
/// so callers are oblivious to which backend served them.
#[async_trait]
pub trait DecimationBackend: Send + Sync {
    async fn decimate(
        &self,
        token: u64,
        entity_ids: Vec<EntityId>,
        window: TimeWindow,
        width_px: u32,
    ) -> TelemetryResult<DecimatedSeries>;
}

pub struct DecimationEngine {
    backend: Backend,
    config: EngineConfig,
}

impl DecimationEngine {
    /// Create an engine backed by a dedicated compute thread, falling back
    /// to the in-line backend for the session if the thread cannot start.
    pub fn new(config: EngineConfig) -> Self {
        let (tx, rx) = channel::unbounded::<WorkerMessage>();
        let worker_config = config.clone();

        let spawned = thread::Builder::new()
            .name("decimation-engine".to_string())
            .spawn(move || {
                let mut store = SeriesStore::new(&worker_config);
                for msg in rx.iter() {
                    let response = handle_request(&mut store, &worker_config, msg.request);
                    // Caller may have given up (timeout); that's fine
                    msg.reply.send(response).ok();
                }
                log::debug!("Decimation worker exiting");
            });

        match spawned {
            Ok(_handle) => Self {
                backend: Backend::Worker { tx },
                config,
            },
            Err(e) => {
                log::warn!(
                    "Failed to spawn decimation worker, using synchronous fallback for this session: {}",
                    e
                );
                Self::new_inline(config)
            }
        }
    }

    /// Create an engine that computes everything in-line on the caller's
    /// thread. This is the fallback backend, also usable directly.
    pub fn new_inline(config: EngineConfig) -> Self {
        let store = Mutex::new(SeriesStore::new(&config));
        Self {
            backend: Backend::Inline { store },
            config,
        }
    }

    pub fn is_fallback_active(&self) -> bool {
        matches!(self.backend, Backend::Inline { .. })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Submit a raw engine request and await its response.
    pub async fn submit(&self, request: EngineRequest) -> TelemetryResult<EngineResponse> {
        match &self.backend {
            Backend::Worker { tx } => {
                let (reply, rx) = oneshot::channel();
                tx.send(WorkerMessage { request, reply })
                    .map_err(|_| TelemetryError::ChannelClosed)?;
                rx.await.map_err(|_| TelemetryError::ChannelClosed)
            }
            Backend::Inline { store } => {
                let mut store = store.lock();
                Ok(handle_request(&mut store, &self.config, request))
            }
        }
    }

    pub async fn register(&self, token: u64, entity_id: impl Into<EntityId>) -> TelemetryResult<()> {
        let response = self
            .submit(EngineRequest::Register {
                token,
                entity_id: entity_id.into(),
            })
            .await?;
        response.result.map(|_| ())
    }

    /// Append readings for one entity. Returns whether the readings were
    /// accepted (false means the entity had no registration).
    pub async fn append(
        &self,
        token: u64,
        entity_id: impl Into<EntityId>,
        readings: Vec<Reading>,
    ) -> TelemetryResult<bool> {
        let response = self
            .submit(EngineRequest::Append {
                token,
                entity_id: entity_id.into(),
                readings,
            })
            .await?;
        match response.result? {
            EnginePayload::Appended { accepted } => Ok(accepted),
            other => Err(unexpected_payload("append", &other)),
        }
    }

    pub async fn raw_slice(
        &self,
        token: u64,
        entity_id: impl Into<EntityId>,
        window: TimeWindow,
    ) -> TelemetryResult<Vec<Reading>> {
        let response = self
            .submit(EngineRequest::RawSlice {
                token,
                entity_id: entity_id.into(),
                window,
            })
            .await?;
        match response.result? {
            EnginePayload::RawSlice { points } => Ok(points),
            other => Err(unexpected_payload("raw_slice", &other)),
        }
    }

    pub async fn reset(&self, token: u64, entity_id: Option<EntityId>) -> TelemetryResult<()> {
        let response = self.submit(EngineRequest::Reset { token, entity_id }).await?;
        response.result.map(|_| ())
    }

    pub async fn stats(&self, token: u64) -> TelemetryResult<StoreMetrics> {
        let response = self.submit(EngineRequest::Stats { token }).await?;
        match response.result? {
            EnginePayload::Stats { metrics } => Ok(metrics),
            other => Err(unexpected_payload("stats", &other)),
        }
    }
}

#[async_trait]
impl DecimationBackend for DecimationEngine {
    async fn decimate(
        &self,
        token: u64,
        entity_ids: Vec<EntityId>,
        window: TimeWindow,
        width_px: u32,
    ) -> TelemetryResult<DecimatedSeries> {
        let response = self
            .submit(EngineRequest::Decimate {
                token,
                entity_ids,
                window,
                width_px,
            })
            .await?;
        match response.result? {
            EnginePayload::Decimated { series } => Ok(series),
            other => Err(unexpected_payload("decimate", &other)),
        }
    }
}

fn unexpected_payload(operation: &str, payload: &EnginePayload) -> TelemetryError {
    TelemetryError::BackendUnavailable(format!(
        "unexpected payload for {}: {:?}",
        operation, payload
    ))
}

/// Service one request against the store. Shared verbatim by the worker
/// thread and the in-line fallback.
fn handle_request(
    store: &mut SeriesStore,
    config: &EngineConfig,
    request: EngineRequest,
) -> EngineResponse {
    let token = request.token();
    let result = match request {
        EngineRequest::Register { entity_id, .. } => {
            store.register(entity_id);
            Ok(EnginePayload::Registered)
        }
        EngineRequest::Append {
            entity_id,
            readings,
            ..
        } => {
            let accepted = store.append(&entity_id, &readings);
            Ok(EnginePayload::Appended { accepted })
        }
        EngineRequest::Decimate {
            entity_ids,
            window,
            width_px,
            ..
        } => decimate_entities(store, config, &entity_ids, window, width_px)
            .map(|series| EnginePayload::Decimated { series }),
        EngineRequest::RawSlice {
            entity_id, window, ..
        } => window.validate().and_then(|_| {
            store
                .slice(&entity_id, window)
                .map(|points| EnginePayload::RawSlice {
                    points: points.to_vec(),
                })
                .ok_or(TelemetryError::UnknownEntity(entity_id))
        }),
        EngineRequest::Reset { entity_id, .. } => {
            store.reset(entity_id.as_deref());
            Ok(EnginePayload::ResetDone)
        }
        EngineRequest::Stats { .. } => Ok(EnginePayload::Stats {
            metrics: store.metrics(),
        }),
    };

    if let Err(e) = &result {
        log::debug!("Engine request {} failed: {}", token, e);
    }

    EngineResponse { token, result }
}

fn decimate_entities(
    store: &SeriesStore,
    config: &EngineConfig,
    entity_ids: &[EntityId],
    window: TimeWindow,
    width_px: u32,
) -> TelemetryResult<DecimatedSeries> {
    window.validate()?;
    let budget = point_budget(width_px, config);

    // Copy the slices out first; the store is never shared with rayon
    let mut slices: Vec<(EntityId, Vec<Reading>)> = Vec::with_capacity(entity_ids.len());
    for id in entity_ids {
        let slice = store
            .slice(id, window)
            .ok_or_else(|| TelemetryError::UnknownEntity(id.clone()))?;
        slices.push((id.clone(), slice.to_vec()));
    }

    Ok(slices
        .into_par_iter()
        .map(|(id, points)| (id, stride_decimate(&points, budget)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(count: i64) -> Vec<Reading> {
        (0..count).map(|t| Reading::new(t, t as f64)).collect()
    }

    async fn seeded_engine(engine: DecimationEngine) -> DecimationEngine {
        engine.register(1, "s1").await.unwrap();
        engine.append(2, "s1", ramp(10_000)).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_worker_roundtrip() {
        let engine = seeded_engine(DecimationEngine::new(EngineConfig {
            max_points: 20_000,
            ..Default::default()
        }))
        .await;
        assert!(!engine.is_fallback_active());

        let series = engine
            .decimate(3, vec!["s1".to_string()], TimeWindow::new(0, 20_000), 50)
            .await
            .unwrap();

        let points = &series["s1"];
        // balanced mode: 50px * 2 points per pixel
        assert!(points.len() <= 100);
        assert_eq!(points[0].timestamp_ms, 0);
        assert_eq!(points.last().unwrap().timestamp_ms, 9_999);
    }

    #[tokio::test]
    async fn test_inline_fallback_same_interface() {
        let engine = seeded_engine(DecimationEngine::new_inline(EngineConfig {
            max_points: 20_000,
            ..Default::default()
        }))
        .await;
        assert!(engine.is_fallback_active());

        let series = engine
            .decimate(3, vec!["s1".to_string()], TimeWindow::new(0, 20_000), 50)
            .await
            .unwrap();
        assert!(series["s1"].len() <= 100);
    }

    #[tokio::test]
    async fn test_unknown_entity_rejects_request() {
        let engine = DecimationEngine::new(EngineConfig::default());
        let result = engine
            .decimate(1, vec!["ghost".to_string()], TimeWindow::new(0, 10), 100)
            .await;
        assert!(matches!(result, Err(TelemetryError::UnknownEntity(_))));
    }

    #[tokio::test]
    async fn test_bad_window_rejects_request() {
        let engine = seeded_engine(DecimationEngine::new(EngineConfig::default())).await;
        let result = engine
            .decimate(3, vec!["s1".to_string()], TimeWindow::new(100, 0), 100)
            .await;
        assert!(matches!(result, Err(TelemetryError::InvalidWindow { .. })));
    }

    #[tokio::test]
    async fn test_raw_slice_and_reset() {
        let engine = seeded_engine(DecimationEngine::new(EngineConfig {
            max_points: 20_000,
            ..Default::default()
        }))
        .await;

        let points = engine
            .raw_slice(3, "s1", TimeWindow::new(100, 199))
            .await
            .unwrap();
        assert_eq!(points.len(), 100);

        engine.reset(4, None).await.unwrap();
        let points = engine
            .raw_slice(5, "s1", TimeWindow::new(0, 20_000))
            .await
            .unwrap();
        assert!(points.is_empty());
    }

    #[tokio::test]
    async fn test_stats_reports_dropped_unknown() {
        let engine = DecimationEngine::new(EngineConfig::default());
        let accepted = engine.append(1, "ghost", ramp(5)).await.unwrap();
        assert!(!accepted);

        let metrics = engine.stats(2).await.unwrap();
        assert_eq!(metrics.total_dropped_unknown, 5);
        assert_eq!(metrics.entities, 0);
    }

    #[tokio::test]
    async fn test_response_token_echo() {
        let engine = DecimationEngine::new(EngineConfig::default());
        let response = engine.submit(EngineRequest::Stats { token: 42 }).await.unwrap();
        assert_eq!(response.token, 42);
    }
}
