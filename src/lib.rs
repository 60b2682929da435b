// In-process telemetry core for live sensor dashboards
//
// This crate buffers high-frequency sensor readings, decimates them to
// display resolution on demand, coordinates bursty render-driven requests,
// tracks per-sensor liveness, and cascades offline state through declared
// hub/child dependencies.
//
// Architecture:
// - `series`: Append-only in-memory buffers with bounded retention
// - `decimate`: Stride decimation plus the dedicated engine worker thread
// - `coordinator`: Debouncing, stale-response rejection, concurrency ceiling
// - `liveness`: Timeout-driven online/offline tracking with cancellable timers
// - `dependency`: Offline cascade from hubs to their dependent sensors
// - `ingest`: Raw reading intake, identity resolution, discovery throttling

pub mod config;
pub mod coordinator;
pub mod decimate;
pub mod dependency;
pub mod ingest;
pub mod liveness;
pub mod series;
pub mod types;

pub use config::{CoordinatorConfig, DiscoveryConfig, EngineConfig, LivenessConfig, QualityMode};
pub use coordinator::{CoordinatorResult, RequestCoordinator, RequestKey};
pub use decimate::{DecimatedSeries, DecimationBackend, DecimationEngine};
pub use dependency::DependencyResolver;
pub use ingest::{
    DiscoveryService, DiscoveryThrottle, IdentityRegistry, IngestPipeline, IngestSummary,
};
pub use liveness::LivenessTracker;
pub use series::{SeriesBuffer, SeriesStore, StoreMetrics};
pub use types::{
    Aggregates, DecimatedPoint, EntityId, LivenessEvent, LivenessState, RawReading, Reading,
    TelemetryError, TelemetryResult, TimeWindow,
};
