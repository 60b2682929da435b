// Ingestion pipeline: raw readings in, buffered series + liveness out
//
// Raw readings arrive keyed by device address. Addresses are resolved to
// internal entity ids through the external identity registry; resolved
// readings fan in to the decimation engine (append) and the liveness
// tracker (activity). Readings for unresolved addresses are never
// buffered - they may trigger a rate-limited, single-flight discovery
// attempt, and an address is permanently removed from the retry set once
// an attempt completes, successfully or not. Readings that arrived before
// discovery completed stay dropped; there is no retroactive backfill.

use crate::config::DiscoveryConfig;
use crate::decimate::engine::DecimationEngine;
use crate::liveness::LivenessTracker;
use crate::types::{EntityId, RawReading, Reading, TelemetryResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// External identity registry: maps raw device addresses to stable entity
/// ids. Owned elsewhere; this core only queries it.
pub trait IdentityRegistry: Send + Sync {
    fn resolve(&self, address: &str) -> Option<EntityId>;
}

/// External discovery collaborator, invoked for addresses the registry
/// does not know.
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    async fn discover(&self, address: &str) -> TelemetryResult<()>;
}

/// Rate-limited, single-flight gate in front of the discovery service.
///
/// Explicit state with tokio-time bookkeeping rather than ambient module
/// caches, so it stays testable under a paused clock.
#[derive(Clone)]
pub struct DiscoveryThrottle {
    config: DiscoveryConfig,
    service: Arc<dyn DiscoveryService>,
    last_attempt: Arc<Mutex<Option<Instant>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    /// Addresses already attempted; never retried
    attempted: Arc<Mutex<HashSet<String>>>,
}

impl DiscoveryThrottle {
    pub fn new(config: DiscoveryConfig, service: Arc<dyn DiscoveryService>) -> Self {
        Self {
            config,
            service,
            last_attempt: Arc::new(Mutex::new(None)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            attempted: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Attempt discovery for an address. Returns true when an attempt was
    /// actually launched; false when gated (already attempted, already in
    /// flight, or inside the minimum spacing window).
    pub fn try_discover(&self, address: &str) -> bool {
        if self.attempted.lock().contains(address) {
            return false;
        }
        if self.in_flight.lock().contains(address) {
            return false;
        }

        {
            let mut last = self.last_attempt.lock();
            let now = Instant::now();
            if let Some(previous) = *last {
                if now.duration_since(previous) < self.config.min_spacing() {
                    log::debug!("Discovery for {} suppressed by rate limit", address);
                    return false;
                }
            }
            *last = Some(now);
        }

        self.in_flight.lock().insert(address.to_string());

        let throttle = self.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            let result = throttle.service.discover(&address).await;
            match &result {
                Ok(()) => log::info!("Discovery succeeded for {}", address),
                Err(e) => log::warn!("Discovery failed for {}: {}", address, e),
            }
            throttle.in_flight.lock().remove(&address);
            // Permanent removal from the retry set either way
            throttle.attempted.lock().insert(address);
        });

        true
    }

    pub fn attempted_count(&self) -> usize {
        self.attempted.lock().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Summary of one ingest batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Readings resolved and handed to the engine
    pub buffered: usize,
    /// Readings dropped because their address is unknown
    pub dropped_unresolved: usize,
    /// Discovery attempts actually launched for this batch
    pub discovery_launched: usize,
}

pub struct IngestPipeline {
    engine: Arc<DecimationEngine>,
    tracker: LivenessTracker,
    registry: Arc<dyn IdentityRegistry>,
    discovery: DiscoveryThrottle,
    next_token: AtomicU64,
}

impl IngestPipeline {
    pub fn new(
        engine: Arc<DecimationEngine>,
        tracker: LivenessTracker,
        registry: Arc<dyn IdentityRegistry>,
        discovery: DiscoveryThrottle,
    ) -> Self {
        Self {
            engine,
            tracker,
            registry,
            discovery,
            next_token: AtomicU64::new(0),
        }
    }

    /// Ingest a batch of raw readings, in any timestamp order.
    pub async fn ingest(&self, readings: &[RawReading]) -> TelemetryResult<IngestSummary> {
        let mut summary = IngestSummary::default();
        let mut resolved: HashMap<EntityId, Vec<Reading>> = HashMap::new();

        for raw in readings {
            match self.registry.resolve(&raw.address) {
                Some(entity_id) => {
                    resolved
                        .entry(entity_id)
                        .or_default()
                        .push(Reading::new(raw.timestamp_ms, raw.value));
                    summary.buffered += 1;
                }
                None => {
                    summary.dropped_unresolved += 1;
                    if self.discovery.try_discover(&raw.address) {
                        summary.discovery_launched += 1;
                    }
                }
            }
        }

        for (entity_id, batch) in resolved {
            // The registry vouched for this id, so it is a registered
            // identity; make sure the store has its buffer
            self.engine.register(self.next_token(), entity_id.clone()).await?;
            self.engine
                .append(self.next_token(), entity_id.clone(), batch.clone())
                .await?;

            for reading in &batch {
                self.tracker.record_activity(&entity_id, reading.timestamp_ms);
            }
        }

        Ok(summary)
    }

    fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::SeqCst) + 1
    }
}
