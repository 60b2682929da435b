// Demo binary: wires the full pipeline against a simulated sensor feed.
//
// Three sensors report through a hub; one address is unknown to the
// registry to show the discovery path. The feed runs for a few seconds,
// then the hub goes silent and liveness cascades offline through the
// dependency graph.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use telemetry_core::{
    CoordinatorConfig, DiscoveryConfig, DiscoveryService, DiscoveryThrottle, EngineConfig,
    EntityId, IdentityRegistry, IngestPipeline, LivenessConfig, LivenessState, LivenessTracker,
    DecimationEngine, DependencyResolver, RawReading, RequestCoordinator, TelemetryResult,
    TimeWindow,
};

struct StaticRegistry {
    known: HashMap<String, EntityId>,
}

impl IdentityRegistry for StaticRegistry {
    fn resolve(&self, address: &str) -> Option<EntityId> {
        self.known.get(address).cloned()
    }
}

struct LoggingDiscovery;

#[async_trait]
impl DiscoveryService for LoggingDiscovery {
    async fn discover(&self, address: &str) -> TelemetryResult<()> {
        log::info!("Probing unknown address {}", address);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }
}

fn reading(address: &str, timestamp_ms: i64, value: f64) -> RawReading {
    RawReading {
        address: address.to_string(),
        kind: "temperature".to_string(),
        unit: "C".to_string(),
        value,
        timestamp_ms,
        battery_pct: Some(92.0),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let engine = Arc::new(DecimationEngine::new(EngineConfig::default()));
    let coordinator = RequestCoordinator::new(engine.clone(), CoordinatorConfig::default());

    // Short liveness timeout so the offline cascade shows up quickly
    let tracker = LivenessTracker::new(LivenessConfig { timeout_ms: 2_000 });

    let resolver = DependencyResolver::new(tracker.clone());
    resolver.register_dependency("hub-1", ["temp-kitchen", "temp-cellar"]);
    {
        let resolver = resolver.clone();
        tracker.set_event_callback(move |event| {
            log::info!("Liveness: {} -> {:?}", event.entity_id, event.state);
            if event.state == LivenessState::Offline {
                resolver.on_parent_offline(&event.entity_id);
            }
        });
    }

    let registry = Arc::new(StaticRegistry {
        known: [
            ("hub:aa".to_string(), "hub-1".to_string()),
            ("temp:01".to_string(), "temp-kitchen".to_string()),
            ("temp:02".to_string(), "temp-cellar".to_string()),
        ]
        .into_iter()
        .collect(),
    });
    let discovery = DiscoveryThrottle::new(DiscoveryConfig::default(), Arc::new(LoggingDiscovery));
    let pipeline = IngestPipeline::new(engine.clone(), tracker.clone(), registry, discovery);

    tracker.initialize_tracking(["hub-1", "temp-kitchen", "temp-cellar"]);

    log::info!("Feeding simulated readings for 3 seconds");
    let start = 1_000_000_i64;
    for tick in 0..12_i64 {
        let t = start + tick * 250;
        let batch = vec![
            reading("hub:aa", t, 0.0),
            reading("temp:01", t, 20.0 + (tick as f64 * 0.1)),
            reading("temp:02", t, 11.0),
            // Unknown address; dropped, triggers one discovery attempt
            reading("temp:99", t, 3.3),
        ];
        let summary = pipeline.ingest(&batch).await?;
        log::debug!(
            "tick {}: buffered={} dropped={} discovery={}",
            tick,
            summary.buffered,
            summary.dropped_unresolved,
            summary.discovery_launched
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let window = TimeWindow::new(start, start + 12 * 250);
    let series = coordinator
        .request_decimation(
            vec!["temp-kitchen".to_string(), "temp-cellar".to_string()],
            window,
            800,
        )
        .await??;
    for (entity_id, points) in &series {
        log::info!("{}: {} points after decimation", entity_id, points.len());
    }

    let metrics = engine.stats(0).await?;
    log::info!(
        "Store: {} entities, {} points buffered, {} dropped as unknown",
        metrics.entities,
        metrics.total_points,
        metrics.total_dropped_unknown
    );

    log::info!("Hub goes silent; waiting for the offline cascade");
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    for id in ["hub-1", "temp-kitchen", "temp-cellar"] {
        log::info!("{}: {:?}", id, tracker.state(id));
    }

    coordinator.shutdown();
    tracker.shutdown();
    Ok(())
}
