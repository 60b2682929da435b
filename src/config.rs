// Configuration for the telemetry core
//
// All tunables live here as serde-friendly structs with documented defaults
// so callers can persist and restore a full configuration as JSON.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rendering quality mode.
///
/// Quality modes only change the point budget multiplier, debounce timing
/// and the concurrency ceiling; the decimation algorithm itself is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityMode {
    /// Fewest points, longest debounce; lowest CPU cost
    Performance,
    Balanced,
    /// Most points, shortest debounce; highest fidelity
    Quality,
}

impl QualityMode {
    /// Point budget multiplier: `point_budget = width_px * points_per_pixel`
    pub fn points_per_pixel(&self) -> usize {
        match self {
            QualityMode::Performance => 1,
            QualityMode::Balanced => 2,
            QualityMode::Quality => 4,
        }
    }

    /// Debounce window applied to bursts of requests for the same key
    pub fn debounce(&self) -> Duration {
        match self {
            QualityMode::Performance => Duration::from_millis(300),
            QualityMode::Balanced => Duration::from_millis(200),
            QualityMode::Quality => Duration::from_millis(100),
        }
    }

    /// Maximum number of in-flight engine requests
    pub fn max_concurrent_requests(&self) -> usize {
        match self {
            QualityMode::Performance => 2,
            QualityMode::Balanced => 3,
            QualityMode::Quality => 4,
        }
    }
}

impl Default for QualityMode {
    fn default() -> Self {
        QualityMode::Balanced
    }
}

/// Configuration for series buffers and the decimation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum retained points per entity; oldest evicted first
    pub max_points: usize,

    /// Render widths at or above this are served unbounded (all points)
    pub ultra_wide_px: u32,

    pub quality: QualityMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_points: 10_000,
            ultra_wide_px: 2400,
            quality: QualityMode::default(),
        }
    }
}

/// Configuration for the request coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub quality: QualityMode,

    /// Hard ceiling on how long any single engine request may stay pending
    pub request_timeout_ms: u64,
}

impl CoordinatorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            quality: QualityMode::default(),
            request_timeout_ms: 30_000,
        }
    }
}

/// Configuration for liveness tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Silence window after which an entity is declared offline
    pub timeout_ms: u64,
}

impl LivenessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self { timeout_ms: 60_000 }
    }
}

/// Configuration for discovery of unknown device addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Minimum spacing between discovery attempts
    pub min_spacing_ms: u64,
}

impl DiscoveryConfig {
    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { min_spacing_ms: 500 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_mode_budget_scaling() {
        assert!(
            QualityMode::Quality.points_per_pixel() > QualityMode::Performance.points_per_pixel()
        );
        assert!(QualityMode::Quality.debounce() < QualityMode::Performance.debounce());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_points, config.max_points);
        assert_eq!(back.quality, config.quality);
    }
}
