// Common types for the telemetry core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable internal identifier for a tracked entity (sensor or gateway).
///
/// This is not the raw device address; addresses are resolved to ids
/// through the external identity registry before anything is buffered.
pub type EntityId = String;

/// Result type for telemetry operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Errors that can occur in the telemetry core
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Unknown entity: {0}")]
    UnknownEntity(EntityId),

    #[error("Invalid window: start {start_ms} > end {end_ms}")]
    InvalidWindow { start_ms: i64, end_ms: i64 },

    #[error("Compute backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Request {0} timed out")]
    RequestTimeout(u64),

    #[error("Request {0} superseded by a newer request for the same key")]
    Superseded(u64),

    #[error("Request {0} cancelled")]
    Cancelled(u64),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Channel closed")]
    ChannelClosed,
}

/// A single timestamped reading for one entity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Unix timestamp in milliseconds
    pub timestamp_ms: i64,

    /// Measured value
    pub value: f64,
}

impl Reading {
    pub fn new(timestamp_ms: i64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value,
        }
    }
}

/// A reading as it arrives off the wire, keyed by raw device address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReading {
    /// Raw device address (e.g. a MAC or vendor serial)
    pub address: String,

    /// Measurement kind (e.g. "temperature", "humidity")
    pub kind: String,

    /// Unit string as reported by the device
    pub unit: String,

    pub value: f64,

    pub timestamp_ms: i64,

    /// Battery level, when the device reports one
    #[serde(default)]
    pub battery_pct: Option<f32>,
}

/// Inclusive time window `[start_ms, end_ms]` over a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeWindow {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn validate(&self) -> TelemetryResult<()> {
        if self.start_ms > self.end_ms {
            return Err(TelemetryError::InvalidWindow {
                start_ms: self.start_ms,
                end_ms: self.end_ms,
            });
        }
        Ok(())
    }

    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.start_ms && timestamp_ms <= self.end_ms
    }
}

/// A decimated output point, one of at most `point_budget` per entity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecimatedPoint {
    pub timestamp_ms: i64,
    pub value: f64,
}

impl From<Reading> for DecimatedPoint {
    fn from(r: Reading) -> Self {
        Self {
            timestamp_ms: r.timestamp_ms,
            value: r.value,
        }
    }
}

/// Rolling aggregates over the retained points of one series
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Aggregates {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    /// Value of the most recent retained point
    pub current: f64,
}

/// Liveness state of a tracked entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessState {
    /// Seeded but no activity observed yet
    Unknown,
    Online,
    Offline,
}

/// Event emitted when an entity's liveness state changes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessEvent {
    pub entity_id: EntityId,
    pub state: LivenessState,
    /// Wall-clock time the transition was observed, unix milliseconds
    pub timestamp_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_validation() {
        assert!(TimeWindow::new(0, 100).validate().is_ok());
        assert!(TimeWindow::new(100, 100).validate().is_ok());
        assert!(TimeWindow::new(101, 100).validate().is_err());
    }

    #[test]
    fn test_window_contains() {
        let w = TimeWindow::new(10, 20);
        assert!(w.contains(10));
        assert!(w.contains(20));
        assert!(!w.contains(9));
        assert!(!w.contains(21));
    }

    #[test]
    fn test_liveness_state_serialization() {
        let json = serde_json::to_string(&LivenessState::Offline).unwrap();
        assert_eq!(json, "\"offline\"");
    }
}
