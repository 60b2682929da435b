// Bounded, time-ordered per-entity series storage
//
// Each registered entity gets a capacity-bounded buffer of (timestamp, value)
// points kept sorted by timestamp, with rolling aggregates recomputed eagerly
// on every mutation so readers never observe a stale min/max/avg for a shown
// series. Eviction is FIFO: when an append overflows the capacity, the oldest
// points are dropped.

use crate::config::EngineConfig;
use crate::types::{Aggregates, EntityId, Reading, TimeWindow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metrics for store-level monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreMetrics {
    pub total_appended: u64,
    pub total_evicted: u64,
    /// Readings dropped because their entity was never registered
    pub total_dropped_unknown: u64,
    pub entities: usize,
    pub total_points: usize,
}

/// One entity's bounded history
#[derive(Debug, Clone)]
pub struct SeriesBuffer {
    points: Vec<Reading>,
    max_points: usize,
    aggregates: Aggregates,
}

impl SeriesBuffer {
    pub fn new(max_points: usize) -> Self {
        Self {
            points: Vec::new(),
            max_points: max_points.max(1),
            aggregates: Aggregates::default(),
        }
    }

    /// Insert new readings, restoring sort order and the capacity bound.
    ///
    /// Stream order is not guaranteed, so the whole buffer is re-sorted by
    /// timestamp after insertion. Returns the number of evicted points.
    pub fn append(&mut self, readings: &[Reading]) -> usize {
        if readings.is_empty() {
            return 0;
        }

        self.points.extend_from_slice(readings);
        // Stable sort keeps arrival order for equal timestamps
        self.points.sort_by_key(|r| r.timestamp_ms);

        let evicted = self.points.len().saturating_sub(self.max_points);
        if evicted > 0 {
            self.points.drain(..evicted);
        }

        self.recompute_aggregates();
        evicted
    }

    /// Ordered subsequence within the window, via binary search on the
    /// sorted timestamps.
    pub fn slice(&self, window: TimeWindow) -> &[Reading] {
        let start = self
            .points
            .partition_point(|r| r.timestamp_ms < window.start_ms);
        let end = self
            .points
            .partition_point(|r| r.timestamp_ms <= window.end_ms);
        &self.points[start..end]
    }

    pub fn points(&self) -> &[Reading] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn aggregates(&self) -> Aggregates {
        self.aggregates
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.aggregates = Aggregates::default();
    }

    fn recompute_aggregates(&mut self) {
        if self.points.is_empty() {
            self.aggregates = Aggregates::default();
            return;
        }

        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for r in &self.points {
            if r.value < min {
                min = r.value;
            }
            if r.value > max {
                max = r.value;
            }
            sum += r.value;
        }

        self.aggregates = Aggregates {
            min,
            max,
            avg: sum / self.points.len() as f64,
            current: self.points[self.points.len() - 1].value,
        };
    }
}

/// All per-entity buffers, keyed by entity id.
///
/// Buffers exist only for registered entities; readings for anything else
/// are counted and dropped rather than silently materializing new state.
/// The store itself is not synchronized - it is owned by whichever engine
/// backend is active and mutated from a single writer.
pub struct SeriesStore {
    buffers: HashMap<EntityId, SeriesBuffer>,
    max_points: usize,
    total_appended: u64,
    total_evicted: u64,
    total_dropped_unknown: u64,
}

impl SeriesStore {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            buffers: HashMap::new(),
            max_points: config.max_points,
            total_appended: 0,
            total_evicted: 0,
            total_dropped_unknown: 0,
        }
    }

    /// Declare an entity known to the system. Idempotent.
    pub fn register(&mut self, entity_id: impl Into<EntityId>) {
        let max_points = self.max_points;
        self.buffers
            .entry(entity_id.into())
            .or_insert_with(|| SeriesBuffer::new(max_points));
    }

    pub fn is_registered(&self, entity_id: &str) -> bool {
        self.buffers.contains_key(entity_id)
    }

    /// Append readings for one entity. No-op for an unregistered entity.
    pub fn append(&mut self, entity_id: &str, readings: &[Reading]) -> bool {
        match self.buffers.get_mut(entity_id) {
            Some(buffer) => {
                let evicted = buffer.append(readings);
                self.total_appended += readings.len() as u64;
                self.total_evicted += evicted as u64;
                true
            }
            None => {
                self.total_dropped_unknown += readings.len() as u64;
                log::debug!(
                    "Dropping {} readings for unregistered entity {}",
                    readings.len(),
                    entity_id
                );
                false
            }
        }
    }

    pub fn slice(&self, entity_id: &str, window: TimeWindow) -> Option<&[Reading]> {
        self.buffers.get(entity_id).map(|b| b.slice(window))
    }

    pub fn aggregates(&self, entity_id: &str) -> Option<Aggregates> {
        self.buffers.get(entity_id).map(|b| b.aggregates())
    }

    /// Clear one buffer, or all of them
    pub fn reset(&mut self, entity_id: Option<&str>) {
        match entity_id {
            Some(id) => {
                if let Some(buffer) = self.buffers.get_mut(id) {
                    buffer.clear();
                }
            }
            None => {
                for buffer in self.buffers.values_mut() {
                    buffer.clear();
                }
            }
        }
    }

    pub fn metrics(&self) -> StoreMetrics {
        StoreMetrics {
            total_appended: self.total_appended,
            total_evicted: self.total_evicted,
            total_dropped_unknown: self.total_dropped_unknown,
            entities: self.buffers.len(),
            total_points: self.buffers.values().map(|b| b.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SeriesStore {
        SeriesStore::new(&EngineConfig {
            max_points: 100,
            ..Default::default()
        })
    }

    fn ramp(start: i64, count: i64) -> Vec<Reading> {
        (start..start + count)
            .map(|t| Reading::new(t, t as f64))
            .collect()
    }

    #[test]
    fn test_append_sorts_out_of_order_readings() {
        let mut store = store();
        store.register("s1");

        store.append("s1", &[Reading::new(30, 3.0), Reading::new(10, 1.0)]);
        store.append("s1", &[Reading::new(20, 2.0)]);

        let points = store.slice("s1", TimeWindow::new(0, 100)).unwrap();
        let timestamps: Vec<i64> = points.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
    }

    #[test]
    fn test_fifo_eviction_and_aggregates() {
        let mut store = store();
        store.register("s1");

        // 150 points into a 100-point buffer: t=50..149 must survive
        store.append("s1", &ramp(0, 150));

        let points = store.slice("s1", TimeWindow::new(0, 1000)).unwrap();
        assert_eq!(points.len(), 100);
        assert_eq!(points[0].timestamp_ms, 50);
        assert_eq!(points[99].timestamp_ms, 149);

        let aggregates = store.aggregates("s1").unwrap();
        assert_eq!(aggregates.min, 50.0);
        assert_eq!(aggregates.max, 149.0);
        assert_eq!(aggregates.current, 149.0);
    }

    #[test]
    fn test_unregistered_entity_is_dropped() {
        let mut store = store();

        assert!(!store.append("ghost", &ramp(0, 5)));
        assert!(store.slice("ghost", TimeWindow::new(0, 10)).is_none());
        assert_eq!(store.metrics().total_dropped_unknown, 5);
    }

    #[test]
    fn test_slice_window_bounds() {
        let mut store = store();
        store.register("s1");
        store.append("s1", &ramp(0, 50));

        let slice = store.slice("s1", TimeWindow::new(10, 20)).unwrap();
        assert_eq!(slice.len(), 11);
        assert_eq!(slice[0].timestamp_ms, 10);
        assert_eq!(slice[10].timestamp_ms, 20);

        let empty = store.slice("s1", TimeWindow::new(200, 300)).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_reset_single_and_all() {
        let mut store = store();
        store.register("s1");
        store.register("s2");
        store.append("s1", &ramp(0, 10));
        store.append("s2", &ramp(0, 10));

        store.reset(Some("s1"));
        assert!(store.slice("s1", TimeWindow::new(0, 100)).unwrap().is_empty());
        assert_eq!(store.slice("s2", TimeWindow::new(0, 100)).unwrap().len(), 10);

        store.reset(None);
        assert!(store.slice("s2", TimeWindow::new(0, 100)).unwrap().is_empty());
    }

    #[test]
    fn test_aggregates_reset_when_cleared() {
        let mut store = store();
        store.register("s1");
        store.append("s1", &ramp(0, 10));
        store.reset(Some("s1"));
        assert_eq!(store.aggregates("s1").unwrap(), Aggregates::default());
    }
}
