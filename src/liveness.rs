// Per-entity liveness tracking via silence timeouts
//
// Each tracked entity carries a single cancellable timer. Valid activity
// (strictly newer timestamp) cancels and re-arms the timer; when the timer
// expires without intervening activity the entity flips Offline and one
// event is emitted. Activity with an equal-or-older timestamp is counted
// and otherwise ignored - without that guard, replayed or re-delivered
// events perpetually reset the timer and offline detection never fires.

use crate::config::LivenessConfig;
use crate::types::{EntityId, LivenessEvent, LivenessState};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct LivenessRecord {
    last_seen_ms: i64,
    state: LivenessState,
    /// At most one live timer per entity; always cancel-before-arm
    timer: Option<CancellationToken>,
    /// Bumped on every arm/cancel so a raced expiry can tell it is stale
    timer_epoch: u64,
}

impl LivenessRecord {
    fn seeded() -> Self {
        Self {
            last_seen_ms: i64::MIN,
            state: LivenessState::Unknown,
            timer: None,
            timer_epoch: 0,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.timer_epoch += 1;
    }
}

type EventCallback = Box<dyn Fn(LivenessEvent) + Send + Sync>;

/// Silence-timeout state machine for all tracked entities.
///
/// Cheap to clone; clones share the same records and timers.
#[derive(Clone)]
pub struct LivenessTracker {
    records: Arc<Mutex<HashMap<EntityId, LivenessRecord>>>,
    timeout: Arc<RwLock<Duration>>,
    callback: Arc<RwLock<Option<EventCallback>>>,
    /// Duplicate/out-of-order activity calls, for diagnostics
    stale_activity: Arc<AtomicU64>,
}

impl LivenessTracker {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            timeout: Arc::new(RwLock::new(config.timeout())),
            callback: Arc::new(RwLock::new(None)),
            stale_activity: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set the callback invoked on every state transition
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(LivenessEvent) + Send + Sync + 'static,
    {
        *self.callback.write() = Some(Box::new(callback));
    }

    /// Seed records in Unknown state with no running timer. First activity
    /// promotes each to Online.
    pub fn initialize_tracking<I, S>(&self, entity_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<EntityId>,
    {
        let mut records = self.records.lock();
        for id in entity_ids {
            records.entry(id.into()).or_insert_with(LivenessRecord::seeded);
        }
    }

    /// Record activity for an entity. Returns true when the activity was
    /// accepted (strictly newer than the recorded last-seen timestamp).
    ///
    /// Rejected activity changes neither state nor timer.
    pub fn record_activity(&self, entity_id: &str, timestamp_ms: i64) -> bool {
        let previous_state;
        {
            let mut records = self.records.lock();
            let record = records
                .entry(entity_id.to_string())
                .or_insert_with(LivenessRecord::seeded);

            if timestamp_ms <= record.last_seen_ms {
                self.stale_activity.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Ignoring stale activity for {} (ts {} <= last seen {})",
                    entity_id,
                    timestamp_ms,
                    record.last_seen_ms
                );
                return false;
            }

            previous_state = record.state;
            record.last_seen_ms = timestamp_ms;
            record.state = LivenessState::Online;

            record.cancel_timer();
            record.timer = Some(self.arm_timer(entity_id.to_string(), record.timer_epoch));
        }

        if previous_state != LivenessState::Online {
            self.emit(entity_id, LivenessState::Online);
        }
        true
    }

    /// Force an entity offline immediately, cancelling its timer. Used for
    /// the gateway cascade; emits at most one event.
    pub fn force_offline(&self, entity_id: &str) {
        let transitioned;
        {
            let mut records = self.records.lock();
            let record = match records.get_mut(entity_id) {
                Some(r) => r,
                None => return,
            };

            record.cancel_timer();
            transitioned = record.state != LivenessState::Offline;
            record.state = LivenessState::Offline;
        }

        if transitioned {
            self.emit(entity_id, LivenessState::Offline);
        }
    }

    /// Change the silence window. Currently running timers are re-armed
    /// with the new duration; this is not an activity event, so last-seen
    /// timestamps are untouched.
    pub fn set_timeout_duration(&self, timeout: Duration) {
        *self.timeout.write() = timeout;

        let mut records = self.records.lock();
        for (id, record) in records.iter_mut() {
            if record.timer.is_some() {
                record.cancel_timer();
                record.timer = Some(self.arm_timer(id.clone(), record.timer_epoch));
            }
        }
        log::info!("Liveness timeout set to {:?}", timeout);
    }

    pub fn state(&self, entity_id: &str) -> Option<LivenessState> {
        self.records.lock().get(entity_id).map(|r| r.state)
    }

    pub fn last_seen_ms(&self, entity_id: &str) -> Option<i64> {
        self.records
            .lock()
            .get(entity_id)
            .map(|r| r.last_seen_ms)
            .filter(|&ts| ts != i64::MIN)
    }

    pub fn stale_activity_count(&self) -> u64 {
        self.stale_activity.load(Ordering::Relaxed)
    }

    /// Cancel every running timer. Records keep their states.
    pub fn shutdown(&self) {
        let mut records = self.records.lock();
        for record in records.values_mut() {
            record.cancel_timer();
        }
        log::info!("Liveness tracker shut down");
    }

    fn arm_timer(&self, entity_id: EntityId, epoch: u64) -> CancellationToken {
        let token = CancellationToken::new();
        let timer = token.clone();
        let tracker = self.clone();
        let timeout = *self.timeout.read();

        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    tracker.on_timer_expired(&entity_id, epoch);
                }
            }
        });

        token
    }

    fn on_timer_expired(&self, entity_id: &str, epoch: u64) {
        let transitioned;
        {
            let mut records = self.records.lock();
            let record = match records.get_mut(entity_id) {
                Some(r) => r,
                None => return,
            };

            // A re-arm may have raced the expiry between the sleep firing
            // and this lock; only the current timer may transition
            if record.timer_epoch != epoch || record.timer.is_none() {
                return;
            }

            record.timer = None;
            transitioned = record.state != LivenessState::Offline;
            record.state = LivenessState::Offline;
        }

        if transitioned {
            log::info!("Entity {} went offline (silence timeout)", entity_id);
            self.emit(entity_id, LivenessState::Offline);
        }
    }

    fn emit(&self, entity_id: &str, state: LivenessState) {
        // Callbacks may re-enter (offline cascades call force_offline from
        // inside the callback), so the recursive read is required
        if let Some(callback) = self.callback.read_recursive().as_ref() {
            callback(LivenessEvent {
                entity_id: entity_id.to_string(),
                state,
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
            });
        }
    }
}
