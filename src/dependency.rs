// Gateway-to-sensor offline cascading
//
// A plain directed mapping from parent (gateway) to the set of children
// (sensors) it serves. The fan-out set is replaced wholesale on every
// registration rather than patched incrementally. When a parent goes
// offline, every current child is forced offline immediately - the parent
// signal is authoritative and does not wait for each child's own silence
// window. Children are never marked online by the parent returning; each
// must demonstrate activity on its own.

use crate::liveness::LivenessTracker;
use crate::types::EntityId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Cheap to clone; clones share the same mapping.
#[derive(Clone)]
pub struct DependencyResolver {
    dependencies: Arc<RwLock<HashMap<EntityId, HashSet<EntityId>>>>,
    tracker: LivenessTracker,
}

impl DependencyResolver {
    pub fn new(tracker: LivenessTracker) -> Self {
        Self {
            dependencies: Arc::new(RwLock::new(HashMap::new())),
            tracker,
        }
    }

    /// Store (or overwrite) the fan-out set for a parent
    pub fn register_dependency<I, S>(&self, parent_id: impl Into<EntityId>, child_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<EntityId>,
    {
        let parent = parent_id.into();
        let children: HashSet<EntityId> = child_ids.into_iter().map(Into::into).collect();
        log::debug!(
            "Registered {} dependent children for {}",
            children.len(),
            parent
        );
        self.dependencies.write().insert(parent, children);
    }

    /// Cascade a parent's offline transition to every current child,
    /// cancelling each child's individually armed timer.
    pub fn on_parent_offline(&self, parent_id: &str) {
        let children: Vec<EntityId> = match self.dependencies.read().get(parent_id) {
            Some(set) => set.iter().cloned().collect(),
            None => return,
        };

        log::info!(
            "Parent {} offline, cascading to {} children",
            parent_id,
            children.len()
        );
        for child in children {
            self.tracker.force_offline(&child);
        }
    }

    pub fn children_of(&self, parent_id: &str) -> Vec<EntityId> {
        self.dependencies
            .read()
            .get(parent_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}
