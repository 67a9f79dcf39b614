//! The registry of active filters: the single source of truth for what the
//! server should be sending us.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::dispatch::InboundBatch;
use crate::filter::{Filter, SubscriberId};

/// Delivery callback for one subscriber.
pub type Callback = Arc<dyn Fn(&InboundBatch) + Send + Sync>;

struct Entry {
    filter: Filter,
    callback: Callback,
}

/// Maps subscriber ids to their filter and delivery callback.
///
/// Keyed by a `BTreeMap` so [`FilterRegistry::filters`] is a deterministic
/// snapshot ordered by subscriber id.
#[derive(Default)]
pub struct FilterRegistry {
    entries: BTreeMap<SubscriberId, Entry>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a subscriber.
    ///
    /// Every filter already present is demoted to `preload = false` first, so
    /// the reconnect that follows does not replay history for widgets that are
    /// already subscribed. The new filter keeps whatever preload it carries.
    ///
    /// A filter without a routing id is stamped with a generated one.
    pub fn insert(&mut self, filter: Filter, callback: Callback) -> SubscriberId {
        let (id, filter) = match filter.subscriber_id() {
            Some(id) => (id, filter),
            None => {
                let id = SubscriberId::generate();
                let filter = filter.stamped(&id);
                (id, filter)
            }
        };
        self.demote_preload();
        debug!(subscriber = %id, preload = filter.preload(), "filter registered");
        self.entries.insert(id.clone(), Entry { filter, callback });
        id
    }

    /// Remove a subscriber. Returns `false` (and changes nothing) if it was not
    /// registered.
    pub fn remove(&mut self, id: &SubscriberId) -> bool {
        if self.entries.remove(id).is_none() {
            return false;
        }
        self.demote_preload();
        debug!(subscriber = %id, remaining = self.entries.len(), "filter removed");
        true
    }

    /// Current filter set, ordered by subscriber id.
    pub fn filters(&self) -> Vec<Filter> {
        self.entries.values().map(|e| e.filter.clone()).collect()
    }

    /// Clone of the callback registered under `id`.
    pub fn callback(&self, id: &SubscriberId) -> Option<Callback> {
        self.entries.get(id).map(|e| e.callback.clone())
    }

    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    // Replaces each filter with a demoted copy rather than editing in place.
    fn demote_preload(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.filter.preload() {
                entry.filter = entry.filter.without_preload();
            }
        }
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("subscribers", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
