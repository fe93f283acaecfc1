//! Live exchange table keyed by [`ConnectionId`].

use std::sync::Arc;

use dashmap::DashMap;

use crate::controller::{ConnectionId, ConnectionState, Controller};

/// The controller that owns an exchange together with its state.
pub(crate) struct Slot {
    pub(crate) controller: Arc<dyn Controller>,
    pub(crate) state: ConnectionState,
}

impl Slot {
    pub(crate) fn new(controller: Arc<dyn Controller>) -> Self {
        let state = controller.new_state();
        Self { controller, state }
    }
}

/// Concurrent map from exchange id to its slot.
///
/// A slot is taken out for the duration of a `handle` call and put back
/// afterwards, so no map guard is ever held while controller code runs.
#[derive(Default)]
pub(crate) struct ConnectionTable {
    slots: DashMap<ConnectionId, Slot>,
}

impl ConnectionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn take(&self, id: ConnectionId) -> Option<Slot> {
        self.slots.remove(&id).map(|(_, slot)| slot)
    }

    pub(crate) fn put(&self, id: ConnectionId, slot: Slot) {
        self.slots.insert(id, slot);
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: ConnectionId) -> bool {
        self.slots.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Removes and returns every slot.
    pub(crate) fn drain(&self) -> Vec<(ConnectionId, Slot)> {
        let ids: Vec<ConnectionId> = self.slots.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.slots.remove(&id))
            .collect()
    }
}
