//! Entity state storage with domain indexing
//!
//! The [`StateStore`] holds the current [`State`] of every entity. Integrations
//! read from it (e.g. telemetry collection); entity platforms write to it.

use dashmap::DashMap;
use ha_core::{Attributes, EntityId, State};
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// Current state of all entities, safe for concurrent readers and writers
#[derive(Default)]
pub struct StateStore {
    /// States keyed by the entity_id string
    states: DashMap<String, State>,
    /// entity_id strings grouped by domain
    domain_index: DashMap<String, Vec<String>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the state of an entity, returning the stored state
    ///
    /// `last_changed` only moves when the state value differs from the
    /// previous one.
    #[instrument(skip(self, state, attributes), fields(entity_id = %entity_id))]
    pub fn set(
        &self,
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: Attributes,
    ) -> State {
        let key = entity_id.to_string();

        let new_state = match self.states.get(&key) {
            Some(existing) => existing.updated(state, attributes),
            None => {
                self.domain_index
                    .entry(entity_id.domain().to_string())
                    .or_default()
                    .push(key.clone());
                State::new(entity_id, state, attributes)
            }
        };

        debug!(state = %new_state.state, "Setting entity state");
        self.states.insert(key, new_state.clone());
        new_state
    }

    /// Put back a previously saved state as-is, timestamps included
    ///
    /// Entities that already have a live state keep it.
    pub fn restore(&self, state: State) -> bool {
        let key = state.entity_id.to_string();
        if self.states.contains_key(&key) {
            return false;
        }
        self.domain_index
            .entry(state.entity_id.domain().to_string())
            .or_default()
            .push(key.clone());
        trace!(entity_id = %key, "Restoring entity state");
        self.states.insert(key, state);
        true
    }

    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    /// All entity_ids of a domain, in insertion order
    pub fn entity_ids(&self, domain: &str) -> Vec<String> {
        self.domain_index
            .get(domain)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    pub fn all_entity_ids(&self) -> Vec<String> {
        self.states.iter().map(|r| r.key().clone()).collect()
    }

    pub fn all(&self) -> Vec<State> {
        self.states.iter().map(|r| r.value().clone()).collect()
    }

    #[instrument(skip(self), fields(entity_id = %entity_id))]
    pub fn remove(&self, entity_id: &EntityId) -> Option<State> {
        let key = entity_id.to_string();
        let removed = self.states.remove(&key).map(|(_, s)| s);

        if removed.is_some() {
            trace!("Removing entity state");
            if let Some(mut ids) = self.domain_index.get_mut(entity_id.domain()) {
                ids.retain(|id| id != &key);
            }
        }

        removed
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

pub type SharedStateStore = Arc<StateStore>;
