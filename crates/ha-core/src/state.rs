//! State type representing an entity's current state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EntityId;

/// Attribute map attached to a state
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// The state of an entity at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub entity_id: EntityId,

    /// The state value (e.g. "on", "21.5", "unavailable")
    pub state: String,

    #[serde(default)]
    pub attributes: Attributes,

    /// When the state value last changed
    pub last_changed: DateTime<Utc>,

    /// When the state or its attributes were last written
    pub last_updated: DateTime<Utc>,
}

impl State {
    pub fn new(entity_id: EntityId, state: impl Into<String>, attributes: Attributes) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: state.into(),
            attributes,
            last_changed: now,
            last_updated: now,
        }
    }

    /// Build the successor of this state, keeping `last_changed` when the value is unchanged
    pub fn updated(&self, state: impl Into<String>, attributes: Attributes) -> Self {
        let now = Utc::now();
        let state = state.into();
        Self {
            entity_id: self.entity_id.clone(),
            last_changed: if state == self.state {
                self.last_changed
            } else {
                now
            },
            state,
            attributes,
            last_updated: now,
        }
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps are bookkeeping, not identity
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}
