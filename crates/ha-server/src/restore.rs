//! Entity states carried across restarts
//!
//! On shutdown every current state is written to `.storage/core.restore_state`;
//! on startup those states are put back into the state store before any
//! integration is set up.

use chrono::{DateTime, Utc};
use ha_registries::{load_storable, Storable, Storage, StorageResult};
use ha_state_store::StateStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredState {
    pub state: ha_core::State,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RestoreStateData(pub Vec<StoredState>);

impl Storable for RestoreStateData {
    const KEY: &'static str = "core.restore_state";
    const VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 1;
}

/// Load saved states into `states`, returning how many were restored
pub async fn restore_states(storage: &Storage, states: &StateStore) -> StorageResult<usize> {
    let RestoreStateData(saved) = load_storable(storage).await?;
    let restored = saved
        .into_iter()
        .filter(|stored| states.restore(stored.state.clone()))
        .count();
    debug!(restored, "Restored entity states");
    Ok(restored)
}

/// Save every current state, returning how many were written
pub async fn dump_states(storage: &Storage, states: &StateStore) -> StorageResult<usize> {
    let now = Utc::now();
    let data = RestoreStateData(
        states
            .all()
            .into_iter()
            .map(|state| StoredState {
                state,
                last_seen: now,
            })
            .collect(),
    );
    storage.save(&data.to_storage_file()).await?;
    Ok(data.0.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_core::Attributes;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_states_survive_restart() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());

        let before = StateStore::new();
        let mut attrs = Attributes::new();
        attrs.insert("unit".into(), json!("C"));
        before.set("sensor.temp".parse().unwrap(), "21.5", attrs);
        assert_eq!(dump_states(&storage, &before).await.unwrap(), 1);

        let after = StateStore::new();
        assert_eq!(restore_states(&storage, &after).await.unwrap(), 1);
        let state = after.get("sensor.temp").unwrap();
        assert_eq!(state.state, "21.5");
        assert_eq!(state.attributes["unit"], json!("C"));
        assert_eq!(
            state.last_changed,
            before.get("sensor.temp").unwrap().last_changed
        );
    }

    #[tokio::test]
    async fn test_nothing_to_restore() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        assert_eq!(
            restore_states(&storage, &StateStore::new()).await.unwrap(),
            0
        );
    }
}
