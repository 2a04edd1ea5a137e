//! Config Entry types
//!
//! A ConfigEntry represents one configured instance of an integration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state_machine::InvalidTransition;

/// Config entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    /// Not set up (initial state, and the state after a clean unload)
    #[default]
    NotLoaded,
    SetupInProgress,
    Loaded,
    /// Setup failed permanently until the entry is reloaded
    SetupError,
    /// Setup failed transiently; a retry is scheduled
    SetupRetry,
    UnloadInProgress,
    /// The integration refused to unload (terminal)
    FailedUnload,
}

impl ConfigEntryState {
    /// States from which an unload or reload may start
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConfigEntryState::NotLoaded
                | ConfigEntryState::Loaded
                | ConfigEntryState::SetupError
                | ConfigEntryState::SetupRetry
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    /// Created through the UI config flow
    #[default]
    User,
    Import,
    Reconfigure,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryDisabledBy {
    User,
}

/// A configuration entry for an integration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Unique identifier (ULID)
    pub entry_id: String,

    /// Integration domain (e.g. "azure_iot_hub")
    pub domain: String,

    pub title: String,

    /// Data captured by the config flow
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,

    /// Data captured by the options flow
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_version")]
    pub minor_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(default)]
    pub source: ConfigEntrySource,

    /// Current lifecycle state (not persisted)
    #[serde(skip, default)]
    pub state: ConfigEntryState,

    /// Why the entry is in a failed state (not persisted)
    #[serde(skip, default)]
    pub reason: Option<String>,

    /// Consecutive setup retries (not persisted)
    #[serde(skip, default)]
    pub tries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<ConfigEntryDisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl ConfigEntry {
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: HashMap::new(),
            options: HashMap::new(),
            version: 1,
            minor_version: 1,
            unique_id: None,
            source: ConfigEntrySource::User,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            tries: 0,
            disabled_by: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_options(mut self, options: HashMap<String, serde_json::Value>) -> Self {
        self.options = options;
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_source(mut self, source: ConfigEntrySource) -> Self {
        self.source = source;
        self
    }

    pub fn with_version(mut self, version: u32, minor_version: u32) -> Self {
        self.version = version;
        self.minor_version = minor_version;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    /// Move to `new_state` if the lifecycle allows it
    ///
    /// The retry counter survives only `SetupRetry` and `SetupInProgress`.
    pub fn try_set_state(
        &mut self,
        new_state: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.state.try_transition(new_state)?;
        self.state = new_state;
        self.reason = reason;

        if !matches!(
            new_state,
            ConfigEntryState::SetupRetry | ConfigEntryState::SetupInProgress
        ) {
            self.tries = 0;
        }
        Ok(())
    }
}

/// Partial update applied by [`crate::ConfigEntries::update`]
#[derive(Debug, Default)]
pub struct ConfigEntryUpdate {
    pub title: Option<String>,
    pub data: Option<HashMap<String, serde_json::Value>>,
    pub options: Option<HashMap<String, serde_json::Value>>,
    pub unique_id: Option<Option<String>>,
}

impl ConfigEntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn options(mut self, options: HashMap<String, serde_json::Value>) -> Self {
        self.options = Some(options);
        self
    }

    /// Whether applying this update to `entry` would change anything
    pub fn changes(&self, entry: &ConfigEntry) -> bool {
        self.title.as_ref().is_some_and(|t| *t != entry.title)
            || self.data.as_ref().is_some_and(|d| *d != entry.data)
            || self.options.as_ref().is_some_and(|o| *o != entry.options)
            || self
                .unique_id
                .as_ref()
                .is_some_and(|u| *u != entry.unique_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_entry_new() {
        let entry = ConfigEntry::new("azure_iot_hub", "IoT Hub Device");
        assert_eq!(entry.domain, "azure_iot_hub");
        assert_eq!(entry.state, ConfigEntryState::NotLoaded);
        assert_eq!(entry.version, 1);
        assert!(!entry.entry_id.is_empty());
    }

    #[test]
    fn test_runtime_fields_not_persisted() {
        let mut entry = ConfigEntry::new("demo", "Demo").with_unique_id("u1");
        entry.try_set_state(ConfigEntryState::SetupInProgress, None).unwrap();
        entry.tries = 3;

        let json = serde_json::to_string(&entry).unwrap();
        let parsed: ConfigEntry = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.unique_id.as_deref(), Some("u1"));
        assert_eq!(parsed.state, ConfigEntryState::NotLoaded);
        assert_eq!(parsed.tries, 0);
    }

    #[test]
    fn test_tries_reset_on_loaded() {
        let mut entry = ConfigEntry::new("demo", "Demo");
        entry.try_set_state(ConfigEntryState::SetupInProgress, None).unwrap();
        entry.try_set_state(ConfigEntryState::SetupRetry, None).unwrap();
        entry.tries = 2;
        entry.try_set_state(ConfigEntryState::SetupInProgress, None).unwrap();
        assert_eq!(entry.tries, 2);
        entry.try_set_state(ConfigEntryState::Loaded, None).unwrap();
        assert_eq!(entry.tries, 0);
    }

    #[test]
    fn test_update_changes() {
        let mut options = HashMap::new();
        options.insert("monitored_entities".to_string(), json!(["sensor.a"]));
        let entry = ConfigEntry::new("demo", "Demo").with_options(options.clone());

        assert!(!ConfigEntryUpdate::new().options(options).changes(&entry));
        assert!(ConfigEntryUpdate::new().title("Other").changes(&entry));
        assert!(!ConfigEntryUpdate::new().changes(&entry));
    }
}
