//! Config Entries Manager
//!
//! Owns every config entry and drives its lifecycle: setup through the
//! registered [`IntegrationHandler`], scheduled retries, unload, reload,
//! update listeners and on-unload callbacks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use ha_core::Platform;
use ha_registries::{load_storable, Storable, Storage, StorageResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::entry::{ConfigEntry, ConfigEntryState, ConfigEntryUpdate};
use crate::flow::FlowResult;
use crate::handler::{
    IntegrationHandler, ListenerId, PlatformRegistrar, SetupError, UnloadCallback, UpdateListener,
};
use crate::state_machine::{calculate_retry_delay, InvalidTransition};

pub const STORAGE_KEY: &str = "core.config_entries";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error(transparent)]
    InvalidState(#[from] InvalidTransition),

    #[error("Cannot unload entry in state {0:?}")]
    CannotUnload(ConfigEntryState),

    #[error("Setup failed: {0}")]
    SetupFailed(String),

    #[error("Setup not ready: {0}")]
    NotReady(String),

    #[error("Unload failed for entry {0}")]
    UnloadFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] ha_registries::StorageError),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    pub entries: Vec<ConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Config Entries Manager
///
/// Setup, unload and reload of one entry are serialized by a per-entry
/// lock. Lifecycle methods take `self: &Arc<Self>` so handlers and retry
/// tasks can call back into the manager.
pub struct ConfigEntries {
    storage: Arc<Storage>,

    /// entry_id -> ConfigEntry
    entries: DashMap<String, ConfigEntry>,
    /// domain -> entry_ids
    by_domain: DashMap<String, HashSet<String>>,
    /// (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,

    entry_locks: DashMap<String, Arc<Mutex<()>>>,
    handlers: DashMap<String, Arc<dyn IntegrationHandler>>,

    update_listeners: DashMap<String, Vec<(u64, UpdateListener)>>,
    next_listener_id: AtomicU64,
    on_unload: DashMap<String, Vec<UnloadCallback>>,

    /// entry_id -> platforms forwarded for it
    platforms: DashMap<String, Vec<Platform>>,
    /// entry_id -> pending setup retry
    retries: DashMap<String, JoinHandle<()>>,
}

impl ConfigEntries {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            entry_locks: DashMap::new(),
            handlers: DashMap::new(),
            update_listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(1),
            on_unload: DashMap::new(),
            platforms: DashMap::new(),
            retries: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        let data: ConfigEntriesData = load_storable(&self.storage).await?;
        info!("Loading {} config entries from storage", data.entries.len());

        for entry in data.entries {
            self.index_entry(entry);
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let data = ConfigEntriesData {
            entries: self.iter().collect(),
        };
        self.storage.save(&data.to_storage_file()).await?;
        debug!("Saved {} config entries to storage", data.entries.len());
        Ok(())
    }

    fn index_entry(&self, entry: ConfigEntry) {
        let entry_id = entry.entry_id.clone();

        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry_id.clone());

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .insert((entry.domain.clone(), unique_id.clone()), entry_id.clone());
        }

        self.entries.insert(entry_id, entry);
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }
        self.entries.remove(&entry.entry_id);
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        self.by_domain
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        let entry_id = self
            .by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))?
            .clone();
        self.get(&entry_id)
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ConfigEntry> + '_ {
        self.entries.iter().map(|r| r.value().clone())
    }

    /// Add a new entry and persist it. Does not set it up.
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            if self.get_by_unique_id(&entry.domain, unique_id).is_some() {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        self.index_entry(entry.clone());
        self.save().await?;

        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );
        Ok(entry)
    }

    /// Apply `update`, persist, and notify update listeners if anything changed
    pub async fn update(
        &self,
        entry_id: &str,
        update: ConfigEntryUpdate,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let current = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if !update.changes(&current) {
            return Ok(current);
        }

        if let Some(Some(ref unique_id)) = update.unique_id {
            if let Some(other) = self.get_by_unique_id(&current.domain, unique_id) {
                if other.entry_id != entry_id {
                    return Err(ConfigEntriesError::AlreadyExists {
                        domain: current.domain,
                        unique_id: unique_id.clone(),
                    });
                }
            }
        }

        let updated = {
            let mut entry = self
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

            if let Some(title) = update.title {
                entry.title = title;
            }
            if let Some(data) = update.data {
                entry.data = data;
            }
            if let Some(options) = update.options {
                entry.options = options;
            }
            if let Some(unique_id) = update.unique_id {
                if let Some(old) = entry.unique_id.take() {
                    self.by_unique_id.remove(&(entry.domain.clone(), old));
                }
                if let Some(ref new) = unique_id {
                    self.by_unique_id
                        .insert((entry.domain.clone(), new.clone()), entry_id.to_string());
                }
                entry.unique_id = unique_id;
            }
            entry.modified_at = Utc::now();
            entry.clone()
        };

        self.save().await?;
        debug!("Updated config entry: {}", entry_id);

        self.fire_update_listeners(&updated).await;
        Ok(updated)
    }

    pub async fn update_options(
        &self,
        entry_id: &str,
        options: HashMap<String, serde_json::Value>,
    ) -> ConfigEntriesResult<ConfigEntry> {
        self.update(entry_id, ConfigEntryUpdate::new().options(options))
            .await
    }

    /// Unload (if needed) and delete an entry
    pub async fn remove(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let lock = self.entry_lock(entry_id);
        let _guard = lock.lock().await;

        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if entry.state.is_recoverable() {
            self.unload_locked(entry_id).await?;
        }

        self.cancel_retry(entry_id);
        self.unindex_entry(&entry);
        self.update_listeners.remove(entry_id);
        self.on_unload.remove(entry_id);
        self.platforms.remove(entry_id);
        self.save().await?;

        info!(
            "Removed config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );
        Ok(entry)
    }

    pub fn register_handler(&self, domain: &str, handler: Arc<dyn IntegrationHandler>) {
        self.handlers.insert(domain.to_string(), handler);
        debug!("Registered integration handler for domain: {}", domain);
    }

    fn handler(&self, domain: &str) -> Option<Arc<dyn IntegrationHandler>> {
        self.handlers.get(domain).map(|h| Arc::clone(h.value()))
    }

    fn entry_lock(&self, entry_id: &str) -> Arc<Mutex<()>> {
        self.entry_locks
            .entry(entry_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn transition(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        entry.try_set_state(state, reason)?;
        debug!("Entry {} state changed to {:?}", entry_id, state);
        Ok(entry.clone())
    }

    pub async fn setup(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<()> {
        let lock = self.entry_lock(entry_id);
        let _guard = lock.lock().await;
        self.setup_locked(entry_id).await
    }

    async fn setup_locked(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<()> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if entry.is_disabled() {
            debug!("Skipping setup for disabled entry: {}", entry_id);
            return Ok(());
        }

        let entry = self.transition(entry_id, ConfigEntryState::SetupInProgress, None)?;

        let Some(handler) = self.handler(&entry.domain) else {
            debug!(
                "No integration handler for domain {}, marking as loaded",
                entry.domain
            );
            self.transition(entry_id, ConfigEntryState::Loaded, None)?;
            return Ok(());
        };

        match handler.setup_entry(self, &entry).await {
            Ok(()) => {
                self.transition(entry_id, ConfigEntryState::Loaded, None)?;
                info!("Setup completed for entry: {} ({})", entry.title, entry_id);
                Ok(())
            }
            Err(SetupError::NotReady(reason)) => {
                let tries = self.mark_retry(entry_id, &reason)?;
                let delay = calculate_retry_delay(tries);
                warn!(
                    "Config entry {} for {} not ready yet: {}; retrying in {:?}",
                    entry.title, entry.domain, reason, delay
                );
                self.schedule_retry(entry_id, delay);
                Err(ConfigEntriesError::NotReady(reason))
            }
            Err(SetupError::Failed(reason)) => {
                error!("Setup failed for entry {}: {}", entry_id, reason);
                self.transition(entry_id, ConfigEntryState::SetupError, Some(reason.clone()))?;
                Err(ConfigEntriesError::SetupFailed(reason))
            }
        }
    }

    fn mark_retry(&self, entry_id: &str, reason: &str) -> ConfigEntriesResult<u32> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        entry.try_set_state(ConfigEntryState::SetupRetry, Some(reason.to_string()))?;
        entry.tries += 1;
        Ok(entry.tries)
    }

    fn schedule_retry(self: &Arc<Self>, entry_id: &str, delay: Duration) {
        let entries = Arc::clone(self);
        let id = entry_id.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Drop our own handle so setup below is not aborted as a stale retry
            entries.retries.remove(&id);
            if let Err(err) = entries.setup(&id).await {
                debug!("Retried setup of entry {} did not complete: {}", id, err);
            }
        });

        if let Some(previous) = self.retries.insert(entry_id.to_string(), task) {
            previous.abort();
        }
    }

    fn cancel_retry(&self, entry_id: &str) {
        if let Some((_, task)) = self.retries.remove(entry_id) {
            task.abort();
            debug!("Cancelled pending setup retry for entry {}", entry_id);
        }
    }

    pub fn has_pending_retry(&self, entry_id: &str) -> bool {
        self.retries.contains_key(entry_id)
    }

    pub async fn unload(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<()> {
        let lock = self.entry_lock(entry_id);
        let _guard = lock.lock().await;
        self.unload_locked(entry_id).await
    }

    async fn unload_locked(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<()> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.cancel_retry(entry_id);

        match entry.state {
            ConfigEntryState::NotLoaded => return Ok(()),
            state if !state.is_recoverable() => {
                return Err(ConfigEntriesError::CannotUnload(state));
            }
            _ => {}
        }

        let was_loaded = entry.is_loaded();
        let entry = self.transition(entry_id, ConfigEntryState::UnloadInProgress, None)?;

        // A retrying or failed entry never finished setup, so only loaded
        // entries go back through the integration.
        let unloaded = match self.handler(&entry.domain) {
            Some(handler) if was_loaded => handler.unload_entry(self, &entry).await,
            _ => true,
        };

        if !unloaded {
            error!("Integration {} refused to unload entry {}", entry.domain, entry_id);
            self.transition(
                entry_id,
                ConfigEntryState::FailedUnload,
                Some("unload refused by integration".to_string()),
            )?;
            return Err(ConfigEntriesError::UnloadFailed(entry_id.to_string()));
        }

        self.run_on_unload(entry_id);
        self.transition(entry_id, ConfigEntryState::NotLoaded, None)?;
        info!("Unloaded entry: {} ({})", entry.title, entry_id);
        Ok(())
    }

    /// Unload then set up again, holding the entry lock throughout
    pub async fn reload(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<()> {
        let lock = self.entry_lock(entry_id);
        let _guard = lock.lock().await;

        info!("Reloading config entry {}", entry_id);
        self.unload_locked(entry_id).await?;
        self.setup_locked(entry_id).await
    }

    /// Set up every entry, returning per-entry results
    pub async fn setup_all(self: &Arc<Self>) -> Vec<(String, ConfigEntriesResult<()>)> {
        let mut results = Vec::new();
        for entry_id in self.entry_ids() {
            let result = self.setup(&entry_id).await;
            results.push((entry_id, result));
        }
        results
    }

    /// Unload every loaded entry, logging failures
    pub async fn unload_all(self: &Arc<Self>) {
        for entry_id in self.entry_ids() {
            if let Err(err) = self.unload(&entry_id).await {
                warn!("Failed to unload entry {}: {}", entry_id, err);
            }
        }
    }

    pub fn add_update_listener(&self, entry_id: &str, listener: UpdateListener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.update_listeners
            .entry(entry_id.to_string())
            .or_default()
            .push((id, listener));
        debug!("Added update listener {} for entry {}", id, entry_id);
        ListenerId {
            entry_id: entry_id.to_string(),
            id,
        }
    }

    pub fn remove_update_listener(&self, listener: &ListenerId) -> bool {
        let Some(mut listeners) = self.update_listeners.get_mut(&listener.entry_id) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != listener.id);
        before != listeners.len()
    }

    pub fn has_update_listeners(&self, entry_id: &str) -> bool {
        self.update_listener_count(entry_id) > 0
    }

    pub fn update_listener_count(&self, entry_id: &str) -> usize {
        self.update_listeners
            .get(entry_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Register a callback to run when the entry next unloads
    pub fn on_unload(&self, entry_id: &str, callback: UnloadCallback) {
        self.on_unload
            .entry(entry_id.to_string())
            .or_default()
            .push(callback);
    }

    fn run_on_unload(&self, entry_id: &str) {
        if let Some((_, callbacks)) = self.on_unload.remove(entry_id) {
            for callback in callbacks {
                callback(self);
            }
        }
    }

    async fn fire_update_listeners(&self, entry: &ConfigEntry) {
        // Clone out so listeners may add or remove listeners themselves
        let listeners: Vec<UpdateListener> = self
            .update_listeners
            .get(&entry.entry_id)
            .map(|l| l.iter().map(|(_, f)| Arc::clone(f)).collect())
            .unwrap_or_default();

        for listener in listeners {
            listener(entry.clone()).await;
        }
    }

    /// Persist and set up the entry produced by a finished config flow
    ///
    /// Returns `None` when the flow did not create an entry. A setup failure
    /// leaves the entry in place in its failed state. A unique id already
    /// taken in the domain fails with `AlreadyExists` and adds nothing.
    pub async fn finish_flow(
        self: &Arc<Self>,
        result: FlowResult,
    ) -> ConfigEntriesResult<Option<ConfigEntry>> {
        if !result.is_create_entry() {
            return Ok(None);
        }

        let mut entry = ConfigEntry::new(result.handler, result.title.unwrap_or_default())
            .with_data(result.data.unwrap_or_default());
        if let Some(unique_id) = result.unique_id {
            entry = entry.with_unique_id(unique_id);
        }
        let entry = self.add(entry).await?;

        if let Err(err) = self.setup(&entry.entry_id).await {
            warn!("Setup of new entry {} failed: {}", entry.entry_id, err);
        }
        Ok(self.get(&entry.entry_id))
    }

    /// Replace the entry's options with the result of a finished options flow
    pub async fn finish_options_flow(
        &self,
        entry_id: &str,
        result: FlowResult,
    ) -> ConfigEntriesResult<Option<ConfigEntry>> {
        if !result.is_create_entry() {
            return Ok(None);
        }
        self.update_options(entry_id, result.data.unwrap_or_default())
            .await
            .map(Some)
    }

    pub fn loaded_platforms(&self, entry_id: &str) -> Vec<Platform> {
        self.platforms
            .get(entry_id)
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PlatformRegistrar for ConfigEntries {
    async fn forward_entry_setups(
        &self,
        entry: &ConfigEntry,
        platforms: &[Platform],
    ) -> ConfigEntriesResult<()> {
        if !self.entries.contains_key(&entry.entry_id) {
            return Err(ConfigEntriesError::NotFound(entry.entry_id.clone()));
        }

        let mut loaded = self.platforms.entry(entry.entry_id.clone()).or_default();
        for platform in platforms {
            if !loaded.contains(platform) {
                loaded.push(*platform);
                debug!(
                    "Forwarded {} platform setup for entry {}",
                    platform, entry.entry_id
                );
            }
        }
        Ok(())
    }

    async fn unload_platforms(&self, entry: &ConfigEntry, platforms: &[Platform]) -> bool {
        let Some(mut loaded) = self.platforms.get_mut(&entry.entry_id) else {
            return platforms.is_empty();
        };

        let mut all_unloaded = true;
        for platform in platforms {
            match loaded.iter().position(|p| p == platform) {
                Some(pos) => {
                    loaded.remove(pos);
                }
                None => {
                    warn!(
                        "Platform {} was not loaded for entry {}",
                        platform, entry.entry_id
                    );
                    all_unloaded = false;
                }
            }
        }
        all_unloaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ConfigEntrySource;
    use crate::flow::FlowResult;
    use futures::FutureExt;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use tempfile::TempDir;

    fn create_test_manager() -> (TempDir, Arc<ConfigEntries>) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));
        let manager = Arc::new(ConfigEntries::new(storage));
        (temp_dir, manager)
    }

    /// Handler that replays scripted setup results, succeeding once exhausted
    #[derive(Default)]
    struct ScriptedHandler {
        setup_results: std::sync::Mutex<VecDeque<Result<(), SetupError>>>,
        refuse_unload: bool,
        setups: AtomicUsize,
        unloads: AtomicUsize,
    }

    impl ScriptedHandler {
        fn with_results(results: Vec<Result<(), SetupError>>) -> Self {
            Self {
                setup_results: std::sync::Mutex::new(results.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl IntegrationHandler for ScriptedHandler {
        async fn setup_entry(
            &self,
            _entries: &Arc<ConfigEntries>,
            _entry: &ConfigEntry,
        ) -> Result<(), SetupError> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            self.setup_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn unload_entry(&self, _entries: &Arc<ConfigEntries>, _entry: &ConfigEntry) -> bool {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            !self.refuse_unload
        }
    }

    fn state_of(manager: &ConfigEntries, entry_id: &str) -> ConfigEntryState {
        manager.get(entry_id).unwrap().state
    }

    #[tokio::test]
    async fn test_add_entry() {
        let (_dir, manager) = create_test_manager();

        let entry = ConfigEntry::new("azure_iot_hub", "IoT Hub Device")
            .with_unique_id("device-001")
            .with_source(ConfigEntrySource::User);

        let added = manager.add(entry).await.unwrap();
        assert_eq!(added.domain, "azure_iot_hub");
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.get_by_domain("azure_iot_hub").len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_unique_id_rejected() {
        let (_dir, manager) = create_test_manager();

        manager
            .add(ConfigEntry::new("demo", "One").with_unique_id("same-id"))
            .await
            .unwrap();
        let result = manager
            .add(ConfigEntry::new("demo", "Two").with_unique_id("same-id"))
            .await;

        assert!(matches!(
            result,
            Err(ConfigEntriesError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let (_dir, manager) = create_test_manager();
        let entry = manager.add(ConfigEntry::new("demo", "Old")).await.unwrap();

        let updated = manager
            .update(&entry.entry_id, ConfigEntryUpdate::new().title("New"))
            .await
            .unwrap();
        assert_eq!(updated.title, "New");

        manager.remove(&entry.entry_id).await.unwrap();
        assert!(manager.is_empty());
        assert!(matches!(
            manager.remove(&entry.entry_id).await,
            Err(ConfigEntriesError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_setup_without_handler_marks_loaded() {
        let (_dir, manager) = create_test_manager();
        let entry = manager.add(ConfigEntry::new("demo", "Test")).await.unwrap();

        manager.setup(&entry.entry_id).await.unwrap();
        assert_eq!(state_of(&manager, &entry.entry_id), ConfigEntryState::Loaded);

        manager.unload(&entry.entry_id).await.unwrap();
        assert_eq!(state_of(&manager, &entry.entry_id), ConfigEntryState::NotLoaded);
    }

    #[tokio::test]
    async fn test_setup_twice_is_rejected() {
        let (_dir, manager) = create_test_manager();
        let entry = manager.add(ConfigEntry::new("demo", "Test")).await.unwrap();

        manager.setup(&entry.entry_id).await.unwrap();
        assert!(matches!(
            manager.setup(&entry.entry_id).await,
            Err(ConfigEntriesError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_setup_failure() {
        let (_dir, manager) = create_test_manager();
        manager.register_handler(
            "demo",
            Arc::new(ScriptedHandler::with_results(vec![Err(SetupError::Failed(
                "bad config".into(),
            ))])),
        );

        let entry = manager.add(ConfigEntry::new("demo", "Test")).await.unwrap();
        let result = manager.setup(&entry.entry_id).await;

        assert!(matches!(result, Err(ConfigEntriesError::SetupFailed(_))));
        let stored = manager.get(&entry.entry_id).unwrap();
        assert_eq!(stored.state, ConfigEntryState::SetupError);
        assert_eq!(stored.reason.as_deref(), Some("bad config"));
        assert!(!manager.has_pending_retry(&entry.entry_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_schedules_retry() {
        let (_dir, manager) = create_test_manager();
        let handler = Arc::new(ScriptedHandler::with_results(vec![Err(
            SetupError::NotReady("hub offline".into()),
        )]));
        manager.register_handler("demo", handler.clone());

        let entry = manager.add(ConfigEntry::new("demo", "Test")).await.unwrap();
        let result = manager.setup(&entry.entry_id).await;

        assert!(matches!(result, Err(ConfigEntriesError::NotReady(_))));
        let stored = manager.get(&entry.entry_id).unwrap();
        assert_eq!(stored.state, ConfigEntryState::SetupRetry);
        assert_eq!(stored.tries, 1);
        assert!(manager.has_pending_retry(&entry.entry_id));

        // First retry fires after 10s plus jitter
        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        assert_eq!(state_of(&manager, &entry.entry_id), ConfigEntryState::Loaded);
        assert_eq!(handler.setups.load(Ordering::SeqCst), 2);
        assert!(!manager.has_pending_retry(&entry.entry_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_cancels_pending_retry() {
        let (_dir, manager) = create_test_manager();
        let handler = Arc::new(ScriptedHandler::with_results(vec![Err(
            SetupError::NotReady("offline".into()),
        )]));
        manager.register_handler("demo", handler.clone());

        let entry = manager.add(ConfigEntry::new("demo", "Test")).await.unwrap();
        let _ = manager.setup(&entry.entry_id).await;

        manager.unload(&entry.entry_id).await.unwrap();
        assert_eq!(state_of(&manager, &entry.entry_id), ConfigEntryState::NotLoaded);
        assert!(!manager.has_pending_retry(&entry.entry_id));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(handler.setups.load(Ordering::SeqCst), 1);
        // Never loaded, so the integration was not asked to unload
        assert_eq!(handler.unloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refused_unload_is_terminal() {
        let (_dir, manager) = create_test_manager();
        manager.register_handler(
            "demo",
            Arc::new(ScriptedHandler {
                refuse_unload: true,
                ..Default::default()
            }),
        );

        let entry = manager.add(ConfigEntry::new("demo", "Test")).await.unwrap();
        manager.setup(&entry.entry_id).await.unwrap();

        assert!(matches!(
            manager.unload(&entry.entry_id).await,
            Err(ConfigEntriesError::UnloadFailed(_))
        ));
        assert_eq!(
            state_of(&manager, &entry.entry_id),
            ConfigEntryState::FailedUnload
        );
        assert!(matches!(
            manager.reload(&entry.entry_id).await,
            Err(ConfigEntriesError::CannotUnload(ConfigEntryState::FailedUnload))
        ));
    }

    #[tokio::test]
    async fn test_reload_runs_unload_then_setup() {
        let (_dir, manager) = create_test_manager();
        let handler = Arc::new(ScriptedHandler::default());
        manager.register_handler("demo", handler.clone());

        let entry = manager.add(ConfigEntry::new("demo", "Test")).await.unwrap();
        manager.setup(&entry.entry_id).await.unwrap();
        manager.reload(&entry.entry_id).await.unwrap();

        assert_eq!(handler.setups.load(Ordering::SeqCst), 2);
        assert_eq!(handler.unloads.load(Ordering::SeqCst), 1);
        assert_eq!(state_of(&manager, &entry.entry_id), ConfigEntryState::Loaded);
    }

    #[tokio::test]
    async fn test_update_listeners_fire_on_change_only() {
        let (_dir, manager) = create_test_manager();
        let entry = manager.add(ConfigEntry::new("demo", "Test")).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        manager.add_update_listener(
            &entry.entry_id,
            Arc::new(move |updated: ConfigEntry| {
                let counter = Arc::clone(&counter);
                async move {
                    assert_eq!(updated.options["monitored_entities"], json!(["light.a"]));
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }),
        );

        let mut options = HashMap::new();
        options.insert("monitored_entities".to_string(), json!(["light.a"]));
        manager
            .update_options(&entry.entry_id, options.clone())
            .await
            .unwrap();
        manager
            .update_options(&entry.entry_id, options)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_unload_removes_listener() {
        let (_dir, manager) = create_test_manager();
        let entry = manager.add(ConfigEntry::new("demo", "Test")).await.unwrap();
        manager.setup(&entry.entry_id).await.unwrap();

        let listener = manager.add_update_listener(
            &entry.entry_id,
            Arc::new(|_entry: ConfigEntry| async {}.boxed()),
        );
        manager.on_unload(
            &entry.entry_id,
            Box::new(move |entries: &ConfigEntries| {
                entries.remove_update_listener(&listener);
            }),
        );
        assert!(manager.has_update_listeners(&entry.entry_id));

        manager.unload(&entry.entry_id).await.unwrap();
        assert!(!manager.has_update_listeners(&entry.entry_id));
    }

    #[tokio::test]
    async fn test_finish_flow_creates_and_sets_up() {
        let (_dir, manager) = create_test_manager();

        let abort = FlowResult::abort("demo", "already_configured");
        assert!(manager.finish_flow(abort).await.unwrap().is_none());
        assert!(manager.is_empty());

        let mut data = HashMap::new();
        data.insert("polling_interval_minutes".to_string(), json!(5));
        let created = manager
            .finish_flow(FlowResult::create_entry("demo", "Demo Device", data))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(created.title, "Demo Device");
        assert_eq!(created.data["polling_interval_minutes"], json!(5));
        assert!(created.is_loaded());
    }

    #[tokio::test]
    async fn test_finish_flow_rejects_taken_unique_id() {
        let (_dir, manager) = create_test_manager();

        let first = manager
            .finish_flow(
                FlowResult::create_entry("demo", "One", HashMap::new()).with_unique_id("dev1"),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.unique_id.as_deref(), Some("dev1"));
        assert_eq!(
            manager.get_by_unique_id("demo", "dev1").unwrap().entry_id,
            first.entry_id
        );

        let second = manager
            .finish_flow(
                FlowResult::create_entry("demo", "Two", HashMap::new()).with_unique_id("dev1"),
            )
            .await;
        assert!(matches!(second, Err(ConfigEntriesError::AlreadyExists { .. })));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_finish_options_flow_replaces_options() {
        let (_dir, manager) = create_test_manager();
        let mut old = HashMap::new();
        old.insert("stale".to_string(), json!(true));
        let entry = manager
            .add(ConfigEntry::new("demo", "Test").with_options(old))
            .await
            .unwrap();

        let mut data = HashMap::new();
        data.insert("monitored_entities".to_string(), json!(["sensor.temp"]));
        let updated = manager
            .finish_options_flow(&entry.entry_id, FlowResult::create_entry("demo", "", data))
            .await
            .unwrap()
            .unwrap();

        assert!(!updated.options.contains_key("stale"));
        assert_eq!(updated.options["monitored_entities"], json!(["sensor.temp"]));
    }

    #[tokio::test]
    async fn test_platform_forwarding() {
        let (_dir, manager) = create_test_manager();
        let entry = manager.add(ConfigEntry::new("demo", "Test")).await.unwrap();

        manager
            .forward_entry_setups(&entry, &[Platform::Light])
            .await
            .unwrap();
        manager
            .forward_entry_setups(&entry, &[Platform::Light])
            .await
            .unwrap();
        assert_eq!(manager.loaded_platforms(&entry.entry_id), vec![Platform::Light]);

        assert!(manager.unload_platforms(&entry, &[Platform::Light]).await);
        assert!(!manager.unload_platforms(&entry, &[Platform::Light]).await);
        assert!(manager.loaded_platforms(&entry.entry_id).is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));

        {
            let manager = ConfigEntries::new(storage.clone());
            manager
                .add(
                    ConfigEntry::new("demo", "Test")
                        .with_unique_id("test-123")
                        .with_source(ConfigEntrySource::Import),
                )
                .await
                .unwrap();
        }

        let manager = ConfigEntries::new(storage);
        manager.load().await.unwrap();

        assert_eq!(manager.len(), 1);
        let entry = manager.get_by_unique_id("demo", "test-123").unwrap();
        assert_eq!(entry.title, "Test");
        assert_eq!(entry.source, ConfigEntrySource::Import);
        assert_eq!(entry.state, ConfigEntryState::NotLoaded);
    }
}
