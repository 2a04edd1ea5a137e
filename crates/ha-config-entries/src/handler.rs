//! Integration-facing seams of the config entry lifecycle

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use ha_core::Platform;
use thiserror::Error;

use crate::entry::ConfigEntry;
use crate::manager::{ConfigEntries, ConfigEntriesResult};

/// Outcome of a failed [`IntegrationHandler::setup_entry`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SetupError {
    /// Transient failure; the host schedules a retry
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Permanent failure; the entry stays in `SetupError` until reloaded
    #[error("{0}")]
    Failed(String),
}

/// The integration side of an entry's lifecycle
#[async_trait]
pub trait IntegrationHandler: Send + Sync {
    async fn setup_entry(
        &self,
        entries: &Arc<ConfigEntries>,
        entry: &ConfigEntry,
    ) -> Result<(), SetupError>;

    /// Returns false when the integration could not release the entry
    async fn unload_entry(&self, entries: &Arc<ConfigEntries>, entry: &ConfigEntry) -> bool;
}

/// Host capability to bring entity platforms up and down for an entry
#[async_trait]
pub trait PlatformRegistrar: Send + Sync {
    async fn forward_entry_setups(
        &self,
        entry: &ConfigEntry,
        platforms: &[Platform],
    ) -> ConfigEntriesResult<()>;

    /// True only if every platform was loaded and is now unloaded
    async fn unload_platforms(&self, entry: &ConfigEntry, platforms: &[Platform]) -> bool;
}

/// Called with the updated entry after its data or options change
pub type UpdateListener = Arc<dyn Fn(ConfigEntry) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs once when the entry unloads
pub type UnloadCallback = Box<dyn FnOnce(&ConfigEntries) + Send + Sync>;

/// Handle returned by [`ConfigEntries::add_update_listener`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId {
    pub(crate) entry_id: String,
    pub(crate) id: u64,
}

impl ListenerId {
    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }
}
