//! Config Entries
//!
//! Config entries represent individual integration instances. This crate
//! stores them, drives their lifecycle (setup, retry, unload, reload) and
//! defines the seams integrations plug into.
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - A single integration configuration
//! - [`ConfigEntryState`] - Lifecycle state of an entry
//! - [`ConfigEntries`] - Manager for all config entries
//! - [`IntegrationHandler`] - Setup/unload hooks an integration implements
//! - [`PlatformRegistrar`] - Platform forwarding offered to integrations
//! - [`FlowResult`] - Answer of a config or options flow step
//!
//! # Storage
//!
//! Config entries are persisted in `.storage/core.config_entries`.

pub mod entry;
pub mod flow;
pub mod handler;
pub mod manager;
pub mod state_machine;

pub use entry::{
    ConfigEntry, ConfigEntryDisabledBy, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate,
};
pub use flow::{FieldType, FlowResult, FlowResultType, FormField, BASE_ERROR_KEY};
pub use handler::{
    IntegrationHandler, ListenerId, PlatformRegistrar, SetupError, UnloadCallback, UpdateListener,
};
pub use manager::{
    ConfigEntries, ConfigEntriesData, ConfigEntriesError, ConfigEntriesResult, STORAGE_KEY,
    STORAGE_MINOR_VERSION, STORAGE_VERSION,
};
pub use state_machine::{calculate_retry_delay, InvalidTransition};
