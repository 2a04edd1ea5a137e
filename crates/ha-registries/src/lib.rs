//! Host registries
//!
//! Persistent registries backed by versioned JSON files in the `.storage/`
//! directory. Only the entity registry is needed by the integrations hosted
//! here; the storage layer is shared with the config entries manager.

pub mod entity_registry;
pub mod storage;

pub use entity_registry::{
    DisabledBy, EntityEntry, EntityRegistry, EntityRegistryData, EntityRegistryError,
};
pub use storage::{load_storable, Storable, Storage, StorageError, StorageFile, StorageResult};
