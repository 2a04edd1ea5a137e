//! Home Assistant Rust Server
//!
//! Loads persisted config entries, sets up their integrations and keeps
//! them running until interrupted. Entity states are restored from
//! `.storage/core.restore_state` at startup and saved back on shutdown.
//! Entries are created through the integration's config and options flows
//! (library API); the server itself exposes no HTTP surface.

mod config;
mod restore;

use anyhow::Result;
use ha_azure_iot_hub::{AzureIotHub, MqttClientFactory};
use ha_config_entries::ConfigEntries;
use ha_registries::{EntityRegistry, Storage};
use ha_state_store::{SharedStateStore, StateStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{resolve_config_dir, ServerConfig, CONFIG_DIR_ENV};

/// The central Home Assistant instance
pub struct HomeAssistant {
    pub config_dir: PathBuf,
    storage: Arc<Storage>,
    /// Current entity states
    pub states: SharedStateStore,
    pub entity_registry: Arc<EntityRegistry>,
    pub config_entries: Arc<ConfigEntries>,
}

impl HomeAssistant {
    pub fn new(config_dir: PathBuf) -> Self {
        let storage = Arc::new(Storage::new(&config_dir));
        let states: SharedStateStore = Arc::new(StateStore::new());
        let entity_registry = Arc::new(EntityRegistry::new(Arc::clone(&storage)));
        let config_entries = Arc::new(ConfigEntries::new(Arc::clone(&storage)));

        config_entries.register_handler(
            ha_azure_iot_hub::DOMAIN,
            Arc::new(AzureIotHub::new(
                Arc::new(MqttClientFactory),
                Arc::clone(&states),
            )),
        );

        Self {
            config_dir,
            storage,
            states,
            entity_registry,
            config_entries,
        }
    }

    /// Load persisted registries and set up every config entry
    pub async fn start(&self) -> Result<()> {
        self.entity_registry.load().await?;
        self.config_entries.load().await?;
        restore::restore_states(&self.storage, &self.states).await?;
        info!(
            entities = self.entity_registry.len(),
            states = self.states.len(),
            entries = self.config_entries.len(),
            "Loaded storage from {}",
            self.config_dir.display()
        );

        for (entry_id, result) in self.config_entries.setup_all().await {
            if let Err(err) = result {
                warn!(%entry_id, "Config entry not set up: {}", err);
            }
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.config_entries.unload_all().await;
        match restore::dump_states(&self.storage, &self.states).await {
            Ok(saved) => info!(saved, "Saved entity states"),
            Err(err) => warn!("Could not save entity states: {}", err),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_dir = resolve_config_dir(
        std::env::args().nth(1),
        std::env::var(CONFIG_DIR_ENV).ok(),
    );
    let config = ServerConfig::load(&config_dir)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logger.default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Home Assistant (Rust)");

    let hass = HomeAssistant::new(config_dir);
    hass.start().await?;

    info!("Home Assistant is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    hass.stop().await;
    Ok(())
}
