//! The Azure IoT Hub integration handler
//!
//! One runtime per loaded config entry: the connected client and the timer
//! that sends telemetry with it.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use ha_config_entries::{
    ConfigEntries, ConfigEntry, IntegrationHandler, PlatformRegistrar, SetupError, UpdateListener,
};
use ha_core::{track_time_interval, IntervalHandle};
use ha_state_store::SharedStateStore;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::client::ClientFactory;
use crate::constants::PLATFORMS;
use crate::schema::EntrySettings;
use crate::telemetry::{SharedClient, TelemetrySender};

struct EntryRuntime {
    client: SharedClient,
    interval: IntervalHandle,
}

pub struct AzureIotHub {
    factory: Arc<dyn ClientFactory>,
    states: SharedStateStore,
    /// entry_id -> runtime
    runtimes: DashMap<String, EntryRuntime>,
}

impl AzureIotHub {
    pub fn new(factory: Arc<dyn ClientFactory>, states: SharedStateStore) -> Self {
        Self {
            factory,
            states,
            runtimes: DashMap::new(),
        }
    }

    pub fn is_running(&self, entry_id: &str) -> bool {
        self.runtimes.contains_key(entry_id)
    }

    pub fn running_entries(&self) -> usize {
        self.runtimes.len()
    }

    /// Stop the timer (waiting out a running tick) and shut the client down
    async fn teardown(&self, entry_id: &str) {
        let Some((_, runtime)) = self.runtimes.remove(entry_id) else {
            return;
        };

        runtime.interval.cancel().await;
        let mut client = runtime.client.lock().await;
        if let Err(err) = client.shutdown().await {
            warn!(entry_id, "Client shutdown failed: {}", err);
        }
        debug!(entry_id, "Entry runtime torn down");
    }

    /// Reloads the entry whenever its options change
    fn reload_listener(entries: &Arc<ConfigEntries>) -> UpdateListener {
        let entries = Arc::downgrade(entries);
        Arc::new(move |entry: ConfigEntry| {
            let entries = entries.clone();
            async move {
                let Some(entries) = entries.upgrade() else {
                    return;
                };
                info!(entry_id = %entry.entry_id, "Options changed, reloading entry");
                if let Err(err) = entries.reload(&entry.entry_id).await {
                    error!(entry_id = %entry.entry_id, "Reload failed: {}", err);
                }
            }
            .boxed()
        })
    }
}

#[async_trait]
impl IntegrationHandler for AzureIotHub {
    #[instrument(skip_all, fields(entry_id = %entry.entry_id))]
    async fn setup_entry(
        &self,
        entries: &Arc<ConfigEntries>,
        entry: &ConfigEntry,
    ) -> Result<(), SetupError> {
        let settings = EntrySettings::from_entry(entry).map_err(SetupError::Failed)?;

        // At most one client per entry
        self.teardown(&entry.entry_id).await;

        let mut client = self
            .factory
            .create_from_connection_string(&settings.connection_string)
            .map_err(|e| SetupError::Failed(e.to_string()))?;

        if let Err(err) = client.connect().await {
            warn!("Could not connect to IoT Hub: {}", err);
            if let Err(shutdown_err) = client.shutdown().await {
                debug!("Shutdown after failed connect: {}", shutdown_err);
            }
            return Err(SetupError::NotReady(err.to_string()));
        }
        let client: SharedClient = Arc::new(Mutex::new(client));

        let registrar: &dyn PlatformRegistrar = &**entries;
        if let Err(err) = registrar.forward_entry_setups(entry, PLATFORMS).await {
            if let Err(shutdown_err) = client.lock().await.shutdown().await {
                debug!("Shutdown after failed platform setup: {}", shutdown_err);
            }
            return Err(SetupError::Failed(err.to_string()));
        }

        let sender = TelemetrySender::new(
            &entry.entry_id,
            Arc::clone(&self.states),
            settings.monitored_entities.clone(),
            Arc::clone(&client),
        );
        let interval = track_time_interval(settings.polling_interval, move |cancel| {
            let sender = sender.clone();
            async move { sender.tick(cancel).await }
        });

        self.runtimes
            .insert(entry.entry_id.clone(), EntryRuntime { client, interval });

        if !entries.has_update_listeners(&entry.entry_id) {
            let listener =
                entries.add_update_listener(&entry.entry_id, Self::reload_listener(entries));
            entries.on_unload(
                &entry.entry_id,
                Box::new(move |entries: &ConfigEntries| {
                    entries.remove_update_listener(&listener);
                }),
            );
        }

        info!(
            interval = ?settings.polling_interval,
            monitored = settings.monitored_entities.len(),
            "Azure IoT Hub entry running"
        );
        Ok(())
    }

    #[instrument(skip_all, fields(entry_id = %entry.entry_id))]
    async fn unload_entry(&self, entries: &Arc<ConfigEntries>, entry: &ConfigEntry) -> bool {
        self.teardown(&entry.entry_id).await;

        let registrar: &dyn PlatformRegistrar = &**entries;
        let unloaded = registrar.unload_platforms(entry, PLATFORMS).await;
        if !unloaded {
            warn!("Some platforms did not unload cleanly");
        }
        unloaded
    }
}
