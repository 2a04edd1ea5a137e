//! Azure IoT Hub integration
//!
//! Periodically sends the state of user-selected entities to an Azure IoT
//! Hub device as one JSON message.
//!
//! - [`ConfigFlow`] validates a device connection string by connecting once
//! - [`OptionsFlow`] selects the monitored entities from the entity registry
//! - [`AzureIotHub`] is the [`ha_config_entries::IntegrationHandler`] that
//!   owns one connected [`DeviceClient`] and one timer per config entry

pub mod client;
pub mod config_flow;
pub mod connection_string;
pub mod constants;
pub mod error;
pub mod hub;
pub mod mqtt;
pub mod options_flow;
pub mod sas;
pub mod schema;
pub mod telemetry;

pub use client::{ClientFactory, DeviceClient, Message, MAX_MESSAGE_SIZE};
pub use config_flow::ConfigFlow;
pub use connection_string::ConnectionString;
pub use constants::{
    CONF_CONNECTION_STRING, CONF_MONITORED_ENTITIES, CONF_POLLING_INTERVAL, DOMAIN, ENTRY_TITLE,
    PLATFORMS,
};
pub use error::{IotHubError, IotHubResult};
pub use hub::AzureIotHub;
pub use mqtt::{MqttClientFactory, MqttDeviceClient};
pub use options_flow::OptionsFlow;
pub use telemetry::{collect_snapshot, EntitySnapshot, TelemetrySnapshot};
