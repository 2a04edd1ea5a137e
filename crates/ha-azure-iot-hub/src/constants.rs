//! Constants for the Azure IoT Hub integration

use ha_core::Platform;

pub const DOMAIN: &str = "azure_iot_hub";

/// Title given to entries created by the config flow
pub const ENTRY_TITLE: &str = "IoT Hub Device";

pub const CONF_CONNECTION_STRING: &str = "connection_string";
pub const CONF_POLLING_INTERVAL: &str = "polling_interval_minutes";
pub const CONF_MONITORED_ENTITIES: &str = "monitored_entities";

pub const MIN_POLLING_INTERVAL: i64 = 1;
pub const MAX_POLLING_INTERVAL: i64 = 1440;

pub const PLATFORMS: &[Platform] = &[Platform::Light];

/// Abort reason when the device already has an entry
pub const ABORT_ALREADY_CONFIGURED: &str = "already_configured";

pub const STEP_USER: &str = "user";
pub const STEP_INIT: &str = "init";
