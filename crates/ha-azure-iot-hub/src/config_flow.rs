//! Setup flow: collect and probe the device connection string

use std::collections::HashMap;
use std::sync::Arc;

use ha_config_entries::{ConfigEntries, FlowResult, BASE_ERROR_KEY};
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use crate::client::ClientFactory;
use crate::connection_string::ConnectionString;
use crate::constants::{ABORT_ALREADY_CONFIGURED, DOMAIN, ENTRY_TITLE, STEP_USER};
use crate::error::{IotHubError, IotHubResult};
use crate::schema::{user_schema, validate_user_input};

pub struct ConfigFlow {
    factory: Arc<dyn ClientFactory>,
    entries: Arc<ConfigEntries>,
}

impl ConfigFlow {
    pub fn new(factory: Arc<dyn ClientFactory>, entries: Arc<ConfigEntries>) -> Self {
        Self { factory, entries }
    }

    /// Show the form, or validate a submission and create the entry
    ///
    /// Any failure redisplays the form with errors; nothing is persisted
    /// until the returned result is a `create_entry`. A device that already
    /// has an entry aborts the flow.
    #[instrument(skip_all, fields(handler = DOMAIN))]
    pub async fn step_user(&self, user_input: Option<HashMap<String, Value>>) -> FlowResult {
        let Some(input) = user_input else {
            return FlowResult::form(DOMAIN, STEP_USER, user_schema(None), HashMap::new());
        };

        let parsed = match validate_user_input(&input) {
            Ok(parsed) => parsed,
            Err(errors) => {
                debug!(?errors, "Setup form failed schema validation");
                return FlowResult::form(DOMAIN, STEP_USER, user_schema(Some(&input)), errors);
            }
        };

        let connection: ConnectionString = match parsed.connection_string.parse() {
            Ok(connection) => connection,
            Err(err) => return error_form(&input, err),
        };

        let unique_id = connection.unique_id();
        if self.entries.get_by_unique_id(DOMAIN, &unique_id).is_some() {
            info!(device_id = %connection.device_id, "Device is already configured");
            return FlowResult::abort(DOMAIN, ABORT_ALREADY_CONFIGURED);
        }

        match self.probe(&parsed.connection_string).await {
            Ok(()) => {
                info!("IoT Hub connection verified, creating entry");
                FlowResult::create_entry(DOMAIN, ENTRY_TITLE, parsed.into_entry_data())
                    .with_unique_id(unique_id)
            }
            Err(err) => error_form(&input, err),
        }
    }

    /// Connect once and always disconnect afterwards
    async fn probe(&self, connection_string: &str) -> IotHubResult<()> {
        let mut client = self.factory.create_from_connection_string(connection_string)?;

        let result = client.connect().await;
        if let Err(err) = client.disconnect().await {
            debug!("Disconnect after probe failed: {}", err);
        }
        result
    }
}

fn error_form(input: &HashMap<String, Value>, err: IotHubError) -> FlowResult {
    match &err {
        IotHubError::CannotConnect(_)
        | IotHubError::InvalidConnectionString(_)
        | IotHubError::InvalidAuth(_) => debug!("Connection probe failed: {}", err),
        _ => error!("Unexpected error while validating IoT Hub connection: {:?}", err),
    }
    let mut errors = HashMap::new();
    errors.insert(BASE_ERROR_KEY.to_string(), err.flow_error_code().to_string());
    FlowResult::form(DOMAIN, STEP_USER, user_schema(Some(input)), errors)
}
