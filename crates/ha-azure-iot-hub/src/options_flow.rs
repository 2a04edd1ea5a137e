//! Options flow: choose which entities are sent to IoT Hub

use std::collections::HashMap;
use std::sync::Arc;

use ha_config_entries::{ConfigEntry, FieldType, FlowResult, FormField};
use ha_registries::EntityRegistry;
use indexmap::IndexMap;
use serde_json::{json, Value};
use tracing::debug;

use crate::constants::{CONF_MONITORED_ENTITIES, DOMAIN, STEP_INIT};
use crate::schema::validate_monitored;

pub struct OptionsFlow {
    registry: Arc<EntityRegistry>,
}

impl OptionsFlow {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }

    /// Selectable entities: entity_id -> display name, in registry order
    fn selectable(&self) -> IndexMap<String, String> {
        self.registry
            .iter()
            .iter()
            .map(|e| (e.entity_id.clone(), e.display_name().to_string()))
            .collect()
    }

    fn form(
        &self,
        options: IndexMap<String, String>,
        default: Value,
        errors: HashMap<String, String>,
    ) -> FlowResult {
        let field = FormField::new(CONF_MONITORED_ENTITIES, FieldType::MultiSelect)
            .with_default(default)
            .with_options(options);
        FlowResult::form(DOMAIN, STEP_INIT, vec![field], errors)
    }

    pub fn step_init(
        &self,
        entry: &ConfigEntry,
        user_input: Option<HashMap<String, Value>>,
    ) -> FlowResult {
        let options = self.selectable();
        let current = entry
            .options
            .get(CONF_MONITORED_ENTITIES)
            .cloned()
            .unwrap_or_else(|| json!([]));

        let Some(input) = user_input else {
            return self.form(options, current, HashMap::new());
        };

        match validate_monitored(&input, &options) {
            Ok(selected) => {
                debug!(
                    entry_id = %entry.entry_id,
                    count = selected.len(),
                    "Monitored entities selected"
                );
                let mut data = HashMap::new();
                data.insert(CONF_MONITORED_ENTITIES.to_string(), json!(selected));
                FlowResult::create_entry(DOMAIN, "", data)
            }
            Err(errors) => self.form(options, current, errors),
        }
    }
}
