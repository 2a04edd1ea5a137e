//! Form input validation and stored entry settings

use std::collections::HashMap;
use std::time::Duration;

use ha_config_entries::{ConfigEntry, FieldType, FormField};
use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::constants::{
    CONF_CONNECTION_STRING, CONF_MONITORED_ENTITIES, CONF_POLLING_INTERVAL, MAX_POLLING_INTERVAL,
    MIN_POLLING_INTERVAL,
};

pub const ERR_REQUIRED: &str = "required";
pub const ERR_INVALID_STRING: &str = "invalid_string";
pub const ERR_INVALID_INT: &str = "invalid_int";
pub const ERR_OUT_OF_RANGE: &str = "out_of_range";
pub const ERR_INVALID_SELECTION: &str = "invalid_selection";

/// field -> error code
pub type FieldErrors = HashMap<String, String>;

/// Validated setup form input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInput {
    pub connection_string: String,
    pub polling_interval_minutes: i64,
}

impl UserInput {
    /// Data stored on the created entry
    pub fn into_entry_data(self) -> HashMap<String, Value> {
        let mut data = HashMap::new();
        data.insert(
            CONF_CONNECTION_STRING.to_string(),
            Value::String(self.connection_string),
        );
        data.insert(
            CONF_POLLING_INTERVAL.to_string(),
            json!(self.polling_interval_minutes),
        );
        data
    }
}

/// Integers, integral floats and numeric strings
pub fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn interval_in_range(value: i64) -> bool {
    (MIN_POLLING_INTERVAL..=MAX_POLLING_INTERVAL).contains(&value)
}

pub fn validate_user_input(input: &HashMap<String, Value>) -> Result<UserInput, FieldErrors> {
    let mut errors = FieldErrors::new();

    let connection_string = match input.get(CONF_CONNECTION_STRING) {
        None | Some(Value::Null) => {
            errors.insert(CONF_CONNECTION_STRING.into(), ERR_REQUIRED.into());
            None
        }
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(_) => {
            errors.insert(CONF_CONNECTION_STRING.into(), ERR_INVALID_STRING.into());
            None
        }
    };

    let interval = match input.get(CONF_POLLING_INTERVAL) {
        None | Some(Value::Null) => {
            errors.insert(CONF_POLLING_INTERVAL.into(), ERR_REQUIRED.into());
            None
        }
        Some(value) => match coerce_int(value) {
            None => {
                errors.insert(CONF_POLLING_INTERVAL.into(), ERR_INVALID_INT.into());
                None
            }
            Some(v) if !interval_in_range(v) => {
                errors.insert(CONF_POLLING_INTERVAL.into(), ERR_OUT_OF_RANGE.into());
                None
            }
            Some(v) => Some(v),
        },
    };

    match (connection_string, interval) {
        (Some(connection_string), Some(polling_interval_minutes)) => Ok(UserInput {
            connection_string,
            polling_interval_minutes,
        }),
        _ => Err(errors),
    }
}

pub fn user_schema(defaults: Option<&HashMap<String, Value>>) -> Vec<FormField> {
    let default_of = |key: &str| defaults.and_then(|d| d.get(key)).cloned();

    let mut connection_string =
        FormField::new(CONF_CONNECTION_STRING, FieldType::String).required();
    let mut interval = FormField::new(CONF_POLLING_INTERVAL, FieldType::Integer)
        .required()
        .with_range(MIN_POLLING_INTERVAL, MAX_POLLING_INTERVAL);

    if let Some(default) = default_of(CONF_CONNECTION_STRING) {
        connection_string = connection_string.with_default(default);
    }
    if let Some(default) = default_of(CONF_POLLING_INTERVAL) {
        interval = interval.with_default(default);
    }
    vec![connection_string, interval]
}

/// Check a `monitored_entities` submission against the selectable options
pub fn validate_monitored(
    input: &HashMap<String, Value>,
    options: &IndexMap<String, String>,
) -> Result<Vec<String>, FieldErrors> {
    let invalid = || {
        let mut errors = FieldErrors::new();
        errors.insert(CONF_MONITORED_ENTITIES.into(), ERR_INVALID_SELECTION.into());
        errors
    };

    let Some(value) = input.get(CONF_MONITORED_ENTITIES) else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = value else {
        return Err(invalid());
    };

    let mut selected: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        match item.as_str() {
            Some(id) if options.contains_key(id) => {
                if !selected.iter().any(|s| s == id) {
                    selected.push(id.to_string());
                }
            }
            _ => return Err(invalid()),
        }
    }
    Ok(selected)
}

/// Settings read back from a stored entry
#[derive(Clone, PartialEq, Eq)]
pub struct EntrySettings {
    pub connection_string: String,
    pub polling_interval: Duration,
    pub monitored_entities: Vec<String>,
}

impl EntrySettings {
    pub fn from_entry(entry: &ConfigEntry) -> Result<Self, String> {
        let connection_string = entry
            .data
            .get(CONF_CONNECTION_STRING)
            .and_then(Value::as_str)
            .ok_or_else(|| format!("entry has no {}", CONF_CONNECTION_STRING))?
            .to_string();

        let minutes = entry
            .data
            .get(CONF_POLLING_INTERVAL)
            .and_then(coerce_int)
            .filter(|m| interval_in_range(*m))
            .ok_or_else(|| format!("entry has no valid {}", CONF_POLLING_INTERVAL))?;

        let monitored_entities = entry
            .options
            .get(CONF_MONITORED_ENTITIES)
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            connection_string,
            polling_interval: Duration::from_secs(minutes as u64 * 60),
            monitored_entities,
        })
    }
}

impl std::fmt::Debug for EntrySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntrySettings")
            .field("connection_string", &"<redacted>")
            .field("polling_interval", &self.polling_interval)
            .field("monitored_entities", &self.monitored_entities)
            .finish()
    }
}
