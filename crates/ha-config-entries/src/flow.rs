//! Data flow results
//!
//! Config and options flows answer each step with a [`FlowResult`]: either a
//! form to show (with per-field errors), a finished entry, or an abort.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowResultType {
    Form,
    CreateEntry,
    Abort,
}

/// Error key used when a failure is not tied to one field
pub const BASE_ERROR_KEY: &str = "base";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResult {
    pub flow_id: String,
    pub handler: String,
    #[serde(rename = "type")]
    pub result_type: FlowResultType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_schema: Vec<FormField>,
    /// field name (or `base`) -> error code
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub errors: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<HashMap<String, Value>>,
    /// Unique id the created entry is registered under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FlowResult {
    fn base(handler: &str, result_type: FlowResultType) -> Self {
        Self {
            flow_id: ulid::Ulid::new().to_string(),
            handler: handler.to_string(),
            result_type,
            step_id: None,
            data_schema: Vec::new(),
            errors: HashMap::new(),
            title: None,
            data: None,
            unique_id: None,
            reason: None,
        }
    }

    pub fn form(
        handler: &str,
        step_id: &str,
        data_schema: Vec<FormField>,
        errors: HashMap<String, String>,
    ) -> Self {
        Self {
            step_id: Some(step_id.to_string()),
            data_schema,
            errors,
            ..Self::base(handler, FlowResultType::Form)
        }
    }

    pub fn create_entry(
        handler: &str,
        title: impl Into<String>,
        data: HashMap<String, Value>,
    ) -> Self {
        Self {
            title: Some(title.into()),
            data: Some(data),
            ..Self::base(handler, FlowResultType::CreateEntry)
        }
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn abort(handler: &str, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::base(handler, FlowResultType::Abort)
        }
    }

    pub fn is_form(&self) -> bool {
        self.result_type == FlowResultType::Form
    }

    pub fn is_create_entry(&self) -> bool {
        self.result_type == FlowResultType::CreateEntry
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    MultiSelect,
}

/// One field of a form schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    /// value -> label, for `multi_select`
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub options: IndexMap<String, String>,
}

impl FormField {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            default: None,
            min: None,
            max: None,
            options: IndexMap::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_range(mut self, min: i64, max: i64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_options(mut self, options: IndexMap<String, String>) -> Self {
        self.options = options;
        self
    }
}
