// Schema domain models - workflow templates

//! # Schema Models
//!
//! A `Schema` is the authoring-time template of a workflow: a graph of nodes
//! rooted at `root_node_id`, plus the context parameters used to recognise
//! which running instance an incoming event belongs to.
//!
//! ## Rust Learning Notes:
//!
//! ### Builder-style Constructors
//! `Schema::new` fills in ids and timestamps, and the `with_*` methods take
//! `self` by value so calls can be chained without a separate builder type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::condition::DataType;

/// Name of the reserved context parameter that carries the generated instance code
pub const SCHEMA_INSTANCE_CODE_PARAM: &str = "SchemaInstanceCode";

/// What kind of conversation or process a schema drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaType {
    ChatBot,
    Application,
}

impl Default for SchemaType {
    fn default() -> Self {
        SchemaType::ChatBot
    }
}

/// Unit for the fuzzy-matching threshold of a context parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdUnit {
    Meters,
    Kilometers,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl ThresholdUnit {
    /// Convert a threshold expressed in this unit into meters.
    /// Returns `None` for time units.
    pub fn to_meters(&self, value: f64) -> Option<f64> {
        match self {
            ThresholdUnit::Meters => Some(value),
            ThresholdUnit::Kilometers => Some(value * 1000.0),
            _ => None,
        }
    }

    /// Convert a threshold expressed in this unit into seconds.
    /// Returns `None` for distance units.
    pub fn to_seconds(&self, value: f64) -> Option<f64> {
        match self {
            ThresholdUnit::Seconds => Some(value),
            ThresholdUnit::Minutes => Some(value * 60.0),
            ThresholdUnit::Hours => Some(value * 3600.0),
            ThresholdUnit::Days => Some(value * 86400.0),
            _ => None,
        }
    }
}

/// A named, typed slot used to identify schema instances
///
/// On the schema the `value` is empty; when an instance is created the
/// parameters are copied and bound from the triggering event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextParam {
    pub name: String,

    #[serde(rename = "type")]
    pub param_type: DataType,

    /// Bound value (only set on instances)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,

    /// A required parameter that fails to match eliminates a candidate instance
    #[serde(default)]
    pub required: bool,

    /// Distance or time window for fuzzy matching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_unit: Option<ThresholdUnit>,
}

impl ContextParam {
    pub fn new<S: Into<String>>(name: S, param_type: DataType) -> Self {
        Self {
            name: name.into(),
            param_type,
            value: None,
            required: false,
            threshold: None,
            threshold_unit: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_threshold(mut self, threshold: f64, unit: ThresholdUnit) -> Self {
        self.threshold = Some(threshold);
        self.threshold_unit = Some(unit);
        self
    }

    pub fn is_instance_code(&self) -> bool {
        self.name == SCHEMA_INSTANCE_CODE_PARAM
    }
}

/// Workflow template owned by a tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "type", default)]
    pub schema_type: SchemaType,

    /// Entry node of the execution graph
    #[serde(default)]
    pub root_node_id: Option<Uuid>,

    /// Set for child schemas that are only started by a parent workflow.
    /// Top-level schemas have no parent.
    #[serde(default)]
    pub parent_schema_id: Option<Uuid>,

    #[serde(default)]
    pub context_params: Vec<ContextParam>,

    /// Run a node's actions as soon as the instance arrives at it
    #[serde(default)]
    pub execute_immediately: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schema {
    pub fn new<T: Into<String>, N: Into<String>>(tenant_id: T, name: N) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            description: None,
            schema_type: SchemaType::ChatBot,
            root_node_id: None,
            parent_schema_id: None,
            context_params: Vec::new(),
            execute_immediately: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_context_param(mut self, param: ContextParam) -> Self {
        self.context_params.push(param);
        self
    }

    pub fn with_root_node(mut self, node_id: Uuid) -> Self {
        self.root_node_id = Some(node_id);
        self
    }

    pub fn executing_immediately(mut self) -> Self {
        self.execute_immediately = true;
        self
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_schema_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_conversion() {
        assert_eq!(ThresholdUnit::Kilometers.to_meters(1.5), Some(1500.0));
        assert_eq!(ThresholdUnit::Hours.to_seconds(2.0), Some(7200.0));
        assert_eq!(ThresholdUnit::Days.to_meters(1.0), None);
    }

    #[test]
    fn test_schema_json_shape() {
        let schema = Schema::new("tenant-a", "Intake")
            .with_context_param(ContextParam::new("Phone", DataType::Phonenumber).required());
        let json = serde_json::to_value(&schema).unwrap();

        assert_eq!(json["type"], "ChatBot");
        assert_eq!(json["context_params"][0]["type"], "Phonenumber");
        assert_eq!(json["context_params"][0]["required"], true);
        assert!(schema.is_top_level());
    }
}
