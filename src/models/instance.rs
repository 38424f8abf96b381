// Runtime records - one running execution of a schema

//! # Instance Models
//!
//! Runtime state lives in three records:
//! - `SchemaInstance`: one run of a schema, including its almanac facts
//! - `NodeInstance`: the execution record of one node inside one run
//! - `NodeActionInstance`: the execution record of one action, holding a
//!   snapshot of the action as it was when first materialised
//!
//! Schema and node instances carry a `version` that storage bumps on every
//! versioned write; a write carrying a stale version is rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::action::NodeAction;
use super::node::{Node, NodeType};
use super::schema::{ContextParam, Schema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Executed,
    Waiting,
    Exited,
}

/// Named fact stored in a schema instance's almanac
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlmanacFact {
    pub name: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaInstance {
    pub id: Uuid,
    pub tenant_id: String,
    pub schema_id: Uuid,

    /// `E-YYMMDD-NNN`, sequential per tenant, schema and day
    pub code: String,

    /// The schema's context params bound from the triggering event
    #[serde(default)]
    pub context_params: Vec<ContextParam>,

    #[serde(default)]
    pub root_node_instance_id: Option<Uuid>,

    #[serde(default)]
    pub current_node_instance_id: Option<Uuid>,

    /// Set when a parent workflow started this instance
    #[serde(default)]
    pub parent_schema_instance_id: Option<Uuid>,

    #[serde(default)]
    pub execution_started: bool,

    #[serde(default)]
    pub execution_started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub terminated: bool,

    #[serde(default)]
    pub terminated_at: Option<DateTime<Utc>>,

    /// Almanac facts; written only through the almanac storage operations
    #[serde(default)]
    pub almanac: Vec<AlmanacFact>,

    #[serde(default)]
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SchemaInstance {
    pub fn new(schema: &Schema, code: String, context_params: Vec<ContextParam>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: schema.tenant_id.clone(),
            schema_id: schema.id,
            code,
            context_params,
            root_node_instance_id: None,
            current_node_instance_id: None,
            parent_schema_instance_id: None,
            execution_started: false,
            execution_started_at: None,
            terminated: false,
            terminated_at: None,
            almanac: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn context_param(&self, name: &str) -> Option<&ContextParam> {
        self.context_params.iter().find(|param| param.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: Uuid,
    pub node_id: Uuid,
    pub schema_instance_id: Uuid,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    pub status: ExecutionStatus,
    pub status_updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<Value>,

    #[serde(default)]
    pub timer_tries_completed: u32,

    #[serde(default)]
    pub timer_finished: bool,

    /// Mirrors the node authoring tree
    #[serde(default)]
    pub parent_node_instance_id: Option<Uuid>,

    /// Path taken when leaving this node
    #[serde(default)]
    pub chosen_node_path_id: Option<Uuid>,

    #[serde(default)]
    pub version: u64,

    pub created_at: DateTime<Utc>,
}

impl NodeInstance {
    pub fn new(node: &Node, schema_instance_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            node_id: node.id,
            schema_instance_id,
            node_type: node.node_type,
            status: ExecutionStatus::Pending,
            status_updated_at: now,
            execution_result: None,
            timer_tries_completed: 0,
            timer_finished: false,
            parent_node_instance_id: None,
            chosen_node_path_id: None,
            version: 0,
            created_at: now,
        }
    }

    pub fn is_executed(&self) -> bool {
        self.status == ExecutionStatus::Executed
    }
}

/// Execution record of one action inside one node instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeActionInstance {
    pub id: Uuid,
    pub action_id: Uuid,
    pub node_id: Uuid,
    pub node_instance_id: Uuid,
    pub schema_instance_id: Uuid,
    pub sequence: u32,

    #[serde(default)]
    pub executed: bool,

    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,

    /// Action definition copied at materialisation time
    #[serde(rename = "action")]
    pub snapshot: NodeAction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    pub created_at: DateTime<Utc>,
}

impl NodeActionInstance {
    pub fn materialize(action: &NodeAction, node_instance: &NodeInstance) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_id: action.id,
            node_id: action.node_id,
            node_instance_id: node_instance.id,
            schema_instance_id: node_instance.schema_instance_id,
            sequence: action.sequence,
            executed: false,
            executed_at: None,
            snapshot: action.clone(),
            result: None,
            created_at: Utc::now(),
        }
    }
}
