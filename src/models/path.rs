// Decision edges and the rules that gate them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named decision edge from `parent_node_id` to `next_node_id`
///
/// A path is gated by at most one [`Rule`]. Paths without a rule act as the
/// default branch of their parent node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePath {
    pub id: Uuid,
    pub parent_node_id: Uuid,
    pub next_node_id: Uuid,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl NodePath {
    pub fn new<N: Into<String>>(parent_node_id: Uuid, next_node_id: Uuid, name: N) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_node_id,
            next_node_id,
            name: name.into(),
            description: None,
            created_at: Utc::now(),
        }
    }
}

/// Binds a condition to a node, and optionally to one of its paths
///
/// A rule without `node_path_id` is a plain gate, e.g. the base rule of a
/// node or the check a timer node repeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub parent_node_id: Uuid,

    #[serde(default)]
    pub node_path_id: Option<Uuid>,

    pub condition_id: Uuid,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Rule {
    pub fn new(parent_node_id: Uuid, condition_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_node_id,
            node_path_id: None,
            condition_id,
            name: String::new(),
            description: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_path(mut self, node_path_id: Uuid) -> Self {
        self.node_path_id = Some(node_path_id);
        self
    }

    pub fn with_name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = name.into();
        self
    }
}
