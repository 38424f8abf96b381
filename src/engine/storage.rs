// Storage abstraction for the workflow engine
// Repository operations over schemas, graph elements and runtime records

//! # Storage Abstraction Layer
//!
//! The engine never touches persistence directly. Everything it needs is
//! expressed as repository operations on the [`WorkflowStorage`] trait:
//! CRUD over the authoring graph, find-by-relation queries, and the runtime
//! writes that move a schema instance forward.
//!
//! ## Invariants every backend must keep
//!
//! - **One node instance per (node, schema instance)**:
//!   `get_or_create_node_instance` is a lookup-or-create done atomically.
//! - **One rule per node path**: `create_rule` rejects a second rule for the
//!   same path with `FlowgateError::Conflict` and leaves the existing link alone.
//! - **Almanac facts are column-scoped**: `update_schema_instance` never
//!   overwrites the fact list; only `update_almanac_facts` does.
//! - **Versioned writes**: `update_schema_instance`,
//!   `update_current_node_instance` and `update_node_instance` compare the
//!   caller's `version` with the stored one and fail with
//!   `FlowgateError::ConcurrencyConflict` on mismatch.
//! - **Stable ordering**: list operations return rows in creation order
//!   (actions by `sequence`, condition children by `sequence`, ties by
//!   creation order), so "first match wins" is deterministic.
//!
//! ## Rust Learning Notes:
//!
//! ### Async Traits
//! The `async-trait` crate lets traits declare `async fn`. The trait is
//! `Send + Sync` so it can be shared as `Arc<dyn WorkflowStorage>` across
//! worker tasks.
//!
//! ### One Lock, Many Tables
//! `InMemoryStorage` keeps all tables behind a single `tokio::sync::RwLock`.
//! Multi-table operations (cascading deletes, rule conflict checks,
//! lookup-or-create) then happen under one write guard and are atomic.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    AlmanacFact, Condition, DeadLetter, Event, ExecutionStatus, Node, NodeAction,
    NodeActionInstance, NodeInstance, NodePath, Rule, Schema, SchemaInstance,
};
use crate::{FlowgateError, Result};

/// Repository operations the engine and authoring layer depend on
#[async_trait::async_trait]
pub trait WorkflowStorage: Send + Sync {
    // Schemas
    async fn create_schema(&self, schema: Schema) -> Result<Schema>;
    async fn get_schema(&self, id: &Uuid) -> Result<Option<Schema>>;
    /// Schemas of a tenant in creation order
    async fn list_schemas(&self, tenant_id: &str) -> Result<Vec<Schema>>;
    async fn update_schema(&self, schema: Schema) -> Result<Schema>;
    /// Deletes the schema together with its nodes, actions, paths and rules
    async fn delete_schema(&self, id: &Uuid) -> Result<bool>;

    // Nodes
    async fn create_node(&self, node: Node) -> Result<Node>;
    async fn get_node(&self, id: &Uuid) -> Result<Option<Node>>;
    async fn list_nodes(&self, schema_id: &Uuid) -> Result<Vec<Node>>;
    async fn list_child_nodes(&self, parent_node_id: &Uuid) -> Result<Vec<Node>>;
    async fn update_node(&self, node: Node) -> Result<Node>;
    async fn delete_node(&self, id: &Uuid) -> Result<bool>;

    // Node actions
    async fn create_node_action(&self, action: NodeAction) -> Result<NodeAction>;
    async fn get_node_action(&self, id: &Uuid) -> Result<Option<NodeAction>>;
    /// Actions of a node ordered by `sequence`
    async fn list_node_actions(&self, node_id: &Uuid) -> Result<Vec<NodeAction>>;
    async fn update_node_action(&self, action: NodeAction) -> Result<NodeAction>;
    async fn delete_node_action(&self, id: &Uuid) -> Result<bool>;

    // Node paths
    async fn create_node_path(&self, path: NodePath) -> Result<NodePath>;
    async fn get_node_path(&self, id: &Uuid) -> Result<Option<NodePath>>;
    /// Outgoing paths of a node in creation order
    async fn list_node_paths(&self, parent_node_id: &Uuid) -> Result<Vec<NodePath>>;
    /// Deletes the path and the rule bound to it
    async fn delete_node_path(&self, id: &Uuid) -> Result<bool>;

    // Rules
    async fn create_rule(&self, rule: Rule) -> Result<Rule>;
    async fn get_rule(&self, id: &Uuid) -> Result<Option<Rule>>;
    async fn get_rule_by_node_path(&self, node_path_id: &Uuid) -> Result<Option<Rule>>;
    async fn list_rules(&self, parent_node_id: &Uuid) -> Result<Vec<Rule>>;
    async fn delete_rule(&self, id: &Uuid) -> Result<bool>;

    // Conditions
    async fn create_condition(&self, condition: Condition) -> Result<Condition>;
    async fn get_condition(&self, id: &Uuid) -> Result<Option<Condition>>;
    /// Children of a composite condition ordered by `sequence`
    async fn list_condition_children(&self, parent_condition_id: &Uuid) -> Result<Vec<Condition>>;
    async fn update_condition(&self, condition: Condition) -> Result<Condition>;
    /// Deletes the condition and its whole subtree
    async fn delete_condition(&self, id: &Uuid) -> Result<bool>;

    // Schema instances
    async fn create_schema_instance(&self, instance: SchemaInstance) -> Result<SchemaInstance>;
    async fn get_schema_instance(&self, id: &Uuid) -> Result<Option<SchemaInstance>>;
    /// All instances of a schema, terminated ones included, in creation order
    async fn list_schema_instances(&self, schema_id: &Uuid) -> Result<Vec<SchemaInstance>>;
    async fn update_schema_instance(&self, instance: SchemaInstance) -> Result<SchemaInstance>;
    async fn update_current_node_instance(
        &self,
        schema_instance_id: &Uuid,
        node_instance_id: &Uuid,
        expected_version: u64,
    ) -> Result<SchemaInstance>;
    /// Deletes the instance with its node and action instances
    async fn delete_schema_instance(&self, id: &Uuid) -> Result<bool>;
    /// Next value of the per tenant/schema/day code counter, starting at 1
    async fn next_instance_sequence(&self, tenant_id: &str, schema_id: &Uuid, day: NaiveDate) -> Result<u32>;

    // Node instances
    async fn get_or_create_node_instance(&self, node: &Node, schema_instance_id: &Uuid) -> Result<NodeInstance>;
    async fn get_node_instance(&self, id: &Uuid) -> Result<Option<NodeInstance>>;
    async fn find_node_instance(&self, node_id: &Uuid, schema_instance_id: &Uuid) -> Result<Option<NodeInstance>>;
    async fn list_node_instances(&self, schema_instance_id: &Uuid) -> Result<Vec<NodeInstance>>;
    async fn update_node_instance(&self, node_instance: NodeInstance) -> Result<NodeInstance>;
    async fn set_execution_status(
        &self,
        node_instance_id: &Uuid,
        status: ExecutionStatus,
        result: Option<Value>,
    ) -> Result<NodeInstance>;
    async fn update_timer_tries(&self, node_instance_id: &Uuid, tries: u32, finished: bool) -> Result<NodeInstance>;

    // Node action instances
    async fn get_or_create_node_action_instance(
        &self,
        action: &NodeAction,
        node_instance: &NodeInstance,
    ) -> Result<NodeActionInstance>;
    async fn list_node_action_instances(&self, node_instance_id: &Uuid) -> Result<Vec<NodeActionInstance>>;
    async fn update_node_action_instance(&self, instance: NodeActionInstance) -> Result<NodeActionInstance>;

    // Almanac
    async fn get_almanac_facts(&self, schema_instance_id: &Uuid) -> Result<Vec<AlmanacFact>>;
    async fn update_almanac_facts(&self, schema_instance_id: &Uuid, facts: Vec<AlmanacFact>) -> Result<()>;

    // Events
    async fn create_event(&self, event: Event) -> Result<Event>;
    async fn get_event(&self, id: &Uuid) -> Result<Option<Event>>;
    async fn mark_event_handled(&self, id: &Uuid) -> Result<Event>;
    async fn list_events(&self, tenant_id: &str) -> Result<Vec<Event>>;

    // Dead letters
    async fn record_dead_letter(&self, dead_letter: DeadLetter) -> Result<DeadLetter>;
    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>>;
}

/// Rows keyed by id, remembering insertion order
struct Table<T> {
    rows: HashMap<Uuid, (u64, T)>,
    next_seq: u64,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T: Clone> Table<T> {
    fn insert(&mut self, id: Uuid, value: T) {
        let seq = match self.rows.get(&id) {
            Some((seq, _)) => *seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.rows.insert(id, (seq, value));
    }

    fn get(&self, id: &Uuid) -> Option<&T> {
        self.rows.get(id).map(|(_, value)| value)
    }

    fn get_mut(&mut self, id: &Uuid) -> Option<&mut T> {
        self.rows.get_mut(id).map(|(_, value)| value)
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.rows.contains_key(id)
    }

    fn remove(&mut self, id: &Uuid) -> Option<T> {
        self.rows.remove(id).map(|(_, value)| value)
    }

    /// Matching rows in insertion order
    fn ordered<F: Fn(&T) -> bool>(&self, filter: F) -> Vec<T> {
        let mut rows: Vec<&(u64, T)> = self.rows.values().filter(|(_, v)| filter(v)).collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, value)| value.clone()).collect()
    }

    fn ids_where<F: Fn(&T) -> bool>(&self, filter: F) -> Vec<Uuid> {
        self.rows
            .iter()
            .filter(|(_, (_, value))| filter(value))
            .map(|(id, _)| *id)
            .collect()
    }
}

#[derive(Default)]
struct StoreState {
    schemas: Table<Schema>,
    nodes: Table<Node>,
    actions: Table<NodeAction>,
    paths: Table<NodePath>,
    rules: Table<Rule>,
    conditions: Table<Condition>,
    instances: Table<SchemaInstance>,
    node_instances: Table<NodeInstance>,
    action_instances: Table<NodeActionInstance>,
    events: Table<Event>,
    dead_letters: Table<DeadLetter>,
    code_counters: HashMap<(String, Uuid, NaiveDate), u32>,
}

impl StoreState {
    fn remove_node_cascade(&mut self, node_id: &Uuid) -> bool {
        if self.nodes.remove(node_id).is_none() {
            return false;
        }
        for id in self.actions.ids_where(|a| a.node_id == *node_id) {
            self.actions.remove(&id);
        }
        for id in self.paths.ids_where(|p| p.parent_node_id == *node_id) {
            self.paths.remove(&id);
        }
        for id in self.rules.ids_where(|r| r.parent_node_id == *node_id) {
            self.rules.remove(&id);
        }
        true
    }

    fn remove_condition_tree(&mut self, condition_id: &Uuid) -> bool {
        if self.conditions.remove(condition_id).is_none() {
            return false;
        }
        for child in self
            .conditions
            .ids_where(|c| c.parent_condition_id == Some(*condition_id))
        {
            self.remove_condition_tree(&child);
        }
        true
    }

    fn node_instance_mut(&mut self, id: &Uuid) -> Result<&mut NodeInstance> {
        self.node_instances
            .get_mut(id)
            .ok_or_else(|| FlowgateError::not_found("NodeInstance", id))
    }
}

/// In-memory storage for development, tests and single-process deployments
///
/// ## Limitations
///
/// - **Not persistent**: data is lost when the process restarts
/// - **Not distributed**: cannot be shared across processes
#[derive(Default)]
pub struct InMemoryStorage {
    state: RwLock<StoreState>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl WorkflowStorage for InMemoryStorage {
    async fn create_schema(&self, schema: Schema) -> Result<Schema> {
        let mut state = self.state.write().await;
        if state.schemas.contains(&schema.id) {
            return Err(FlowgateError::Conflict(format!("Schema {} already exists", schema.id)));
        }
        state.schemas.insert(schema.id, schema.clone());
        Ok(schema)
    }

    async fn get_schema(&self, id: &Uuid) -> Result<Option<Schema>> {
        Ok(self.state.read().await.schemas.get(id).cloned())
    }

    async fn list_schemas(&self, tenant_id: &str) -> Result<Vec<Schema>> {
        Ok(self.state.read().await.schemas.ordered(|s| s.tenant_id == tenant_id))
    }

    async fn update_schema(&self, mut schema: Schema) -> Result<Schema> {
        let mut state = self.state.write().await;
        if !state.schemas.contains(&schema.id) {
            return Err(FlowgateError::not_found("Schema", schema.id));
        }
        schema.updated_at = Utc::now();
        state.schemas.insert(schema.id, schema.clone());
        Ok(schema)
    }

    async fn delete_schema(&self, id: &Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.schemas.remove(id).is_none() {
            return Ok(false);
        }
        for node_id in state.nodes.ids_where(|n| n.schema_id == *id) {
            state.remove_node_cascade(&node_id);
        }
        Ok(true)
    }

    async fn create_node(&self, node: Node) -> Result<Node> {
        let mut state = self.state.write().await;
        if !state.schemas.contains(&node.schema_id) {
            return Err(FlowgateError::not_found("Schema", node.schema_id));
        }
        state.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    async fn get_node(&self, id: &Uuid) -> Result<Option<Node>> {
        Ok(self.state.read().await.nodes.get(id).cloned())
    }

    async fn list_nodes(&self, schema_id: &Uuid) -> Result<Vec<Node>> {
        Ok(self.state.read().await.nodes.ordered(|n| n.schema_id == *schema_id))
    }

    async fn list_child_nodes(&self, parent_node_id: &Uuid) -> Result<Vec<Node>> {
        Ok(self
            .state
            .read()
            .await
            .nodes
            .ordered(|n| n.parent_node_id == Some(*parent_node_id)))
    }

    async fn update_node(&self, node: Node) -> Result<Node> {
        let mut state = self.state.write().await;
        if !state.nodes.contains(&node.id) {
            return Err(FlowgateError::not_found("Node", node.id));
        }
        state.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    async fn delete_node(&self, id: &Uuid) -> Result<bool> {
        Ok(self.state.write().await.remove_node_cascade(id))
    }

    async fn create_node_action(&self, action: NodeAction) -> Result<NodeAction> {
        let mut state = self.state.write().await;
        if !state.nodes.contains(&action.node_id) {
            return Err(FlowgateError::not_found("Node", action.node_id));
        }
        state.actions.insert(action.id, action.clone());
        Ok(action)
    }

    async fn get_node_action(&self, id: &Uuid) -> Result<Option<NodeAction>> {
        Ok(self.state.read().await.actions.get(id).cloned())
    }

    async fn list_node_actions(&self, node_id: &Uuid) -> Result<Vec<NodeAction>> {
        let mut actions = self.state.read().await.actions.ordered(|a| a.node_id == *node_id);
        // stable sort keeps creation order among equal sequences
        actions.sort_by_key(|a| a.sequence);
        Ok(actions)
    }

    async fn update_node_action(&self, action: NodeAction) -> Result<NodeAction> {
        let mut state = self.state.write().await;
        if !state.actions.contains(&action.id) {
            return Err(FlowgateError::not_found("NodeAction", action.id));
        }
        state.actions.insert(action.id, action.clone());
        Ok(action)
    }

    async fn delete_node_action(&self, id: &Uuid) -> Result<bool> {
        Ok(self.state.write().await.actions.remove(id).is_some())
    }

    async fn create_node_path(&self, path: NodePath) -> Result<NodePath> {
        let mut state = self.state.write().await;
        for node_id in [&path.parent_node_id, &path.next_node_id] {
            if !state.nodes.contains(node_id) {
                return Err(FlowgateError::not_found("Node", node_id));
            }
        }
        state.paths.insert(path.id, path.clone());
        Ok(path)
    }

    async fn get_node_path(&self, id: &Uuid) -> Result<Option<NodePath>> {
        Ok(self.state.read().await.paths.get(id).cloned())
    }

    async fn list_node_paths(&self, parent_node_id: &Uuid) -> Result<Vec<NodePath>> {
        Ok(self
            .state
            .read()
            .await
            .paths
            .ordered(|p| p.parent_node_id == *parent_node_id))
    }

    async fn delete_node_path(&self, id: &Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.paths.remove(id).is_none() {
            return Ok(false);
        }
        for rule_id in state.rules.ids_where(|r| r.node_path_id == Some(*id)) {
            state.rules.remove(&rule_id);
        }
        Ok(true)
    }

    async fn create_rule(&self, rule: Rule) -> Result<Rule> {
        let mut state = self.state.write().await;
        if !state.nodes.contains(&rule.parent_node_id) {
            return Err(FlowgateError::not_found("Node", rule.parent_node_id));
        }
        if let Some(path_id) = rule.node_path_id {
            if !state.paths.contains(&path_id) {
                return Err(FlowgateError::not_found("NodePath", path_id));
            }
            let taken = state
                .rules
                .ordered(|r| r.node_path_id == Some(path_id) && r.id != rule.id);
            if let Some(existing) = taken.first() {
                return Err(FlowgateError::Conflict(format!(
                    "NodePath {} is already linked to rule {}",
                    path_id, existing.id
                )));
            }
        }
        state.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn get_rule(&self, id: &Uuid) -> Result<Option<Rule>> {
        Ok(self.state.read().await.rules.get(id).cloned())
    }

    async fn get_rule_by_node_path(&self, node_path_id: &Uuid) -> Result<Option<Rule>> {
        Ok(self
            .state
            .read()
            .await
            .rules
            .ordered(|r| r.node_path_id == Some(*node_path_id))
            .into_iter()
            .next())
    }

    async fn list_rules(&self, parent_node_id: &Uuid) -> Result<Vec<Rule>> {
        Ok(self
            .state
            .read()
            .await
            .rules
            .ordered(|r| r.parent_node_id == *parent_node_id))
    }

    async fn delete_rule(&self, id: &Uuid) -> Result<bool> {
        Ok(self.state.write().await.rules.remove(id).is_some())
    }

    async fn create_condition(&self, condition: Condition) -> Result<Condition> {
        let mut state = self.state.write().await;
        if let Some(parent_id) = condition.parent_condition_id {
            if !state.conditions.contains(&parent_id) {
                return Err(FlowgateError::not_found("Condition", parent_id));
            }
        }
        state.conditions.insert(condition.id, condition.clone());
        Ok(condition)
    }

    async fn get_condition(&self, id: &Uuid) -> Result<Option<Condition>> {
        Ok(self.state.read().await.conditions.get(id).cloned())
    }

    async fn list_condition_children(&self, parent_condition_id: &Uuid) -> Result<Vec<Condition>> {
        let mut children = self
            .state
            .read()
            .await
            .conditions
            .ordered(|c| c.parent_condition_id == Some(*parent_condition_id));
        children.sort_by_key(|c| c.sequence);
        Ok(children)
    }

    async fn update_condition(&self, condition: Condition) -> Result<Condition> {
        let mut state = self.state.write().await;
        if !state.conditions.contains(&condition.id) {
            return Err(FlowgateError::not_found("Condition", condition.id));
        }
        state.conditions.insert(condition.id, condition.clone());
        Ok(condition)
    }

    async fn delete_condition(&self, id: &Uuid) -> Result<bool> {
        Ok(self.state.write().await.remove_condition_tree(id))
    }

    async fn create_schema_instance(&self, instance: SchemaInstance) -> Result<SchemaInstance> {
        let mut state = self.state.write().await;
        if !state.schemas.contains(&instance.schema_id) {
            return Err(FlowgateError::not_found("Schema", instance.schema_id));
        }
        state.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn get_schema_instance(&self, id: &Uuid) -> Result<Option<SchemaInstance>> {
        Ok(self.state.read().await.instances.get(id).cloned())
    }

    async fn list_schema_instances(&self, schema_id: &Uuid) -> Result<Vec<SchemaInstance>> {
        Ok(self
            .state
            .read()
            .await
            .instances
            .ordered(|i| i.schema_id == *schema_id))
    }

    async fn update_schema_instance(&self, mut instance: SchemaInstance) -> Result<SchemaInstance> {
        let mut state = self.state.write().await;
        let stored = state
            .instances
            .get(&instance.id)
            .ok_or_else(|| FlowgateError::not_found("SchemaInstance", instance.id))?;
        if stored.version != instance.version {
            return Err(FlowgateError::ConcurrencyConflict {
                entity: "SchemaInstance",
                id: instance.id.to_string(),
                expected: instance.version,
                found: stored.version,
            });
        }
        instance.almanac = stored.almanac.clone();
        instance.version += 1;
        instance.updated_at = Utc::now();
        state.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn update_current_node_instance(
        &self,
        schema_instance_id: &Uuid,
        node_instance_id: &Uuid,
        expected_version: u64,
    ) -> Result<SchemaInstance> {
        let mut state = self.state.write().await;
        let belongs = state
            .node_instances
            .get(node_instance_id)
            .map(|ni| ni.schema_instance_id == *schema_instance_id)
            .unwrap_or(false);
        if !belongs {
            return Err(FlowgateError::not_found("NodeInstance", node_instance_id));
        }
        let instance = state
            .instances
            .get_mut(schema_instance_id)
            .ok_or_else(|| FlowgateError::not_found("SchemaInstance", schema_instance_id))?;
        if instance.version != expected_version {
            return Err(FlowgateError::ConcurrencyConflict {
                entity: "SchemaInstance",
                id: schema_instance_id.to_string(),
                expected: expected_version,
                found: instance.version,
            });
        }
        instance.current_node_instance_id = Some(*node_instance_id);
        instance.version += 1;
        instance.updated_at = Utc::now();
        Ok(instance.clone())
    }

    async fn delete_schema_instance(&self, id: &Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.instances.remove(id).is_none() {
            return Ok(false);
        }
        for ni in state.node_instances.ids_where(|ni| ni.schema_instance_id == *id) {
            state.node_instances.remove(&ni);
        }
        for ai in state.action_instances.ids_where(|ai| ai.schema_instance_id == *id) {
            state.action_instances.remove(&ai);
        }
        Ok(true)
    }

    async fn next_instance_sequence(&self, tenant_id: &str, schema_id: &Uuid, day: NaiveDate) -> Result<u32> {
        let mut state = self.state.write().await;
        let counter = state
            .code_counters
            .entry((tenant_id.to_string(), *schema_id, day))
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn get_or_create_node_instance(&self, node: &Node, schema_instance_id: &Uuid) -> Result<NodeInstance> {
        let mut state = self.state.write().await;
        let existing = state
            .node_instances
            .ordered(|ni| ni.node_id == node.id && ni.schema_instance_id == *schema_instance_id);
        if let Some(found) = existing.into_iter().next() {
            return Ok(found);
        }
        if !state.instances.contains(schema_instance_id) {
            return Err(FlowgateError::not_found("SchemaInstance", schema_instance_id));
        }

        let mut node_instance = NodeInstance::new(node, *schema_instance_id);
        if let Some(parent_node_id) = node.parent_node_id {
            node_instance.parent_node_instance_id = state
                .node_instances
                .ordered(|ni| ni.node_id == parent_node_id && ni.schema_instance_id == *schema_instance_id)
                .first()
                .map(|parent| parent.id);
        }
        // adopt children created before their parent
        for child in state.node_instances.ids_where(|ni| ni.schema_instance_id == *schema_instance_id) {
            let child_node_parent = state
                .node_instances
                .get(&child)
                .and_then(|ni| state.nodes.get(&ni.node_id))
                .and_then(|n| n.parent_node_id);
            if child_node_parent == Some(node.id) {
                if let Some(ni) = state.node_instances.get_mut(&child) {
                    ni.parent_node_instance_id = Some(node_instance.id);
                }
            }
        }
        state.node_instances.insert(node_instance.id, node_instance.clone());
        Ok(node_instance)
    }

    async fn get_node_instance(&self, id: &Uuid) -> Result<Option<NodeInstance>> {
        Ok(self.state.read().await.node_instances.get(id).cloned())
    }

    async fn find_node_instance(&self, node_id: &Uuid, schema_instance_id: &Uuid) -> Result<Option<NodeInstance>> {
        Ok(self
            .state
            .read()
            .await
            .node_instances
            .ordered(|ni| ni.node_id == *node_id && ni.schema_instance_id == *schema_instance_id)
            .into_iter()
            .next())
    }

    async fn list_node_instances(&self, schema_instance_id: &Uuid) -> Result<Vec<NodeInstance>> {
        Ok(self
            .state
            .read()
            .await
            .node_instances
            .ordered(|ni| ni.schema_instance_id == *schema_instance_id))
    }

    async fn update_node_instance(&self, mut node_instance: NodeInstance) -> Result<NodeInstance> {
        let mut state = self.state.write().await;
        let stored = state.node_instance_mut(&node_instance.id)?;
        if stored.version != node_instance.version {
            return Err(FlowgateError::ConcurrencyConflict {
                entity: "NodeInstance",
                id: node_instance.id.to_string(),
                expected: node_instance.version,
                found: stored.version,
            });
        }
        node_instance.version += 1;
        *stored = node_instance.clone();
        Ok(node_instance)
    }

    async fn set_execution_status(
        &self,
        node_instance_id: &Uuid,
        status: ExecutionStatus,
        result: Option<Value>,
    ) -> Result<NodeInstance> {
        let mut state = self.state.write().await;
        let stored = state.node_instance_mut(node_instance_id)?;
        stored.status = status;
        stored.status_updated_at = Utc::now();
        if result.is_some() {
            stored.execution_result = result;
        }
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn update_timer_tries(&self, node_instance_id: &Uuid, tries: u32, finished: bool) -> Result<NodeInstance> {
        let mut state = self.state.write().await;
        let stored = state.node_instance_mut(node_instance_id)?;
        stored.timer_tries_completed = tries;
        stored.timer_finished = finished;
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn get_or_create_node_action_instance(
        &self,
        action: &NodeAction,
        node_instance: &NodeInstance,
    ) -> Result<NodeActionInstance> {
        let mut state = self.state.write().await;
        let existing = state
            .action_instances
            .ordered(|ai| ai.action_id == action.id && ai.node_instance_id == node_instance.id);
        if let Some(found) = existing.into_iter().next() {
            return Ok(found);
        }
        if !state.node_instances.contains(&node_instance.id) {
            return Err(FlowgateError::not_found("NodeInstance", node_instance.id));
        }
        let instance = NodeActionInstance::materialize(action, node_instance);
        state.action_instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn list_node_action_instances(&self, node_instance_id: &Uuid) -> Result<Vec<NodeActionInstance>> {
        let mut instances = self
            .state
            .read()
            .await
            .action_instances
            .ordered(|ai| ai.node_instance_id == *node_instance_id);
        instances.sort_by_key(|ai| ai.sequence);
        Ok(instances)
    }

    async fn update_node_action_instance(&self, instance: NodeActionInstance) -> Result<NodeActionInstance> {
        let mut state = self.state.write().await;
        if !state.action_instances.contains(&instance.id) {
            return Err(FlowgateError::not_found("NodeActionInstance", instance.id));
        }
        state.action_instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn get_almanac_facts(&self, schema_instance_id: &Uuid) -> Result<Vec<AlmanacFact>> {
        self.state
            .read()
            .await
            .instances
            .get(schema_instance_id)
            .map(|instance| instance.almanac.clone())
            .ok_or_else(|| FlowgateError::not_found("SchemaInstance", schema_instance_id))
    }

    async fn update_almanac_facts(&self, schema_instance_id: &Uuid, facts: Vec<AlmanacFact>) -> Result<()> {
        let mut state = self.state.write().await;
        let instance = state
            .instances
            .get_mut(schema_instance_id)
            .ok_or_else(|| FlowgateError::not_found("SchemaInstance", schema_instance_id))?;
        instance.almanac = facts;
        Ok(())
    }

    async fn create_event(&self, event: Event) -> Result<Event> {
        self.state.write().await.events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn get_event(&self, id: &Uuid) -> Result<Option<Event>> {
        Ok(self.state.read().await.events.get(id).cloned())
    }

    async fn mark_event_handled(&self, id: &Uuid) -> Result<Event> {
        let mut state = self.state.write().await;
        let event = state
            .events
            .get_mut(id)
            .ok_or_else(|| FlowgateError::not_found("Event", id))?;
        event.mark_handled();
        Ok(event.clone())
    }

    async fn list_events(&self, tenant_id: &str) -> Result<Vec<Event>> {
        Ok(self.state.read().await.events.ordered(|e| e.tenant_id == tenant_id))
    }

    async fn record_dead_letter(&self, dead_letter: DeadLetter) -> Result<DeadLetter> {
        self.state
            .write()
            .await
            .dead_letters
            .insert(dead_letter.id, dead_letter.clone());
        Ok(dead_letter)
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.state.read().await.dead_letters.ordered(|_| true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeType, Schema};

    async fn seeded() -> (InMemoryStorage, Schema, Node, SchemaInstance) {
        let storage = InMemoryStorage::new();
        let schema = storage.create_schema(Schema::new("tenant", "flow")).await.unwrap();
        let node = storage
            .create_node(Node::new(schema.id, NodeType::ExecutionNode, "start"))
            .await
            .unwrap();
        let instance = storage
            .create_schema_instance(SchemaInstance::new(&schema, "E-240101-001".into(), vec![]))
            .await
            .unwrap();
        (storage, schema, node, instance)
    }

    #[tokio::test]
    async fn test_get_or_create_node_instance_is_idempotent() {
        let (storage, _, node, instance) = seeded().await;

        let first = storage.get_or_create_node_instance(&node, &instance.id).await.unwrap();
        let second = storage.get_or_create_node_instance(&node, &instance.id).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(storage.list_node_instances(&instance.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rule_path_exclusivity() {
        let (storage, schema, node, _) = seeded().await;
        let target = storage
            .create_node(Node::new(schema.id, NodeType::ExecutionNode, "next"))
            .await
            .unwrap();
        let path = storage
            .create_node_path(NodePath::new(node.id, target.id, "go"))
            .await
            .unwrap();

        let original = storage
            .create_rule(Rule::new(node.id, Uuid::new_v4()).for_path(path.id))
            .await
            .unwrap();
        let clash = storage
            .create_rule(Rule::new(node.id, Uuid::new_v4()).for_path(path.id))
            .await;

        assert!(matches!(clash, Err(FlowgateError::Conflict(_))));
        let linked = storage.get_rule_by_node_path(&path.id).await.unwrap().unwrap();
        assert_eq!(linked.id, original.id);
        assert_eq!(storage.list_rules(&node.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_versioned_instance_update_detects_lost_update() {
        let (storage, _, _, instance) = seeded().await;

        let stale = instance.clone();
        let updated = storage.update_schema_instance(instance).await.unwrap();
        assert_eq!(updated.version, 1);

        let result = storage.update_schema_instance(stale).await;
        assert!(matches!(
            result,
            Err(FlowgateError::ConcurrencyConflict { expected: 0, found: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_instance_update_keeps_almanac() {
        let (storage, _, _, instance) = seeded().await;
        storage
            .update_almanac_facts(
                &instance.id,
                vec![AlmanacFact { name: "x".into(), data: serde_json::json!(1) }],
            )
            .await
            .unwrap();

        storage.update_schema_instance(instance.clone()).await.unwrap();
        assert_eq!(storage.get_almanac_facts(&instance.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_schema_cascades_to_nodes() {
        let (storage, schema, node, _) = seeded().await;
        storage
            .create_node_action(NodeAction::new(node.id, crate::models::ActionType::Continue, 1))
            .await
            .unwrap();

        assert!(storage.delete_schema(&schema.id).await.unwrap());
        assert!(storage.get_node(&node.id).await.unwrap().is_none());
        assert!(storage.list_node_actions(&node.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_instance_sequence_per_day() {
        let storage = InMemoryStorage::new();
        let schema_id = Uuid::new_v4();
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let next_day = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();

        assert_eq!(storage.next_instance_sequence("t", &schema_id, day).await.unwrap(), 1);
        assert_eq!(storage.next_instance_sequence("t", &schema_id, day).await.unwrap(), 2);
        assert_eq!(storage.next_instance_sequence("t", &schema_id, next_day).await.unwrap(), 1);
        assert_eq!(storage.next_instance_sequence("u", &schema_id, day).await.unwrap(), 1);
    }
}
