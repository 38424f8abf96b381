// Authoring service - validated CRUD over the schema graph

//! # Authoring
//!
//! Every create/update of a schema graph element goes through
//! [`AuthoringService`], which checks tenant ownership and graph
//! references before touching storage:
//!
//! - nodes, paths, actions and rules must stay inside one schema
//! - a path connects two nodes of the same schema
//! - a rule's condition must be a root condition, and a path holds at most one rule
//! - a condition's parent must be a composition
//!
//! Elements of another tenant are reported as `NotFound`.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::engine::storage::WorkflowStorage;
use crate::models::{
    ActionType, AlmanacFact, Condition, DeadLetter, Event, LogicalOperator,
    Node, NodeAction, NodeActionInstance, NodeInstance, NodePath, NodeType, OperatorType, Rule,
    Schema, SchemaInstance,
};
use crate::{FlowgateError, Result};

/// A condition with its nested children
#[derive(Debug, Clone, Serialize)]
pub struct ConditionTree {
    #[serde(flatten)]
    pub condition: Condition,
    pub children: Vec<ConditionTree>,
}

#[derive(Clone)]
pub struct AuthoringService {
    storage: Arc<dyn WorkflowStorage>,
}

impl AuthoringService {
    pub fn new(storage: Arc<dyn WorkflowStorage>) -> Self {
        Self { storage }
    }

    // Schemas

    pub async fn create_schema(&self, tenant_id: &str, mut schema: Schema) -> Result<Schema> {
        schema.tenant_id = tenant_id.to_string();
        validate_schema(&schema)?;
        if schema.root_node_id.is_some() {
            return Err(FlowgateError::Validation(
                "root_node_id can only be set once the node exists".to_string(),
            ));
        }
        if let Some(parent_id) = schema.parent_schema_id {
            self.schema(tenant_id, &parent_id).await?;
        }
        let schema = self.storage.create_schema(schema).await?;
        info!(tenant_id, schema_id = %schema.id, name = %schema.name, "Schema created");
        Ok(schema)
    }

    pub async fn schema(&self, tenant_id: &str, id: &Uuid) -> Result<Schema> {
        self.storage
            .get_schema(id)
            .await?
            .filter(|schema| schema.tenant_id == tenant_id)
            .ok_or_else(|| FlowgateError::not_found("Schema", id))
    }

    pub async fn list_schemas(&self, tenant_id: &str) -> Result<Vec<Schema>> {
        self.storage.list_schemas(tenant_id).await
    }

    pub async fn update_schema(&self, tenant_id: &str, mut schema: Schema) -> Result<Schema> {
        let existing = self.schema(tenant_id, &schema.id).await?;
        schema.tenant_id = existing.tenant_id;
        schema.created_at = existing.created_at;
        validate_schema(&schema)?;
        if let Some(root) = schema.root_node_id {
            self.node_of_schema(&root, &schema.id).await?;
        }
        if schema.parent_schema_id == Some(schema.id) {
            return Err(FlowgateError::Validation("a schema cannot be its own parent".to_string()));
        }
        self.storage.update_schema(schema).await
    }

    pub async fn delete_schema(&self, tenant_id: &str, id: &Uuid) -> Result<bool> {
        self.schema(tenant_id, id).await?;
        self.storage.delete_schema(id).await
    }

    // Nodes

    /// Create a node; the first node of a schema becomes its root
    pub async fn create_node(&self, tenant_id: &str, node: Node) -> Result<Node> {
        let mut schema = self.schema(tenant_id, &node.schema_id).await?;
        self.validate_node(&node).await?;
        let node = self.storage.create_node(node).await?;
        if schema.root_node_id.is_none() {
            schema.root_node_id = Some(node.id);
            self.storage.update_schema(schema).await?;
        }
        Ok(node)
    }

    pub async fn node(&self, tenant_id: &str, id: &Uuid) -> Result<Node> {
        let node = self
            .storage
            .get_node(id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("Node", id))?;
        self.schema(tenant_id, &node.schema_id)
            .await
            .map_err(|_| FlowgateError::not_found("Node", id))?;
        Ok(node)
    }

    pub async fn list_nodes(&self, tenant_id: &str, schema_id: &Uuid) -> Result<Vec<Node>> {
        self.schema(tenant_id, schema_id).await?;
        self.storage.list_nodes(schema_id).await
    }

    pub async fn update_node(&self, tenant_id: &str, mut node: Node) -> Result<Node> {
        let existing = self.node(tenant_id, &node.id).await?;
        node.schema_id = existing.schema_id;
        node.created_at = existing.created_at;
        self.validate_node(&node).await?;
        self.storage.update_node(node).await
    }

    pub async fn delete_node(&self, tenant_id: &str, id: &Uuid) -> Result<bool> {
        let node = self.node(tenant_id, id).await?;
        let mut schema = self.schema(tenant_id, &node.schema_id).await?;
        let deleted = self.storage.delete_node(id).await?;
        if schema.root_node_id == Some(node.id) {
            schema.root_node_id = None;
            self.storage.update_schema(schema).await?;
        }
        Ok(deleted)
    }

    async fn validate_node(&self, node: &Node) -> Result<()> {
        if node.name.trim().is_empty() {
            return Err(FlowgateError::Validation("node name must not be empty".to_string()));
        }
        for reference in [
            node.next_node_id,
            node.parent_node_id,
            node.next_node_id_on_success,
            node.next_node_id_on_timeout,
        ]
        .into_iter()
        .flatten()
        {
            self.node_of_schema(&reference, &node.schema_id).await?;
        }
        if node.parent_node_id == Some(node.id) {
            return Err(FlowgateError::Validation("a node cannot be its own parent".to_string()));
        }
        for action_id in [node.yes_action_id, node.no_action_id].into_iter().flatten() {
            let action = self
                .storage
                .get_node_action(&action_id)
                .await?
                .ok_or_else(|| FlowgateError::not_found("NodeAction", action_id))?;
            if action.node_id != node.id || !action.is_path_action {
                return Err(FlowgateError::Validation(format!(
                    "action {} is not a path action of node {}",
                    action_id, node.id
                )));
            }
        }
        if let Some(rule_id) = node.rule_id {
            let rule = self
                .storage
                .get_rule(&rule_id)
                .await?
                .ok_or_else(|| FlowgateError::not_found("Rule", rule_id))?;
            if rule.parent_node_id != node.id {
                return Err(FlowgateError::Validation(format!(
                    "rule {} does not belong to node {}",
                    rule_id, node.id
                )));
            }
        }
        match node.node_type {
            NodeType::QuestionNode if node.question.is_none() => Err(FlowgateError::Validation(
                "a QuestionNode needs a question".to_string(),
            )),
            NodeType::TimerNode if node.timer_seconds == 0 => Err(FlowgateError::Validation(
                "a TimerNode needs timer_seconds greater than zero".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn node_of_schema(&self, node_id: &Uuid, schema_id: &Uuid) -> Result<Node> {
        let node = self
            .storage
            .get_node(node_id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("Node", node_id))?;
        if node.schema_id != *schema_id {
            return Err(FlowgateError::Validation(format!(
                "node {} belongs to another schema",
                node_id
            )));
        }
        Ok(node)
    }

    // Node actions

    pub async fn create_node_action(&self, tenant_id: &str, action: NodeAction) -> Result<NodeAction> {
        let node = self.node(tenant_id, &action.node_id).await?;
        self.validate_action(&action, &node).await?;
        self.storage.create_node_action(action).await
    }

    pub async fn node_action(&self, tenant_id: &str, id: &Uuid) -> Result<NodeAction> {
        let action = self
            .storage
            .get_node_action(id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("NodeAction", id))?;
        self.node(tenant_id, &action.node_id)
            .await
            .map_err(|_| FlowgateError::not_found("NodeAction", id))?;
        Ok(action)
    }

    pub async fn list_node_actions(&self, tenant_id: &str, node_id: &Uuid) -> Result<Vec<NodeAction>> {
        self.node(tenant_id, node_id).await?;
        self.storage.list_node_actions(node_id).await
    }

    pub async fn update_node_action(&self, tenant_id: &str, mut action: NodeAction) -> Result<NodeAction> {
        let existing = self.node_action(tenant_id, &action.id).await?;
        action.node_id = existing.node_id;
        action.created_at = existing.created_at;
        let node = self.node(tenant_id, &action.node_id).await?;
        self.validate_action(&action, &node).await?;
        self.storage.update_node_action(action).await
    }

    pub async fn delete_node_action(&self, tenant_id: &str, id: &Uuid) -> Result<bool> {
        self.node_action(tenant_id, id).await?;
        self.storage.delete_node_action(id).await
    }

    async fn validate_action(&self, action: &NodeAction, node: &Node) -> Result<()> {
        if let ActionType::Unsupported(name) = &action.action_type {
            return Err(FlowgateError::Validation(format!("unknown action type '{}'", name)));
        }
        if let Some(next) = action.next_node_id {
            self.node_of_schema(&next, &node.schema_id).await?;
        }
        let mut names = HashSet::new();
        for param in &action.input {
            if !names.insert(param.name.as_str()) {
                return Err(FlowgateError::Validation(format!(
                    "duplicate input parameter '{}'",
                    param.name
                )));
            }
        }
        Ok(())
    }

    // Node paths

    pub async fn create_node_path(&self, tenant_id: &str, path: NodePath) -> Result<NodePath> {
        let from = self.node(tenant_id, &path.parent_node_id).await?;
        self.node_of_schema(&path.next_node_id, &from.schema_id).await?;
        if path.name.trim().is_empty() {
            return Err(FlowgateError::Validation("path name must not be empty".to_string()));
        }
        self.storage.create_node_path(path).await
    }

    pub async fn node_path(&self, tenant_id: &str, id: &Uuid) -> Result<NodePath> {
        let path = self
            .storage
            .get_node_path(id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("NodePath", id))?;
        self.node(tenant_id, &path.parent_node_id)
            .await
            .map_err(|_| FlowgateError::not_found("NodePath", id))?;
        Ok(path)
    }

    pub async fn list_node_paths(&self, tenant_id: &str, node_id: &Uuid) -> Result<Vec<NodePath>> {
        self.node(tenant_id, node_id).await?;
        self.storage.list_node_paths(node_id).await
    }

    pub async fn delete_node_path(&self, tenant_id: &str, id: &Uuid) -> Result<bool> {
        self.node_path(tenant_id, id).await?;
        self.storage.delete_node_path(id).await
    }

    // Rules

    pub async fn create_rule(&self, tenant_id: &str, rule: Rule) -> Result<Rule> {
        self.node(tenant_id, &rule.parent_node_id).await?;
        let condition = self
            .storage
            .get_condition(&rule.condition_id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("Condition", rule.condition_id))?;
        if condition.parent_condition_id.is_some() {
            return Err(FlowgateError::Validation(format!(
                "condition {} is nested and cannot back a rule",
                condition.id
            )));
        }
        if let Some(path_id) = rule.node_path_id {
            let path = self.node_path(tenant_id, &path_id).await?;
            if path.parent_node_id != rule.parent_node_id {
                return Err(FlowgateError::Validation(format!(
                    "path {} does not leave node {}",
                    path_id, rule.parent_node_id
                )));
            }
        }
        self.storage.create_rule(rule).await
    }

    pub async fn rule(&self, tenant_id: &str, id: &Uuid) -> Result<Rule> {
        let rule = self
            .storage
            .get_rule(id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("Rule", id))?;
        self.node(tenant_id, &rule.parent_node_id)
            .await
            .map_err(|_| FlowgateError::not_found("Rule", id))?;
        Ok(rule)
    }

    pub async fn list_rules(&self, tenant_id: &str, node_id: &Uuid) -> Result<Vec<Rule>> {
        self.node(tenant_id, node_id).await?;
        self.storage.list_rules(node_id).await
    }

    pub async fn delete_rule(&self, tenant_id: &str, id: &Uuid) -> Result<bool> {
        self.rule(tenant_id, id).await?;
        self.storage.delete_rule(id).await
    }

    // Conditions

    pub async fn create_condition(&self, condition: Condition) -> Result<Condition> {
        self.validate_condition(&condition).await?;
        self.storage.create_condition(condition).await
    }

    pub async fn condition(&self, id: &Uuid) -> Result<Condition> {
        self.storage
            .get_condition(id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("Condition", id))
    }

    pub async fn update_condition(&self, mut condition: Condition) -> Result<Condition> {
        let existing = self.condition(&condition.id).await?;
        condition.parent_condition_id = existing.parent_condition_id;
        condition.created_at = existing.created_at;
        self.validate_condition(&condition).await?;
        if condition.operator_type != OperatorType::Composition
            && !self.storage.list_condition_children(&condition.id).await?.is_empty()
        {
            return Err(FlowgateError::Validation(
                "a condition with children must stay a composition".to_string(),
            ));
        }
        self.storage.update_condition(condition).await
    }

    pub async fn delete_condition(&self, id: &Uuid) -> Result<bool> {
        self.storage.delete_condition(id).await
    }

    /// The condition and all of its descendants
    pub fn condition_tree<'a>(&'a self, id: &'a Uuid) -> BoxFuture<'a, Result<ConditionTree>> {
        async move {
            let condition = self.condition(id).await?;
            let mut children = Vec::new();
            for child in self.storage.list_condition_children(id).await? {
                children.push(self.condition_tree(&child.id).await?);
            }
            Ok(ConditionTree { condition, children })
        }
        .boxed()
    }

    async fn validate_condition(&self, condition: &Condition) -> Result<()> {
        match condition.operator_type {
            OperatorType::Logical => {
                if let LogicalOperator::Unsupported(name) = &condition.logical_operator {
                    return Err(FlowgateError::Validation(format!("unknown logical operator '{}'", name)));
                }
                if condition.first_operand.is_none() {
                    return Err(FlowgateError::Validation(
                        "a logical condition needs a first operand".to_string(),
                    ));
                }
                let needs_second = !matches!(
                    condition.logical_operator,
                    LogicalOperator::IsTrue
                        | LogicalOperator::IsFalse
                        | LogicalOperator::Exists
                        | LogicalOperator::None
                );
                if needs_second && condition.second_operand.is_none() {
                    return Err(FlowgateError::Validation(format!(
                        "{:?} needs a second operand",
                        condition.logical_operator
                    )));
                }
                if condition.logical_operator == LogicalOperator::Between
                    && condition.third_operand.is_none()
                {
                    return Err(FlowgateError::Validation("Between needs a third operand".to_string()));
                }
            }
            OperatorType::Composition => {
                if condition.first_operand.is_some() || condition.second_operand.is_some() {
                    return Err(FlowgateError::Validation(
                        "a composition combines child conditions and takes no operands".to_string(),
                    ));
                }
            }
            OperatorType::Mathematical | OperatorType::Iterate => {
                return Err(FlowgateError::Validation(format!(
                    "operator type {:?} cannot be evaluated",
                    condition.operator_type
                )));
            }
        }

        if let Some(parent_id) = condition.parent_condition_id {
            let parent = self.condition(&parent_id).await?;
            if parent.operator_type != OperatorType::Composition {
                return Err(FlowgateError::Validation(format!(
                    "parent condition {} is not a composition",
                    parent_id
                )));
            }
        }
        Ok(())
    }

    // Schema instances (read side)

    pub async fn schema_instance(&self, tenant_id: &str, id: &Uuid) -> Result<SchemaInstance> {
        self.storage
            .get_schema_instance(id)
            .await?
            .filter(|instance| instance.tenant_id == tenant_id)
            .ok_or_else(|| FlowgateError::not_found("SchemaInstance", id))
    }

    pub async fn list_schema_instances(&self, tenant_id: &str, schema_id: &Uuid) -> Result<Vec<SchemaInstance>> {
        self.schema(tenant_id, schema_id).await?;
        self.storage.list_schema_instances(schema_id).await
    }

    pub async fn node_instances(&self, tenant_id: &str, schema_instance_id: &Uuid) -> Result<Vec<NodeInstance>> {
        self.schema_instance(tenant_id, schema_instance_id).await?;
        self.storage.list_node_instances(schema_instance_id).await
    }

    pub async fn node_action_instances(
        &self,
        tenant_id: &str,
        node_instance_id: &Uuid,
    ) -> Result<Vec<NodeActionInstance>> {
        let node_instance = self
            .storage
            .get_node_instance(node_instance_id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("NodeInstance", node_instance_id))?;
        self.schema_instance(tenant_id, &node_instance.schema_instance_id).await?;
        self.storage.list_node_action_instances(node_instance_id).await
    }

    pub async fn almanac(&self, tenant_id: &str, schema_instance_id: &Uuid) -> Result<Vec<AlmanacFact>> {
        self.schema_instance(tenant_id, schema_instance_id).await?;
        self.storage.get_almanac_facts(schema_instance_id).await
    }

    pub async fn event(&self, tenant_id: &str, id: &Uuid) -> Result<Event> {
        self.storage
            .get_event(id)
            .await?
            .filter(|event| event.tenant_id == tenant_id)
            .ok_or_else(|| FlowgateError::not_found("Event", id))
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.storage.list_dead_letters().await
    }
}

fn validate_schema(schema: &Schema) -> Result<()> {
    if schema.tenant_id.trim().is_empty() {
        return Err(FlowgateError::Validation("tenant_id must not be empty".to_string()));
    }
    if schema.name.trim().is_empty() {
        return Err(FlowgateError::Validation("schema name must not be empty".to_string()));
    }
    let mut names = HashSet::new();
    for param in &schema.context_params {
        if !names.insert(param.name.as_str()) {
            return Err(FlowgateError::Validation(format!(
                "duplicate context parameter '{}'",
                param.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use crate::models::{CompositionOperator, ContextParam, DataType, Operand};
    use serde_json::json;

    fn service() -> AuthoringService {
        AuthoringService::new(Arc::new(InMemoryStorage::new()))
    }

    fn equal_yes() -> Condition {
        Condition::logical(
            LogicalOperator::Equal,
            Operand::named("ChosenOption", DataType::Text),
            Some(Operand::literal(DataType::Text, json!("Yes"))),
        )
    }

    #[tokio::test]
    async fn test_first_node_becomes_root() {
        let authoring = service();
        let schema = authoring.create_schema("acme", Schema::new("ignored", "Intake")).await.unwrap();
        assert_eq!(schema.tenant_id, "acme");

        let root = authoring
            .create_node("acme", Node::new(schema.id, NodeType::ExecutionNode, "start"))
            .await
            .unwrap();
        authoring
            .create_node("acme", Node::new(schema.id, NodeType::ExecutionNode, "next"))
            .await
            .unwrap();

        assert_eq!(authoring.schema("acme", &schema.id).await.unwrap().root_node_id, Some(root.id));
        assert!(matches!(
            authoring.schema("other", &schema.id).await,
            Err(FlowgateError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_context_params_are_rejected() {
        let authoring = service();
        let schema = Schema::new("acme", "Intake")
            .with_context_param(ContextParam::new("Phone", DataType::Phonenumber))
            .with_context_param(ContextParam::new("Phone", DataType::Text));
        assert!(matches!(
            authoring.create_schema("acme", schema).await,
            Err(FlowgateError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_cross_schema_references_are_rejected() {
        let authoring = service();
        let a = authoring.create_schema("acme", Schema::new("acme", "a")).await.unwrap();
        let b = authoring.create_schema("acme", Schema::new("acme", "b")).await.unwrap();
        let in_a = authoring
            .create_node("acme", Node::new(a.id, NodeType::ExecutionNode, "a1"))
            .await
            .unwrap();
        let in_b = authoring
            .create_node("acme", Node::new(b.id, NodeType::ExecutionNode, "b1"))
            .await
            .unwrap();

        let crossing = Node::new(a.id, NodeType::ExecutionNode, "a2").with_next(in_b.id);
        assert!(matches!(
            authoring.create_node("acme", crossing).await,
            Err(FlowgateError::Validation(_))
        ));
        assert!(matches!(
            authoring
                .create_node_path("acme", NodePath::new(in_a.id, in_b.id, "jump"))
                .await,
            Err(FlowgateError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_rule_conflict_keeps_original_binding() {
        let authoring = service();
        let schema = authoring.create_schema("acme", Schema::new("acme", "q")).await.unwrap();
        let from = authoring
            .create_node("acme", Node::new(schema.id, NodeType::ExecutionNode, "from"))
            .await
            .unwrap();
        let to = authoring
            .create_node("acme", Node::new(schema.id, NodeType::ExecutionNode, "to"))
            .await
            .unwrap();
        let path = authoring
            .create_node_path("acme", NodePath::new(from.id, to.id, "go"))
            .await
            .unwrap();
        let condition = authoring.create_condition(equal_yes()).await.unwrap();
        let other = authoring.create_condition(equal_yes()).await.unwrap();

        let first = authoring
            .create_rule("acme", Rule::new(from.id, condition.id).for_path(path.id))
            .await
            .unwrap();
        let second = authoring
            .create_rule("acme", Rule::new(from.id, other.id).for_path(path.id))
            .await;

        assert!(matches!(second, Err(FlowgateError::Conflict(_))));
        let rules = authoring.list_rules("acme", &from.id).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, first.id);
        assert_eq!(rules[0].condition_id, condition.id);
    }

    #[tokio::test]
    async fn test_condition_validation_and_tree() {
        let authoring = service();
        let missing_second = Condition::logical(
            LogicalOperator::GreaterThan,
            Operand::literal(DataType::Integer, json!(1)),
            None,
        );
        assert!(matches!(
            authoring.create_condition(missing_second).await,
            Err(FlowgateError::Validation(_))
        ));

        let root = authoring
            .create_condition(Condition::composition(CompositionOperator::And))
            .await
            .unwrap();
        let leaf = authoring
            .create_condition(equal_yes().child_of(root.id, 1))
            .await
            .unwrap();
        assert!(matches!(
            authoring.create_condition(equal_yes().child_of(leaf.id, 1)).await,
            Err(FlowgateError::Validation(_))
        ));

        let tree = authoring.condition_tree(&root.id).await.unwrap();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].condition.id, leaf.id);

        let node = Node::new(Uuid::new_v4(), NodeType::ExecutionNode, "n");
        assert!(authoring.create_rule("acme", Rule::new(node.id, leaf.id)).await.is_err());
    }
}
