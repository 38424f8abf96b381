// Read helpers over the persisted schema graph

//! # Graph Accessor
//!
//! Read-only traversal over Schema → Node → NodePath/Rule → Condition, plus
//! the lazy materialisation of node action instances for a node instance.
//! Lookups that must succeed return `NotFound` errors; the schema engine
//! turns missing nodes into `GraphIntegrity` errors during traversal.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::engine::storage::WorkflowStorage;
use crate::models::{
    Condition, Node, NodeAction, NodeActionInstance, NodeInstance, NodePath, NodeType, Rule, Schema,
};
use crate::{FlowgateError, Result};

/// An outgoing path together with the rule gating it
#[derive(Debug, Clone, Serialize)]
pub struct PathRoute {
    pub path: NodePath,
    pub rule: Option<Rule>,
}

/// A node with its relations loaded
#[derive(Debug, Clone, Serialize)]
pub struct NodeGraph {
    pub node: Node,
    pub schema: Schema,
    pub parent: Option<Node>,
    pub children: Vec<Node>,
    pub actions: Vec<NodeAction>,
    pub paths: Vec<PathRoute>,
}

#[derive(Clone)]
pub struct GraphAccessor {
    storage: Arc<dyn WorkflowStorage>,
}

impl GraphAccessor {
    pub fn new(storage: Arc<dyn WorkflowStorage>) -> Self {
        Self { storage }
    }

    pub async fn schema(&self, id: &Uuid) -> Result<Schema> {
        self.storage
            .get_schema(id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("Schema", id))
    }

    pub async fn node(&self, id: &Uuid) -> Result<Node> {
        self.storage
            .get_node(id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("Node", id))
    }

    pub async fn rule(&self, id: &Uuid) -> Result<Rule> {
        self.storage
            .get_rule(id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("Rule", id))
    }

    pub async fn condition(&self, id: &Uuid) -> Result<Condition> {
        self.storage
            .get_condition(id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("Condition", id))
    }

    pub async fn condition_children(&self, id: &Uuid) -> Result<Vec<Condition>> {
        self.storage.list_condition_children(id).await
    }

    pub async fn node_with_relations(&self, id: &Uuid) -> Result<NodeGraph> {
        let node = self.node(id).await?;
        let schema = self.schema(&node.schema_id).await?;
        let parent = match node.parent_node_id {
            Some(parent_id) => self.storage.get_node(&parent_id).await?,
            None => None,
        };
        Ok(NodeGraph {
            children: self.storage.list_child_nodes(id).await?,
            actions: self.storage.list_node_actions(id).await?,
            paths: self.node_paths(id).await?,
            node,
            schema,
            parent,
        })
    }

    /// Generic (non path) actions of a node in sequence order
    pub async fn node_actions(&self, node_id: &Uuid) -> Result<Vec<NodeAction>> {
        Ok(self
            .storage
            .list_node_actions(node_id)
            .await?
            .into_iter()
            .filter(|action| !action.is_path_action)
            .collect())
    }

    /// Outgoing paths in creation order, each with its gating rule
    pub async fn node_paths(&self, node_id: &Uuid) -> Result<Vec<PathRoute>> {
        let paths = self.storage.list_node_paths(node_id).await?;
        let mut routes = Vec::with_capacity(paths.len());
        for path in paths {
            let rule = self.storage.get_rule_by_node_path(&path.id).await?;
            routes.push(PathRoute { path, rule });
        }
        Ok(routes)
    }

    /// Action instances for every generic action of the node.
    ///
    /// For YesNo nodes the yes and no path action instances are ensured too,
    /// whichever branch is eventually taken.
    pub async fn get_or_create_node_action_instances(
        &self,
        node: &Node,
        node_instance: &NodeInstance,
    ) -> Result<Vec<NodeActionInstance>> {
        for action in self.node_actions(&node.id).await? {
            self.storage
                .get_or_create_node_action_instance(&action, node_instance)
                .await?;
        }
        if node.node_type == NodeType::YesNoNode {
            for action_id in [node.yes_action_id, node.no_action_id].into_iter().flatten() {
                self.get_or_create_node_action_instance(&action_id, node_instance)
                    .await?;
            }
        }
        self.storage.list_node_action_instances(&node_instance.id).await
    }

    pub async fn get_or_create_node_action_instance(
        &self,
        action_id: &Uuid,
        node_instance: &NodeInstance,
    ) -> Result<NodeActionInstance> {
        let action = self
            .storage
            .get_node_action(action_id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("NodeAction", action_id))?;
        self.storage
            .get_or_create_node_action_instance(&action, node_instance)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use crate::models::{ActionType, SchemaInstance};

    #[tokio::test]
    async fn test_yes_no_action_instances_are_ensured() {
        let storage: Arc<dyn WorkflowStorage> = Arc::new(InMemoryStorage::new());
        let graph = GraphAccessor::new(storage.clone());
        let schema = storage.create_schema(Schema::new("tenant", "yes-no")).await.unwrap();
        let mut node = storage
            .create_node(Node::new(schema.id, NodeType::YesNoNode, "confirm"))
            .await
            .unwrap();

        let generic = storage
            .create_node_action(NodeAction::new(node.id, ActionType::Continue, 1))
            .await
            .unwrap();
        let yes = storage
            .create_node_action(NodeAction::new(node.id, ActionType::Continue, 2).as_path_action(None))
            .await
            .unwrap();
        let no = storage
            .create_node_action(NodeAction::new(node.id, ActionType::Exit, 3).as_path_action(None))
            .await
            .unwrap();
        node.yes_action_id = Some(yes.id);
        node.no_action_id = Some(no.id);
        let node = storage.update_node(node).await.unwrap();

        let instance = storage
            .create_schema_instance(SchemaInstance::new(&schema, "E-240101-001".into(), vec![]))
            .await
            .unwrap();
        let node_instance = storage.get_or_create_node_instance(&node, &instance.id).await.unwrap();

        let first = graph
            .get_or_create_node_action_instances(&node, &node_instance)
            .await
            .unwrap();
        let again = graph
            .get_or_create_node_action_instances(&node, &node_instance)
            .await
            .unwrap();

        let ids: Vec<Uuid> = first.iter().map(|ai| ai.action_id).collect();
        assert_eq!(ids, vec![generic.id, yes.id, no.id]);
        assert_eq!(again.len(), 3);
        assert_eq!(graph.node_actions(&node.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_paths_come_with_rules_in_creation_order() {
        let storage: Arc<dyn WorkflowStorage> = Arc::new(InMemoryStorage::new());
        let graph = GraphAccessor::new(storage.clone());
        let schema = storage.create_schema(Schema::new("tenant", "paths")).await.unwrap();
        let from = storage
            .create_node(Node::new(schema.id, NodeType::QuestionNode, "ask"))
            .await
            .unwrap();
        let a = storage
            .create_node(Node::new(schema.id, NodeType::ExecutionNode, "a"))
            .await
            .unwrap();
        let b = storage
            .create_node(Node::new(schema.id, NodeType::ExecutionNode, "b"))
            .await
            .unwrap();
        let gated = storage.create_node_path(NodePath::new(from.id, a.id, "gated")).await.unwrap();
        storage.create_node_path(NodePath::new(from.id, b.id, "default")).await.unwrap();
        storage
            .create_rule(Rule::new(from.id, Uuid::new_v4()).for_path(gated.id))
            .await
            .unwrap();

        let routes = graph.node_paths(&from.id).await.unwrap();
        assert_eq!(routes.len(), 2);
        assert!(routes[0].rule.is_some());
        assert!(routes[1].rule.is_none());

        let relations = graph.node_with_relations(&from.id).await.unwrap();
        assert_eq!(relations.schema.id, schema.id);
        assert_eq!(relations.paths.len(), 2);
    }
}
