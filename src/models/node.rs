// Node domain models - vertices of the workflow graph

//! # Node Models
//!
//! Nodes are the vertices of a schema's execution graph. Each node has a
//! [`NodeType`] that decides how the engine leaves it:
//!
//! - `ExecutionNode`: straight-line, follows `next_node_id`
//! - `QuestionNode`: picks a `NodePath` from the user's chosen option
//! - `YesNoNode`: a rule decides between the yes and the no path action
//! - `ListeningNode`: waits for any user message (optionally gated by its rule)
//! - `TimerNode`: re-checked by the timer handler after `timer_seconds`
//!
//! `parent_node_id` describes the authoring tree and is independent of the
//! execution edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    ExecutionNode,
    QuestionNode,
    ListeningNode,
    YesNoNode,
    #[serde(alias = "WaitNode")]
    TimerNode,
}

impl NodeType {
    /// Nodes that cannot be left without input carried by an event
    pub fn needs_input(&self) -> bool {
        matches!(
            self,
            NodeType::QuestionNode | NodeType::YesNoNode | NodeType::ListeningNode
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionResponseType {
    SingleChoice,
    MultiChoice,
    Text,
    Integer,
    Float,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub text: String,
    pub sequence: u32,
}

/// Question attached 1:1 to a `QuestionNode`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    pub response_type: QuestionResponseType,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
}

impl Question {
    /// Options sorted by their sequence
    pub fn ordered_options(&self) -> Vec<&QuestionOption> {
        let mut options: Vec<&QuestionOption> = self.options.iter().collect();
        options.sort_by_key(|option| option.sequence);
        options
    }

    pub fn option_by_sequence(&self, sequence: u32) -> Option<&QuestionOption> {
        self.options.iter().find(|option| option.sequence == sequence)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub schema_id: Uuid,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Authoring hierarchy parent
    #[serde(default)]
    pub parent_node_id: Option<Uuid>,

    /// Linear successor
    #[serde(default)]
    pub next_node_id: Option<Uuid>,

    /// Base rule gating the transition out of this node
    #[serde(default)]
    pub rule_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<Question>,

    #[serde(default)]
    pub yes_action_id: Option<Uuid>,

    #[serde(default)]
    pub no_action_id: Option<Uuid>,

    // Timer settings
    #[serde(default)]
    pub number_of_tries: u32,

    #[serde(default)]
    pub timer_seconds: u64,

    #[serde(default)]
    pub next_node_id_on_success: Option<Uuid>,

    #[serde(default)]
    pub next_node_id_on_timeout: Option<Uuid>,

    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn new<N: Into<String>>(schema_id: Uuid, node_type: NodeType, name: N) -> Self {
        Self {
            id: Uuid::new_v4(),
            schema_id,
            node_type,
            name: name.into(),
            code: None,
            description: None,
            parent_node_id: None,
            next_node_id: None,
            rule_id: None,
            raw_data: None,
            question: None,
            yes_action_id: None,
            no_action_id: None,
            number_of_tries: 0,
            timer_seconds: 0,
            next_node_id_on_success: None,
            next_node_id_on_timeout: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_next(mut self, next_node_id: Uuid) -> Self {
        self.next_node_id = Some(next_node_id);
        self
    }

    pub fn with_parent(mut self, parent_node_id: Uuid) -> Self {
        self.parent_node_id = Some(parent_node_id);
        self
    }

    pub fn with_rule(mut self, rule_id: Uuid) -> Self {
        self.rule_id = Some(rule_id);
        self
    }

    pub fn with_question(mut self, question: Question) -> Self {
        self.question = Some(question);
        self
    }

    /// Configure timer semantics: re-check after `seconds`, at most `tries` times
    pub fn with_timer(
        mut self,
        seconds: u64,
        tries: u32,
        on_success: Option<Uuid>,
        on_timeout: Option<Uuid>,
    ) -> Self {
        self.timer_seconds = seconds;
        self.number_of_tries = tries;
        self.next_node_id_on_success = on_success;
        self.next_node_id_on_timeout = on_timeout;
        self
    }

    /// Successor once the timer condition holds
    pub fn success_target(&self) -> Option<Uuid> {
        self.next_node_id_on_success.or(self.next_node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_node_alias() {
        let node_type: NodeType = serde_json::from_str("\"WaitNode\"").unwrap();
        assert_eq!(node_type, NodeType::TimerNode);
        assert!(!node_type.needs_input());
        assert!(NodeType::QuestionNode.needs_input());
    }

    #[test]
    fn test_question_option_order() {
        let question = Question {
            text: "Continue?".to_string(),
            response_type: QuestionResponseType::SingleChoice,
            options: vec![
                QuestionOption { text: "No".to_string(), sequence: 2 },
                QuestionOption { text: "Yes".to_string(), sequence: 1 },
            ],
        };

        let ordered: Vec<&str> = question
            .ordered_options()
            .iter()
            .map(|o| o.text.as_str())
            .collect();
        assert_eq!(ordered, vec!["Yes", "No"]);
        assert_eq!(question.option_by_sequence(2).unwrap().text, "No");
    }
}
