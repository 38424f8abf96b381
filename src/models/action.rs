// Node action models - executable steps attached to nodes

//! # Node Actions
//!
//! A `NodeAction` is one executable effect attached to a node. Actions run in
//! `sequence` order. Path actions (`is_path_action`) belong to a decision
//! branch such as the yes/no arms of a `YesNoNode` and are skipped when the
//! node's generic actions run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::condition::{DataType, ValueSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionType {
    SendMessage,
    StoreToAlmanac,
    GetFromAlmanac,
    ExistsInAlmanac,
    RestApiCall,
    Continue,
    Exit,
    TriggerListeningNode,
    TriggerWaitNode,
    TriggerChildWorkflow,
    /// Action name this engine cannot execute
    Unsupported(String),
}

impl From<String> for ActionType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "SendMessage" => ActionType::SendMessage,
            "StoreToAlmanac" => ActionType::StoreToAlmanac,
            "GetFromAlmanac" => ActionType::GetFromAlmanac,
            "ExistsInAlmanac" => ActionType::ExistsInAlmanac,
            "RestApiCall" => ActionType::RestApiCall,
            "Continue" => ActionType::Continue,
            "Exit" => ActionType::Exit,
            "TriggerListeningNode" => ActionType::TriggerListeningNode,
            "TriggerWaitNode" | "TriggerTimerNode" => ActionType::TriggerWaitNode,
            "TriggerChildWorkflow" => ActionType::TriggerChildWorkflow,
            _ => ActionType::Unsupported(name),
        }
    }
}

impl From<ActionType> for String {
    fn from(action_type: ActionType) -> Self {
        match action_type {
            ActionType::Unsupported(name) => name,
            other => format!("{:?}", other),
        }
    }
}

/// Named, typed input parameter of an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParam {
    pub name: String,

    #[serde(rename = "type")]
    pub data_type: DataType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default)]
    pub source: ValueSource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ActionParam {
    pub fn literal<N: Into<String>>(name: N, data_type: DataType, value: Value) -> Self {
        Self {
            name: name.into(),
            data_type,
            value: Some(value),
            source: ValueSource::Literal,
            key: None,
        }
    }

    pub fn from_almanac<N: Into<String>, K: Into<String>>(name: N, data_type: DataType, key: K) -> Self {
        Self {
            name: name.into(),
            data_type,
            value: None,
            source: ValueSource::Almanac,
            key: Some(key.into()),
        }
    }

    pub fn with_key<K: Into<String>>(mut self, key: K) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn has_value(&self) -> bool {
        match &self.value {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputDestination {
    Database,
    Almanac,
    ApiEndpoint,
    None,
}

/// Where an action's result goes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    pub destination: OutputDestination,

    /// Almanac fact name or endpoint URL, depending on the destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAction {
    pub id: Uuid,
    pub node_id: Uuid,

    #[serde(rename = "type")]
    pub action_type: ActionType,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub sequence: u32,

    #[serde(default)]
    pub is_path_action: bool,

    #[serde(default)]
    pub input: Vec<ActionParam>,

    #[serde(default)]
    pub output: Option<ActionOutput>,

    /// Where a path action continues once it ran
    #[serde(default)]
    pub next_node_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
}

impl NodeAction {
    pub fn new(node_id: Uuid, action_type: ActionType, sequence: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            name: String::from(action_type.clone()),
            action_type,
            description: None,
            sequence,
            is_path_action: false,
            input: Vec::new(),
            output: None,
            next_node_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_input(mut self, param: ActionParam) -> Self {
        self.input.push(param);
        self
    }

    pub fn with_output(mut self, destination: OutputDestination, key: Option<String>) -> Self {
        self.output = Some(ActionOutput { destination, key });
        self
    }

    /// Mark as a decision-branch action continuing at `next_node_id`
    pub fn as_path_action(mut self, next_node_id: Option<Uuid>) -> Self {
        self.is_path_action = true;
        self.next_node_id = next_node_id;
        self
    }

    /// Case-insensitive parameter lookup by name
    pub fn param(&self, name: &str) -> Option<&ActionParam> {
        self.input
            .iter()
            .find(|param| param.name.eq_ignore_ascii_case(name))
    }

    pub fn param_of_type(&self, data_type: DataType) -> Option<&ActionParam> {
        self.input.iter().find(|param| param.data_type == data_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_type_names() {
        let parsed: ActionType = serde_json::from_value(json!("TriggerTimerNode")).unwrap();
        assert_eq!(parsed, ActionType::TriggerWaitNode);

        let unknown: ActionType = serde_json::from_value(json!("GenerateQrCode")).unwrap();
        assert_eq!(unknown, ActionType::Unsupported("GenerateQrCode".to_string()));
    }

    #[test]
    fn test_param_lookup() {
        let action = NodeAction::new(Uuid::new_v4(), ActionType::SendMessage, 1)
            .with_input(ActionParam::literal("Message", DataType::Text, json!("hi")))
            .with_input(ActionParam::from_almanac("Phone", DataType::Phonenumber, "phone"));

        assert!(action.param("message").unwrap().has_value());
        assert!(!action.param_of_type(DataType::Phonenumber).unwrap().has_value());
        assert_eq!(action.name, "SendMessage");
    }
}
