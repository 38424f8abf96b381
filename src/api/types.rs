// REST request/response types
// Command payloads accepted by the router and the error envelope it returns

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::queue::QueueStats;
use crate::engine::schema_engine::ExecutionOutcome;
use crate::models::{
    ActionOutput, ActionParam, ActionType, CompositionOperator, Condition, ContextParam, Event,
    EventType, LogicalOperator, Node, NodeAction, NodePath, NodeType, Operand, OperatorType,
    Question, Rule, Schema, SchemaType, UserMessage,
};
use crate::FlowgateError;

/// Error envelope: `{"error": {"message", "type", "code"}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,

    #[serde(rename = "type")]
    pub error_type: String,

    /// HTTP status code as a string, e.g. "404"
    pub code: String,
}

/// A `FlowgateError` on its way out of a handler
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, error_type: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: ErrorDetail {
                    message: message.into(),
                    error_type: error_type.to_string(),
                    code: status.as_u16().to_string(),
                },
            },
        }
    }
}

impl From<FlowgateError> for ApiError {
    fn from(err: FlowgateError) -> Self {
        let (status, error_type) = match &err {
            FlowgateError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found_error"),
            FlowgateError::Conflict(_) | FlowgateError::ConcurrencyConflict { .. } => {
                (StatusCode::CONFLICT, "conflict_error")
            }
            FlowgateError::Validation(_) | FlowgateError::Parse(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "validation_error")
            }
            FlowgateError::UnsupportedOperation(_) => (StatusCode::BAD_REQUEST, "unsupported_operation"),
            FlowgateError::Cancelled(_) => (StatusCode::GONE, "cancelled"),
            FlowgateError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        }
        ApiError::new(status, error_type, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Events

/// Inbound user message from a chat channel
#[derive(Debug, Clone, Deserialize)]
pub struct MessageEventRequest {
    #[serde(default)]
    pub reference_id: Option<String>,

    #[serde(default)]
    pub schema_id: Option<Uuid>,

    #[serde(default)]
    pub schema_instance_id: Option<Uuid>,

    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub message: UserMessage,

    /// Process on the request task and return the outcome instead of queueing
    #[serde(default)]
    pub sync: bool,
}

impl MessageEventRequest {
    pub fn into_event(self, tenant_id: &str) -> Event {
        let mut event = Event::user_message(tenant_id, self.message);
        event.reference_id = self.reference_id;
        event.schema_id = self.schema_id;
        event.schema_instance_id = self.schema_instance_id;
        if let Some(timestamp) = self.timestamp {
            event.timestamp = timestamp;
        }
        event
    }
}

/// Generic event from an external system
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingEventRequest {
    #[serde(default = "default_event_type")]
    pub event_type: EventType,

    #[serde(default)]
    pub reference_id: Option<String>,

    #[serde(default)]
    pub schema_id: Option<Uuid>,

    #[serde(default)]
    pub schema_instance_id: Option<Uuid>,

    #[serde(default)]
    pub payload: Option<Value>,

    #[serde(default)]
    pub sync: bool,
}

fn default_event_type() -> EventType {
    EventType::External
}

impl IncomingEventRequest {
    pub fn into_event(self, tenant_id: &str) -> Event {
        let mut event = Event::new(tenant_id, self.event_type);
        event.reference_id = self.reference_id;
        event.schema_id = self.schema_id;
        event.schema_instance_id = self.schema_instance_id;
        event.payload = self.payload;
        event
    }
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub event: Event,

    /// Present for synchronous processing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ExecutionOutcome>,
}

// ============================================================================
// Authoring

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaRequest {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(rename = "type", default)]
    pub schema_type: Option<SchemaType>,

    #[serde(default)]
    pub root_node_id: Option<Uuid>,

    #[serde(default)]
    pub parent_schema_id: Option<Uuid>,

    #[serde(default)]
    pub context_params: Vec<ContextParam>,

    #[serde(default)]
    pub execute_immediately: bool,
}

impl SchemaRequest {
    pub fn apply(self, mut schema: Schema) -> Schema {
        schema.name = self.name;
        schema.description = self.description;
        if let Some(schema_type) = self.schema_type {
            schema.schema_type = schema_type;
        }
        if self.root_node_id.is_some() {
            schema.root_node_id = self.root_node_id;
        }
        schema.parent_schema_id = self.parent_schema_id;
        schema.context_params = self.context_params;
        schema.execute_immediately = self.execute_immediately;
        schema.updated_at = Utc::now();
        schema
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeRequest {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub name: String,

    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub parent_node_id: Option<Uuid>,

    #[serde(default)]
    pub next_node_id: Option<Uuid>,

    #[serde(default)]
    pub rule_id: Option<Uuid>,

    #[serde(default)]
    pub raw_data: Option<Value>,

    #[serde(default)]
    pub question: Option<Question>,

    #[serde(default)]
    pub yes_action_id: Option<Uuid>,

    #[serde(default)]
    pub no_action_id: Option<Uuid>,

    #[serde(default)]
    pub number_of_tries: u32,

    #[serde(default)]
    pub timer_seconds: u64,

    #[serde(default)]
    pub next_node_id_on_success: Option<Uuid>,

    #[serde(default)]
    pub next_node_id_on_timeout: Option<Uuid>,
}

impl NodeRequest {
    pub fn apply(self, mut node: Node) -> Node {
        node.node_type = self.node_type;
        node.name = self.name;
        node.code = self.code;
        node.description = self.description;
        node.parent_node_id = self.parent_node_id;
        node.next_node_id = self.next_node_id;
        node.rule_id = self.rule_id;
        node.raw_data = self.raw_data;
        node.question = self.question;
        node.yes_action_id = self.yes_action_id;
        node.no_action_id = self.no_action_id;
        node.number_of_tries = self.number_of_tries;
        node.timer_seconds = self.timer_seconds;
        node.next_node_id_on_success = self.next_node_id_on_success;
        node.next_node_id_on_timeout = self.next_node_id_on_timeout;
        node
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeActionRequest {
    #[serde(rename = "type")]
    pub action_type: ActionType,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub sequence: u32,

    #[serde(default)]
    pub is_path_action: bool,

    #[serde(default)]
    pub input: Vec<ActionParam>,

    #[serde(default)]
    pub output: Option<ActionOutput>,

    #[serde(default)]
    pub next_node_id: Option<Uuid>,
}

impl NodeActionRequest {
    pub fn apply(self, mut action: NodeAction) -> NodeAction {
        action.action_type = self.action_type;
        if let Some(name) = self.name {
            action.name = name;
        }
        action.description = self.description;
        action.sequence = self.sequence;
        action.is_path_action = self.is_path_action;
        action.input = self.input;
        action.output = self.output;
        action.next_node_id = self.next_node_id;
        action
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodePathRequest {
    pub next_node_id: Uuid,
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,
}

impl NodePathRequest {
    pub fn into_path(self, parent_node_id: Uuid) -> NodePath {
        let mut path = NodePath::new(parent_node_id, self.next_node_id, self.name);
        path.description = self.description;
        path
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleRequest {
    pub condition_id: Uuid,

    #[serde(default)]
    pub node_path_id: Option<Uuid>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
}

impl RuleRequest {
    pub fn into_rule(self, parent_node_id: Uuid) -> Rule {
        let mut rule = Rule::new(parent_node_id, self.condition_id);
        rule.node_path_id = self.node_path_id;
        if let Some(name) = self.name {
            rule.name = name;
        }
        rule.description = self.description;
        rule
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionRequest {
    #[serde(default)]
    pub name: Option<String>,

    pub operator_type: OperatorType,

    #[serde(default)]
    pub logical_operator: LogicalOperator,

    #[serde(default)]
    pub composition_operator: CompositionOperator,

    #[serde(default)]
    pub first_operand: Option<Operand>,

    #[serde(default)]
    pub second_operand: Option<Operand>,

    #[serde(default)]
    pub third_operand: Option<Operand>,

    #[serde(default)]
    pub parent_condition_id: Option<Uuid>,

    #[serde(default)]
    pub sequence: u32,
}

impl ConditionRequest {
    pub fn apply(self, mut condition: Condition) -> Condition {
        condition.name = self.name;
        condition.operator_type = self.operator_type;
        condition.logical_operator = self.logical_operator;
        condition.composition_operator = self.composition_operator;
        condition.first_operand = self.first_operand;
        condition.second_operand = self.second_operand;
        condition.third_operand = self.third_operand;
        condition.parent_condition_id = self.parent_condition_id;
        condition.sequence = self.sequence;
        condition
    }

    pub fn into_condition(self) -> Condition {
        self.apply(Condition::composition(CompositionOperator::None))
    }
}

// ============================================================================
// Misc

#[derive(Debug, Serialize, Deserialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub queues: Vec<QueueStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_mapping() {
        let cases = [
            (FlowgateError::not_found("Schema", "x"), StatusCode::NOT_FOUND),
            (FlowgateError::Conflict("dup".into()), StatusCode::CONFLICT),
            (
                FlowgateError::ConcurrencyConflict {
                    entity: "SchemaInstance",
                    id: "x".into(),
                    expected: 1,
                    found: 2,
                },
                StatusCode::CONFLICT,
            ),
            (FlowgateError::Validation("bad".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (FlowgateError::UnsupportedOperation("Iterate".into()), StatusCode::BAD_REQUEST),
            (FlowgateError::Cancelled("gone".into()), StatusCode::GONE),
            (FlowgateError::Timeout("slow".into()), StatusCode::GATEWAY_TIMEOUT),
            (FlowgateError::GraphIntegrity("broken".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.status, status);
            assert_eq!(api.body.error.code, status.as_u16().to_string());
        }
    }

    #[test]
    fn test_message_request_flattens_user_message() {
        let request: MessageEventRequest = serde_json::from_value(json!({
            "phone": "+31612345678",
            "text": "hi",
            "question_response": { "chosen_option": "Yes" },
            "sync": true
        }))
        .unwrap();
        assert!(request.sync);

        let event = request.into_event("acme");
        assert_eq!(event.tenant_id, "acme");
        assert_eq!(event.event_type, EventType::UserMessage);
        assert_eq!(event.phone(), Some("+31612345678"));
        assert_eq!(event.answer(), Some(json!("Yes")));
    }
}
