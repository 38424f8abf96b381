// Action executor - dispatches node actions to their effects

//! # Action Executor
//!
//! Runs a single [`NodeAction`] for a node instance. The dispatch is an
//! exhaustive `match` over [`ActionType`]; action names the engine does not
//! know arrive as `ActionType::Unsupported` and fail with
//! `FlowgateError::UnsupportedOperation` instead of being skipped.
//!
//! An action reports an [`ActionResult`]: whether it succeeded, an optional
//! value, and an [`ActionSignal`] telling the schema engine what to do next
//! (exit the workflow, wait for input, start a child workflow, ...).
//!
//! ## Parameter Resolution
//!
//! Input parameters resolve to their literal value when set. Otherwise the
//! parameter's `source` decides: `Almanac` reads the fact named by `key`
//! (falling back to the parameter name), `Event` reads the triggering
//! event's context.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::almanac::Almanac;
use crate::engine::storage::WorkflowStorage;
use crate::models::{
    ActionParam, ActionType, DataType, Event, NodeAction, NodeInstance, OutputDestination, ValueSource,
};
use crate::{FlowgateError, Result};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound message channel used by `SendMessage`
#[async_trait::async_trait]
pub trait MessagingService: Send + Sync {
    /// Deliver `message` to `phone`; `false` means the channel refused it
    async fn send(&self, phone: &str, message: &Value) -> Result<bool>;
}

/// Messaging service that only logs, keeping the sent messages in memory
#[derive(Default)]
pub struct LoggingMessagingService {
    sent: Mutex<Vec<(String, Value)>>,
}

impl LoggingMessagingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl MessagingService for LoggingMessagingService {
    async fn send(&self, phone: &str, message: &Value) -> Result<bool> {
        info!(phone = phone, message = %message, "Outbound message");
        self.sent.lock().await.push((phone.to_string(), message.clone()));
        Ok(true)
    }
}

/// Messaging service that POSTs `{ "phone", "message" }` to a webhook
pub struct WebhookMessagingService {
    client: Client,
    url: String,
}

impl WebhookMessagingService {
    pub fn new<U: Into<String>>(url: U, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl MessagingService for WebhookMessagingService {
    async fn send(&self, phone: &str, message: &Value) -> Result<bool> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "phone": phone, "message": message }))
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), url = %self.url, "Messaging webhook rejected message");
            return Ok(false);
        }
        Ok(true)
    }
}

/// What the schema engine should do after an action ran
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum ActionSignal {
    None,
    /// Stop the workflow at this node
    Exit,
    /// The node waits for the next inbound message
    Listen,
    /// The node waits for its timer
    Wait,
    /// Start a child workflow of `schema_id`
    TriggerChild { schema_id: Uuid, payload: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub signal: ActionSignal,
}

impl ActionResult {
    fn done(success: bool) -> Self {
        Self {
            success,
            value: None,
            signal: ActionSignal::None,
        }
    }

    fn with_value(success: bool, value: Option<Value>) -> Self {
        Self {
            success,
            value,
            signal: ActionSignal::None,
        }
    }

    fn signal(success: bool, signal: ActionSignal) -> Self {
        Self {
            success,
            value: None,
            signal,
        }
    }
}

pub struct ActionExecutor {
    storage: Arc<dyn WorkflowStorage>,
    messaging: Arc<dyn MessagingService>,
    http: Client,
    request_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(storage: Arc<dyn WorkflowStorage>, messaging: Arc<dyn MessagingService>) -> Self {
        Self {
            storage,
            messaging,
            http: Client::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Applied to every outbound request, so a hung endpoint cannot hold the instance lock
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn execute(
        &self,
        action: &NodeAction,
        node_instance: &NodeInstance,
        event: Option<&Event>,
    ) -> Result<ActionResult> {
        if node_instance.schema_instance_id.is_nil() {
            return Err(FlowgateError::Validation(format!(
                "node instance {} has no schema instance",
                node_instance.id
            )));
        }
        let almanac = Almanac::new(self.storage.clone(), node_instance.schema_instance_id);

        debug!(
            action_id = %action.id,
            action_type = ?action.action_type,
            node_instance_id = %node_instance.id,
            "Executing action"
        );

        let result = match &action.action_type {
            ActionType::SendMessage => self.send_message(action, &almanac, event).await?,
            ActionType::StoreToAlmanac => store_to_almanac(action, &almanac, event).await?,
            ActionType::GetFromAlmanac => {
                let value = match first_key(action) {
                    Some(key) => almanac.get_fact(key).await?,
                    None => None,
                };
                self.apply_output(action, &almanac, value.as_ref()).await?;
                ActionResult::with_value(value.is_some(), value)
            }
            ActionType::ExistsInAlmanac => {
                let exists = match first_key(action) {
                    Some(key) => almanac.has_fact(key).await?,
                    None => false,
                };
                ActionResult::with_value(exists, Some(Value::Bool(exists)))
            }
            ActionType::RestApiCall => self.rest_api_call(action, &almanac, event).await?,
            ActionType::Continue => ActionResult::done(true),
            ActionType::Exit => ActionResult::signal(false, ActionSignal::Exit),
            ActionType::TriggerListeningNode => ActionResult::signal(true, ActionSignal::Listen),
            ActionType::TriggerWaitNode => ActionResult::signal(true, ActionSignal::Wait),
            ActionType::TriggerChildWorkflow => trigger_child(action, &almanac, event).await?,
            ActionType::Unsupported(name) => {
                return Err(FlowgateError::UnsupportedOperation(format!(
                    "action type '{}' on action {}",
                    name, action.id
                )))
            }
        };
        Ok(result)
    }

    async fn send_message(&self, action: &NodeAction, almanac: &Almanac, event: Option<&Event>) -> Result<ActionResult> {
        let phone = match action.param_of_type(DataType::Phonenumber) {
            Some(param) => resolve_param(param, almanac, event).await?,
            None => None,
        };
        let message = match action.param("Message") {
            Some(param) => resolve_param(param, almanac, event).await?,
            None => None,
        };

        let (Some(phone), Some(message)) = (phone, message) else {
            warn!(action_id = %action.id, "SendMessage is missing its phone number or message");
            return Ok(ActionResult::done(false));
        };
        let phone = match phone {
            Value::String(s) => s,
            other => other.to_string(),
        };

        let delivered = self.messaging.send(&phone, &message).await?;
        Ok(ActionResult::with_value(delivered, Some(message)))
    }

    async fn rest_api_call(&self, action: &NodeAction, almanac: &Almanac, event: Option<&Event>) -> Result<ActionResult> {
        let url = match action.param("Url") {
            Some(param) => resolve_param(param, almanac, event).await?,
            None => None,
        };
        let Some(Value::String(url)) = url else {
            warn!(action_id = %action.id, "RestApiCall has no Url");
            return Ok(ActionResult::done(false));
        };

        let method = match action.param("Method") {
            Some(param) => resolve_param(param, almanac, event).await?,
            None => None,
        };
        let method = match method {
            Some(Value::String(m)) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|e| FlowgateError::Validation(format!("invalid HTTP method '{}': {}", m, e)))?,
            _ => Method::GET,
        };

        let mut request = self.http.request(method, &url).timeout(self.request_timeout);
        if let Some(param) = action.param("Body") {
            if let Some(body) = resolve_param(param, almanac, event).await? {
                request = request.json(&body);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        self.apply_output(action, almanac, Some(&body)).await?;
        Ok(ActionResult::with_value(status.is_success(), Some(body)))
    }

    /// Route a produced value to the action's output destination
    async fn apply_output(&self, action: &NodeAction, almanac: &Almanac, value: Option<&Value>) -> Result<()> {
        let (Some(output), Some(value)) = (&action.output, value) else {
            return Ok(());
        };
        match (output.destination, output.key.as_deref()) {
            (OutputDestination::Almanac, Some(key)) => {
                almanac.add_fact(key, value.clone()).await?;
            }
            (OutputDestination::ApiEndpoint, Some(url)) => {
                let response = self
                    .http
                    .post(url)
                    .timeout(self.request_timeout)
                    .json(value)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    warn!(status = %response.status(), url = url, "Action output endpoint rejected payload");
                }
            }
            // Database output is persisted with the action instance result
            _ => {}
        }
        Ok(())
    }
}

fn first_key(action: &NodeAction) -> Option<&str> {
    let param = action.input.first()?;
    param.key.as_deref().or(Some(param.name.as_str())).filter(|k| !k.is_empty())
}

/// Literal value, else the almanac or event lookup named by the parameter
async fn resolve_param(param: &ActionParam, almanac: &Almanac, event: Option<&Event>) -> Result<Option<Value>> {
    if param.has_value() {
        return Ok(param.value.clone());
    }
    let key = param.key.as_deref().unwrap_or(param.name.as_str());
    let value = match param.source {
        ValueSource::Almanac => almanac.get_fact(key).await?,
        ValueSource::Event => event.and_then(|event| event.context_value(key)),
        ValueSource::Literal => match &param.key {
            Some(key) => almanac.get_fact(key).await?,
            None => None,
        },
    };
    Ok(value.filter(|v| !v.is_null()))
}

/// StoreToAlmanac: the first parameter's key receives its value
async fn store_to_almanac(action: &NodeAction, almanac: &Almanac, event: Option<&Event>) -> Result<ActionResult> {
    let Some(param) = action.input.first() else {
        return Ok(ActionResult::done(false));
    };
    let Some(key) = param.key.as_deref().filter(|k| !k.is_empty()) else {
        warn!(action_id = %action.id, "StoreToAlmanac parameter has no key");
        return Ok(ActionResult::done(false));
    };

    let value = if param.has_value() {
        param.value.clone()
    } else if param.source == ValueSource::Event {
        event.and_then(|event| event.context_value(&param.name))
    } else {
        None
    };
    let Some(value) = value.filter(|v| !v.is_null()) else {
        warn!(action_id = %action.id, key = key, "StoreToAlmanac parameter has no value");
        return Ok(ActionResult::done(false));
    };

    let stored = almanac.add_fact(key, value.clone()).await?;
    Ok(ActionResult::with_value(stored, Some(value)))
}

/// TriggerChildWorkflow: `SchemaId` names the child; the almanac travels along
async fn trigger_child(action: &NodeAction, almanac: &Almanac, event: Option<&Event>) -> Result<ActionResult> {
    let schema_id = match action.param("SchemaId") {
        Some(param) => resolve_param(param, almanac, event).await?,
        None => None,
    };
    let Some(raw) = schema_id else {
        warn!(action_id = %action.id, "TriggerChildWorkflow has no SchemaId");
        return Ok(ActionResult::done(false));
    };
    let schema_id = raw
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| FlowgateError::Validation(format!("invalid child schema id {}", raw)))?;

    let payload = json!({
        "parent_schema_instance_id": almanac.schema_instance_id(),
        "almanac": almanac.facts().await?,
    });
    Ok(ActionResult::signal(
        true,
        ActionSignal::TriggerChild { schema_id, payload },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use crate::models::{Node, NodeType, Schema, SchemaInstance, UserMessage};

    struct Fixture {
        executor: ActionExecutor,
        messaging: Arc<LoggingMessagingService>,
        almanac: Almanac,
        node: Node,
        node_instance: NodeInstance,
    }

    async fn fixture() -> Fixture {
        let storage: Arc<dyn WorkflowStorage> = Arc::new(InMemoryStorage::new());
        let schema = storage.create_schema(Schema::new("tenant", "actions")).await.unwrap();
        let node = storage
            .create_node(Node::new(schema.id, NodeType::ExecutionNode, "act"))
            .await
            .unwrap();
        let instance = storage
            .create_schema_instance(SchemaInstance::new(&schema, "E-240101-001".into(), vec![]))
            .await
            .unwrap();
        let node_instance = storage.get_or_create_node_instance(&node, &instance.id).await.unwrap();
        let messaging = Arc::new(LoggingMessagingService::new());
        Fixture {
            executor: ActionExecutor::new(storage.clone(), messaging.clone()),
            messaging,
            almanac: Almanac::new(storage, instance.id),
            node,
            node_instance,
        }
    }

    #[tokio::test]
    async fn test_send_message_resolves_almanac_params() {
        let f = fixture().await;
        f.almanac.add_fact("phone", json!("+15550100")).await.unwrap();
        let action = NodeAction::new(f.node.id, ActionType::SendMessage, 1)
            .with_input(ActionParam::from_almanac("To", DataType::Phonenumber, "phone"))
            .with_input(ActionParam::literal("Message", DataType::Text, json!("Hello")));

        let result = f.executor.execute(&action, &f.node_instance, None).await.unwrap();

        assert!(result.success);
        assert_eq!(
            f.messaging.sent().await,
            vec![("+15550100".to_string(), json!("Hello"))]
        );
    }

    #[tokio::test]
    async fn test_send_message_without_phone_fails() {
        let f = fixture().await;
        let action = NodeAction::new(f.node.id, ActionType::SendMessage, 1)
            .with_input(ActionParam::literal("Message", DataType::Text, json!("Hello")));

        let result = f.executor.execute(&action, &f.node_instance, None).await.unwrap();
        assert!(!result.success);
        assert!(f.messaging.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_store_then_get_from_almanac() {
        let f = fixture().await;
        let store = NodeAction::new(f.node.id, ActionType::StoreToAlmanac, 1)
            .with_input(ActionParam::literal("Plan", DataType::Text, json!("gold")).with_key("plan"));
        assert!(f.executor.execute(&store, &f.node_instance, None).await.unwrap().success);

        let get = NodeAction::new(f.node.id, ActionType::GetFromAlmanac, 2)
            .with_input(ActionParam::from_almanac("Plan", DataType::Text, "plan"));
        let result = f.executor.execute(&get, &f.node_instance, None).await.unwrap();
        assert_eq!(result.value, Some(json!("gold")));

        let exists = NodeAction::new(f.node.id, ActionType::ExistsInAlmanac, 3)
            .with_input(ActionParam::from_almanac("Other", DataType::Text, "other"));
        let result = f.executor.execute(&exists, &f.node_instance, None).await.unwrap();
        assert_eq!(result.value, Some(json!(false)));
    }

    #[tokio::test]
    async fn test_store_from_event_context() {
        let f = fixture().await;
        let mut param = ActionParam::literal("Text", DataType::Text, Value::Null).with_key("last_reply");
        param.source = ValueSource::Event;
        let store = NodeAction::new(f.node.id, ActionType::StoreToAlmanac, 1).with_input(param);
        let event = Event::user_message(
            "tenant",
            UserMessage {
                text: Some("hi there".to_string()),
                ..Default::default()
            },
        );

        assert!(f.executor.execute(&store, &f.node_instance, Some(&event)).await.unwrap().success);
        assert_eq!(f.almanac.get_fact("last_reply").await.unwrap(), Some(json!("hi there")));
    }

    #[tokio::test]
    async fn test_signals() {
        let f = fixture().await;
        let run = |action_type: ActionType| NodeAction::new(f.node.id, action_type, 1);

        let exit = f.executor.execute(&run(ActionType::Exit), &f.node_instance, None).await.unwrap();
        assert!(!exit.success);
        assert_eq!(exit.signal, ActionSignal::Exit);

        let cont = f.executor.execute(&run(ActionType::Continue), &f.node_instance, None).await.unwrap();
        assert!(cont.success);

        let wait = f.executor.execute(&run(ActionType::TriggerWaitNode), &f.node_instance, None).await.unwrap();
        assert_eq!(wait.signal, ActionSignal::Wait);
    }

    #[tokio::test]
    async fn test_trigger_child_workflow_carries_almanac() {
        let f = fixture().await;
        f.almanac.add_fact("order", json!(42)).await.unwrap();
        let child_schema = Uuid::new_v4();
        let action = NodeAction::new(f.node.id, ActionType::TriggerChildWorkflow, 1).with_input(
            ActionParam::literal("SchemaId", DataType::Text, json!(child_schema.to_string())),
        );

        let result = f.executor.execute(&action, &f.node_instance, None).await.unwrap();
        match result.signal {
            ActionSignal::TriggerChild { schema_id, payload } => {
                assert_eq!(schema_id, child_schema);
                assert_eq!(payload["almanac"][0]["name"], json!("order"));
            }
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rest_api_call_without_url_fails() {
        let f = fixture().await;
        let action = NodeAction::new(f.node.id, ActionType::RestApiCall, 1);
        let result = f.executor.execute(&action, &f.node_instance, None).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_rest_api_call_times_out() {
        let f = fixture().await;
        // accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let action = NodeAction::new(f.node.id, ActionType::RestApiCall, 1)
            .with_input(ActionParam::literal("Url", DataType::Text, json!(format!("http://{}/slow", addr))));
        let executor = f.executor.with_request_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let result = executor.execute(&action, &f.node_instance, None).await;
        assert!(matches!(result, Err(FlowgateError::Http(_))), "{:?}", result.map(|r| r.success));
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }

    #[tokio::test]
    async fn test_unsupported_action_type() {
        let f = fixture().await;
        let action = NodeAction::new(f.node.id, ActionType::Unsupported("SendFax".into()), 1);
        assert!(matches!(
            f.executor.execute(&action, &f.node_instance, None).await,
            Err(FlowgateError::UnsupportedOperation(_))
        ));
    }
}
