// Tests for the REST API
use crate::{
    api::ApiServer,
    engine::{actions::LoggingMessagingService, events::EngineRuntime, storage::InMemoryStorage},
    settings::{AppConfig, ServerConfig},
};

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use hyper::body::to_bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

// Test helpers
fn setup() -> (Router, Arc<EngineRuntime>) {
    let runtime = Arc::new(EngineRuntime::start(
        Arc::new(InMemoryStorage::new()),
        &AppConfig::default(),
        Arc::new(LoggingMessagingService::new()),
    ));
    let server = ApiServer::new(ServerConfig::default(), runtime.clone());
    (server.create_router(), runtime)
}

async fn call(app: &Router, method: Method, uri: &str, tenant: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-tenant-id", tenant);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body()).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn id(value: &Value) -> String {
    value["id"].as_str().unwrap().to_string()
}

/// Question node (root) with one gated path to an execution node
async fn author_question_schema(app: &Router, tenant: &str) -> (String, String, String) {
    let (status, schema) = call(
        app,
        Method::POST,
        "/api/v1/schemas",
        tenant,
        Some(json!({
            "name": "Support intake",
            "context_params": [{ "name": "Phone", "type": "Phonenumber", "required": true }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let schema_id = id(&schema);

    let (status, ask) = call(
        app,
        Method::POST,
        &format!("/api/v1/schemas/{}/nodes", schema_id),
        tenant,
        Some(json!({
            "type": "QuestionNode",
            "name": "ask",
            "question": {
                "text": "Do you need help?",
                "response_type": "SingleChoice",
                "options": [{ "text": "Yes", "sequence": 1 }, { "text": "No", "sequence": 2 }]
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let ask_id = id(&ask);

    let (_, help) = call(
        app,
        Method::POST,
        &format!("/api/v1/schemas/{}/nodes", schema_id),
        tenant,
        Some(json!({ "type": "ExecutionNode", "name": "help" })),
    )
    .await;
    let help_id = id(&help);

    let (status, path) = call(
        app,
        Method::POST,
        &format!("/api/v1/nodes/{}/paths", ask_id),
        tenant,
        Some(json!({ "next_node_id": help_id, "name": "needs help" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, condition) = call(
        app,
        Method::POST,
        "/api/v1/conditions",
        tenant,
        Some(json!({
            "operator_type": "Logical",
            "logical_operator": "Equal",
            "first_operand": { "data_type": "Text", "name": "ChosenOption", "source": "Event" },
            "second_operand": { "data_type": "Text", "value": "Yes" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = call(
        app,
        Method::POST,
        &format!("/api/v1/nodes/{}/rules", ask_id),
        tenant,
        Some(json!({ "condition_id": id(&condition), "node_path_id": id(&path) })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    (schema_id, ask_id, help_id)
}

#[tokio::test]
async fn test_health_reports_queues() {
    let (app, _) = setup();
    let (status, body) = call(&app, Method::GET, "/health", "default", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queues"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let (app, _) = setup();
    let (status, _) = call(&app, Method::GET, "/api/v1/nope", "default", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, Method::GET, "/nope", "default", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "404");
}

#[tokio::test]
async fn test_authored_schema_runs_from_messages() {
    let (app, _) = setup();
    let (schema_id, ask_id, help_id) = author_question_schema(&app, "acme").await;

    let (status, schema) = call(&app, Method::GET, &format!("/api/v1/schemas/{}", schema_id), "acme", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(schema["root_node_id"], json!(ask_id));

    let (status, first) = call(
        &app,
        Method::POST,
        "/api/v1/events/messages",
        "acme",
        Some(json!({ "phone": "+31612345678", "text": "hi", "sync": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["outcome"]["status"], "AwaitingInput");
    assert_eq!(first["event"]["handled"], true);
    let instance_id = first["outcome"]["schema_instance"]["id"].as_str().unwrap().to_string();

    let (status, second) = call(
        &app,
        Method::POST,
        "/api/v1/events/messages",
        "acme",
        Some(json!({
            "phone": "+31 6 1234 5678",
            "question_response": { "chosen_option": "Yes" },
            "sync": true
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["outcome"]["status"], "Advanced");
    assert_eq!(second["outcome"]["schema_instance"]["id"], json!(instance_id));
    assert_eq!(second["outcome"]["current_node_instance"]["node_id"], json!(help_id));

    let (_, nodes) = call(
        &app,
        Method::GET,
        &format!("/api/v1/instances/{}/nodes", instance_id),
        "acme",
        None,
    )
    .await;
    assert_eq!(nodes.as_array().unwrap().len(), 2);

    let (_, instances) = call(
        &app,
        Method::GET,
        &format!("/api/v1/schemas/{}/instances", schema_id),
        "acme",
        None,
    )
    .await;
    assert_eq!(instances.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_queued_message_is_accepted() {
    let (app, runtime) = setup();
    let (schema_id, _, _) = author_question_schema(&app, "acme").await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/events/messages",
        "acme",
        Some(json!({ "phone": "+31612345678", "text": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body.get("outcome").is_none());
    let event_id = id(&body["event"]);

    runtime.drain().await;

    let (_, event) = call(&app, Method::GET, &format!("/api/v1/events/{}", event_id), "acme", None).await;
    assert_eq!(event["handled"], true);
    let (_, instances) = call(
        &app,
        Method::GET,
        &format!("/api/v1/schemas/{}/instances", schema_id),
        "acme",
        None,
    )
    .await;
    assert_eq!(instances.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_tenants_are_isolated() {
    let (app, _) = setup();
    let (schema_id, ask_id, _) = author_question_schema(&app, "acme").await;

    let (status, body) = call(&app, Method::GET, &format!("/api/v1/schemas/{}", schema_id), "globex", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "not_found_error");

    let (status, _) = call(&app, Method::DELETE, &format!("/api/v1/nodes/{}", ask_id), "globex", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, schemas) = call(&app, Method::GET, "/api/v1/schemas", "globex", None).await;
    assert!(schemas.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_validation_and_conflict_errors() {
    let (app, _) = setup();
    let (schema_id, ask_id, _) = author_question_schema(&app, "acme").await;

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/api/v1/schemas/{}/nodes", schema_id),
        "acme",
        Some(json!({ "type": "QuestionNode", "name": "no question" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["type"], "validation_error");

    let (_, paths) = call(&app, Method::GET, &format!("/api/v1/nodes/{}/paths", ask_id), "acme", None).await;
    let path_id = paths[0]["id"].as_str().unwrap().to_string();
    let (_, condition) = call(
        &app,
        Method::POST,
        "/api/v1/conditions",
        "acme",
        Some(json!({
            "operator_type": "Logical",
            "logical_operator": "Exists",
            "first_operand": { "data_type": "Text", "name": "Text", "source": "Event" }
        })),
    )
    .await;

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/api/v1/nodes/{}/rules", ask_id),
        "acme",
        Some(json!({ "condition_id": id(&condition), "node_path_id": path_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "409");
}

#[tokio::test]
async fn test_terminate_and_delete_instance() {
    let (app, _) = setup();
    author_question_schema(&app, "acme").await;
    let (_, first) = call(
        &app,
        Method::POST,
        "/api/v1/events/messages",
        "acme",
        Some(json!({ "phone": "+31612345678", "text": "hi", "sync": true })),
    )
    .await;
    let instance_id = first["outcome"]["schema_instance"]["id"].as_str().unwrap().to_string();

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/api/v1/instances/{}/terminate", instance_id),
        "globex",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, terminated) = call(
        &app,
        Method::POST,
        &format!("/api/v1/instances/{}/terminate", instance_id),
        "acme",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(terminated["terminated"], true);

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/events/messages",
        "acme",
        Some(json!({ "schema_instance_id": instance_id, "text": "still there?", "sync": true })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{}", body);

    let (status, deleted) = call(&app, Method::DELETE, &format!("/api/v1/instances/{}", instance_id), "acme", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["deleted"], true);
    let (status, _) = call(&app, Method::GET, &format!("/api/v1/instances/{}", instance_id), "acme", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
