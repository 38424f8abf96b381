// REST handlers
// Each handler translates one validated command into an engine or authoring call

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::middleware::TenantId;
use super::types::{
    ApiError, ApiResult, ConditionRequest, DeletedResponse, EventResponse, HealthResponse,
    IncomingEventRequest, MessageEventRequest, NodeActionRequest, NodePathRequest, NodeRequest,
    RuleRequest, SchemaRequest,
};
use crate::engine::authoring::{AuthoringService, ConditionTree};
use crate::engine::events::EngineRuntime;
use crate::models::{
    AlmanacFact, Condition, DeadLetter, Event, Node, NodeAction, NodeActionInstance, NodeInstance,
    NodePath, Rule, Schema, SchemaInstance,
};

/// Shared application state for the REST API
#[derive(Clone)]
pub struct ApiState {
    pub runtime: Arc<EngineRuntime>,
    pub authoring: AuthoringService,
}

impl ApiState {
    pub fn new(runtime: Arc<EngineRuntime>) -> Self {
        let authoring = AuthoringService::new(runtime.storage());
        Self { runtime, authoring }
    }
}

pub async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        queues: state.runtime.queue_stats(),
    })
}

pub async fn not_found() -> impl IntoResponse {
    ApiError::new(StatusCode::NOT_FOUND, "not_found_error", "Not found")
}

// ============================================================================
// Events

/// Store the event, then queue it, or process it in-line when `sync` is set
async fn accept_event(state: &ApiState, event: Event, sync: bool) -> ApiResult<(StatusCode, Json<EventResponse>)> {
    if sync {
        let event_id = event.id;
        let outcome = state.runtime.process_event(event).await?;
        let event = state
            .runtime
            .storage()
            .get_event(&event_id)
            .await?
            .ok_or_else(|| crate::FlowgateError::not_found("Event", event_id))?;
        return Ok((StatusCode::OK, Json(EventResponse { event, outcome })));
    }

    let event = state.runtime.submit_event(event).await?;
    Ok((StatusCode::ACCEPTED, Json(EventResponse { event, outcome: None })))
}

pub async fn create_message_event(
    State(state): State<ApiState>,
    tenant: TenantId,
    Json(request): Json<MessageEventRequest>,
) -> ApiResult<(StatusCode, Json<EventResponse>)> {
    let sync = request.sync;
    let event = request.into_event(tenant.as_str());
    debug!(tenant_id = %tenant.as_str(), event_id = %event.id, sync, "Message event received");
    accept_event(&state, event, sync).await
}

pub async fn create_incoming_event(
    State(state): State<ApiState>,
    tenant: TenantId,
    Json(request): Json<IncomingEventRequest>,
) -> ApiResult<(StatusCode, Json<EventResponse>)> {
    let sync = request.sync;
    let event = request.into_event(tenant.as_str());
    debug!(tenant_id = %tenant.as_str(), event_id = %event.id, event_type = ?event.event_type, "Incoming event received");
    accept_event(&state, event, sync).await
}

pub async fn get_event(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Event>> {
    Ok(Json(state.authoring.event(tenant.as_str(), &id).await?))
}

// ============================================================================
// Schemas

pub async fn create_schema(
    State(state): State<ApiState>,
    tenant: TenantId,
    Json(request): Json<SchemaRequest>,
) -> ApiResult<(StatusCode, Json<Schema>)> {
    let schema = request.apply(Schema::new(tenant.as_str(), ""));
    let schema = state.authoring.create_schema(tenant.as_str(), schema).await?;
    Ok((StatusCode::CREATED, Json(schema)))
}

pub async fn list_schemas(State(state): State<ApiState>, tenant: TenantId) -> ApiResult<Json<Vec<Schema>>> {
    Ok(Json(state.authoring.list_schemas(tenant.as_str()).await?))
}

pub async fn get_schema(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Schema>> {
    Ok(Json(state.authoring.schema(tenant.as_str(), &id).await?))
}

pub async fn update_schema(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
    Json(request): Json<SchemaRequest>,
) -> ApiResult<Json<Schema>> {
    let existing = state.authoring.schema(tenant.as_str(), &id).await?;
    let schema = state
        .authoring
        .update_schema(tenant.as_str(), request.apply(existing))
        .await?;
    Ok(Json(schema))
}

pub async fn delete_schema(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeletedResponse>> {
    let deleted = state.authoring.delete_schema(tenant.as_str(), &id).await?;
    info!(tenant_id = %tenant.as_str(), schema_id = %id, "Schema deleted");
    Ok(Json(DeletedResponse { deleted }))
}

// ============================================================================
// Nodes

pub async fn create_node(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(schema_id): Path<Uuid>,
    Json(request): Json<NodeRequest>,
) -> ApiResult<(StatusCode, Json<Node>)> {
    let node = request.apply(Node::new(schema_id, crate::models::NodeType::ExecutionNode, ""));
    let node = state.authoring.create_node(tenant.as_str(), node).await?;
    Ok((StatusCode::CREATED, Json(node)))
}

pub async fn list_nodes(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(schema_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Node>>> {
    Ok(Json(state.authoring.list_nodes(tenant.as_str(), &schema_id).await?))
}

pub async fn get_node(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Node>> {
    Ok(Json(state.authoring.node(tenant.as_str(), &id).await?))
}

pub async fn update_node(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
    Json(request): Json<NodeRequest>,
) -> ApiResult<Json<Node>> {
    let existing = state.authoring.node(tenant.as_str(), &id).await?;
    Ok(Json(
        state
            .authoring
            .update_node(tenant.as_str(), request.apply(existing))
            .await?,
    ))
}

pub async fn delete_node(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeletedResponse>> {
    let deleted = state.authoring.delete_node(tenant.as_str(), &id).await?;
    Ok(Json(DeletedResponse { deleted }))
}

// ============================================================================
// Node actions

pub async fn create_node_action(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(node_id): Path<Uuid>,
    Json(request): Json<NodeActionRequest>,
) -> ApiResult<(StatusCode, Json<NodeAction>)> {
    let action = NodeAction::new(node_id, request.action_type.clone(), request.sequence);
    let action = state
        .authoring
        .create_node_action(tenant.as_str(), request.apply(action))
        .await?;
    Ok((StatusCode::CREATED, Json(action)))
}

pub async fn list_node_actions(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(node_id): Path<Uuid>,
) -> ApiResult<Json<Vec<NodeAction>>> {
    Ok(Json(state.authoring.list_node_actions(tenant.as_str(), &node_id).await?))
}

pub async fn get_node_action(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<NodeAction>> {
    Ok(Json(state.authoring.node_action(tenant.as_str(), &id).await?))
}

pub async fn update_node_action(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
    Json(request): Json<NodeActionRequest>,
) -> ApiResult<Json<NodeAction>> {
    let existing = state.authoring.node_action(tenant.as_str(), &id).await?;
    Ok(Json(
        state
            .authoring
            .update_node_action(tenant.as_str(), request.apply(existing))
            .await?,
    ))
}

pub async fn delete_node_action(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeletedResponse>> {
    let deleted = state.authoring.delete_node_action(tenant.as_str(), &id).await?;
    Ok(Json(DeletedResponse { deleted }))
}

// ============================================================================
// Paths and rules

pub async fn create_node_path(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(node_id): Path<Uuid>,
    Json(request): Json<NodePathRequest>,
) -> ApiResult<(StatusCode, Json<NodePath>)> {
    let path = state
        .authoring
        .create_node_path(tenant.as_str(), request.into_path(node_id))
        .await?;
    Ok((StatusCode::CREATED, Json(path)))
}

pub async fn list_node_paths(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(node_id): Path<Uuid>,
) -> ApiResult<Json<Vec<NodePath>>> {
    Ok(Json(state.authoring.list_node_paths(tenant.as_str(), &node_id).await?))
}

pub async fn get_node_path(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<NodePath>> {
    Ok(Json(state.authoring.node_path(tenant.as_str(), &id).await?))
}

pub async fn delete_node_path(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeletedResponse>> {
    let deleted = state.authoring.delete_node_path(tenant.as_str(), &id).await?;
    Ok(Json(DeletedResponse { deleted }))
}

pub async fn create_rule(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(node_id): Path<Uuid>,
    Json(request): Json<RuleRequest>,
) -> ApiResult<(StatusCode, Json<Rule>)> {
    let rule = state
        .authoring
        .create_rule(tenant.as_str(), request.into_rule(node_id))
        .await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn list_rules(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(node_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Rule>>> {
    Ok(Json(state.authoring.list_rules(tenant.as_str(), &node_id).await?))
}

pub async fn get_rule(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Rule>> {
    Ok(Json(state.authoring.rule(tenant.as_str(), &id).await?))
}

pub async fn delete_rule(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeletedResponse>> {
    let deleted = state.authoring.delete_rule(tenant.as_str(), &id).await?;
    Ok(Json(DeletedResponse { deleted }))
}

// ============================================================================
// Conditions

pub async fn create_condition(
    State(state): State<ApiState>,
    Json(request): Json<ConditionRequest>,
) -> ApiResult<(StatusCode, Json<Condition>)> {
    let condition = state.authoring.create_condition(request.into_condition()).await?;
    Ok((StatusCode::CREATED, Json(condition)))
}

pub async fn get_condition(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult<Json<Condition>> {
    Ok(Json(state.authoring.condition(&id).await?))
}

pub async fn get_condition_tree(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ConditionTree>> {
    Ok(Json(state.authoring.condition_tree(&id).await?))
}

pub async fn update_condition(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ConditionRequest>,
) -> ApiResult<Json<Condition>> {
    let existing = state.authoring.condition(&id).await?;
    Ok(Json(state.authoring.update_condition(request.apply(existing)).await?))
}

pub async fn delete_condition(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeletedResponse>> {
    let deleted = state.authoring.delete_condition(&id).await?;
    Ok(Json(DeletedResponse { deleted }))
}

// ============================================================================
// Schema instances

pub async fn list_schema_instances(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(schema_id): Path<Uuid>,
) -> ApiResult<Json<Vec<SchemaInstance>>> {
    Ok(Json(
        state
            .authoring
            .list_schema_instances(tenant.as_str(), &schema_id)
            .await?,
    ))
}

pub async fn get_schema_instance(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SchemaInstance>> {
    Ok(Json(state.authoring.schema_instance(tenant.as_str(), &id).await?))
}

pub async fn terminate_schema_instance(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SchemaInstance>> {
    state.authoring.schema_instance(tenant.as_str(), &id).await?;
    let instance = state.runtime.terminate_instance(&id).await?;
    info!(tenant_id = %tenant.as_str(), schema_instance_id = %id, "Schema instance terminated");
    Ok(Json(instance))
}

pub async fn delete_schema_instance(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeletedResponse>> {
    state.authoring.schema_instance(tenant.as_str(), &id).await?;
    let deleted = state.runtime.delete_instance(&id).await?;
    Ok(Json(DeletedResponse { deleted }))
}

pub async fn get_almanac(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<AlmanacFact>>> {
    Ok(Json(state.authoring.almanac(tenant.as_str(), &id).await?))
}

pub async fn list_node_instances(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<NodeInstance>>> {
    Ok(Json(state.authoring.node_instances(tenant.as_str(), &id).await?))
}

pub async fn list_node_action_instances(
    State(state): State<ApiState>,
    tenant: TenantId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<NodeActionInstance>>> {
    Ok(Json(state.authoring.node_action_instances(tenant.as_str(), &id).await?))
}

pub async fn list_dead_letters(State(state): State<ApiState>) -> ApiResult<Json<Vec<DeadLetter>>> {
    Ok(Json(state.authoring.dead_letters().await?))
}
