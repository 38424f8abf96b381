// REST API module
// axum router exposing event intake, authoring CRUD and instance inspection

pub mod handlers;
pub mod middleware;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::engine::events::EngineRuntime;
use crate::settings::ServerConfig;
use crate::{FlowgateError, Result};
use handlers::*;

pub use handlers::ApiState;
pub use middleware::TenantId;

/// REST API server
pub struct ApiServer {
    config: ServerConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(config: ServerConfig, runtime: Arc<EngineRuntime>) -> Self {
        Self {
            config,
            state: ApiState::new(runtime),
        }
    }

    /// Create the axum router with every route under `/api/v1` plus `/health`
    pub fn create_router(&self) -> Router {
        let api = Router::new()
            // Events
            .route("/events", post(create_incoming_event))
            .route("/events/messages", post(create_message_event))
            .route("/events/:id", get(get_event))
            // Schemas and their nodes/instances
            .route("/schemas", post(create_schema).get(list_schemas))
            .route("/schemas/:id", get(get_schema).put(update_schema).delete(delete_schema))
            .route("/schemas/:id/nodes", post(create_node).get(list_nodes))
            .route("/schemas/:id/instances", get(list_schema_instances))
            // Nodes
            .route("/nodes/:id", get(get_node).put(update_node).delete(delete_node))
            .route("/nodes/:id/actions", post(create_node_action).get(list_node_actions))
            .route("/nodes/:id/paths", post(create_node_path).get(list_node_paths))
            .route("/nodes/:id/rules", post(create_rule).get(list_rules))
            .route(
                "/actions/:id",
                get(get_node_action).put(update_node_action).delete(delete_node_action),
            )
            .route("/paths/:id", get(get_node_path).delete(delete_node_path))
            .route("/rules/:id", get(get_rule).delete(delete_rule))
            // Conditions
            .route("/conditions", post(create_condition))
            .route(
                "/conditions/:id",
                get(get_condition).put(update_condition).delete(delete_condition),
            )
            .route("/conditions/:id/tree", get(get_condition_tree))
            // Instances
            .route("/instances/:id", get(get_schema_instance).delete(delete_schema_instance))
            .route("/instances/:id/terminate", post(terminate_schema_instance))
            .route("/instances/:id/almanac", get(get_almanac))
            .route("/instances/:id/nodes", get(list_node_instances))
            .route("/node-instances/:id/actions", get(list_node_action_instances))
            .route("/dead-letters", get(list_dead_letters));

        let router = Router::new()
            .nest("/api/v1", api)
            .route("/health", get(health_check))
            .fallback(not_found)
            .with_state(self.state.clone());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| FlowgateError::Validation(format!("invalid bind address: {}", e)))?;
        let app = self.create_router();

        info!("flowgate API listening on http://{}", addr);
        info!("   POST http://{}/api/v1/events/messages", addr);
        info!("   GET  http://{}/health", addr);

        axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| FlowgateError::Internal(e.to_string()))
    }
}

/// Builder pattern for the API server
pub struct ApiServerBuilder {
    config: ServerConfig,
    runtime: Option<Arc<EngineRuntime>>,
}

impl ApiServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            runtime: None,
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn with_cors(mut self, enabled: bool) -> Self {
        self.config.cors_enabled = enabled;
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<EngineRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<ApiServer> {
        let runtime = self
            .runtime
            .ok_or_else(|| FlowgateError::Validation("an engine runtime is required".to_string()))?;
        Ok(ApiServer::new(self.config, runtime))
    }
}

impl Default for ApiServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;
