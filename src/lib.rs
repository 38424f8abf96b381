// flowgate - multi-tenant workflow and rules engine
// Schemas of nodes, paths and rules driven forward by inbound events

//! # flowgate
//!
//! Tenants author *schemas*: graphs of nodes connected by paths and gated by
//! rules and conditions. Each conversation or process run is a *schema
//! instance*. Inbound events (mostly user messages) are matched to an
//! instance, and the engine executes the current node's actions, evaluates
//! conditions against the instance's almanac to choose the next node, and
//! persists the new execution state.
//!
//! ## Core Components
//!
//! ### Domain Models ([`models`])
//! - [`Schema`], [`Node`], [`NodeAction`], [`NodePath`], [`Rule`], [`Condition`]
//! - [`SchemaInstance`], [`NodeInstance`], [`NodeActionInstance`], [`Event`]
//!
//! ### Engine ([`engine`])
//! - [`Almanac`]: per-instance fact store
//! - [`ConditionEvaluator`]: evaluates condition trees
//! - [`ActionExecutor`]: dispatches node actions
//! - [`SchemaEngine`]: the traversal state machine
//! - [`EngineRuntime`]: composition root owning the event, child-schema and
//!   timer worker pools
//!
//! ### Storage
//! [`WorkflowStorage`] abstracts persistence; [`InMemoryStorage`] is the
//! bundled implementation.
//!
//! ### REST API ([`api`])
//! An axum router translating validated commands into engine and authoring
//! operations.
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users can write
//! `use flowgate::SchemaEngine` instead of
//! `use flowgate::engine::schema_engine::SchemaEngine`.

pub mod api;
pub mod engine;
pub mod models;
pub mod settings;

pub use models::{
    ActionType, AlmanacFact, CompositionOperator, Condition, ContextParam, DataType, Event,
    EventType, ExecutionStatus, LogicalOperator, Node, NodeAction, NodeActionInstance,
    NodeInstance, NodePath, NodeType, Operand, OperatorType, Rule, Schema, SchemaInstance,
};

pub use engine::{
    actions::{ActionExecutor, LoggingMessagingService, MessagingService, WebhookMessagingService},
    almanac::Almanac,
    authoring::AuthoringService,
    conditions::{ConditionEvaluation, ConditionEvaluator},
    events::{ChildSchemaTriggerHandler, EngineRuntime, EventHandler},
    schema_engine::{ExecutionOutcome, SchemaEngine, TraversalStatus},
    storage::{InMemoryStorage, WorkflowStorage},
    timers::TimerNodeTriggerHandler,
};

pub use api::{ApiServer, ApiServerBuilder};
pub use settings::AppConfig;

use thiserror::Error;

/// Error type shared by every flowgate operation
///
/// ## Rust Learning Notes:
///
/// ### The `thiserror` Crate
/// - `#[derive(Error)]` implements `std::error::Error`
/// - `#[error("...")]` provides the display message, `{field}` interpolates
/// - `#[from]` generates `From` impls so `?` converts errors automatically
#[derive(Error, Debug)]
pub enum FlowgateError {
    /// A referenced schema, node, rule, condition or instance does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The write would break a uniqueness invariant (e.g. a path bound to two rules)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed create/update payload
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Traversal cannot find the current or next node
    #[error("Graph integrity violated: {0}")]
    GraphIntegrity(String),

    /// Persistence failure
    #[error("Database access failed: {0}")]
    DbAccess(#[from] anyhow::Error),

    /// Action type or operator the engine cannot execute
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Optimistic concurrency check failed
    #[error("{entity} {id} was modified concurrently (expected version {expected}, found {found})")]
    ConcurrencyConflict {
        entity: &'static str,
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] models::ParseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The owning schema instance was terminated while work was in flight
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlowgateError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        FlowgateError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<std::io::Error> for FlowgateError {
    fn from(err: std::io::Error) -> Self {
        FlowgateError::Internal(err.to_string())
    }
}

impl From<::config::ConfigError> for FlowgateError {
    fn from(err: ::config::ConfigError) -> Self {
        FlowgateError::Validation(err.to_string())
    }
}

/// Result alias using [`FlowgateError`]
pub type Result<T> = std::result::Result<T, FlowgateError>;
