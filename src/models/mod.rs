// Core domain models for flowgate
// Plain data structures shared by the engine, storage and API layers

//! # Domain Models Module
//!
//! This module contains the authoring-time workflow graph and the runtime
//! records produced while executing it:
//!
//! ```text
//! Schema ── Node ──┬── NodeAction
//!                  ├── NodePath ── Rule ── Condition (tree)
//!                  └── Question
//!
//! SchemaInstance ── NodeInstance ── NodeActionInstance
//!        └── almanac facts
//! ```
//!
//! Nothing in here talks to storage; the engine owns all behaviour.

pub mod action;
pub mod condition;
pub mod event;
pub mod instance;
pub mod node;
pub mod path;
pub mod schema;

pub use action::{ActionOutput, ActionParam, ActionType, NodeAction, OutputDestination};
pub use condition::{
    CompositionOperator, Condition, DataType, LogicalOperator, Operand, OperatorType, ParseError,
    TypedValue, ValueSource,
};
pub use event::{DeadLetter, Event, EventType, GeoLocation, QuestionResponse, UserMessage};
pub use instance::{AlmanacFact, ExecutionStatus, NodeActionInstance, NodeInstance, SchemaInstance};
pub use node::{Node, NodeType, Question, QuestionOption, QuestionResponseType};
pub use path::{NodePath, Rule};
pub use schema::{ContextParam, Schema, SchemaType, ThresholdUnit, SCHEMA_INSTANCE_CODE_PARAM};
