// flowgate engine
// Execution, evaluation and persistence of schema instances

//! # Engine Module
//!
//! Everything between the domain models and the REST surface lives here.
//!
//! ## Architecture Overview
//!
//! - **Domain Models**: pure data (in `models/`)
//! - **Engine Layer**: storage, evaluation, execution and queues (this module)
//! - **API Layer**: axum handlers translating requests into engine calls (in `api/`)
//!
//! ## Engine Components
//!
//! ### Storage (`storage` module)
//! - `WorkflowStorage` repository trait covering graph, runtime and event records
//! - `InMemoryStorage` implementation with version-checked instance writes
//!
//! ### Evaluation (`almanac`, `conditions`, `graph` modules)
//! - per-instance fact store
//! - recursive condition evaluation with explanation reports
//! - read helpers over Schema → Node → Path/Rule → Condition
//!
//! ### Execution (`actions`, `schema_engine` modules)
//! - action dispatch and the outbound messaging collaborator
//! - the traversal state machine with per-instance locking
//!
//! ### Background Work (`queue`, `timers`, `events`, `matching` modules)
//! - bounded worker pools with deadlines and dead letters
//! - cancellable timer scheduling
//! - event routing and the `EngineRuntime` composition root
//! - matching inbound events to live instances
//!
//! ### Authoring (`authoring` module)
//! - validated CRUD used by the API
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! 1. Create a directory with the module name (`engine/`)
//! 2. Add a `mod.rs` file as the module root
//! 3. Declare submodules in `mod.rs`
//! 4. Re-export important types for a flat public API

pub mod actions;
pub mod almanac;
pub mod authoring;
pub mod conditions;
pub mod events;
pub mod graph;
pub mod matching;
pub mod queue;
pub mod schema_engine;
pub mod storage;
pub mod timers;


pub use actions::{ActionExecutor, ActionResult, ActionSignal, MessagingService};
pub use almanac::Almanac;
pub use authoring::{AuthoringService, ConditionTree};
pub use conditions::{ConditionEvaluation, ConditionEvaluator};
pub use events::{ChildSchemaTriggerHandler, EngineRuntime, EventHandler, OutcomeRouter};
pub use graph::{GraphAccessor, NodeGraph, PathRoute};
pub use matching::InstanceMatcher;
pub use queue::{QueueStats, QueueTask, TaskHandler, TaskQueue, WorkerPool};
pub use schema_engine::{ChildTrigger, ExecutionOutcome, SchemaEngine, TimerRequest, TraversalStatus};
pub use storage::{InMemoryStorage, WorkflowStorage};
pub use timers::{TimerNodeTriggerHandler, TimerScheduler};
