// Event processing - queues, handlers and the runtime that owns them

//! # Event System
//!
//! Inbound events never run on the caller's task. [`EngineRuntime::submit_event`]
//! stores the event and pushes it onto the event queue; the
//! [`EventHandler`] later resolves schema and instance, runs the schema
//! engine and stamps the event handled.
//!
//! Work produced by an execution is routed by [`OutcomeRouter`]:
//! - timer requests go to the [`TimerScheduler`]
//! - child triggers go to the child-schema queue, drained by
//!   [`ChildSchemaTriggerHandler`]
//!
//! ```text
//! submit_event ─▶ [events] ─▶ EventHandler ─▶ SchemaEngine ─▶ OutcomeRouter
//!                                                             │        │
//!                       TimerScheduler ─(delay)─▶ [timers] ◀──┘        │
//!                                                     │                ▼
//!                            TimerNodeTriggerHandler ◀┘           [children]
//!                                                                      │
//!                                           ChildSchemaTriggerHandler ◀┘
//! ```
//!
//! [`EngineRuntime`] is the composition root: it builds the engine, the
//! three worker pools and their handlers, and owns their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::actions::MessagingService;
use crate::engine::matching::InstanceMatcher;
use crate::engine::queue::{QueueStats, QueueTask, TaskHandler, TaskQueue, WorkerPool};
use crate::engine::schema_engine::{ChildTrigger, ExecutionOutcome, SchemaEngine, TimerRequest};
use crate::engine::storage::WorkflowStorage;
use crate::engine::timers::{TimerNodeTriggerHandler, TimerScheduler};
use crate::models::{Event, EventType, SchemaInstance};
use crate::settings::AppConfig;
use crate::{FlowgateError, Result};

pub const EVENT_QUEUE: &str = "events";
pub const CHILD_QUEUE: &str = "child-schemas";
pub const TIMER_QUEUE: &str = "timers";

impl QueueTask for Event {
    fn schema_instance_id(&self) -> Option<Uuid> {
        self.schema_instance_id
    }
}

impl QueueTask for ChildTrigger {
    fn schema_instance_id(&self) -> Option<Uuid> {
        Some(self.parent_schema_instance_id)
    }
}

/// Sends the side effects of an execution to the queues that own them
#[derive(Clone)]
pub struct OutcomeRouter {
    timers: TimerScheduler,
    children: TaskQueue<ChildTrigger>,
}

impl OutcomeRouter {
    pub fn new(timers: TimerScheduler, children: TaskQueue<ChildTrigger>) -> Self {
        Self { timers, children }
    }

    pub fn route(&self, outcome: &ExecutionOutcome) -> Result<()> {
        for timer in &outcome.timers {
            self.timers.schedule(timer.clone());
        }
        for trigger in &outcome.child_triggers {
            self.children.enqueue(trigger.clone())?;
        }
        Ok(())
    }
}

pub struct EventHandler {
    storage: Arc<dyn WorkflowStorage>,
    engine: Arc<SchemaEngine>,
    matcher: InstanceMatcher,
    router: OutcomeRouter,
}

impl EventHandler {
    pub fn new(
        storage: Arc<dyn WorkflowStorage>,
        engine: Arc<SchemaEngine>,
        matcher: InstanceMatcher,
        router: OutcomeRouter,
    ) -> Self {
        Self {
            storage,
            engine,
            matcher,
            router,
        }
    }

    /// Process one stored event. Returns the execution outcome, if the event ran the engine.
    pub async fn process(&self, event: &Event) -> Result<Option<ExecutionOutcome>> {
        let outcome = match event.event_type {
            EventType::TerminateWorkflow => {
                let schema = self.matcher.resolve_schema(event).await?;
                let instance = self
                    .matcher
                    .resolve_instance(&schema, event)
                    .await?
                    .ok_or_else(|| FlowgateError::not_found("SchemaInstance", "matching the event"))?;
                let terminated = self.engine.terminate(&instance.id).await?;
                self.router.timers.cancel_for_instance(&terminated.id);
                None
            }
            EventType::TriggerChildWorkflow => {
                let schema = self.matcher.resolve_schema(event).await?;
                let outcome = self.engine.execute(&schema, None, event).await?;
                Some(outcome)
            }
            EventType::UserMessage | EventType::External => {
                let schema = self.matcher.resolve_schema(event).await?;
                let instance = self.matcher.resolve_instance(&schema, event).await?;
                Some(self.engine.execute(&schema, instance, event).await?)
            }
        };

        if let Some(outcome) = &outcome {
            self.router.route(outcome)?;
            debug!(
                event_id = %event.id,
                schema_instance_id = %outcome.schema_instance.id,
                status = ?outcome.status,
                "Event executed"
            );
        }
        self.storage.mark_event_handled(&event.id).await?;
        Ok(outcome)
    }
}

#[async_trait]
impl TaskHandler<Event> for EventHandler {
    async fn handle(&self, event: Event) -> Result<()> {
        self.process(&event).await.map(|_| ())
    }
}

/// Starts child workflows requested by `TriggerChildWorkflow` actions
pub struct ChildSchemaTriggerHandler {
    storage: Arc<dyn WorkflowStorage>,
    events: Arc<EventHandler>,
}

impl ChildSchemaTriggerHandler {
    pub fn new(storage: Arc<dyn WorkflowStorage>, events: Arc<EventHandler>) -> Self {
        Self { storage, events }
    }
}

#[async_trait]
impl TaskHandler<ChildTrigger> for ChildSchemaTriggerHandler {
    async fn handle(&self, trigger: ChildTrigger) -> Result<()> {
        let mut payload = trigger.payload.clone();
        if let Some(fields) = payload.as_object_mut() {
            fields
                .entry("parent_schema_instance_id")
                .or_insert_with(|| json!(trigger.parent_schema_instance_id));
        }
        let event = Event::new(trigger.tenant_id.clone(), EventType::TriggerChildWorkflow)
            .for_schema(trigger.schema_id)
            .with_payload(payload);
        let event = self.storage.create_event(event).await?;

        if let Some(outcome) = self.events.process(&event).await? {
            info!(
                parent_schema_instance_id = %trigger.parent_schema_instance_id,
                child_schema_instance_id = %outcome.schema_instance.id,
                "Child workflow started"
            );
        }
        Ok(())
    }
}

/// Composition root for the engine and its worker pools
pub struct EngineRuntime {
    storage: Arc<dyn WorkflowStorage>,
    engine: Arc<SchemaEngine>,
    event_handler: Arc<EventHandler>,
    scheduler: TimerScheduler,
    deadline: Duration,
    events: WorkerPool<Event>,
    children: WorkerPool<ChildTrigger>,
    timers: WorkerPool<TimerRequest>,
}

impl EngineRuntime {
    /// Build the engine and start the event, child-schema and timer pools
    pub fn start(
        storage: Arc<dyn WorkflowStorage>,
        config: &AppConfig,
        messaging: Arc<dyn MessagingService>,
    ) -> Self {
        let engine = Arc::new(SchemaEngine::new(storage.clone(), messaging, config.engine.clone()));
        let matcher = InstanceMatcher::new(storage.clone(), config.engine.clone());
        let deadline = config.queues.task_deadline();

        let (event_queue, event_receiver) = TaskQueue::<Event>::channel(EVENT_QUEUE);
        let (child_queue, child_receiver) = TaskQueue::<ChildTrigger>::channel(CHILD_QUEUE);
        let (timer_queue, timer_receiver) = TaskQueue::<TimerRequest>::channel(TIMER_QUEUE);

        let scheduler = TimerScheduler::new(engine.clone(), timer_queue.clone());
        let router = OutcomeRouter::new(scheduler.clone(), child_queue.clone());
        let event_handler = Arc::new(EventHandler::new(
            storage.clone(),
            engine.clone(),
            matcher,
            router.clone(),
        ));

        let events = WorkerPool::start(
            event_queue,
            event_receiver,
            event_handler.clone(),
            storage.clone(),
            config.queues.event_concurrency,
            deadline,
        );
        let children = WorkerPool::start(
            child_queue,
            child_receiver,
            Arc::new(ChildSchemaTriggerHandler::new(storage.clone(), event_handler.clone())),
            storage.clone(),
            config.queues.child_concurrency,
            deadline,
        );
        let timers = WorkerPool::start(
            timer_queue,
            timer_receiver,
            Arc::new(TimerNodeTriggerHandler::new(engine.clone(), router)),
            storage.clone(),
            config.queues.timer_concurrency,
            deadline,
        );

        info!("Engine runtime started");
        Self {
            storage,
            engine,
            event_handler,
            scheduler,
            deadline,
            events,
            children,
            timers,
        }
    }

    pub fn storage(&self) -> Arc<dyn WorkflowStorage> {
        self.storage.clone()
    }

    pub fn engine(&self) -> Arc<SchemaEngine> {
        self.engine.clone()
    }

    pub fn timers(&self) -> &TimerScheduler {
        &self.scheduler
    }

    /// Store the event and queue it for processing
    pub async fn submit_event(&self, event: Event) -> Result<Event> {
        let event = self.storage.create_event(event).await?;
        self.events.enqueue(event.clone())?;
        debug!(event_id = %event.id, event_type = ?event.event_type, "Event submitted");
        Ok(event)
    }

    /// Store and process an event on the caller's task, bounded by the task deadline
    pub async fn process_event(&self, event: Event) -> Result<Option<ExecutionOutcome>> {
        let event = self.storage.create_event(event).await?;
        match tokio::time::timeout(self.deadline, self.event_handler.process(&event)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(event_id = %event.id, deadline = ?self.deadline, "Synchronous event processing timed out");
                Err(FlowgateError::Timeout(format!(
                    "event {} exceeded {:?}",
                    event.id, self.deadline
                )))
            }
        }
    }

    pub async fn terminate_instance(&self, schema_instance_id: &Uuid) -> Result<SchemaInstance> {
        let instance = self.engine.terminate(schema_instance_id).await?;
        self.scheduler.cancel_for_instance(schema_instance_id);
        Ok(instance)
    }

    pub async fn delete_instance(&self, schema_instance_id: &Uuid) -> Result<bool> {
        self.scheduler.cancel_for_instance(schema_instance_id);
        self.engine.delete_instance(schema_instance_id).await
    }

    pub fn queue_stats(&self) -> Vec<QueueStats> {
        vec![
            self.events.queue().stats(),
            self.children.queue().stats(),
            self.timers.queue().stats(),
        ]
    }

    /// Wait until every queue is idle; work queued by other queues meanwhile is waited for too
    pub async fn drain(&self) {
        loop {
            self.events.drain().await;
            self.children.drain().await;
            self.timers.drain().await;
            if self.queue_stats().iter().all(|stats| stats.pending == 0) {
                return;
            }
        }
    }

    pub async fn shutdown(&self) {
        self.drain().await;
        self.events.shutdown().await;
        self.children.shutdown().await;
        self.timers.shutdown().await;
        let dropped = self.scheduler.pending();
        if dropped > 0 {
            warn!(dropped, "Pending timers dropped at shutdown");
        }
        info!("Engine runtime stopped");
    }
}
