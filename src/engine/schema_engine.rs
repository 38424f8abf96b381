// Schema engine - the traversal state machine

//! # Schema Engine
//!
//! Drives one schema instance through its node graph:
//!
//! 1. create the instance when the event does not belong to one yet
//! 2. run the current node's actions unless the node instance is `Executed`
//! 3. choose the next node according to the node type
//! 4. create or fetch the next node instance and make it current
//!
//! ```text
//! NodeInstance: Pending ──run actions──▶ Executed ──traverse──▶ next node
//!                  │                        │
//!                  │                        ├─ no input ──▶ Waiting
//!                  └── Exit action ─────────┴────────────────▶ Exited
//! ```
//!
//! ## Concurrency
//!
//! Every entry point takes an async mutex keyed by schema instance id, so two
//! events for the same instance never interleave. Writes of the current node
//! pointer and node instances are additionally version-checked in storage.
//!
//! Each instance also owns a `CancellationToken`. `terminate` and
//! `delete_instance` cancel it first, which aborts in-flight traversals
//! between actions and fires the cancellation of pending timers.
//!
//! ## Side Effects
//!
//! The engine never schedules timers or spawns child workflows itself. It
//! returns them in the [`ExecutionOutcome`] and the runtime routes them to
//! the timer and child-schema queues.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::actions::{ActionExecutor, ActionResult, ActionSignal, MessagingService};
use crate::engine::almanac::Almanac;
use crate::engine::conditions::ConditionEvaluator;
use crate::engine::graph::GraphAccessor;
use crate::engine::storage::WorkflowStorage;
use crate::models::{
    AlmanacFact, ContextParam, DataType, Event, EventType, ExecutionStatus, Node, NodeActionInstance,
    NodeInstance, NodeType, Schema, SchemaInstance,
};
use crate::settings::EngineConfig;
use crate::{FlowgateError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraversalStatus {
    /// A new node instance became current
    Advanced,
    /// The current node needs input the event did not carry
    AwaitingInput,
    /// The current timer node waits for its timer
    WaitingForTimer,
    /// The current node has no successor
    Completed,
    /// An Exit action stopped the workflow
    Exited,
    /// The instance was terminated; nothing was done
    Terminated,
    /// A timer fired for a node that is no longer waiting on it
    Ignored,
}

/// Deferred re-check of a timer node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerRequest {
    pub schema_instance_id: Uuid,
    pub node_instance_id: Uuid,
    pub node_id: Uuid,
    pub delay_secs: u64,
    pub attempt: u32,
}

/// Child workflow to start on behalf of a parent instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildTrigger {
    pub tenant_id: String,
    pub parent_schema_instance_id: Uuid,
    pub schema_id: Uuid,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub schema_instance: SchemaInstance,
    pub current_node_instance: Option<NodeInstance>,
    pub status: TraversalStatus,
    /// Nodes advanced during this call
    pub steps: usize,
    pub timers: Vec<TimerRequest>,
    pub child_triggers: Vec<ChildTrigger>,
}

#[derive(Default)]
struct Effects {
    timers: Vec<TimerRequest>,
    child_triggers: Vec<ChildTrigger>,
}

enum NodeRun {
    Completed(Value),
    Exited(Value),
}

enum Step {
    Advance { next_node_id: Uuid, path_id: Option<Uuid> },
    AwaitInput,
    AwaitTimer { schedule: bool },
    Exit(Value),
    End,
}

impl Step {
    fn follow(next_node_id: Option<Uuid>) -> Self {
        match next_node_id {
            Some(next_node_id) => Step::Advance {
                next_node_id,
                path_id: None,
            },
            None => Step::End,
        }
    }
}

pub struct SchemaEngine {
    storage: Arc<dyn WorkflowStorage>,
    graph: GraphAccessor,
    evaluator: ConditionEvaluator,
    executor: ActionExecutor,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    cancellations: DashMap<Uuid, CancellationToken>,
    config: EngineConfig,
}

impl SchemaEngine {
    pub fn new(
        storage: Arc<dyn WorkflowStorage>,
        messaging: Arc<dyn MessagingService>,
        config: EngineConfig,
    ) -> Self {
        Self {
            graph: GraphAccessor::new(storage.clone()),
            evaluator: ConditionEvaluator::new(storage.clone()),
            executor: ActionExecutor::new(storage.clone(), messaging).with_request_timeout(config.action_timeout()),
            storage,
            locks: DashMap::new(),
            cancellations: DashMap::new(),
            config,
        }
    }

    pub fn storage(&self) -> Arc<dyn WorkflowStorage> {
        self.storage.clone()
    }

    pub fn graph(&self) -> &GraphAccessor {
        &self.graph
    }

    pub fn evaluator(&self) -> &ConditionEvaluator {
        &self.evaluator
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn instance_lock(&self, schema_instance_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(schema_instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Token cancelled when the instance is terminated or deleted
    pub fn cancellation_token(&self, schema_instance_id: Uuid) -> CancellationToken {
        self.cancellations
            .entry(schema_instance_id)
            .or_insert_with(CancellationToken::new)
            .child_token()
    }

    fn cancel_instance(&self, schema_instance_id: &Uuid) {
        if let Some((_, token)) = self.cancellations.remove(schema_instance_id) {
            token.cancel();
        }
    }

    /// Run the event against `instance`, creating a new instance when `None`
    pub async fn execute(
        &self,
        schema: &Schema,
        instance: Option<SchemaInstance>,
        event: &Event,
    ) -> Result<ExecutionOutcome> {
        let instance = match instance {
            Some(instance) => instance,
            None => self.create_instance(schema, event).await?,
        };
        if instance.schema_id != schema.id {
            return Err(FlowgateError::Validation(format!(
                "schema instance {} does not belong to schema {}",
                instance.id, schema.id
            )));
        }

        let schema_instance_id = instance.id;
        let lock = self.instance_lock(schema_instance_id);
        let result = {
            let _guard = lock.lock().await;
            self.execute_locked(schema, &schema_instance_id, event).await
        };
        self.release(&schema_instance_id, lock, &result);
        result
    }

    async fn execute_locked(
        &self,
        schema: &Schema,
        schema_instance_id: &Uuid,
        event: &Event,
    ) -> Result<ExecutionOutcome> {
        let token = self.cancellation_token(*schema_instance_id);
        let instance = self.reload_instance(schema_instance_id).await?;
        if instance.terminated {
            debug!(schema_instance_id = %instance.id, "Event for terminated instance ignored");
            return Ok(outcome(instance, None, TraversalStatus::Terminated, 0, Effects::default()));
        }

        let mut effects = Effects::default();
        self.drive(schema, instance, Some(event), &token, &mut effects, 0).await
    }

    /// Forget the lock and token of an instance nobody is waiting on.
    /// Tokens are kept while the instance can still have a pending timer.
    fn release(&self, schema_instance_id: &Uuid, lock: Arc<Mutex<()>>, result: &Result<ExecutionOutcome>) {
        drop(lock);
        let finished = matches!(
            result,
            Ok(ExecutionOutcome {
                status: TraversalStatus::Completed | TraversalStatus::Exited | TraversalStatus::Terminated,
                ..
            })
        );
        if finished {
            self.cancellations.remove(schema_instance_id);
        }
        self.locks
            .remove_if(schema_instance_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Instances with engine bookkeeping (locks, tokens) still held
    pub fn tracked_instances(&self) -> (usize, usize) {
        (self.locks.len(), self.cancellations.len())
    }

    /// Create an instance, bind its context params and pre-create every node instance
    pub async fn create_instance(&self, schema: &Schema, event: &Event) -> Result<SchemaInstance> {
        let root_node_id = schema.root_node_id.ok_or_else(|| {
            FlowgateError::GraphIntegrity(format!("schema {} has no root node", schema.id))
        })?;

        let now = Utc::now();
        let sequence = self
            .storage
            .next_instance_sequence(&schema.tenant_id, &schema.id, now.date_naive())
            .await?;
        let code = format!("E-{}-{:03}", now.format("%y%m%d"), sequence);

        let params = schema
            .context_params
            .iter()
            .map(|param| bind_context_param(param, event, &code))
            .collect();
        let mut instance = SchemaInstance::new(schema, code, params);
        instance.execution_started = true;
        instance.execution_started_at = Some(now);
        if event.event_type == EventType::TriggerChildWorkflow {
            instance.parent_schema_instance_id = event
                .payload
                .as_ref()
                .and_then(|p| p.get("parent_schema_instance_id"))
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok());
        }
        let mut instance = self.storage.create_schema_instance(instance).await?;

        for node in self.storage.list_nodes(&schema.id).await? {
            self.storage.get_or_create_node_instance(&node, &instance.id).await?;
        }
        let root = self
            .storage
            .find_node_instance(&root_node_id, &instance.id)
            .await?
            .ok_or_else(|| {
                FlowgateError::GraphIntegrity(format!(
                    "root node {} is not part of schema {}",
                    root_node_id, schema.id
                ))
            })?;

        if event.event_type == EventType::TriggerChildWorkflow {
            let seeded: Vec<AlmanacFact> = event
                .payload
                .as_ref()
                .and_then(|p| p.get("almanac"))
                .and_then(|facts| serde_json::from_value(facts.clone()).ok())
                .unwrap_or_default();
            if !seeded.is_empty() {
                self.storage.update_almanac_facts(&instance.id, seeded).await?;
            }
        }

        instance.root_node_instance_id = Some(root.id);
        instance.current_node_instance_id = Some(root.id);
        let instance = self.storage.update_schema_instance(instance).await?;

        info!(
            schema_id = %schema.id,
            schema_instance_id = %instance.id,
            code = %instance.code,
            "Schema instance created"
        );
        Ok(instance)
    }

    /// Re-check a timer node after its delay
    pub async fn on_timer_fired(&self, node_instance_id: &Uuid) -> Result<ExecutionOutcome> {
        let node_instance = self
            .storage
            .get_node_instance(node_instance_id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("NodeInstance", node_instance_id))?;

        let schema_instance_id = node_instance.schema_instance_id;
        let lock = self.instance_lock(schema_instance_id);
        let result = {
            let _guard = lock.lock().await;
            self.timer_fired_locked(&schema_instance_id, node_instance_id).await
        };
        self.release(&schema_instance_id, lock, &result);
        result
    }

    async fn timer_fired_locked(
        &self,
        schema_instance_id: &Uuid,
        node_instance_id: &Uuid,
    ) -> Result<ExecutionOutcome> {
        let token = self.cancellation_token(*schema_instance_id);
        let instance = self.reload_instance(schema_instance_id).await?;
        if instance.terminated {
            return Ok(outcome(instance, None, TraversalStatus::Terminated, 0, Effects::default()));
        }
        let node_instance = self
            .storage
            .get_node_instance(node_instance_id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("NodeInstance", node_instance_id))?;
        let node = self.node_for(&node_instance).await?;

        let still_waiting = instance.current_node_instance_id == Some(node_instance.id)
            && node_instance.status == ExecutionStatus::Waiting
            && !node_instance.timer_finished
            && node.node_type == NodeType::TimerNode;
        if !still_waiting {
            debug!(node_instance_id = %node_instance.id, "Stale timer ignored");
            return Ok(outcome(
                instance,
                Some(node_instance),
                TraversalStatus::Ignored,
                0,
                Effects::default(),
            ));
        }
        ensure_active(&token, &instance)?;

        let schema = self.graph.schema(&instance.schema_id).await?;
        let satisfied = match node.rule_id {
            Some(rule_id) => {
                let rule = self.graph.rule(&rule_id).await.map_err(|e| integrity(e, &node))?;
                let almanac = Almanac::new(self.storage.clone(), instance.id);
                self.evaluator
                    .evaluate_by_id(&rule.condition_id, &almanac, None, None)
                    .await?
                    .passed
            }
            None => true,
        };

        let tries = node_instance.timer_tries_completed + 1;
        let allowed = node.number_of_tries.max(1);
        let mut effects = Effects::default();

        let target = if satisfied {
            self.storage.update_timer_tries(&node_instance.id, tries, true).await?;
            node.success_target()
        } else if tries < allowed {
            let node_instance = self.storage.update_timer_tries(&node_instance.id, tries, false).await?;
            effects.timers.push(TimerRequest {
                schema_instance_id: instance.id,
                node_instance_id: node_instance.id,
                node_id: node.id,
                delay_secs: node.timer_seconds,
                attempt: tries + 1,
            });
            debug!(node_instance_id = %node_instance.id, tries, "Timer condition not met, rescheduling");
            return Ok(outcome(
                instance,
                Some(node_instance),
                TraversalStatus::WaitingForTimer,
                0,
                effects,
            ));
        } else {
            self.storage.update_timer_tries(&node_instance.id, tries, true).await?;
            node.next_node_id_on_timeout
        };

        let current = self
            .storage
            .set_execution_status(
                &node_instance.id,
                ExecutionStatus::Executed,
                Some(json!({ "timer_satisfied": satisfied, "tries": tries })),
            )
            .await?;
        info!(
            node_instance_id = %current.id,
            satisfied,
            tries,
            "Timer node finished"
        );

        let Some(next_node_id) = target else {
            return Ok(outcome(instance, Some(current), TraversalStatus::Completed, 0, effects));
        };
        let (instance, next) = self
            .set_next_node_instance(instance, &current, next_node_id, None)
            .await?;
        if schema.execute_immediately || next.node_type == NodeType::TimerNode {
            return self.drive(&schema, instance, None, &token, &mut effects, 1).await;
        }
        Ok(outcome(instance, Some(next), TraversalStatus::Advanced, 1, effects))
    }

    /// Mark the instance terminated and cancel its timers and in-flight work
    pub async fn terminate(&self, schema_instance_id: &Uuid) -> Result<SchemaInstance> {
        self.cancel_instance(schema_instance_id);

        let lock = self.instance_lock(*schema_instance_id);
        let result = {
            let _guard = lock.lock().await;
            self.terminate_locked(schema_instance_id).await
        };
        // later events get a fresh, uncancelled token but see `terminated`
        self.cancel_instance(schema_instance_id);
        drop(lock);
        self.locks
            .remove_if(schema_instance_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn terminate_locked(&self, schema_instance_id: &Uuid) -> Result<SchemaInstance> {
        let mut instance = self.reload_instance(schema_instance_id).await?;
        if instance.terminated {
            return Ok(instance);
        }
        instance.terminated = true;
        instance.terminated_at = Some(Utc::now());
        let instance = self.storage.update_schema_instance(instance).await?;

        if let Some(current) = instance.current_node_instance_id {
            self.storage
                .set_execution_status(&current, ExecutionStatus::Exited, None)
                .await?;
        }
        info!(schema_instance_id = %instance.id, "Schema instance terminated");
        Ok(instance)
    }

    pub async fn delete_instance(&self, schema_instance_id: &Uuid) -> Result<bool> {
        self.cancel_instance(schema_instance_id);
        let lock = self.instance_lock(*schema_instance_id);
        let deleted = {
            let _guard = lock.lock().await;
            self.storage.delete_schema_instance(schema_instance_id).await
        };
        self.cancel_instance(schema_instance_id);
        drop(lock);
        self.locks
            .remove_if(schema_instance_id, |_, lock| Arc::strong_count(lock) == 1);
        let deleted = deleted?;
        if deleted {
            info!(schema_instance_id = %schema_instance_id, "Schema instance deleted");
        }
        Ok(deleted)
    }

    async fn drive(
        &self,
        schema: &Schema,
        mut instance: SchemaInstance,
        mut input: Option<&Event>,
        token: &CancellationToken,
        effects: &mut Effects,
        mut steps: usize,
    ) -> Result<ExecutionOutcome> {
        loop {
            ensure_active(token, &instance)?;
            let mut current = self.current_node_instance(&instance).await?;
            let node = self.node_for(&current).await?;
            let prior = current.status;

            if prior == ExecutionStatus::Exited {
                return Ok(outcome(instance, Some(current), TraversalStatus::Exited, steps, take(effects)));
            }

            if prior != ExecutionStatus::Executed {
                match self.run_node_actions(&node, &current, input, token, effects).await? {
                    NodeRun::Completed(results) => {
                        current = self
                            .storage
                            .set_execution_status(&current.id, ExecutionStatus::Executed, Some(results))
                            .await?;
                    }
                    NodeRun::Exited(results) => {
                        let current = self
                            .storage
                            .set_execution_status(&current.id, ExecutionStatus::Exited, Some(results))
                            .await?;
                        info!(schema_instance_id = %instance.id, node_id = %node.id, "Workflow exited");
                        return Ok(outcome(instance, Some(current), TraversalStatus::Exited, steps, take(effects)));
                    }
                }
            }

            match self
                .choose_next(&instance, &node, &current, input, prior, token, effects)
                .await?
            {
                Step::AwaitInput => {
                    let current = self
                        .storage
                        .set_execution_status(&current.id, ExecutionStatus::Waiting, None)
                        .await?;
                    return Ok(outcome(
                        instance,
                        Some(current),
                        TraversalStatus::AwaitingInput,
                        steps,
                        take(effects),
                    ));
                }
                Step::AwaitTimer { schedule } => {
                    let current = self
                        .storage
                        .set_execution_status(&current.id, ExecutionStatus::Waiting, None)
                        .await?;
                    if schedule {
                        effects.timers.push(TimerRequest {
                            schema_instance_id: instance.id,
                            node_instance_id: current.id,
                            node_id: node.id,
                            delay_secs: node.timer_seconds,
                            attempt: current.timer_tries_completed + 1,
                        });
                    }
                    return Ok(outcome(
                        instance,
                        Some(current),
                        TraversalStatus::WaitingForTimer,
                        steps,
                        take(effects),
                    ));
                }
                Step::Exit(result) => {
                    let current = self
                        .storage
                        .set_execution_status(&current.id, ExecutionStatus::Exited, Some(result))
                        .await?;
                    return Ok(outcome(instance, Some(current), TraversalStatus::Exited, steps, take(effects)));
                }
                Step::End => {
                    return Ok(outcome(instance, Some(current), TraversalStatus::Completed, steps, take(effects)));
                }
                Step::Advance { next_node_id, path_id } => {
                    let (advanced, next) = self
                        .set_next_node_instance(instance, &current, next_node_id, path_id)
                        .await?;
                    instance = advanced;
                    steps += 1;
                    input = None;

                    let keep_going = schema.execute_immediately || next.node_type == NodeType::TimerNode;
                    if !keep_going {
                        return Ok(outcome(instance, Some(next), TraversalStatus::Advanced, steps, take(effects)));
                    }
                    if steps > self.config.max_chain_steps {
                        return Err(FlowgateError::GraphIntegrity(format!(
                            "schema instance {} exceeded {} chained steps",
                            instance.id, self.config.max_chain_steps
                        )));
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn choose_next(
        &self,
        instance: &SchemaInstance,
        node: &Node,
        current: &NodeInstance,
        input: Option<&Event>,
        prior: ExecutionStatus,
        token: &CancellationToken,
        effects: &mut Effects,
    ) -> Result<Step> {
        match node.node_type {
            NodeType::ExecutionNode => Ok(Step::follow(node.next_node_id)),
            NodeType::QuestionNode => {
                let Some(answer) = input.and_then(Event::answer) else {
                    return Ok(Step::AwaitInput);
                };
                if let Some(step) = self.select_path(instance, node, Some(&answer), input).await? {
                    return Ok(step);
                }
                let has_paths = !self.graph.node_paths(&node.id).await?.is_empty();
                match (has_paths, node.next_node_id) {
                    (false, Some(next)) => Ok(Step::follow(Some(next))),
                    _ => Ok(Step::AwaitInput),
                }
            }
            NodeType::ListeningNode => {
                let Some(event) = input else {
                    return Ok(Step::AwaitInput);
                };
                let heard = event
                    .text()
                    .map(|text| Value::String(text.to_string()))
                    .or_else(|| event.answer());
                if let Some(rule_id) = node.rule_id {
                    if !self.rule_passes(instance, node, &rule_id, input, heard.as_ref()).await? {
                        return Ok(Step::AwaitInput);
                    }
                }
                if self.graph.node_paths(&node.id).await?.is_empty() {
                    return Ok(Step::follow(node.next_node_id));
                }
                Ok(self
                    .select_path(instance, node, heard.as_ref(), input)
                    .await?
                    .unwrap_or(Step::AwaitInput))
            }
            NodeType::YesNoNode => {
                let Some(answer) = input.and_then(Event::answer) else {
                    return Ok(Step::AwaitInput);
                };
                let yes = match node.rule_id {
                    Some(rule_id) => self.rule_passes(instance, node, &rule_id, input, Some(&answer)).await?,
                    None => is_affirmative(&answer),
                };
                let branch = if yes { node.yes_action_id } else { node.no_action_id };
                let Some(action_id) = branch else {
                    return Ok(Step::follow(node.next_node_id));
                };

                let action_instance = self
                    .graph
                    .get_or_create_node_action_instance(&action_id, current)
                    .await
                    .map_err(|e| integrity(e, node))?;
                let next = action_instance.snapshot.next_node_id.or(node.next_node_id);
                if let Some(result) = self
                    .run_action_instance(action_instance, current, input, token, effects)
                    .await?
                {
                    if result.signal == ActionSignal::Exit {
                        return Ok(Step::Exit(json!({ "branch": if yes { "yes" } else { "no" } })));
                    }
                }
                Ok(Step::follow(next))
            }
            NodeType::TimerNode => Ok(Step::AwaitTimer {
                schedule: prior != ExecutionStatus::Waiting && !current.timer_finished,
            }),
        }
    }

    /// First path whose rule passes, else the first path without a rule
    async fn select_path(
        &self,
        instance: &SchemaInstance,
        node: &Node,
        argument: Option<&Value>,
        event: Option<&Event>,
    ) -> Result<Option<Step>> {
        let almanac = Almanac::new(self.storage.clone(), instance.id);
        let mut fallback = None;
        for route in self.graph.node_paths(&node.id).await? {
            match route.rule {
                Some(rule) => {
                    let evaluation = self
                        .evaluator
                        .evaluate_by_id(&rule.condition_id, &almanac, event, argument)
                        .await
                        .map_err(|e| integrity(e, node))?;
                    if evaluation.passed {
                        debug!(node_id = %node.id, path_id = %route.path.id, "Path rule passed");
                        return Ok(Some(Step::Advance {
                            next_node_id: route.path.next_node_id,
                            path_id: Some(route.path.id),
                        }));
                    }
                }
                None if fallback.is_none() => {
                    fallback = Some(Step::Advance {
                        next_node_id: route.path.next_node_id,
                        path_id: Some(route.path.id),
                    });
                }
                None => {}
            }
        }
        Ok(fallback)
    }

    async fn rule_passes(
        &self,
        instance: &SchemaInstance,
        node: &Node,
        rule_id: &Uuid,
        event: Option<&Event>,
        argument: Option<&Value>,
    ) -> Result<bool> {
        let rule = self.graph.rule(rule_id).await.map_err(|e| integrity(e, node))?;
        let almanac = Almanac::new(self.storage.clone(), instance.id);
        Ok(self
            .evaluator
            .evaluate_by_id(&rule.condition_id, &almanac, event, argument)
            .await
            .map_err(|e| integrity(e, node))?
            .passed)
    }

    async fn run_node_actions(
        &self,
        node: &Node,
        node_instance: &NodeInstance,
        event: Option<&Event>,
        token: &CancellationToken,
        effects: &mut Effects,
    ) -> Result<NodeRun> {
        let instances = self
            .graph
            .get_or_create_node_action_instances(node, node_instance)
            .await?;

        let mut results = Vec::new();
        for action_instance in instances.into_iter().filter(|ai| !ai.snapshot.is_path_action) {
            let action_id = action_instance.action_id;
            let Some(result) = self
                .run_action_instance(action_instance, node_instance, event, token, effects)
                .await?
            else {
                continue;
            };
            let exited = result.signal == ActionSignal::Exit;
            results.push(json!({ "action_id": action_id, "result": result }));
            if exited {
                return Ok(NodeRun::Exited(Value::Array(results)));
            }
        }
        Ok(NodeRun::Completed(Value::Array(results)))
    }

    /// Run one action instance unless it already ran
    async fn run_action_instance(
        &self,
        mut action_instance: NodeActionInstance,
        node_instance: &NodeInstance,
        event: Option<&Event>,
        token: &CancellationToken,
        effects: &mut Effects,
    ) -> Result<Option<ActionResult>> {
        if action_instance.executed {
            return Ok(None);
        }
        if token.is_cancelled() {
            return Err(FlowgateError::Cancelled(format!(
                "schema instance {} was terminated",
                node_instance.schema_instance_id
            )));
        }

        let result = self
            .executor
            .execute(&action_instance.snapshot, node_instance, event)
            .await?;
        if !result.success {
            warn!(
                action_id = %action_instance.action_id,
                action_type = ?action_instance.snapshot.action_type,
                "Action reported failure"
            );
        }

        action_instance.executed = true;
        action_instance.executed_at = Some(Utc::now());
        action_instance.result = Some(serde_json::to_value(&result)?);
        self.storage.update_node_action_instance(action_instance).await?;

        if let ActionSignal::TriggerChild { schema_id, payload } = &result.signal {
            let tenant_id = self.reload_instance(&node_instance.schema_instance_id).await?.tenant_id;
            effects.child_triggers.push(ChildTrigger {
                tenant_id,
                parent_schema_instance_id: node_instance.schema_instance_id,
                schema_id: *schema_id,
                payload: payload.clone(),
            });
        }
        Ok(Some(result))
    }

    /// Make the node `next_node_id` current, recording the path taken from `current`
    pub async fn set_next_node_instance(
        &self,
        instance: SchemaInstance,
        current: &NodeInstance,
        next_node_id: Uuid,
        path_id: Option<Uuid>,
    ) -> Result<(SchemaInstance, NodeInstance)> {
        let node = self.graph.node(&next_node_id).await.map_err(|_| {
            FlowgateError::GraphIntegrity(format!("next node {} does not exist", next_node_id))
        })?;
        if node.schema_id != instance.schema_id {
            return Err(FlowgateError::GraphIntegrity(format!(
                "next node {} belongs to another schema",
                next_node_id
            )));
        }

        if path_id.is_some() {
            let mut taken = current.clone();
            taken.chosen_node_path_id = path_id;
            self.storage.update_node_instance(taken).await?;
        }

        let mut next = self.storage.get_or_create_node_instance(&node, &instance.id).await?;
        if next.status != ExecutionStatus::Pending {
            // revisiting a node runs it again from scratch
            self.storage.update_timer_tries(&next.id, 0, false).await?;
            next = self
                .storage
                .set_execution_status(&next.id, ExecutionStatus::Pending, None)
                .await?;
            for mut action_instance in self.storage.list_node_action_instances(&next.id).await? {
                action_instance.executed = false;
                action_instance.executed_at = None;
                self.storage.update_node_action_instance(action_instance).await?;
            }
        }

        let instance = self
            .storage
            .update_current_node_instance(&instance.id, &next.id, instance.version)
            .await?;
        debug!(
            schema_instance_id = %instance.id,
            node_id = %node.id,
            node_instance_id = %next.id,
            "Advanced to next node"
        );
        Ok((instance, next))
    }

    async fn reload_instance(&self, id: &Uuid) -> Result<SchemaInstance> {
        self.storage
            .get_schema_instance(id)
            .await?
            .ok_or_else(|| FlowgateError::not_found("SchemaInstance", id))
    }

    async fn current_node_instance(&self, instance: &SchemaInstance) -> Result<NodeInstance> {
        let id = instance.current_node_instance_id.ok_or_else(|| {
            FlowgateError::GraphIntegrity(format!("schema instance {} has no current node", instance.id))
        })?;
        self.storage.get_node_instance(&id).await?.ok_or_else(|| {
            FlowgateError::GraphIntegrity(format!("current node instance {} does not exist", id))
        })
    }

    async fn node_for(&self, node_instance: &NodeInstance) -> Result<Node> {
        self.storage
            .get_node(&node_instance.node_id)
            .await?
            .ok_or_else(|| {
                FlowgateError::GraphIntegrity(format!(
                    "node {} of node instance {} does not exist",
                    node_instance.node_id, node_instance.id
                ))
            })
    }
}

fn outcome(
    instance: SchemaInstance,
    current: Option<NodeInstance>,
    status: TraversalStatus,
    steps: usize,
    effects: Effects,
) -> ExecutionOutcome {
    ExecutionOutcome {
        schema_instance: instance,
        current_node_instance: current,
        status,
        steps,
        timers: effects.timers,
        child_triggers: effects.child_triggers,
    }
}

fn take(effects: &mut Effects) -> Effects {
    std::mem::take(effects)
}

fn ensure_active(token: &CancellationToken, instance: &SchemaInstance) -> Result<()> {
    if token.is_cancelled() || instance.terminated {
        return Err(FlowgateError::Cancelled(format!(
            "schema instance {} was terminated",
            instance.id
        )));
    }
    Ok(())
}

/// Missing graph elements referenced from a node are integrity failures
fn integrity(err: FlowgateError, node: &Node) -> FlowgateError {
    match err {
        FlowgateError::NotFound { entity, id } => FlowgateError::GraphIntegrity(format!(
            "{} {} referenced from node {} does not exist",
            entity, id, node.id
        )),
        other => other,
    }
}

fn is_affirmative(answer: &Value) -> bool {
    match answer {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "yes" | "y" | "true" | "1" | "ok"
        ),
        _ => false,
    }
}

fn bind_context_param(param: &ContextParam, event: &Event, code: &str) -> ContextParam {
    let mut bound = param.clone();
    bound.value = if param.is_instance_code() {
        Some(Value::String(code.to_string()))
    } else {
        match param.param_type {
            DataType::Phonenumber => event.phone().map(|phone| Value::String(phone.to_string())),
            DataType::Location => event.location().map(|location| location.to_json()),
            DataType::Date | DataType::DateTime => Some(Value::String(Utc::now().to_rfc3339())),
            _ => event.context_value(&param.name),
        }
    };
    bound
}
