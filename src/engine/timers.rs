// Timer node handling - delayed re-checks of timer nodes

//! # Timers
//!
//! A timer node is re-checked `timer_seconds` after the engine parked it.
//! [`TimerScheduler`] owns the delay: it sleeps on a spawned task and then
//! pushes the [`TimerRequest`] onto the timer queue. The delay is raced
//! against the instance's cancellation token, so terminating or deleting
//! the instance drops every pending timer.
//!
//! [`TimerNodeTriggerHandler`] is the queue's handler. It asks the engine
//! to re-evaluate the node, which reloads everything from storage, and
//! routes the outcome (a reschedule, the next node's timers, child triggers).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::events::OutcomeRouter;
use crate::engine::queue::{QueueTask, TaskHandler, TaskQueue};
use crate::engine::schema_engine::{SchemaEngine, TimerRequest};
use crate::Result;

impl QueueTask for TimerRequest {
    fn schema_instance_id(&self) -> Option<Uuid> {
        Some(self.schema_instance_id)
    }
}

struct ScheduledTimer {
    timer_id: Uuid,
    schema_instance_id: Uuid,
    token: CancellationToken,
}

/// Sleeps out timer delays and feeds the timer queue
#[derive(Clone)]
pub struct TimerScheduler {
    engine: Arc<SchemaEngine>,
    queue: TaskQueue<TimerRequest>,
    // keyed by node instance; one pending timer per node instance
    scheduled: Arc<DashMap<Uuid, ScheduledTimer>>,
}

impl TimerScheduler {
    pub fn new(engine: Arc<SchemaEngine>, queue: TaskQueue<TimerRequest>) -> Self {
        Self {
            engine,
            queue,
            scheduled: Arc::new(DashMap::new()),
        }
    }

    pub fn schedule(&self, request: TimerRequest) {
        let timer_id = Uuid::new_v4();
        let token = self.engine.cancellation_token(request.schema_instance_id);
        let replaced = self.scheduled.insert(
            request.node_instance_id,
            ScheduledTimer {
                timer_id,
                schema_instance_id: request.schema_instance_id,
                token: token.clone(),
            },
        );
        if let Some(previous) = replaced {
            previous.token.cancel();
        }
        debug!(
            node_instance_id = %request.node_instance_id,
            delay_secs = request.delay_secs,
            attempt = request.attempt,
            "Timer scheduled"
        );

        let queue = self.queue.clone();
        let scheduled = self.scheduled.clone();
        tokio::spawn(async move {
            let node_instance_id = request.node_instance_id;
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(node_instance_id = %node_instance_id, "Timer cancelled");
                }
                _ = tokio::time::sleep(Duration::from_secs(request.delay_secs)) => {
                    if let Err(e) = queue.enqueue(request) {
                        warn!(node_instance_id = %node_instance_id, error = %e, "Timer could not be queued");
                    }
                }
            }
            scheduled.remove_if(&node_instance_id, |_, timer| timer.timer_id == timer_id);
        });
    }

    /// Cancel every pending timer of a schema instance, returning how many were dropped
    pub fn cancel_for_instance(&self, schema_instance_id: &Uuid) -> usize {
        let mut cancelled = 0;
        self.scheduled.retain(|_, timer| {
            if timer.schema_instance_id == *schema_instance_id {
                timer.token.cancel();
                cancelled += 1;
                false
            } else {
                true
            }
        });
        if cancelled > 0 {
            info!(schema_instance_id = %schema_instance_id, cancelled, "Pending timers cancelled");
        }
        cancelled
    }

    pub fn pending(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_scheduled(&self, node_instance_id: &Uuid) -> bool {
        self.scheduled.contains_key(node_instance_id)
    }
}

pub struct TimerNodeTriggerHandler {
    engine: Arc<SchemaEngine>,
    router: OutcomeRouter,
}

impl TimerNodeTriggerHandler {
    pub fn new(engine: Arc<SchemaEngine>, router: OutcomeRouter) -> Self {
        Self { engine, router }
    }
}

#[async_trait]
impl TaskHandler<TimerRequest> for TimerNodeTriggerHandler {
    async fn handle(&self, request: TimerRequest) -> Result<()> {
        let outcome = self.engine.on_timer_fired(&request.node_instance_id).await?;
        debug!(
            node_instance_id = %request.node_instance_id,
            status = ?outcome.status,
            "Timer handled"
        );
        self.router.route(&outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::actions::LoggingMessagingService;
    use crate::engine::queue::QueueReceiver;
    use crate::engine::storage::{InMemoryStorage, WorkflowStorage};
    use crate::settings::EngineConfig;

    fn scheduler() -> (TimerScheduler, QueueReceiver<TimerRequest>, TaskQueue<TimerRequest>) {
        let storage: Arc<dyn WorkflowStorage> = Arc::new(InMemoryStorage::new());
        let engine = Arc::new(SchemaEngine::new(
            storage,
            Arc::new(LoggingMessagingService::new()),
            EngineConfig::default(),
        ));
        let (queue, receiver) = TaskQueue::channel("timers");
        (TimerScheduler::new(engine, queue.clone()), receiver, queue)
    }

    fn request(schema_instance_id: Uuid, delay_secs: u64) -> TimerRequest {
        TimerRequest {
            schema_instance_id,
            node_instance_id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            delay_secs,
            attempt: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_enqueues_after_delay() {
        let (scheduler, _receiver, queue) = scheduler();
        let request = request(Uuid::new_v4(), 30);
        scheduler.schedule(request.clone());
        assert!(scheduler.is_scheduled(&request.node_instance_id));

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        assert_eq!(queue.stats().pending, 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timers_never_fire() {
        let (scheduler, _receiver, queue) = scheduler();
        let instance = Uuid::new_v4();
        scheduler.schedule(request(instance, 30));
        scheduler.schedule(request(instance, 60));
        scheduler.schedule(request(Uuid::new_v4(), 30));

        assert_eq!(scheduler.cancel_for_instance(&instance), 2);
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert_eq!(queue.stats().pending, 1);
    }
}
