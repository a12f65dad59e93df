use crate::errors::SubmitError;
use crate::queue::{QueueStats, TaskQueue};
use crate::registry::{DeviceRegistry, DispatchCandidate};
use crate::results::ResultStore;
use crate::{CoordinatorConfig, COORDINATOR_SENDER_ID};
use chrono::{Duration as ChronoDuration, Utc};
use salvage_core::{
    FailureReason, Task, TaskOutcome, TaskSpec, TaskState,
};
use salvage_protocol::{
    Envelope, Payload, ResultStatus, TaskAssignData, TaskCancelData, TaskResultData,
};
use salvage_store::{EventLog, TaskEvent, TaskEventKind};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceDownReason {
    ConnectionClosed,
    HeartbeatTimeout,
    Replaced,
}

#[derive(Debug)]
pub(crate) enum Event {
    Submit {
        spec: TaskSpec,
        reply: oneshot::Sender<Result<String, SubmitError>>,
    },
    Cancel {
        task_id: String,
        reply: oneshot::Sender<bool>,
    },
    GetTask {
        task_id: String,
        reply: oneshot::Sender<Option<Task>>,
    },
    Stats {
        reply: oneshot::Sender<SchedulerStats>,
    },
    DeviceUp {
        device_id: String,
    },
    DeviceDown {
        device_id: String,
        reason: DeviceDownReason,
    },
    DeviceRemoved {
        device_id: String,
        reply: oneshot::Sender<usize>,
    },
    AssignAck {
        device_id: String,
        in_reply_to: String,
    },
    Result {
        device_id: String,
        data: TaskResultData,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SchedulerStats {
    pub queue: QueueStats,
    pub in_flight: usize,
}

/// Serial processor of scheduling events. The only mutator of task state
/// outside queue admission, which keeps the dispatch invariants local: at
/// any selection point a higher-priority queued task with an eligible
/// device is dispatched before a lower-priority one.
pub(crate) struct Scheduler {
    config: CoordinatorConfig,
    registry: Arc<DeviceRegistry>,
    queue: TaskQueue,
    results: ResultStore,
    in_flight: HashMap<String, Task>,
    pending_acks: HashMap<String, String>,
    cancel_requested: HashSet<String>,
    event_log: Option<EventLog>,
}

impl Scheduler {
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<DeviceRegistry>,
        queue_depth: Arc<AtomicUsize>,
        event_log: Option<EventLog>,
    ) -> Self {
        let queue = TaskQueue::new(config.queue_capacity, queue_depth);
        let results = ResultStore::new(config.retention_count, config.retention_age);
        Self {
            config,
            registry,
            queue,
            results,
            in_flight: HashMap::new(),
            pending_acks: HashMap::new(),
            cancel_requested: HashSet::new(),
            event_log,
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<Event>, shutdown: CancellationToken) {
        let mut sweep = tokio::time::interval(self.config.task_sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    self.sweep_in_flight().await;
                    self.results.prune_expired(Utc::now());
                    self.try_dispatch().await;
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Submit { spec, reply } => {
                let result = self.handle_submit(spec).await;
                let _ = reply.send(result);
                self.try_dispatch().await;
            }
            Event::Cancel { task_id, reply } => {
                let cancelled = self.handle_cancel(&task_id).await;
                let _ = reply.send(cancelled);
            }
            Event::GetTask { task_id, reply } => {
                let _ = reply.send(self.lookup(&task_id));
            }
            Event::Stats { reply } => {
                let _ = reply.send(SchedulerStats {
                    queue: self.queue.stats(),
                    in_flight: self.in_flight.len(),
                });
            }
            Event::DeviceUp { device_id } => {
                tracing::debug!(device_id = %device_id, "device available, scheduling");
                self.try_dispatch().await;
            }
            Event::DeviceDown { device_id, reason } => {
                // A stale down-event can trail a successful re-register;
                // only a replacement reassigns unconditionally.
                let reassign = match reason {
                    DeviceDownReason::Replaced => true,
                    _ => self
                        .registry
                        .get(&device_id)
                        .await
                        .map_or(true, |device| !device.status.is_online()),
                };
                if reassign {
                    tracing::debug!(device_id = %device_id, ?reason, "device lost, reassigning in-flight tasks");
                    self.reassign_device(&device_id).await;
                }
                self.try_dispatch().await;
            }
            Event::DeviceRemoved { device_id, reply } => {
                let reassigned = self.reassign_device(&device_id).await;
                let _ = reply.send(reassigned);
                self.try_dispatch().await;
            }
            Event::AssignAck {
                device_id,
                in_reply_to,
            } => {
                self.handle_assign_ack(&device_id, &in_reply_to);
            }
            Event::Result { device_id, data } => {
                self.handle_result(&device_id, data).await;
                self.try_dispatch().await;
            }
        }
    }

    async fn handle_submit(&mut self, spec: TaskSpec) -> Result<String, SubmitError> {
        let task = Task::from_spec(
            spec,
            self.config.default_task_timeout.as_secs(),
            self.config.default_max_retries,
        );
        let task_id = task.task_id.clone();
        if self
            .registry
            .find_eligible(&task.requirements, &task.task_type)
            .await
            .is_empty()
        {
            tracing::debug!(task_id = %task_id, task_type = %task.task_type, "no eligible device online, task will wait queued");
        }
        match self.queue.enqueue(task) {
            Ok(()) => {
                tracing::debug!(task_id = %task_id, "task submitted");
                self.log_task_event(TaskEvent::now(&task_id, TaskEventKind::Submitted))
                    .await;
                Ok(task_id)
            }
            Err(_) => {
                tracing::warn!("task submission rejected, queue is full");
                Err(SubmitError::QueueFull)
            }
        }
    }

    async fn handle_cancel(&mut self, task_id: &str) -> bool {
        if let Some(task) = self.queue.cancel(task_id) {
            tracing::info!(task_id = %task_id, "queued task cancelled");
            self.finish(
                task,
                TaskState::Cancelled,
                TaskOutcome::Failure {
                    reason: FailureReason::Cancelled,
                    error: None,
                },
            )
            .await;
            return true;
        }

        if let Some(task) = self.in_flight.get(task_id) {
            let device_id = task.assigned_device_id.clone().unwrap_or_default();
            tracing::info!(task_id = %task_id, device_id = %device_id, "cancelling in-flight task");
            self.cancel_requested.insert(task_id.to_string());
            self.post_cancel(&device_id, task_id, "cancelled_by_caller")
                .await;
            return true;
        }

        false
    }

    fn lookup(&self, task_id: &str) -> Option<Task> {
        if let Some(task) = self.in_flight.get(task_id) {
            return Some(task.clone());
        }
        if let Some(task) = self.queue.get(task_id) {
            return Some(task.clone());
        }
        self.results.get(task_id)
    }

    fn handle_assign_ack(&mut self, device_id: &str, in_reply_to: &str) {
        let Some(task_id) = self.pending_acks.remove(in_reply_to) else {
            return;
        };
        if let Some(task) = self.in_flight.get_mut(&task_id) {
            if task.assigned_device_id.as_deref() == Some(device_id)
                && task.state == TaskState::Assigned
            {
                task.state = TaskState::Running;
            }
        }
    }

    async fn handle_result(&mut self, device_id: &str, data: TaskResultData) {
        let valid = self
            .in_flight
            .get(&data.task_id)
            .is_some_and(|task| task.assigned_device_id.as_deref() == Some(device_id));
        if !valid {
            tracing::warn!(
                task_id = %data.task_id,
                device_id = %device_id,
                "discarding result for unknown or mis-assigned task"
            );
            return;
        }
        let Some(mut task) = self.in_flight.remove(&data.task_id) else {
            return;
        };
        self.registry.task_resolved(device_id).await;
        self.drop_pending_ack(&task.task_id);
        let was_cancel_requested = self.cancel_requested.remove(&task.task_id);

        match data.status {
            ResultStatus::Success => {
                tracing::info!(task_id = %task.task_id, device_id = %device_id, "task succeeded");
                let result = data.result.unwrap_or(serde_json::Value::Null);
                self.finish(task, TaskState::Success, TaskOutcome::Success { result })
                    .await;
            }
            ResultStatus::Failure => {
                let retryable = data.error.as_ref().is_some_and(|error| error.retryable);
                if was_cancel_requested {
                    self.finish(
                        task,
                        TaskState::Cancelled,
                        TaskOutcome::Failure {
                            reason: FailureReason::Cancelled,
                            error: data.error,
                        },
                    )
                    .await;
                } else if retryable && task.retries_left() {
                    tracing::info!(
                        task_id = %task.task_id,
                        attempts = task.attempts,
                        "retryable failure, requeuing"
                    );
                    self.requeue(task);
                } else {
                    tracing::warn!(task_id = %task.task_id, "task failed");
                    self.finish(
                        task,
                        TaskState::Failed,
                        TaskOutcome::Failure {
                            reason: FailureReason::Failed,
                            error: data.error,
                        },
                    )
                    .await;
                }
            }
        }
    }

    /// Per-task timeout sweep over the in-flight set, plus the deferred
    /// resolution of cooperative cancellations.
    async fn sweep_in_flight(&mut self) {
        let now = Utc::now();
        let expired: Vec<String> = self
            .in_flight
            .values()
            .filter(|task| {
                task.dispatched_at.is_some_and(|dispatched| {
                    now.signed_duration_since(dispatched)
                        >= ChronoDuration::seconds(task.timeout_seconds as i64)
                })
            })
            .map(|task| task.task_id.clone())
            .collect();
        for task_id in expired {
            self.timeout_task(&task_id).await;
        }
    }

    async fn timeout_task(&mut self, task_id: &str) {
        let Some(task) = self.in_flight.remove(task_id) else {
            return;
        };
        let device_id = task.assigned_device_id.clone().unwrap_or_default();
        self.registry.task_resolved(&device_id).await;
        self.drop_pending_ack(task_id);
        self.post_cancel(&device_id, task_id, "timeout").await;

        if self.cancel_requested.remove(task_id) {
            tracing::info!(task_id = %task_id, "cancellation resolved after timeout");
            self.finish(
                task,
                TaskState::Cancelled,
                TaskOutcome::Failure {
                    reason: FailureReason::Cancelled,
                    error: None,
                },
            )
            .await;
        } else if task.retries_left() {
            tracing::warn!(
                task_id = %task_id,
                device_id = %device_id,
                attempts = task.attempts,
                "task timed out, requeuing"
            );
            self.requeue(task);
        } else {
            tracing::warn!(task_id = %task_id, device_id = %device_id, "task timed out, retries exhausted");
            self.finish(
                task,
                TaskState::Timeout,
                TaskOutcome::Failure {
                    reason: FailureReason::Timeout,
                    error: None,
                },
            )
            .await;
        }
    }

    /// Device went away: decrement its bookkeeping and either requeue or
    /// fail each in-flight task it held. Returns how many were handled.
    async fn reassign_device(&mut self, device_id: &str) -> usize {
        let task_ids: Vec<String> = self
            .in_flight
            .values()
            .filter(|task| task.assigned_device_id.as_deref() == Some(device_id))
            .map(|task| task.task_id.clone())
            .collect();

        for task_id in &task_ids {
            let Some(task) = self.in_flight.remove(task_id) else {
                continue;
            };
            self.registry.task_resolved(device_id).await;
            self.drop_pending_ack(task_id);
            if self.cancel_requested.remove(task_id) {
                self.finish(
                    task,
                    TaskState::Cancelled,
                    TaskOutcome::Failure {
                        reason: FailureReason::Cancelled,
                        error: None,
                    },
                )
                .await;
            } else if task.retries_left() {
                self.requeue(task);
            } else {
                self.finish(
                    task,
                    TaskState::Failed,
                    TaskOutcome::Failure {
                        reason: FailureReason::DeviceLost,
                        error: None,
                    },
                )
                .await;
            }
        }
        task_ids.len()
    }

    /// Drain the queue against the current device set, highest priority
    /// first, until nothing queued has an eligible device.
    async fn try_dispatch(&mut self) {
        loop {
            let candidates = self.registry.dispatch_candidates().await;
            if candidates.is_empty() {
                break;
            }
            let Some((task, candidate)) = self.select_next(&candidates) else {
                break;
            };
            self.dispatch(task, candidate).await;
        }
    }

    fn select_next(
        &mut self,
        candidates: &[DispatchCandidate],
    ) -> Option<(Task, DispatchCandidate)> {
        let in_flight = &self.in_flight;
        let task = self.queue.dequeue_matching(|task| {
            candidates.iter().any(|candidate| {
                crate::registry::eligible(&candidate.device, &task.requirements, &task.task_type)
            })
        })?;

        let eligible: Vec<&DispatchCandidate> = candidates
            .iter()
            .filter(|candidate| {
                crate::registry::eligible(&candidate.device, &task.requirements, &task.task_type)
            })
            .collect();

        if let Some(preferred_id) = task.requirements.preferred_device_id.as_deref() {
            if let Some(preferred) = eligible
                .iter()
                .find(|candidate| candidate.device.device_id == preferred_id)
            {
                return Some((task, (*preferred).clone()));
            }
        }

        let chosen = eligible.into_iter().min_by(|a, b| {
            let key = |candidate: &DispatchCandidate| {
                (
                    candidate.device.active_task_count,
                    !Self::has_type_in_flight(in_flight, &candidate.device.device_id, &task.task_type),
                )
            };
            key(a)
                .cmp(&key(b))
                .then_with(|| headroom(&b.device).total_cmp(&headroom(&a.device)))
                .then_with(|| a.device.device_id.cmp(&b.device.device_id))
        })?;
        Some((task, chosen.clone()))
    }

    fn has_type_in_flight(
        in_flight: &HashMap<String, Task>,
        device_id: &str,
        task_type: &str,
    ) -> bool {
        in_flight.values().any(|task| {
            task.assigned_device_id.as_deref() == Some(device_id) && task.task_type == task_type
        })
    }

    async fn dispatch(&mut self, mut task: Task, candidate: DispatchCandidate) {
        let device_id = candidate.device.device_id.clone();
        task.attempts += 1;
        task.state = TaskState::Assigned;
        task.assigned_device_id = Some(device_id.clone());
        task.dispatched_at = Some(Utc::now());
        self.registry.task_dispatched(&device_id).await;

        let message_id = Uuid::new_v4().to_string();
        let envelope = Envelope::with_message_id(
            COORDINATOR_SENDER_ID,
            message_id.clone(),
            Payload::TaskAssign(TaskAssignData {
                task_id: task.task_id.clone(),
                task_type: task.task_type.clone(),
                payload: task.payload.clone(),
                timeout_seconds: task.timeout_seconds,
                attempt: task.attempts,
            }),
        );

        match candidate.handle.outbox.try_send(envelope) {
            Ok(()) => {
                tracing::info!(
                    task_id = %task.task_id,
                    device_id = %device_id,
                    attempt = task.attempts,
                    "task dispatched"
                );
                self.log_task_event(TaskEvent::now(
                    &task.task_id,
                    TaskEventKind::Dispatched {
                        device_id: device_id.clone(),
                        attempt: task.attempts,
                    },
                ))
                .await;
                self.pending_acks.insert(message_id, task.task_id.clone());
                self.in_flight.insert(task.task_id.clone(), task);
            }
            Err(error) => {
                // Revert the dispatch mutations; the attempt stays counted.
                self.registry.task_resolved(&device_id).await;
                task.state = TaskState::Queued;
                task.assigned_device_id = None;
                task.dispatched_at = None;
                tracing::warn!(
                    task_id = %task.task_id,
                    device_id = %device_id,
                    "dispatch post failed, requeuing at head of band"
                );
                self.queue.requeue_front(task);

                // Outbox full or handler gone: the connection is no longer
                // usable, drop it and reassign whatever it still held.
                if matches!(error, TrySendError::Full(_)) {
                    tracing::warn!(device_id = %device_id, "worker outbox full, dropping connection");
                }
                self.registry
                    .force_offline(&device_id, candidate.handle.conn_id)
                    .await;
                candidate.handle.close();
                self.reassign_device(&device_id).await;
            }
        }
    }

    fn requeue(&mut self, mut task: Task) {
        task.state = TaskState::Queued;
        task.assigned_device_id = None;
        task.dispatched_at = None;
        self.queue.requeue_back(task);
    }

    async fn finish(&mut self, mut task: Task, state: TaskState, outcome: TaskOutcome) {
        task.state = state;
        task.finished_at = Some(Utc::now());
        task.outcome = Some(outcome);
        self.log_task_event(TaskEvent::now(
            &task.task_id,
            TaskEventKind::Completed { state },
        ))
        .await;
        self.results.insert(task);
    }

    async fn post_cancel(&self, device_id: &str, task_id: &str, reason: &str) {
        if let Some(handle) = self.registry.connection(device_id).await {
            let envelope = Envelope::new(
                COORDINATOR_SENDER_ID,
                Payload::TaskCancel(TaskCancelData {
                    task_id: task_id.to_string(),
                    reason: reason.to_string(),
                }),
            );
            let _ = handle.outbox.try_send(envelope);
        }
    }

    fn drop_pending_ack(&mut self, task_id: &str) {
        self.pending_acks.retain(|_, pending| pending != task_id);
    }

    async fn log_task_event(&self, event: TaskEvent) {
        if let Some(log) = &self.event_log {
            if let Err(error) = log.append(&event).await {
                tracing::warn!(error = %error, "failed to append task event");
            }
        }
    }
}

fn headroom(device: &salvage_core::Device) -> f64 {
    device.capabilities.cpu_cores as f64 * (1.0 - device.cpu_percent / 100.0)
        + (1.0 - device.memory_percent / 100.0)
}
