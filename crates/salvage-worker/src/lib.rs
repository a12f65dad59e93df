mod errors;
mod net;
mod registry;

pub use errors::WorkerError;
pub use registry::{HandlerRegistry, TaskHandler};
pub use salvage_core::TaskError;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use salvage_core::{DeviceCapabilities, Platform, TaskFailure};
use salvage_protocol::{
    Envelope, HeartbeatData, Payload, RegisterData, ResultStatus, StatusReplyData, TaskAssignData,
    TaskResultData,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub type MetricsProbe = Arc<dyn Fn() -> WorkerMetrics + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

pub struct WorkerConfig {
    pub device_id: String,
    pub role: String,
    pub coordinator_addr: String,
    pub platform: Platform,
    pub architecture: String,
    pub runtime_version: String,
    pub capabilities: DeviceCapabilities,
    pub max_concurrent_tasks: u32,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub register_timeout: Duration,
    /// Source of the rolling cpu/memory figures carried in heartbeats.
    /// Defaults to zeros when unset.
    pub metrics_probe: Option<MetricsProbe>,
}

impl WorkerConfig {
    pub fn new(device_id: impl Into<String>, coordinator_addr: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            role: "worker".to_string(),
            coordinator_addr: coordinator_addr.into(),
            platform: local_platform(),
            architecture: std::env::consts::ARCH.to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: DeviceCapabilities::default(),
            max_concurrent_tasks: 2,
            heartbeat_interval: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(1),
            register_timeout: Duration::from_secs(10),
            metrics_probe: None,
        }
    }
}

fn local_platform() -> Platform {
    match std::env::consts::OS {
        "linux" => Platform::Linux,
        "windows" => Platform::Windows,
        "macos" => Platform::Macos,
        "android" => Platform::Android,
        _ => Platform::Other,
    }
}

/// A worker node: connects to the coordinator, registers its identity and
/// handlers, heartbeats, executes assigned tasks, and reconnects with a
/// jittered delay whenever the connection drops.
pub struct Worker {
    config: WorkerConfig,
    registry: HandlerRegistry,
    active_tasks: Arc<AtomicU32>,
    started_at: Instant,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            active_tasks: Arc::new(AtomicU32::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    /// Runs until the coordinator rejects the registration outright.
    /// Everything else (socket loss, send failure, coordinator restart)
    /// is handled by reconnecting under the same device id.
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        loop {
            match self.connect_and_serve().await {
                Err(WorkerError::RegistrationRejected(reason)) => {
                    tracing::error!(reason = %reason, "coordinator rejected registration");
                    return Err(WorkerError::RegistrationRejected(reason));
                }
                Err(error) => {
                    tracing::warn!(error = %error, "connection lost, reconnecting");
                }
                Ok(()) => {
                    tracing::info!("connection closed by coordinator, reconnecting");
                }
            }
            tokio::time::sleep(jitter(self.config.reconnect_delay)).await;
        }
    }

    async fn connect_and_serve(&mut self) -> Result<(), WorkerError> {
        let (mut reader, mut writer) = net::connect(&self.config.coordinator_addr).await?;

        let register = Envelope::new(
            self.config.device_id.clone(),
            Payload::Register(RegisterData {
                device_id: self.config.device_id.clone(),
                role: self.config.role.clone(),
                platform: self.config.platform,
                architecture: self.config.architecture.clone(),
                runtime_version: self.config.runtime_version.clone(),
                capabilities: self.config.capabilities.clone(),
                supported_task_types: self.registry.task_types(),
                max_concurrent_tasks: self.config.max_concurrent_tasks,
            }),
        );
        writer
            .send(register)
            .await
            .map_err(|e| WorkerError::Send(e.to_string()))?;

        let ack = tokio::time::timeout(self.config.register_timeout, reader.next())
            .await
            .map_err(|_| WorkerError::RegistrationTimeout)?;
        match ack {
            Some(Ok(envelope)) => match envelope.payload {
                Payload::RegisterAck(data) if data.accepted => {
                    tracing::info!(
                        device_id = %self.config.device_id,
                        addr = %self.config.coordinator_addr,
                        "registered with coordinator"
                    );
                }
                Payload::RegisterAck(data) => {
                    return Err(WorkerError::RegistrationRejected(
                        data.reason.unwrap_or_else(|| "unspecified".to_string()),
                    ));
                }
                other => {
                    return Err(WorkerError::Receive(format!(
                        "expected register_ack, got {}",
                        other.message_type()
                    )));
                }
            },
            Some(Err(error)) => return Err(WorkerError::Receive(error.to_string())),
            None => return Err(WorkerError::ConnectionClosed),
        }

        let (results_tx, mut results_rx) = mpsc::channel::<TaskResultData>(16);
        let mut cancelled: HashSet<String> = HashSet::new();
        let mut heartbeat = tokio::time::interval(jitter(self.config.heartbeat_interval));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick fires immediately and doubles as the
        // initial liveness report.
        loop {
            tokio::select! {
                frame = reader.next() => {
                    match frame {
                        Some(Ok(envelope)) => {
                            self.handle_frame(envelope, &mut writer, &results_tx, &mut cancelled)
                                .await?;
                        }
                        Some(Err(error)) => return Err(WorkerError::Receive(error.to_string())),
                        None => return Ok(()),
                    }
                }
                _ = heartbeat.tick() => {
                    let metrics = self
                        .config
                        .metrics_probe
                        .as_ref()
                        .map(|probe| probe())
                        .unwrap_or_default();
                    let envelope = Envelope::new(
                        self.config.device_id.clone(),
                        Payload::Heartbeat(HeartbeatData {
                            cpu_percent: metrics.cpu_percent,
                            memory_percent: metrics.memory_percent,
                            active_tasks: self.active_tasks.load(Ordering::SeqCst),
                            uptime_seconds: self.started_at.elapsed().as_secs(),
                        }),
                    );
                    writer
                        .send(envelope)
                        .await
                        .map_err(|e| WorkerError::Send(e.to_string()))?;
                }
                result = results_rx.recv() => {
                    let Some(result) = result else { continue };
                    if cancelled.remove(&result.task_id) {
                        tracing::debug!(task_id = %result.task_id, "suppressing result for cancelled task");
                        continue;
                    }
                    let envelope = Envelope::new(
                        self.config.device_id.clone(),
                        Payload::TaskResult(result),
                    );
                    writer
                        .send(envelope)
                        .await
                        .map_err(|e| WorkerError::Send(e.to_string()))?;
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        envelope: Envelope,
        writer: &mut net::FrameWriter,
        results_tx: &mpsc::Sender<TaskResultData>,
        cancelled: &mut HashSet<String>,
    ) -> Result<(), WorkerError> {
        let Envelope {
            message_id,
            payload,
            ..
        } = envelope;
        match payload {
            Payload::TaskAssign(assign) => {
                tracing::info!(
                    task_id = %assign.task_id,
                    task_type = %assign.task_type,
                    attempt = assign.attempt,
                    "task assigned"
                );
                if let Some(assign_id) = message_id {
                    let ack = Envelope::new(
                        self.config.device_id.clone(),
                        Payload::StatusReply(StatusReplyData {
                            in_reply_to: assign_id,
                            body: json!({"task_id": assign.task_id.clone(), "status": "running"}),
                        }),
                    );
                    writer
                        .send(ack)
                        .await
                        .map_err(|e| WorkerError::Send(e.to_string()))?;
                }
                self.spawn_execution(assign, results_tx.clone());
                Ok(())
            }
            Payload::TaskCancel(data) => {
                tracing::info!(task_id = %data.task_id, reason = %data.reason, "task cancelled by coordinator");
                cancelled.insert(data.task_id);
                Ok(())
            }
            Payload::StatusQuery(_) => {
                let reply = Envelope::new(
                    self.config.device_id.clone(),
                    Payload::StatusReply(StatusReplyData {
                        in_reply_to: message_id.unwrap_or_default(),
                        body: json!({
                            "active_tasks": self.active_tasks.load(Ordering::SeqCst),
                            "uptime_seconds": self.started_at.elapsed().as_secs(),
                        }),
                    }),
                );
                writer
                    .send(reply)
                    .await
                    .map_err(|e| WorkerError::Send(e.to_string()))
            }
            Payload::HeartbeatAck(_) | Payload::RegisterAck(_) => Ok(()),
            Payload::Error(data) => {
                tracing::warn!(code = %data.code, message = %data.message, "coordinator reported error");
                Ok(())
            }
            other => {
                tracing::debug!(message_type = other.message_type(), "ignoring unexpected message");
                Ok(())
            }
        }
    }

    fn spawn_execution(&self, assign: TaskAssignData, results_tx: mpsc::Sender<TaskResultData>) {
        let handler = self.registry.get(&assign.task_type).map(Arc::clone);
        let active = Arc::clone(&self.active_tasks);
        active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let started = Instant::now();
            let task_id = assign.task_id.clone();
            let outcome = match handler {
                Some(handler) => {
                    let payload = assign.payload;
                    tokio::task::spawn_blocking(move || handler(payload))
                        .await
                        .unwrap_or_else(|join_error| {
                            Err(TaskError::Permanent(format!(
                                "task handler panicked: {join_error}"
                            )))
                        })
                }
                None => Err(TaskError::Permanent(format!(
                    "no handler registered for task type {}",
                    assign.task_type
                ))),
            };
            active.fetch_sub(1, Ordering::SeqCst);

            let execution_time_seconds = started.elapsed().as_secs_f64();
            let result = match outcome {
                Ok(value) => TaskResultData {
                    task_id,
                    status: ResultStatus::Success,
                    result: Some(value),
                    error: None,
                    execution_time_seconds,
                },
                Err(TaskError::Retryable(message)) => failure_result(
                    task_id,
                    "handler_error",
                    message,
                    true,
                    execution_time_seconds,
                ),
                Err(TaskError::Permanent(message)) => failure_result(
                    task_id,
                    "handler_error",
                    message,
                    false,
                    execution_time_seconds,
                ),
            };
            let _ = results_tx.send(result).await;
        });
    }
}

fn failure_result(
    task_id: String,
    code: &str,
    message: String,
    retryable: bool,
    execution_time_seconds: f64,
) -> TaskResultData {
    TaskResultData {
        task_id,
        status: ResultStatus::Failure,
        result: None,
        error: Some(TaskFailure {
            code: code.to_string(),
            message,
            retryable,
        }),
        execution_time_seconds,
    }
}

fn jitter(base: Duration) -> Duration {
    let base_ms = base.as_millis() as i64;
    let jitter = ((base_ms as f64) * 0.1).round() as i64;
    let mut rng = rand::thread_rng();
    let delta = if jitter == 0 {
        0
    } else {
        rng.gen_range(-jitter..=jitter)
    };
    let adjusted = std::cmp::max(1, base_ms + delta) as u64;
    Duration::from_millis(adjusted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_millis(1_000);
        for _ in 0..100 {
            let adjusted = jitter(base).as_millis() as i64;
            assert!((900..=1_100).contains(&adjusted), "jitter out of range: {adjusted}");
        }
    }

    #[test]
    fn jitter_never_returns_zero() {
        assert!(jitter(Duration::from_millis(1)) >= Duration::from_millis(1));
    }

    #[test]
    fn config_defaults_follow_worker_contract() {
        let config = WorkerConfig::new("w-1", "127.0.0.1:9000");
        assert_eq!(config.role, "worker");
        assert_eq!(config.max_concurrent_tasks, 2);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
        assert!(config.metrics_probe.is_none());
    }
}
