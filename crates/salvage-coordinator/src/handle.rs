use crate::errors::SubmitError;
use crate::queue::QueueStats;
use crate::registry::{DeviceFilter, DeviceRegistry, RegistryStats};
use crate::scheduler::Event;
use salvage_core::{Device, Task, TaskSpec};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterStats {
    pub devices: RegistryStats,
    pub queue: QueueStats,
    pub in_flight: usize,
}

/// The narrow surface the HTTP layer calls into. Every method completes
/// the underlying operation before returning; errors are enumerated
/// values, never panics.
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::Sender<Event>,
    registry: Arc<DeviceRegistry>,
}

impl CoordinatorHandle {
    pub(crate) fn new(events: mpsc::Sender<Event>, registry: Arc<DeviceRegistry>) -> Self {
        Self { events, registry }
    }

    pub async fn submit_task(&self, spec: TaskSpec) -> Result<String, SubmitError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events
            .send(Event::Submit {
                spec,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SubmitError::Shutdown)?;
        reply_rx.await.map_err(|_| SubmitError::Shutdown)?
    }

    pub async fn cancel_task(&self, task_id: &str) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .events
            .send(Event::Cancel {
                task_id: task_id.to_string(),
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Absence is distinguishable from "still running": an in-flight or
    /// queued task is returned as such, a terminal one comes from the
    /// result store, and `None` means the id is unknown or past retention.
    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events
            .send(Event::GetTask {
                task_id: task_id.to_string(),
                reply: reply_tx,
            })
            .await
            .ok()?;
        reply_rx.await.ok().flatten()
    }

    pub async fn list_devices(&self, filter: &DeviceFilter) -> Vec<Device> {
        self.registry.snapshot(filter).await
    }

    pub async fn cluster_stats(&self) -> ClusterStats {
        let devices = self.registry.stats().await;
        let (reply_tx, reply_rx) = oneshot::channel();
        let scheduler = if self
            .events
            .send(Event::Stats { reply: reply_tx })
            .await
            .is_ok()
        {
            reply_rx.await.unwrap_or_default()
        } else {
            Default::default()
        };
        ClusterStats {
            devices,
            queue: scheduler.queue,
            in_flight: scheduler.in_flight,
        }
    }

    /// Administrative removal. Returns the number of in-flight tasks that
    /// were reassigned, or `None` if the device is unknown.
    pub async fn remove_device(&self, device_id: &str) -> Option<usize> {
        let handle = self.registry.remove(device_id).await?;
        if let Some(handle) = handle {
            handle.close();
        }
        tracing::info!(device_id = %device_id, "device removed from registry");
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .events
            .send(Event::DeviceRemoved {
                device_id: device_id.to_string(),
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Some(0);
        }
        Some(reply_rx.await.unwrap_or(0))
    }
}
