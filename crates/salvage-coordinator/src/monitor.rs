use crate::registry::DeviceRegistry;
use crate::scheduler::{DeviceDownReason, Event};
use salvage_store::SnapshotStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Periodic liveness sweep: any online device silent for longer than the
/// offline threshold is detached and its in-flight work handed back to the
/// scheduler.
pub(crate) async fn run_heartbeat_monitor(
    registry: Arc<DeviceRegistry>,
    events: mpsc::Sender<Event>,
    sweep_interval: Duration,
    offline_threshold: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let stale = registry.mark_stale(offline_threshold).await;
                for device_id in stale {
                    tracing::warn!(device_id = %device_id, "device heartbeat timed out, marked offline");
                    if events
                        .send(Event::DeviceDown {
                            device_id,
                            reason: DeviceDownReason::HeartbeatTimeout,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }
}

/// Writes the registry snapshot whenever it changed since the last pass.
/// Persistence failures are logged; in-memory state stays authoritative.
pub(crate) async fn run_persistence(
    registry: Arc<DeviceRegistry>,
    store: Arc<dyn SnapshotStore>,
    persist_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(persist_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if !registry.take_dirty() {
                    continue;
                }
                let snapshot = registry.snapshot_for_persistence().await;
                if let Err(error) = store.save(&snapshot).await {
                    tracing::warn!(error = %error, "failed to persist registry snapshot");
                }
            }
        }
    }
}
