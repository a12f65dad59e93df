mod errors;
mod handle;
mod monitor;
mod net;
mod queue;
mod registry;
mod results;
mod scheduler;

pub use errors::{CoordinatorError, SubmitError};
pub use handle::{ClusterStats, CoordinatorHandle};
pub use queue::QueueStats;
pub use registry::{DeviceFilter, RegistryStats};

use net::ConnectionContext;
use registry::DeviceRegistry;
use salvage_store::{EventLog, JsonFileStore, SnapshotStore};
use scheduler::Scheduler;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const COORDINATOR_SENDER_ID: &str = "coordinator";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    pub handshake_timeout: Duration,
    /// Expected worker emission interval; informational, scheduling does
    /// not depend on it.
    pub heartbeat_interval: Duration,
    pub offline_threshold: Duration,
    pub sweep_interval: Duration,
    pub task_sweep_interval: Duration,
    pub queue_capacity: usize,
    pub default_task_timeout: Duration,
    pub default_max_retries: u32,
    pub retention_count: usize,
    pub retention_age: Duration,
    pub outbox_capacity: usize,
    pub event_buffer_size: usize,
    pub max_frame_bytes: usize,
    pub registry_path: Option<PathBuf>,
    pub event_log_path: Option<PathBuf>,
    pub persist_interval: Duration,
}

impl CoordinatorConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            max_connections: 100,
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(60),
            offline_threshold: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            task_sweep_interval: Duration::from_secs(60),
            queue_capacity: 10_000,
            default_task_timeout: Duration::from_secs(300),
            default_max_retries: 3,
            retention_count: 10_000,
            retention_age: Duration::from_secs(24 * 60 * 60),
            outbox_capacity: 64,
            event_buffer_size: 1024,
            max_frame_bytes: salvage_protocol::DEFAULT_MAX_FRAME_BYTES,
            registry_path: None,
            event_log_path: None,
            persist_interval: Duration::from_secs(30),
        }
    }
}

/// The running coordinator: listener, connection handlers, serial
/// scheduler, heartbeat monitor, and persistence, wired together at start
/// and torn down on shutdown.
pub struct Coordinator {
    handle: CoordinatorHandle,
    local_addr: SocketAddr,
    registry: Arc<DeviceRegistry>,
    store: Option<Arc<dyn SnapshotStore>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    pub async fn start(config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        let listener = tokio::net::TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| CoordinatorError::Bind(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CoordinatorError::Bind(e.to_string()))?;

        let registry = Arc::new(DeviceRegistry::new());
        let store: Option<Arc<dyn SnapshotStore>> = config
            .registry_path
            .as_ref()
            .map(|path| Arc::new(JsonFileStore::new(path)) as Arc<dyn SnapshotStore>);
        if let Some(store) = &store {
            match store.load().await {
                Ok(Some(snapshot)) => {
                    tracing::info!(
                        devices = snapshot.devices.len(),
                        "restored registry snapshot, all devices offline"
                    );
                    registry.restore(snapshot.devices).await;
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "failed to load registry snapshot, starting empty");
                }
            }
        }
        let event_log = config.event_log_path.as_ref().map(EventLog::new);

        let (events_tx, events_rx) = mpsc::channel(config.event_buffer_size);
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let scheduler = Scheduler::new(
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&queue_depth),
            event_log,
        );

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(scheduler.run(events_rx, shutdown.clone())));
        tasks.push(tokio::spawn(net::run_accept_loop(
            listener,
            ConnectionContext {
                registry: Arc::clone(&registry),
                events: events_tx.clone(),
                queue_depth,
                config: Arc::new(config.clone()),
            },
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(monitor::run_heartbeat_monitor(
            Arc::clone(&registry),
            events_tx.clone(),
            config.sweep_interval,
            config.offline_threshold,
            shutdown.clone(),
        )));
        if let Some(store) = store.clone() {
            tasks.push(tokio::spawn(monitor::run_persistence(
                Arc::clone(&registry),
                store,
                config.persist_interval,
                shutdown.clone(),
            )));
        }

        tracing::info!(addr = %local_addr, "coordinator listening for workers");
        let handle = CoordinatorHandle::new(events_tx, Arc::clone(&registry));
        Ok(Self {
            handle,
            local_addr,
            registry,
            store,
            shutdown,
            tasks,
        })
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        if let Some(store) = &self.store {
            let snapshot = self.registry.snapshot_for_persistence().await;
            if let Err(error) = store.save(&snapshot).await {
                tracing::warn!(error = %error, "failed to persist registry snapshot at shutdown");
            }
        }
        tracing::info!("coordinator stopped");
    }
}
