use chrono::Utc;
use salvage_core::{Device, DeviceStatus, Platform, TaskRequirements};
use salvage_protocol::{Envelope, HeartbeatData, RegisterData};
use salvage_store::RegistrySnapshot;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handle to a live worker connection. Cloning is cheap; closing cancels
/// the connection's reader and writer tasks.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionHandle {
    pub conn_id: Uuid,
    pub outbox: mpsc::Sender<Envelope>,
    pub cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug)]
struct Entry {
    device: Device,
    seen: Instant,
    handle: Option<ConnectionHandle>,
}

pub(crate) struct RegisterOutcome {
    pub was_new: bool,
    pub replaced: Option<ConnectionHandle>,
}

/// Candidate for dispatch: an online device with an attached connection.
#[derive(Debug, Clone)]
pub(crate) struct DispatchCandidate {
    pub device: Device,
    pub handle: ConnectionHandle,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceFilter {
    pub status: Option<DeviceStatus>,
    pub role: Option<String>,
    pub platform: Option<Platform>,
    pub tag: Option<String>,
}

impl DeviceFilter {
    pub fn online() -> Self {
        Self {
            status: Some(DeviceStatus::Online),
            ..Self::default()
        }
    }

    fn matches(&self, device: &Device) -> bool {
        self.status.map_or(true, |status| status == device.status)
            && self
                .role
                .as_deref()
                .map_or(true, |role| role == device.role)
            && self
                .platform
                .map_or(true, |platform| platform == device.platform)
            && self
                .tag
                .as_deref()
                .map_or(true, |tag| device.capabilities.tags.contains(tag))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_devices: usize,
    pub online: usize,
    pub offline: usize,
    pub by_role: BTreeMap<String, usize>,
    pub by_platform: BTreeMap<String, usize>,
}

/// Authoritative map of known devices. Compound operations take the write
/// lock once and never hold it across I/O.
#[derive(Debug, Default)]
pub(crate) struct DeviceRegistry {
    inner: RwLock<HashMap<String, Entry>>,
    dirty: AtomicBool,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Known devices from a persisted snapshot start offline with no
    /// handle and no in-flight work.
    pub async fn restore(&self, devices: Vec<Device>) {
        let mut inner = self.inner.write().await;
        for mut device in devices {
            device.status = DeviceStatus::Offline;
            device.active_task_count = 0;
            device.address = None;
            let device_id = device.device_id.clone();
            inner.insert(
                device_id,
                Entry {
                    device,
                    seen: Instant::now(),
                    handle: None,
                },
            );
        }
    }

    pub async fn register(
        &self,
        info: &RegisterData,
        addr: SocketAddr,
        handle: ConnectionHandle,
    ) -> RegisterOutcome {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let outcome = match inner.get_mut(&info.device_id) {
            Some(entry) => {
                let replaced = entry.handle.take();
                entry.device.role = info.role.clone();
                entry.device.platform = info.platform;
                entry.device.architecture = info.architecture.clone();
                entry.device.runtime_version = info.runtime_version.clone();
                entry.device.capabilities = info.capabilities.clone();
                entry.device.supported_task_types = info.supported_task_types.clone();
                entry.device.max_concurrent_tasks = info.max_concurrent_tasks;
                entry.device.address = Some(addr.to_string());
                entry.device.status = DeviceStatus::Online;
                entry.device.last_seen = now;
                entry.seen = Instant::now();
                entry.handle = Some(handle);
                RegisterOutcome {
                    was_new: false,
                    replaced,
                }
            }
            None => {
                let device = Device {
                    device_id: info.device_id.clone(),
                    role: info.role.clone(),
                    platform: info.platform,
                    architecture: info.architecture.clone(),
                    runtime_version: info.runtime_version.clone(),
                    capabilities: info.capabilities.clone(),
                    supported_task_types: info.supported_task_types.clone(),
                    max_concurrent_tasks: info.max_concurrent_tasks,
                    address: Some(addr.to_string()),
                    status: DeviceStatus::Online,
                    registered_at: now,
                    last_seen: now,
                    active_task_count: 0,
                    cpu_percent: 0.0,
                    memory_percent: 0.0,
                };
                inner.insert(
                    info.device_id.clone(),
                    Entry {
                        device,
                        seen: Instant::now(),
                        handle: Some(handle),
                    },
                );
                RegisterOutcome {
                    was_new: true,
                    replaced: None,
                }
            }
        };
        self.dirty.store(true, Ordering::Relaxed);
        outcome
    }

    /// `last_seen` advances on any inbound message from the device.
    pub async fn touch_seen(&self, device_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(device_id) {
            entry.seen = Instant::now();
            entry.device.last_seen = Utc::now();
        }
    }

    pub async fn record_heartbeat(&self, device_id: &str, metrics: &HeartbeatData) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(device_id) {
            Some(entry) => {
                entry.seen = Instant::now();
                entry.device.last_seen = Utc::now();
                entry.device.cpu_percent = metrics.cpu_percent;
                entry.device.memory_percent = metrics.memory_percent;
                true
            }
            None => false,
        }
    }

    /// No-op unless `conn_id` is the currently attached connection, so a
    /// replaced handler tearing down cannot knock its successor offline.
    pub async fn detach(&self, device_id: &str, conn_id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.get_mut(device_id) else {
            return false;
        };
        let attached = entry
            .handle
            .as_ref()
            .is_some_and(|handle| handle.conn_id == conn_id);
        if !attached {
            return false;
        }
        entry.handle = None;
        entry.device.status = DeviceStatus::Offline;
        entry.device.address = None;
        self.dirty.store(true, Ordering::Relaxed);
        true
    }

    pub async fn remove(&self, device_id: &str) -> Option<Option<ConnectionHandle>> {
        let mut inner = self.inner.write().await;
        let entry = inner.remove(device_id)?;
        self.dirty.store(true, Ordering::Relaxed);
        Some(entry.handle)
    }

    /// Sweep for the heartbeat monitor: every online device whose last
    /// inbound traffic is older than `threshold` is marked offline and its
    /// handle is closed. Returns the affected device ids.
    pub async fn mark_stale(&self, threshold: Duration) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let mut stale = Vec::new();
        for (device_id, entry) in inner.iter_mut() {
            if entry.device.status.is_online() && entry.seen.elapsed() >= threshold {
                entry.device.status = DeviceStatus::Offline;
                entry.device.address = None;
                if let Some(handle) = entry.handle.take() {
                    handle.close();
                }
                stale.push(device_id.clone());
            }
        }
        if !stale.is_empty() {
            self.dirty.store(true, Ordering::Relaxed);
        }
        stale
    }

    pub async fn snapshot(&self, filter: &DeviceFilter) -> Vec<Device> {
        let inner = self.inner.read().await;
        let mut devices: Vec<Device> = inner
            .values()
            .filter(|entry| filter.matches(&entry.device))
            .map(|entry| entry.device.clone())
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub async fn get(&self, device_id: &str) -> Option<Device> {
        let inner = self.inner.read().await;
        inner.get(device_id).map(|entry| entry.device.clone())
    }

    pub async fn connection(&self, device_id: &str) -> Option<ConnectionHandle> {
        let inner = self.inner.read().await;
        inner.get(device_id).and_then(|entry| entry.handle.clone())
    }

    /// Online devices with an attached connection, for a dispatch round.
    pub async fn dispatch_candidates(&self) -> Vec<DispatchCandidate> {
        let inner = self.inner.read().await;
        inner
            .values()
            .filter(|entry| entry.device.status.is_online())
            .filter_map(|entry| {
                entry.handle.clone().map(|handle| DispatchCandidate {
                    device: entry.device.clone(),
                    handle,
                })
            })
            .collect()
    }

    /// Full eligibility predicate over the current registry state.
    pub async fn find_eligible(
        &self,
        requirements: &TaskRequirements,
        task_type: &str,
    ) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut matches: Vec<String> = inner
            .values()
            .filter(|entry| eligible(&entry.device, requirements, task_type))
            .map(|entry| entry.device.device_id.clone())
            .collect();
        matches.sort();
        matches
    }

    pub async fn task_dispatched(&self, device_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(device_id) {
            entry.device.active_task_count += 1;
        }
    }

    pub async fn task_resolved(&self, device_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(device_id) {
            entry.device.active_task_count = entry.device.active_task_count.saturating_sub(1);
        }
    }

    /// Immediate offline transition used when a dispatch post hits the
    /// outbox high-water mark and the connection is being dropped.
    pub async fn force_offline(&self, device_id: &str, conn_id: Uuid) -> bool {
        self.detach(device_id, conn_id).await
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        let mut stats = RegistryStats {
            total_devices: inner.len(),
            ..RegistryStats::default()
        };
        for entry in inner.values() {
            if entry.device.status.is_online() {
                stats.online += 1;
            } else {
                stats.offline += 1;
            }
            *stats.by_role.entry(entry.device.role.clone()).or_insert(0) += 1;
            *stats
                .by_platform
                .entry(entry.device.platform.to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    pub async fn snapshot_for_persistence(&self) -> RegistrySnapshot {
        let inner = self.inner.read().await;
        let mut devices: Vec<Device> = inner.values().map(|entry| entry.device.clone()).collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        RegistrySnapshot {
            saved_at: Utc::now(),
            devices,
        }
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }
}

/// Eligibility of a device for a task: online, advertises the task type,
/// has spare concurrency, and satisfies the declared requirements.
pub(crate) fn eligible(device: &Device, requirements: &TaskRequirements, task_type: &str) -> bool {
    device.status.is_online()
        && device.supports(task_type)
        && device.has_capacity()
        && requirements.satisfied_by(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use salvage_core::DeviceCapabilities;

    fn register_data(device_id: &str, cpu_cores: u32) -> RegisterData {
        RegisterData {
            device_id: device_id.to_string(),
            role: "worker".to_string(),
            platform: Platform::Linux,
            architecture: "x86_64".to_string(),
            runtime_version: "0.1.0".to_string(),
            capabilities: DeviceCapabilities {
                cpu_cores,
                memory_gb: 8.0,
                storage_gb: 64.0,
                has_gpu: false,
                has_internet: true,
                tags: Default::default(),
            },
            supported_task_types: vec!["echo".to_string()],
            max_concurrent_tasks: 2,
        }
    }

    fn handle() -> (ConnectionHandle, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(8);
        (
            ConnectionHandle {
                conn_id: Uuid::new_v4(),
                outbox: tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().expect("addr")
    }

    #[tokio::test]
    async fn first_registration_creates_an_online_device() {
        let registry = DeviceRegistry::new();
        let (conn, _rx) = handle();
        let outcome = registry.register(&register_data("w1", 4), addr(), conn).await;
        assert!(outcome.was_new);
        assert!(outcome.replaced.is_none());

        let device = registry.get("w1").await.expect("device");
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.active_task_count, 0);
        assert!(device.address.is_some());
    }

    #[tokio::test]
    async fn duplicate_registration_replaces_and_evicts_prior_handle() {
        let registry = DeviceRegistry::new();
        let (first, _rx_a) = handle();
        let first_token = first.cancel.clone();
        registry.register(&register_data("w1", 4), addr(), first).await;

        let (second, _rx_b) = handle();
        let outcome = registry
            .register(&register_data("w1", 8), addr(), second)
            .await;
        assert!(!outcome.was_new);
        let replaced = outcome.replaced.expect("prior handle returned");
        replaced.close();
        assert!(first_token.is_cancelled());

        let devices = registry.snapshot(&DeviceFilter::online()).await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].capabilities.cpu_cores, 8);
    }

    #[tokio::test]
    async fn detach_is_a_noop_for_a_stale_connection() {
        let registry = DeviceRegistry::new();
        let (first, _rx_a) = handle();
        let stale_conn_id = first.conn_id;
        registry.register(&register_data("w1", 4), addr(), first).await;

        let (second, _rx_b) = handle();
        let current_conn_id = second.conn_id;
        registry.register(&register_data("w1", 4), addr(), second).await;

        assert!(!registry.detach("w1", stale_conn_id).await);
        assert_eq!(
            registry.get("w1").await.expect("device").status,
            DeviceStatus::Online
        );

        assert!(registry.detach("w1", current_conn_id).await);
        let device = registry.get("w1").await.expect("device");
        assert_eq!(device.status, DeviceStatus::Offline);
        assert!(device.address.is_none());
    }

    #[tokio::test]
    async fn offline_device_can_rejoin() {
        let registry = DeviceRegistry::new();
        let (first, _rx_a) = handle();
        let conn_id = first.conn_id;
        registry.register(&register_data("w1", 4), addr(), first).await;
        registry.detach("w1", conn_id).await;

        let (second, _rx_b) = handle();
        let outcome = registry.register(&register_data("w1", 4), addr(), second).await;
        assert!(!outcome.was_new);
        assert!(outcome.replaced.is_none());
        assert_eq!(
            registry.get("w1").await.expect("device").status,
            DeviceStatus::Online
        );
    }

    #[tokio::test]
    async fn mark_stale_only_affects_devices_past_the_threshold() {
        let registry = DeviceRegistry::new();
        let (conn, _rx) = handle();
        registry.register(&register_data("w1", 4), addr(), conn).await;

        assert!(registry
            .mark_stale(Duration::from_secs(300))
            .await
            .is_empty());

        let stale = registry.mark_stale(Duration::ZERO).await;
        assert_eq!(stale, vec!["w1".to_string()]);
        assert_eq!(
            registry.get("w1").await.expect("device").status,
            DeviceStatus::Offline
        );

        // Already offline devices are not reported again.
        assert!(registry.mark_stale(Duration::ZERO).await.is_empty());
    }

    #[tokio::test]
    async fn find_eligible_applies_requirements_and_capacity() {
        let registry = DeviceRegistry::new();
        let (small, _rx_a) = handle();
        registry.register(&register_data("w1", 2), addr(), small).await;
        let (big, _rx_b) = handle();
        registry.register(&register_data("w2", 8), addr(), big).await;

        let requirements = TaskRequirements {
            min_cpu_cores: 4,
            ..TaskRequirements::default()
        };
        assert_eq!(
            registry.find_eligible(&requirements, "echo").await,
            vec!["w2".to_string()]
        );
        assert!(registry
            .find_eligible(&requirements, "transcode")
            .await
            .is_empty());

        registry.task_dispatched("w2").await;
        registry.task_dispatched("w2").await;
        assert!(registry.find_eligible(&requirements, "echo").await.is_empty());

        registry.task_resolved("w2").await;
        assert_eq!(
            registry.find_eligible(&requirements, "echo").await,
            vec!["w2".to_string()]
        );
    }

    #[tokio::test]
    async fn snapshot_filters_by_status_role_and_tag() {
        let registry = DeviceRegistry::new();
        let (conn_a, _rx_a) = handle();
        let conn_a_id = conn_a.conn_id;
        let mut storage = register_data("nas1", 2);
        storage.role = "storage".to_string();
        storage.capabilities.tags.insert("archive".to_string());
        registry.register(&storage, addr(), conn_a).await;

        let (conn_b, _rx_b) = handle();
        registry.register(&register_data("w1", 4), addr(), conn_b).await;

        registry.detach("nas1", conn_a_id).await;

        assert_eq!(registry.snapshot(&DeviceFilter::default()).await.len(), 2);
        assert_eq!(registry.snapshot(&DeviceFilter::online()).await.len(), 1);

        let by_role = DeviceFilter {
            role: Some("storage".to_string()),
            ..DeviceFilter::default()
        };
        assert_eq!(registry.snapshot(&by_role).await.len(), 1);

        let by_tag = DeviceFilter {
            tag: Some("archive".to_string()),
            ..DeviceFilter::default()
        };
        assert_eq!(registry.snapshot(&by_tag).await[0].device_id, "nas1");
    }

    #[tokio::test]
    async fn restore_marks_every_device_offline() {
        let registry = DeviceRegistry::new();
        let (conn, _rx) = handle();
        registry.register(&register_data("w1", 4), addr(), conn).await;
        let snapshot = registry.snapshot_for_persistence().await;

        let restored = DeviceRegistry::new();
        restored.restore(snapshot.devices).await;
        let device = restored.get("w1").await.expect("device");
        assert_eq!(device.status, DeviceStatus::Offline);
        assert_eq!(device.active_task_count, 0);
        assert!(device.address.is_none());
        assert!(restored.connection("w1").await.is_none());
    }

    #[tokio::test]
    async fn stats_count_by_status_role_and_platform() {
        let registry = DeviceRegistry::new();
        let (conn_a, _rx_a) = handle();
        registry.register(&register_data("w1", 4), addr(), conn_a).await;
        let (conn_b, _rx_b) = handle();
        let conn_b_id = conn_b.conn_id;
        let mut mobile = register_data("phone1", 8);
        mobile.role = "mobile".to_string();
        mobile.platform = Platform::Android;
        registry.register(&mobile, addr(), conn_b).await;
        registry.detach("phone1", conn_b_id).await;

        let stats = registry.stats().await;
        assert_eq!(stats.total_devices, 2);
        assert_eq!(stats.online, 1);
        assert_eq!(stats.offline, 1);
        assert_eq!(stats.by_role.get("worker"), Some(&1));
        assert_eq!(stats.by_role.get("mobile"), Some(&1));
        assert_eq!(stats.by_platform.get("android"), Some(&1));
        assert_eq!(stats.by_platform.get("linux"), Some(&1));
    }

    #[tokio::test]
    async fn record_heartbeat_updates_rolling_metrics() {
        let registry = DeviceRegistry::new();
        let (conn, _rx) = handle();
        registry.register(&register_data("w1", 4), addr(), conn).await;

        let metrics = HeartbeatData {
            cpu_percent: 62.0,
            memory_percent: 40.0,
            active_tasks: 1,
            uptime_seconds: 10,
        };
        assert!(registry.record_heartbeat("w1", &metrics).await);
        assert!(!registry.record_heartbeat("ghost", &metrics).await);

        let device = registry.get("w1").await.expect("device");
        assert_eq!(device.cpu_percent, 62.0);
        assert_eq!(device.memory_percent, 40.0);
    }
}
