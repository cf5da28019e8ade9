//! Tracked-device registry and reconciliation
//!
//! The registry owns every `TrackedDevice`. `discover` is the full pass
//! that creates and removes entries; `refresh` only feeds fresh snapshots to
//! devices that already exist. Both passes serialize on one guard so a slow
//! pass never overlaps the next tick.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::time;
use uuid::Uuid;

use crate::accessory::{AccessoryRegistry, StateSink};
use crate::config::DeviceOverride;
use crate::error::PortalError;
use crate::lock::{LockMachine, LockPolicy};
use crate::models::{serial_number, DeviceDescriptor, IdentityFn, RemoteDevice};
use crate::portal::PortalClient;
use crate::sync::scheduler::{PollScheduler, RefreshTarget};

/// Delay before retrying a throttled discovery pass.
const THROTTLE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// One physical lock tracked by the engine.
pub struct TrackedDevice {
    identity: Uuid,
    device_id: String,
    display_name: String,
    policy: LockPolicy,
    machine: LockMachine,
    snapshot: RwLock<RemoteDevice>,
    first_seen: DateTime<Utc>,
    last_seen: RwLock<DateTime<Utc>>,
}

impl TrackedDevice {
    pub fn identity(&self) -> Uuid {
        self.identity
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn machine(&self) -> &LockMachine {
        &self.machine
    }

    pub async fn snapshot(&self) -> RemoteDevice {
        self.snapshot.read().await.clone()
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub async fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.read().await
    }

    fn kind(&self) -> &'static str {
        match self.policy {
            LockPolicy::RemoteConfirmed => "door",
            LockPolicy::SelfTimed => "stateless-door",
        }
    }

    /// Accessory-facing description derived from the latest snapshot.
    pub async fn descriptor(&self) -> DeviceDescriptor {
        let snapshot = self.snapshot.read().await;
        DeviceDescriptor {
            identity: self.identity,
            device_id: self.device_id.clone(),
            display_name: self.display_name.clone(),
            model: format!("{}-{}", self.kind(), snapshot.version),
            serial_number: serial_number(&self.device_id),
        }
    }

    async fn update_snapshot(&self, remote: &RemoteDevice) {
        *self.snapshot.write().await = remote.clone();
        *self.last_seen.write().await = Utc::now();
    }
}

/// Registry of tracked devices, reconciled against the portal.
pub struct DeviceRegistry {
    client: Arc<PortalClient>,
    accessories: Arc<dyn AccessoryRegistry>,
    sink: Arc<dyn StateSink>,
    scheduler: PollScheduler,
    identity: IdentityFn,
    overrides: HashMap<String, DeviceOverride>,
    devices: RwLock<HashMap<Uuid, Arc<TrackedDevice>>>,
    pass_guard: Mutex<()>,
}

impl DeviceRegistry {
    pub fn new(
        client: Arc<PortalClient>,
        accessories: Arc<dyn AccessoryRegistry>,
        sink: Arc<dyn StateSink>,
        scheduler: PollScheduler,
        identity: IdentityFn,
        overrides: Vec<DeviceOverride>,
    ) -> Self {
        Self {
            client,
            accessories,
            sink,
            scheduler,
            identity,
            overrides: overrides
                .into_iter()
                .map(|entry| (entry.id.clone(), entry))
                .collect(),
            devices: RwLock::new(HashMap::new()),
            pass_guard: Mutex::new(()),
        }
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    pub async fn device(&self, identity: Uuid) -> Option<Arc<TrackedDevice>> {
        self.devices.read().await.get(&identity).cloned()
    }

    pub async fn identities(&self) -> Vec<Uuid> {
        self.devices.read().await.keys().copied().collect()
    }

    /// Full reconciliation pass: fetch the portal device list, track new
    /// devices, update known ones, drop the rest. A throttled pass is retried
    /// after a fixed delay instead of surfacing; other errors propagate.
    pub async fn discover(&self) -> Result<(), PortalError> {
        let _pass = self.pass_guard.lock().await;
        loop {
            match self.discover_pass().await {
                Err(PortalError::Throttle) => {
                    tracing::warn!(
                        "[Sync] Discovery throttled by the portal, retrying in {}s",
                        THROTTLE_RETRY_DELAY.as_secs()
                    );
                    time::sleep(THROTTLE_RETRY_DELAY).await;
                }
                result => return result,
            }
        }
    }

    async fn discover_pass(&self) -> Result<(), PortalError> {
        let remote_devices = self.client.list_devices().await?;
        let mut devices = self.devices.write().await;

        let mut seen = HashSet::with_capacity(remote_devices.len());
        for remote in remote_devices {
            let identity = (self.identity)(&serial_number(&remote.id));
            seen.insert(identity);

            if let Some(tracked) = devices.get(&identity) {
                tracing::info!(
                    "[Sync] Reloading {} from the portal: \"{}\"",
                    tracked.kind(),
                    tracked.display_name()
                );
                tracked.update_snapshot(&remote).await;
                self.accessories.device_updated(&tracked.descriptor().await);
            } else {
                let tracked = self.track(identity, remote);
                tracing::info!(
                    "[Sync] Discovered new {} from the portal: \"{}\"",
                    tracked.kind(),
                    tracked.display_name()
                );
                self.accessories
                    .device_registered(&tracked.descriptor().await);
                devices.insert(identity, tracked);
            }
        }

        let vanished: Vec<Arc<TrackedDevice>> = devices
            .values()
            .filter(|tracked| !seen.contains(&tracked.identity))
            .cloned()
            .collect();
        for tracked in vanished {
            tracing::info!(
                "[Sync] Removing device: \"{}\" ({})",
                tracked.display_name(),
                tracked.identity
            );
            tracked.machine().shutdown().await;
            self.accessories
                .device_removed(tracked.identity, tracked.display_name());
            devices.remove(&tracked.identity);
        }

        Ok(())
    }

    fn track(&self, identity: Uuid, remote: RemoteDevice) -> Arc<TrackedDevice> {
        let overridden = self.overrides.get(&remote.id);
        let policy = overridden.map(|entry| entry.policy).unwrap_or_default();
        let display_name = overridden
            .and_then(|entry| entry.name.clone())
            .unwrap_or_else(|| remote.name.clone());

        let machine = LockMachine::new(
            remote.id.clone(),
            identity,
            display_name.clone(),
            policy,
            remote.state,
            Arc::clone(&self.client),
            self.scheduler.clone(),
            Arc::clone(&self.sink),
        );

        let now = Utc::now();
        Arc::new(TrackedDevice {
            identity,
            device_id: remote.id.clone(),
            display_name,
            policy,
            machine,
            snapshot: RwLock::new(remote),
            first_seen: now,
            last_seen: RwLock::new(now),
        })
    }
}

#[async_trait]
impl RefreshTarget for DeviceRegistry {
    /// Per-tick pass: feed the latest snapshots to already-tracked devices.
    /// Never creates or removes entries; a throttled fetch skips the tick,
    /// any other failure is logged and the tick ends cleanly.
    async fn refresh(&self) {
        let _pass = match self.pass_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("[Sync] Previous pass still running, skipping this tick");
                return;
            }
        };

        tracing::debug!("[Sync] Refreshing devices...");
        let remote_devices = match self.client.list_devices().await {
            Ok(devices) => devices,
            Err(PortalError::Throttle) => {
                tracing::debug!(
                    "[Sync] Refresh throttled by the portal, waiting for the next tick"
                );
                return;
            }
            Err(err) => {
                tracing::error!("[Sync] Refresh failed: {}", err);
                return;
            }
        };

        let devices = self.devices.read().await;
        for remote in remote_devices {
            let identity = (self.identity)(&serial_number(&remote.id));
            let tracked = match devices.get(&identity) {
                Some(tracked) => tracked,
                // New ids wait for the next discovery pass.
                None => continue,
            };
            tracked.update_snapshot(&remote).await;
            self.accessories.device_updated(&tracked.descriptor().await);
            tracked.machine().apply_snapshot(&remote).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::models::{default_identity, DeviceState, LockState, LoginResponse, PortalInfo};
    use crate::portal::{Credentials, PortalTransport, Session};

    /// Transport that replays a script of device-list results.
    struct ScriptedTransport {
        lists: StdMutex<Vec<Result<Vec<RemoteDevice>, PortalError>>>,
        list_calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(lists: Vec<Result<Vec<RemoteDevice>, PortalError>>) -> Self {
            Self {
                lists: StdMutex::new(lists),
                list_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PortalTransport for ScriptedTransport {
        async fn login(
            &self,
            _username: &str,
            _password: &str,
            _key: &str,
        ) -> Result<LoginResponse, PortalError> {
            Ok(LoginResponse {
                token: "tok".to_string(),
                id_user: 1,
            })
        }

        async fn change_portal(
            &self,
            _token: &str,
            _id_portal: i64,
        ) -> Result<PortalInfo, PortalError> {
            Ok(PortalInfo {
                name: "Condo".to_string(),
                units_with_user_responsible: vec![],
            })
        }

        async fn list_devices(
            &self,
            _token: &str,
            _id_portal: i64,
        ) -> Result<Vec<RemoteDevice>, PortalError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let mut lists = self.lists.lock().unwrap();
            if lists.len() > 1 {
                lists.remove(0)
            } else {
                lists[0].clone()
            }
        }

        async fn set_device_state(
            &self,
            _token: &str,
            _id_portal: i64,
            _device_id: &str,
            _state: DeviceState,
        ) -> Result<(), PortalError> {
            Ok(())
        }
    }

    /// Bridge that records registry events by device id.
    #[derive(Default)]
    struct RecordingBridge {
        events: StdMutex<Vec<String>>,
    }

    impl RecordingBridge {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl AccessoryRegistry for RecordingBridge {
        fn device_registered(&self, descriptor: &DeviceDescriptor) {
            self.events
                .lock()
                .unwrap()
                .push(format!("registered:{}", descriptor.device_id));
        }

        fn device_updated(&self, descriptor: &DeviceDescriptor) {
            self.events
                .lock()
                .unwrap()
                .push(format!("updated:{}", descriptor.device_id));
        }

        fn device_removed(&self, _identity: Uuid, display_name: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("removed:{}", display_name));
        }
    }

    impl StateSink for RecordingBridge {
        fn current_state_changed(&self, _identity: Uuid, _state: LockState) {}
        fn target_state_changed(&self, _identity: Uuid, _state: LockState) {}
    }

    fn device(id: &str, state: DeviceState) -> RemoteDevice {
        RemoteDevice {
            id: id.to_string(),
            name: format!("Door {}", id),
            state,
            event: "EVENT".to_string(),
            version: "1.2.5".to_string(),
        }
    }

    fn registry(
        transport: Arc<ScriptedTransport>,
        overrides: Vec<DeviceOverride>,
    ) -> Arc<DeviceRegistry> {
        let client = Arc::new(PortalClient::new(
            transport as Arc<dyn PortalTransport>,
            Session::new(Credentials {
                username: "user".to_string(),
                password: "hunter2".to_string(),
                client_key: "key".to_string(),
                portal: 42,
            }),
        ));
        let bridge = Arc::new(RecordingBridge::default());
        let (scheduler, _driver) = PollScheduler::new(Duration::from_secs(60));
        Arc::new(DeviceRegistry::new(
            client,
            bridge.clone() as Arc<dyn AccessoryRegistry>,
            bridge as Arc<dyn StateSink>,
            scheduler,
            default_identity(),
            overrides,
        ))
    }

    #[tokio::test]
    async fn test_discover_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(vec![
            device("d1", DeviceState::Closed),
            device("d2", DeviceState::Open),
        ])]));
        let bridge = Arc::new(RecordingBridge::default());
        let client = Arc::new(PortalClient::new(
            Arc::clone(&transport) as Arc<dyn PortalTransport>,
            Session::new(Credentials {
                username: "user".to_string(),
                password: "hunter2".to_string(),
                client_key: "key".to_string(),
                portal: 42,
            }),
        ));
        let (scheduler, _driver) = PollScheduler::new(Duration::from_secs(60));
        let registry = DeviceRegistry::new(
            client,
            bridge.clone() as Arc<dyn AccessoryRegistry>,
            bridge.clone() as Arc<dyn StateSink>,
            scheduler,
            default_identity(),
            vec![],
        );

        registry.discover().await.unwrap();
        let first_identities = {
            let mut ids = registry.identities().await;
            ids.sort();
            ids
        };
        assert_eq!(registry.len().await, 2);

        registry.discover().await.unwrap();
        let second_identities = {
            let mut ids = registry.identities().await;
            ids.sort();
            ids
        };
        assert_eq!(registry.len().await, 2);
        assert_eq!(first_identities, second_identities);

        let events = bridge.events();
        assert_eq!(
            events
                .iter()
                .filter(|event| event.starts_with("registered:"))
                .count(),
            2
        );
        assert_eq!(
            events
                .iter()
                .filter(|event| event.starts_with("updated:"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_discover_removes_vanished_devices() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(vec![
                device("d1", DeviceState::Closed),
                device("d2", DeviceState::Closed),
            ]),
            Ok(vec![device("d1", DeviceState::Closed)]),
        ]));
        let bridge = Arc::new(RecordingBridge::default());
        let client = Arc::new(PortalClient::new(
            Arc::clone(&transport) as Arc<dyn PortalTransport>,
            Session::new(Credentials {
                username: "user".to_string(),
                password: "hunter2".to_string(),
                client_key: "key".to_string(),
                portal: 42,
            }),
        ));
        let (scheduler, _driver) = PollScheduler::new(Duration::from_secs(60));
        let registry = DeviceRegistry::new(
            client,
            bridge.clone() as Arc<dyn AccessoryRegistry>,
            bridge.clone() as Arc<dyn StateSink>,
            scheduler,
            default_identity(),
            vec![],
        );

        registry.discover().await.unwrap();
        assert_eq!(registry.len().await, 2);

        registry.discover().await.unwrap();
        assert_eq!(registry.len().await, 1);
        assert!(bridge
            .events()
            .iter()
            .any(|event| event == "removed:Door d2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_discovery_retries_after_fixed_delay() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(PortalError::Throttle),
            Ok(vec![device("d1", DeviceState::Closed)]),
        ]));
        let bridge = Arc::new(RecordingBridge::default());
        let client = Arc::new(PortalClient::new(
            Arc::clone(&transport) as Arc<dyn PortalTransport>,
            Session::new(Credentials {
                username: "user".to_string(),
                password: "hunter2".to_string(),
                client_key: "key".to_string(),
                portal: 42,
            }),
        ));
        let (scheduler, _driver) = PollScheduler::new(Duration::from_secs(60));
        let registry = DeviceRegistry::new(
            client,
            bridge.clone() as Arc<dyn AccessoryRegistry>,
            bridge as Arc<dyn StateSink>,
            scheduler,
            default_identity(),
            vec![],
        );

        let started = time::Instant::now();
        registry.discover().await.unwrap();

        // One retry, delayed by exactly the fixed backoff, converging to the
        // same state a clean first pass would have produced.
        assert_eq!(transport.list_calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), THROTTLE_RETRY_DELAY);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_transport_error_propagates_from_discovery() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(PortalError::Transport(
            "connection refused".to_string(),
        ))]));
        let registry = registry(Arc::clone(&transport), vec![]);

        assert!(matches!(
            registry.discover().await,
            Err(PortalError::Transport(_))
        ));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_refresh_updates_without_changing_membership() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(vec![device("d1", DeviceState::Closed)]),
            Ok(vec![
                device("d1", DeviceState::Open),
                device("d2", DeviceState::Closed),
            ]),
        ]));
        let registry = registry(Arc::clone(&transport), vec![]);

        registry.discover().await.unwrap();
        assert_eq!(registry.len().await, 1);

        registry.refresh().await;
        assert_eq!(registry.len().await, 1);

        let identity = registry.identities().await[0];
        let tracked = registry.device(identity).await.unwrap();
        assert_eq!(tracked.snapshot().await.state, DeviceState::Open);
        assert_eq!(
            tracked.machine().current_state().await,
            LockState::Unsecured
        );
        assert!(tracked.last_seen().await >= tracked.first_seen());
    }

    #[tokio::test]
    async fn test_refresh_swallows_throttle_and_transport_errors() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(vec![device("d1", DeviceState::Closed)]),
            Err(PortalError::Throttle),
            Err(PortalError::Transport("connection reset".to_string())),
        ]));
        let registry = registry(Arc::clone(&transport), vec![]);

        registry.discover().await.unwrap();
        registry.refresh().await;
        registry.refresh().await;

        // Both ticks ended cleanly with the registry untouched.
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_policy_override_selects_self_timed_machine() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(vec![device(
            "d1",
            DeviceState::Closed,
        )])]));
        let registry = registry(
            Arc::clone(&transport),
            vec![DeviceOverride {
                id: "d1".to_string(),
                name: Some("Garage".to_string()),
                policy: LockPolicy::SelfTimed,
            }],
        );

        registry.discover().await.unwrap();
        let identity = registry.identities().await[0];
        let tracked = registry.device(identity).await.unwrap();
        assert_eq!(tracked.machine().policy(), LockPolicy::SelfTimed);
        assert_eq!(tracked.display_name(), "Garage");
        assert_eq!(tracked.descriptor().await.model, "stateless-door-1.2.5");
    }
}
