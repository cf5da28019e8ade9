//! Lock state machine
//!
//! One machine per tracked device. A local open request only moves the
//! *target* state optimistically; how the *current* state converges depends
//! on the policy:
//!
//! - `RemoteConfirmed`: the device is covered by polling, so after the open
//!   command is acknowledged the machine asks the scheduler for a fast
//!   window and lets subsequent snapshots report the true state.
//! - `SelfTimed`: nothing polls this device class, so the machine flips to
//!   unsecured on acknowledgment and re-secures itself after a fixed window
//!   with no further remote call.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use crate::accessory::StateSink;
use crate::error::PortalError;
use crate::models::{DeviceState, LockState, RemoteDevice};
use crate::portal::PortalClient;
use crate::sync::scheduler::PollScheduler;

/// How long to poll fast after a commanded open, and at what cadence.
const OPEN_CONFIRM_WINDOW: Duration = Duration::from_secs(30);
const OPEN_CONFIRM_FREQUENCY: Duration = Duration::from_secs(5);

/// Cadence used when a snapshot shows the door opened from outside.
const EXTERNAL_OPEN_FREQUENCY: Duration = Duration::from_secs(10);

/// Self-timed policy: how long the door stays unsecured before re-securing.
const RELOCK_DELAY: Duration = Duration::from_secs(5);

/// Convergence policy for a device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockPolicy {
    #[default]
    RemoteConfirmed,
    SelfTimed,
}

/// Transition phase. `Unsecuring` and `Resecuring` hold the pending-operation
/// guard: an open request made in either phase attaches to the transition in
/// flight instead of issuing another remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Unsecuring,
    Resecuring,
}

struct MachineState {
    phase: Phase,
    current: LockState,
    target: LockState,
    waiters: Vec<oneshot::Sender<Result<(), PortalError>>>,
    relock_timer: Option<JoinHandle<()>>,
}

/// Completion handle for an open request. Attaching callers share the
/// pending transition's outcome.
pub struct OpenHandle {
    rx: oneshot::Receiver<Result<(), PortalError>>,
}

impl OpenHandle {
    /// Wait for the transition to finish.
    pub async fn wait(self) -> Result<(), PortalError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(PortalError::Transport(
                "device removed while the operation was pending".to_string(),
            )),
        }
    }
}

/// Per-device state machine. Cloning shares the machine.
#[derive(Clone)]
pub struct LockMachine {
    inner: Arc<MachineInner>,
}

struct MachineInner {
    device_id: String,
    identity: Uuid,
    display_name: String,
    policy: LockPolicy,
    client: Arc<PortalClient>,
    scheduler: PollScheduler,
    sink: Arc<dyn StateSink>,
    state: Mutex<MachineState>,
}

impl LockMachine {
    pub fn new(
        device_id: String,
        identity: Uuid,
        display_name: String,
        policy: LockPolicy,
        initial: DeviceState,
        client: Arc<PortalClient>,
        scheduler: PollScheduler,
        sink: Arc<dyn StateSink>,
    ) -> Self {
        let seeded = LockState::from_remote(initial);
        Self {
            inner: Arc::new(MachineInner {
                device_id,
                identity,
                display_name,
                policy,
                client,
                scheduler,
                sink,
                state: Mutex::new(MachineState {
                    phase: Phase::Idle,
                    current: seeded,
                    target: seeded,
                    waiters: Vec::new(),
                    relock_timer: None,
                }),
            }),
        }
    }

    pub fn policy(&self) -> LockPolicy {
        self.inner.policy
    }

    pub async fn current_state(&self) -> LockState {
        self.inner.state.lock().await.current
    }

    pub async fn target_state(&self) -> LockState {
        self.inner.state.lock().await.target
    }

    /// Request the door to open. At most one transition is in flight per
    /// device; a request made while one is pending attaches to it.
    pub async fn request_open(&self) -> OpenHandle {
        let (tx, rx) = oneshot::channel();
        let previous_target;
        {
            let mut state = self.inner.state.lock().await;
            if state.phase != Phase::Idle {
                tracing::debug!(
                    "[Lock] {}: open already in flight, attaching",
                    self.inner.display_name
                );
                state.waiters.push(tx);
                return OpenHandle { rx };
            }
            previous_target = state.target;
            state.phase = Phase::Unsecuring;
            state.target = LockState::Unsecured;
            state.waiters.push(tx);
        }
        self.inner
            .sink
            .target_state_changed(self.inner.identity, LockState::Unsecured);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_open(previous_target).await;
        });

        OpenHandle { rx }
    }

    /// Deliver a fresh snapshot.
    ///
    /// Self-timed devices ignore snapshots; nothing polls them on purpose.
    /// For remote-confirmed devices the snapshot is authoritative: current
    /// follows it, and so does the target. A door reported unsecured while
    /// the target was secured was opened from outside; watch it closely
    /// until it closes.
    pub async fn apply_snapshot(&self, snapshot: &RemoteDevice) {
        if self.inner.policy == LockPolicy::SelfTimed {
            tracing::debug!(
                "[Lock] {}: self-timed device, snapshot ignored",
                self.inner.display_name
            );
            return;
        }

        let reported = LockState::from_remote(snapshot.state);
        let current_changed;
        let target_changed;
        let opened_externally;
        {
            let mut state = self.inner.state.lock().await;
            current_changed = state.current != reported;
            target_changed = state.target != reported;
            opened_externally =
                reported == LockState::Unsecured && state.target == LockState::Secured;
            state.current = reported;
            state.target = reported;
        }

        if current_changed {
            tracing::debug!(
                "[Lock] {}: current state now {:?}",
                self.inner.display_name,
                reported
            );
            self.inner
                .sink
                .current_state_changed(self.inner.identity, reported);
        }
        if opened_externally {
            let _ = self
                .inner
                .scheduler
                .enter_fast_window(OPEN_CONFIRM_WINDOW, EXTERNAL_OPEN_FREQUENCY);
        }
        if target_changed {
            self.inner
                .sink
                .target_state_changed(self.inner.identity, reported);
        }
    }

    /// Cancel timers and fail pending waiters. Called when the device leaves
    /// the registry; a dangling relock timer must not resurrect it.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(timer) = state.relock_timer.take() {
            timer.abort();
        }
        state.phase = Phase::Idle;
        // Dropping the senders resolves outstanding handles with an error.
        state.waiters.clear();
    }
}

impl MachineInner {
    async fn run_open(self: Arc<Self>, previous_target: LockState) {
        match self
            .client
            .set_device_state(&self.device_id, DeviceState::Open)
            .await
        {
            Ok(()) => {
                tracing::debug!("[Lock] {}: remote open acknowledged", self.display_name);
                match self.policy {
                    LockPolicy::RemoteConfirmed => self.watch_for_confirmation().await,
                    LockPolicy::SelfTimed => self.start_relock_timer().await,
                }
            }
            Err(err) => {
                tracing::error!(
                    "[Lock] {}: remote open failed: {}",
                    self.display_name,
                    err
                );
                let waiters;
                {
                    let mut state = self.state.lock().await;
                    state.phase = Phase::Idle;
                    state.target = previous_target;
                    waiters = std::mem::take(&mut state.waiters);
                }
                self.sink.target_state_changed(self.identity, previous_target);
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }

    /// Remote-confirmed policy: the snapshot stream is authoritative for the
    /// current state, so only tighten the polling cadence and release the
    /// guard. If the window expires without the portal ever reporting the
    /// door open, the target stays as last commanded.
    async fn watch_for_confirmation(&self) {
        let _ = self
            .scheduler
            .enter_fast_window(OPEN_CONFIRM_WINDOW, OPEN_CONFIRM_FREQUENCY);
        let waiters;
        {
            let mut state = self.state.lock().await;
            state.phase = Phase::Idle;
            waiters = std::mem::take(&mut state.waiters);
        }
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Self-timed policy: unsecured now, secured again after the relock
    /// delay, with no remote call in between.
    async fn start_relock_timer(self: Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            state.current = LockState::Unsecured;
            state.phase = Phase::Resecuring;
        }
        self.sink
            .current_state_changed(self.identity, LockState::Unsecured);

        let inner = Arc::clone(&self);
        let timer = tokio::spawn(async move {
            time::sleep(RELOCK_DELAY).await;
            inner.relock().await;
        });
        self.state.lock().await.relock_timer = Some(timer);
    }

    async fn relock(&self) {
        let waiters;
        {
            let mut state = self.state.lock().await;
            state.phase = Phase::Idle;
            state.target = LockState::Secured;
            state.current = LockState::Secured;
            state.relock_timer = None;
            waiters = std::mem::take(&mut state.waiters);
        }
        tracing::debug!("[Lock] {}: re-secured", self.display_name);
        self.sink
            .target_state_changed(self.identity, LockState::Secured);
        self.sink
            .current_state_changed(self.identity, LockState::Secured);
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }
}
