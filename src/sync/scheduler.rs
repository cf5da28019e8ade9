//! Adaptive polling scheduler
//!
//! One driver task owns the refresh cadence. The cadence is the base
//! frequency unless a fast window is active; the window's one-shot expiry
//! and the repeating ticker replace each other so no stale timer survives a
//! cadence change. Fast windows are how the engine observes convergence:
//! the portal does not push state, so after a commanded open the only way to
//! see the door actually move is to poll harder for a bounded period.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};

/// Default background cadence between refresh passes.
pub const DEFAULT_CHECK_FREQUENCY: Duration = Duration::from_secs(60);

/// Target of a scheduler tick. `DeviceRegistry` in production.
#[async_trait]
pub trait RefreshTarget: Send + Sync {
    async fn refresh(&self);
}

enum Command {
    SetBase(Duration),
    EnterFast {
        duration: Duration,
        frequency: Duration,
        done: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle on an active fast window. Resolves once the window has expired and
/// the base cadence is restored.
pub struct WindowHandle {
    rx: oneshot::Receiver<()>,
}

impl WindowHandle {
    /// Wait for the window to end. A stopped scheduler counts as ended.
    pub async fn expired(self) {
        let _ = self.rx.await;
    }
}

/// Cloneable handle to the scheduler driver.
#[derive(Clone)]
pub struct PollScheduler {
    commands: mpsc::UnboundedSender<Command>,
}

impl PollScheduler {
    /// Create the handle and its driver. Nothing ticks until the driver's
    /// `run` is spawned.
    pub fn new(base: Duration) -> (Self, SchedulerDriver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { commands: tx },
            SchedulerDriver { commands: rx, base },
        )
    }

    /// Replace the repeating cadence. Takes effect immediately unless a fast
    /// window is active, in which case it becomes the cadence restored at
    /// expiry.
    pub fn set_base_frequency(&self, frequency: Duration) {
        let _ = self.commands.send(Command::SetBase(frequency));
    }

    /// Poll at `frequency` for the next `duration`, then fall back to the
    /// base cadence. Re-entering while a window is active moves the expiry
    /// out to the full new duration and retargets the frequency; windows
    /// never stack.
    pub fn enter_fast_window(&self, duration: Duration, frequency: Duration) -> WindowHandle {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::EnterFast {
            duration,
            frequency,
            done: tx,
        });
        WindowHandle { rx }
    }

    /// Stop the driver and cancel whichever timer is armed.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct FastWindow {
    expires_at: Instant,
    frequency: Duration,
    waiters: Vec<oneshot::Sender<()>>,
}

/// Timer side of the scheduler, owned by a single task.
pub struct SchedulerDriver {
    commands: mpsc::UnboundedReceiver<Command>,
    base: Duration,
}

impl SchedulerDriver {
    pub async fn run(mut self, target: Arc<dyn RefreshTarget>) {
        tracing::info!(
            "[Scheduler] Starting refresh loop (base frequency: {}s)",
            self.base.as_secs()
        );

        let mut ticker = Self::ticker(self.base);
        let mut window: Option<FastWindow> = None;

        loop {
            // Placeholder instant when idle; the expiry branch is gated on
            // `window.is_some()` either way.
            let expires_at = window
                .as_ref()
                .map(|active| active.expires_at)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                // A window expiring on the same instant as a tick wins the
                // race: that tick belongs to the restored base cadence.
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::SetBase(frequency)) => {
                        self.base = frequency;
                        if window.is_none() {
                            ticker = Self::ticker(frequency);
                        }
                    }
                    Some(Command::EnterFast { duration, frequency, done }) => {
                        let expires_at = Instant::now() + duration;
                        match window.as_mut() {
                            Some(active) => {
                                tracing::debug!(
                                    "[Scheduler] Fast window extended ({}s at {}s cadence)",
                                    duration.as_secs(),
                                    frequency.as_secs()
                                );
                                active.expires_at = expires_at;
                                if active.frequency != frequency {
                                    active.frequency = frequency;
                                    ticker = Self::ticker(frequency);
                                }
                                active.waiters.push(done);
                            }
                            None => {
                                tracing::debug!(
                                    "[Scheduler] Entering fast window ({}s at {}s cadence)",
                                    duration.as_secs(),
                                    frequency.as_secs()
                                );
                                ticker = Self::ticker(frequency);
                                window = Some(FastWindow {
                                    expires_at,
                                    frequency,
                                    waiters: vec![done],
                                });
                            }
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        tracing::info!("[Scheduler] Shutting down, timers cancelled");
                        break;
                    }
                },
                _ = time::sleep_until(expires_at), if window.is_some() => {
                    if let Some(expired) = window.take() {
                        tracing::debug!(
                            "[Scheduler] Fast window expired, back to {}s cadence",
                            self.base.as_secs()
                        );
                        ticker = Self::ticker(self.base);
                        for waiter in expired.waiters {
                            let _ = waiter.send(());
                        }
                    }
                }
                _ = ticker.tick() => {
                    target.refresh().await;
                }
            }
        }
    }

    fn ticker(period: Duration) -> time::Interval {
        // First tick one full period out, not immediately.
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}
