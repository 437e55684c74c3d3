//! Connection-health policies.
//!
//! A pool reports every instruction outcome to its [`HealthPolicy`].  Plain
//! pools use [`AlwaysOnline`]; sender pools use a [`HealthMonitor`], which
//! counts consecutive failures and drives a small state machine:
//!
//! ```text
//!            success                       threshold reached
//! Unknown ───────────► Online ─────────────────────────────► Offline
//!    │                   ▲                                      │
//!    │ threshold reached │ success                              │ reconnect ok
//!    └───────────────────┼──────────────────────► Offline       ▼
//!                        └─────────────────────────────────  Unknown
//! ```
//!
//! Every transition fires the registered status listeners exactly once.
//! Entering `Offline` can optionally start a reconnect task that retries the
//! link with the channel's back-off policy.
//!
//! An offline device is never locked out for good.  Any frame it sends moves
//! it back to `Unknown`, and while no reconnect task is running the monitor
//! admits one trial exchange each time the back-off delay elapses.  A
//! successful trial brings the device `Online`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use devlink_core::{DeviceDescription, InstructionDescription, InstructionError, ReconnectPolicy};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::application::link::Link;

/// Health of the link behind a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkStatus {
    Unknown,
    Online,
    Offline,
}

/// Payload handed to status listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub device: String,
    pub from: LinkStatus,
    pub to: LinkStatus,
}

pub type StatusListener = Arc<dyn Fn(&StatusChange) + Send + Sync>;

/// Receives the outcome of every dispatched instruction.
pub trait HealthPolicy: Send + Sync {
    fn status(&self) -> LinkStatus;

    /// Whether a synchronous call may be dispatched now.
    fn admit(&self) -> bool {
        self.status() != LinkStatus::Offline
    }

    /// The device sent a frame.
    fn frame_received(&self, _device: &DeviceDescription) {}

    fn success_handle(&self, device: &DeviceDescription);

    fn error_handle(
        &self,
        device: &DeviceDescription,
        instruction: &InstructionDescription,
        error: &InstructionError,
    );
}

/// Policy for pools that do not track health.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

impl HealthPolicy for AlwaysOnline {
    fn status(&self) -> LinkStatus {
        LinkStatus::Online
    }

    fn success_handle(&self, _device: &DeviceDescription) {}

    fn error_handle(
        &self,
        _device: &DeviceDescription,
        _instruction: &InstructionDescription,
        _error: &InstructionError,
    ) {
    }
}

#[derive(Debug)]
struct HealthState {
    status: LinkStatus,
    consecutive_failures: u32,
    reconnecting: bool,
    /// Trial exchanges admitted since going offline.
    trials: u32,
    last_trial: Option<Instant>,
}

impl HealthState {
    fn reset_to(&mut self, to: LinkStatus) -> LinkStatus {
        let from = self.status;
        self.status = to;
        self.consecutive_failures = 0;
        self.trials = 0;
        self.last_trial = None;
        from
    }
}

struct Reconnector {
    link: Arc<dyn Link>,
    policy: ReconnectPolicy,
}

struct HealthShared {
    threshold: u32,
    state: Mutex<HealthState>,
    listeners: Mutex<Vec<StatusListener>>,
    reconnector: Option<Reconnector>,
    backoff: ReconnectPolicy,
    reconnect_attempts: AtomicU32,
}

/// Failure-counting health state machine.
#[derive(Clone)]
pub struct HealthMonitor {
    shared: Arc<HealthShared>,
}

impl HealthMonitor {
    /// Monitor that goes offline after `threshold` consecutive failures.
    pub fn new(threshold: u32) -> Self {
        Self::with_backoff(threshold, ReconnectPolicy::default())
    }

    /// Like [`HealthMonitor::new`], spacing trial exchanges while offline
    /// by `backoff`.
    pub fn with_backoff(threshold: u32, backoff: ReconnectPolicy) -> Self {
        Self::build(threshold, backoff, None)
    }

    /// Monitor that also re-establishes `link` when the device goes offline.
    pub fn with_reconnect(threshold: u32, link: Arc<dyn Link>, policy: ReconnectPolicy) -> Self {
        let backoff = policy.clone();
        Self::build(threshold, backoff, Some(Reconnector { link, policy }))
    }

    fn build(threshold: u32, backoff: ReconnectPolicy, reconnector: Option<Reconnector>) -> Self {
        Self {
            shared: Arc::new(HealthShared {
                threshold: threshold.max(1),
                state: Mutex::new(HealthState {
                    status: LinkStatus::Unknown,
                    consecutive_failures: 0,
                    reconnecting: false,
                    trials: 0,
                    last_trial: None,
                }),
                listeners: Mutex::new(Vec::new()),
                reconnector,
                backoff,
                reconnect_attempts: AtomicU32::new(0),
            }),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.shared.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.lock_state().consecutive_failures
    }

    /// Total reconnect attempts made since construction.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.shared.lock_state().reconnecting
    }

    /// Registers a callback fired on every status transition.
    pub fn on_status_changed<F>(&self, listener: F)
    where
        F: Fn(&StatusChange) + Send + Sync + 'static,
    {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(listener));
    }

    fn spawn_reconnect(&self, device: String) {
        let Some(reconnector) = &self.shared.reconnector else {
            return;
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("device {device}: offline but no runtime available to reconnect");
                self.shared.lock_state().reconnecting = false;
                return;
            }
        };
        let shared = Arc::clone(&self.shared);
        let link = Arc::clone(&reconnector.link);
        let policy = reconnector.policy.clone();
        handle.spawn(async move {
            reconnect_loop(shared, link, policy, device).await;
        });
    }
}

impl HealthShared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fire(&self, change: &StatusChange) {
        let listeners: Vec<StatusListener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener(change);
        }
    }
}

impl HealthPolicy for HealthMonitor {
    fn status(&self) -> LinkStatus {
        self.shared.lock_state().status
    }

    /// Offline devices get one trial exchange per back-off step, except
    /// while the reconnect task owns the link.
    fn admit(&self) -> bool {
        let mut state = self.shared.lock_state();
        if state.status != LinkStatus::Offline {
            return true;
        }
        if state.reconnecting {
            return false;
        }
        let now = Instant::now();
        let delay = self.shared.backoff.delay_for(state.trials);
        let due = state
            .last_trial
            .map_or(true, |last| now.saturating_duration_since(last) >= delay);
        if due {
            state.trials = state.trials.saturating_add(1);
            state.last_trial = Some(now);
        }
        due
    }

    fn frame_received(&self, device: &DeviceDescription) {
        let change = {
            let mut state = self.shared.lock_state();
            (state.status == LinkStatus::Offline).then(|| StatusChange {
                device: device.name.clone(),
                from: state.reset_to(LinkStatus::Unknown),
                to: LinkStatus::Unknown,
            })
        };
        if let Some(change) = change {
            info!("device {}: frame received while offline -> Unknown", change.device);
            self.shared.fire(&change);
        }
    }

    fn success_handle(&self, device: &DeviceDescription) {
        let change = {
            let mut state = self.shared.lock_state();
            state.consecutive_failures = 0;
            if state.status == LinkStatus::Online {
                None
            } else {
                let from = state.reset_to(LinkStatus::Online);
                Some(StatusChange {
                    device: device.name.clone(),
                    from,
                    to: LinkStatus::Online,
                })
            }
        };
        if let Some(change) = change {
            info!("device {}: {:?} -> Online", change.device, change.from);
            self.shared.fire(&change);
        }
    }

    fn error_handle(
        &self,
        device: &DeviceDescription,
        instruction: &InstructionDescription,
        error: &InstructionError,
    ) {
        if !error.affects_health() {
            return;
        }
        let (change, reconnect) = {
            let mut state = self.shared.lock_state();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            if state.status == LinkStatus::Offline
                || state.consecutive_failures < self.shared.threshold
            {
                (None, false)
            } else {
                let from = state.status;
                state.status = LinkStatus::Offline;
                state.trials = 0;
                state.last_trial = Some(Instant::now());
                let reconnect = self.shared.reconnector.is_some() && !state.reconnecting;
                if reconnect {
                    state.reconnecting = true;
                }
                let change = StatusChange {
                    device: device.name.clone(),
                    from,
                    to: LinkStatus::Offline,
                };
                (Some(change), reconnect)
            }
        };

        if let Some(change) = change {
            warn!(
                "device {}: offline after {} consecutive failures (last: {} -> {error})",
                change.device, self.shared.threshold, instruction.name
            );
            self.shared.fire(&change);
        }
        if reconnect {
            self.spawn_reconnect(device.name.clone());
        }
    }
}

async fn reconnect_loop(
    shared: Arc<HealthShared>,
    link: Arc<dyn Link>,
    policy: ReconnectPolicy,
    device: String,
) {
    let mut attempt = 0u32;
    while policy.allows(attempt) {
        shared.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        match link.reconnect().await {
            Ok(()) => {
                info!("device {device}: link to {} re-established", link.endpoint());
                let change = {
                    let mut state = shared.lock_state();
                    state.reconnecting = false;
                    state.consecutive_failures = 0;
                    (state.status == LinkStatus::Offline).then(|| StatusChange {
                        device: device.clone(),
                        from: state.reset_to(LinkStatus::Unknown),
                        to: LinkStatus::Unknown,
                    })
                };
                if let Some(change) = change {
                    shared.fire(&change);
                }
                return;
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "device {device}: reconnect attempt {} failed: {e}; retrying in {delay:?}",
                    attempt + 1
                );
                attempt += 1;
                if policy.allows(attempt) {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    warn!("device {device}: giving up after {attempt} reconnect attempt(s); trial exchanges continue");
    let mut state = shared.lock_state();
    state.reconnecting = false;
    state.last_trial = Some(Instant::now());
}
