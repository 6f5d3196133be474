//! Per-task activity tracking.
//!
//! One background monitor per task watches the current activity state and
//! fires heartbeat, idle-warning, and turn-timeout callbacks while the agent
//! is API-bound. All state lives behind one internal lock; callbacks are
//! invoked with the lock released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// What the agent is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    #[default]
    Idle,
    WaitingApi,
    Streaming,
    RunningTool,
    Processing,
    SpecAnalyzing,
    SpecWriting,
}

impl ActivityState {
    /// States in which heartbeats, idle warnings, and turn timeouts apply.
    pub fn is_api_bound(&self) -> bool {
        matches!(self, Self::WaitingApi | Self::Streaming)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::WaitingApi => "waiting_api",
            Self::Streaming => "streaming",
            Self::RunningTool => "running_tool",
            Self::Processing => "processing",
            Self::SpecAnalyzing => "spec_analyzing",
            Self::SpecWriting => "spec_writing",
        }
    }
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type StateChangeFn = Box<dyn Fn(ActivityState, ActivityState) + Send + Sync>;
pub type HeartbeatFn = Box<dyn Fn(ActivityState, Duration) + Send + Sync>;
pub type IdleWarningFn = Box<dyn Fn(ActivityState, Duration) + Send + Sync>;
pub type TurnTimeoutFn = Box<dyn Fn(Duration) + Send + Sync>;

/// Optional callback slots. Unset slots are simply skipped.
#[derive(Default)]
pub struct ActivityCallbacks {
    pub on_state_change: Option<StateChangeFn>,
    pub on_heartbeat: Option<HeartbeatFn>,
    pub on_idle_warning: Option<IdleWarningFn>,
    pub on_turn_timeout: Option<TurnTimeoutFn>,
}

/// Monitor timing knobs.
#[derive(Debug, Clone)]
pub struct ActivityConfig {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub turn_timeout: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            turn_timeout: Duration::from_secs(600),
        }
    }
}

impl ActivityConfig {
    /// Poll interval: idle_timeout / 4, clamped to [10 ms, 10 s].
    pub fn poll_interval(&self) -> Duration {
        (self.idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(10))
    }
}

struct TrackerState {
    state: ActivityState,
    label: Option<String>,
    iteration: u32,
    last_activity: Instant,
    turn_start: Instant,
    last_heartbeat: Instant,
    idle_warned: bool,
    turn_timed_out: bool,
}

/// Tracks one task's activity and runs the background monitor.
pub struct ActivityTracker {
    inner: Arc<Mutex<TrackerState>>,
    callbacks: Arc<ActivityCallbacks>,
    config: ActivityConfig,
    stopped: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityTracker {
    /// Create the tracker and spawn its monitor worker.
    pub fn start(config: ActivityConfig, callbacks: ActivityCallbacks) -> Self {
        let now = Instant::now();
        let inner = Arc::new(Mutex::new(TrackerState {
            state: ActivityState::Idle,
            label: None,
            iteration: 0,
            last_activity: now,
            turn_start: now,
            last_heartbeat: now,
            idle_warned: false,
            turn_timed_out: false,
        }));
        let callbacks = Arc::new(callbacks);
        let stopped = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(Self::monitor(
            inner.clone(),
            callbacks.clone(),
            config.clone(),
            stopped.clone(),
        ));

        Self {
            inner,
            callbacks,
            config,
            stopped,
            handle: Mutex::new(Some(handle)),
        }
    }

    async fn monitor(
        inner: Arc<Mutex<TrackerState>>,
        callbacks: Arc<ActivityCallbacks>,
        config: ActivityConfig,
        stopped: Arc<AtomicBool>,
    ) {
        let poll = config.poll_interval();
        loop {
            tokio::time::sleep(poll).await;
            if stopped.load(Ordering::Acquire) {
                return;
            }

            let now = Instant::now();
            // Decide under the lock, call back outside it.
            let (heartbeat, idle, turn_timeout) = {
                let mut state = inner.lock().unwrap();
                if !state.state.is_api_bound() {
                    continue;
                }

                let mut heartbeat = None;
                if now.duration_since(state.last_heartbeat) >= config.heartbeat_interval {
                    state.last_heartbeat = now;
                    heartbeat = Some((state.state, now.duration_since(state.turn_start)));
                }

                let mut idle = None;
                let idle_for = now.duration_since(state.last_activity);
                if idle_for > config.idle_timeout && !state.idle_warned {
                    state.idle_warned = true;
                    idle = Some((state.state, idle_for));
                }

                let mut turn_timeout = None;
                let turn_for = now.duration_since(state.turn_start);
                if turn_for > config.turn_timeout && !state.turn_timed_out {
                    state.turn_timed_out = true;
                    turn_timeout = Some(turn_for);
                }

                (heartbeat, idle, turn_timeout)
            };

            if let (Some((state, elapsed)), Some(cb)) = (heartbeat, &callbacks.on_heartbeat) {
                cb(state, elapsed);
            }
            if let (Some((state, idle_for)), Some(cb)) = (idle, &callbacks.on_idle_warning) {
                cb(state, idle_for);
            }
            if let (Some(turn_for), Some(cb)) = (turn_timeout, &callbacks.on_turn_timeout) {
                cb(turn_for);
            }
        }
    }

    /// Transition the activity state. Entering `WaitingApi` starts a new turn.
    pub fn set_state(&self, new_state: ActivityState) {
        let old = {
            let mut state = self.inner.lock().unwrap();
            let old = state.state;
            if old == new_state {
                return;
            }
            let now = Instant::now();
            state.state = new_state;
            state.last_activity = now;
            state.idle_warned = false;
            if new_state == ActivityState::WaitingApi {
                state.turn_start = now;
                state.last_heartbeat = now;
                state.turn_timed_out = false;
            }
            old
        };
        debug!(from = %old, to = %new_state, "activity state change");
        if let Some(cb) = &self.callbacks.on_state_change {
            cb(old, new_state);
        }
    }

    /// A streamed chunk arrived: the agent is alive.
    pub fn record_chunk(&self) {
        let mut state = self.inner.lock().unwrap();
        state.last_activity = Instant::now();
        state.idle_warned = false;
        if state.state == ActivityState::WaitingApi {
            state.state = ActivityState::Streaming;
        }
    }

    pub fn set_iteration(&self, iteration: u32) {
        let mut state = self.inner.lock().unwrap();
        state.iteration = iteration;
        state.last_activity = Instant::now();
    }

    /// Record a progress label (e.g. the tool currently running).
    pub fn progress(&self, label: &str) {
        let mut state = self.inner.lock().unwrap();
        state.label = Some(label.to_string());
        state.last_activity = Instant::now();
        state.idle_warned = false;
    }

    pub fn current_state(&self) -> ActivityState {
        self.inner.lock().unwrap().state
    }

    pub fn current_label(&self) -> Option<String> {
        self.inner.lock().unwrap().label.clone()
    }

    pub fn iteration(&self) -> u32 {
        self.inner.lock().unwrap().iteration
    }

    /// Stop the monitor. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Timing configuration this tracker runs with.
    pub fn config(&self) -> &ActivityConfig {
        &self.config
    }
}

impl Drop for ActivityTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn poll_interval_is_clamped() {
        let fast = ActivityConfig {
            idle_timeout: Duration::from_millis(1),
            ..Default::default()
        };
        assert_eq!(fast.poll_interval(), Duration::from_millis(10));

        let slow = ActivityConfig {
            idle_timeout: Duration::from_secs(600),
            ..Default::default()
        };
        assert_eq!(slow.poll_interval(), Duration::from_secs(10));

        let mid = ActivityConfig {
            idle_timeout: Duration::from_secs(20),
            ..Default::default()
        };
        assert_eq!(mid.poll_interval(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn state_change_callback_fires_on_transition() {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let changes_cb = changes.clone();
        let tracker = ActivityTracker::start(
            ActivityConfig::default(),
            ActivityCallbacks {
                on_state_change: Some(Box::new(move |from, to| {
                    changes_cb.lock().unwrap().push((from, to));
                })),
                ..Default::default()
            },
        );

        tracker.set_state(ActivityState::WaitingApi);
        tracker.set_state(ActivityState::WaitingApi); // no-op
        tracker.set_state(ActivityState::Processing);
        tracker.stop();

        let recorded = changes.lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec![
                (ActivityState::Idle, ActivityState::WaitingApi),
                (ActivityState::WaitingApi, ActivityState::Processing),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_fire_while_api_bound() {
        let beats = Arc::new(AtomicUsize::new(0));
        let beats_cb = beats.clone();
        let tracker = ActivityTracker::start(
            ActivityConfig {
                heartbeat_interval: Duration::from_millis(100),
                idle_timeout: Duration::from_millis(400),
                turn_timeout: Duration::from_secs(60),
            },
            ActivityCallbacks {
                on_heartbeat: Some(Box::new(move |state, _| {
                    assert!(state.is_api_bound());
                    beats_cb.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        );

        tracker.set_state(ActivityState::WaitingApi);
        tokio::time::sleep(Duration::from_millis(350)).await;
        tracker.stop();
        assert!(beats.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_heartbeats_while_idle() {
        let beats = Arc::new(AtomicUsize::new(0));
        let beats_cb = beats.clone();
        let tracker = ActivityTracker::start(
            ActivityConfig {
                heartbeat_interval: Duration::from_millis(50),
                idle_timeout: Duration::from_millis(400),
                turn_timeout: Duration::from_secs(60),
            },
            ActivityCallbacks {
                on_heartbeat: Some(Box::new(move |_, _| {
                    beats_cb.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        tracker.stop();
        assert_eq!(beats.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_warning_fires_once_per_idle_period() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let warnings_cb = warnings.clone();
        let tracker = ActivityTracker::start(
            ActivityConfig {
                heartbeat_interval: Duration::from_secs(60),
                idle_timeout: Duration::from_millis(100),
                turn_timeout: Duration::from_secs(60),
            },
            ActivityCallbacks {
                on_idle_warning: Some(Box::new(move |_, _| {
                    warnings_cb.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        );

        tracker.set_state(ActivityState::WaitingApi);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(warnings.load(Ordering::SeqCst), 1);

        // Activity resets the idle period; a second warning can fire after.
        tracker.record_chunk();
        tokio::time::sleep(Duration::from_millis(500)).await;
        tracker.stop();
        assert_eq!(warnings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn turn_timeout_fires_when_turn_runs_long() {
        let timeouts = Arc::new(AtomicUsize::new(0));
        let timeouts_cb = timeouts.clone();
        let tracker = ActivityTracker::start(
            ActivityConfig {
                heartbeat_interval: Duration::from_secs(60),
                idle_timeout: Duration::from_millis(200),
                turn_timeout: Duration::from_millis(300),
            },
            ActivityCallbacks {
                on_turn_timeout: Some(Box::new(move |_| {
                    timeouts_cb.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        );

        tracker.set_state(ActivityState::WaitingApi);
        // Chunks keep arriving, but the turn as a whole is overdue.
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            tracker.record_chunk();
        }
        tracker.stop();
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let tracker = ActivityTracker::start(ActivityConfig::default(), ActivityCallbacks::default());
        tracker.stop();
        tracker.stop();
    }

    #[tokio::test]
    async fn chunk_moves_waiting_to_streaming() {
        let tracker = ActivityTracker::start(ActivityConfig::default(), ActivityCallbacks::default());
        tracker.set_state(ActivityState::WaitingApi);
        tracker.record_chunk();
        assert_eq!(tracker.current_state(), ActivityState::Streaming);
        tracker.stop();
    }
}
