//! Hang watchdog for a single in-flight command.
//!
//! # States
//!
//! ```text
//!            timeout elapses, no activity
//!   quiet ──────────────────────────────────▶ alerted
//!     ▲                                          │
//!     └───────────── on_activity() ──────────────┘
//! ```
//!
//! A stretch of silence produces exactly one alert. Further alerts need an
//! intervening [`HangWatchdog::on_activity`] followed by another full
//! timeout of silence. The watchdog only reports; it never aborts the
//! command it watches.
//!
//! Watchdogs are per invocation and are not shared between commands.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Advisory signal that a command has been silent too long.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HangAlert {
    #[serde(rename = "idleMs", serialize_with = "serialize_millis")]
    pub idle: Duration,
    pub message: String,
    /// Set when the last output looked like an input prompt.
    pub awaiting_input: bool,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl HangAlert {
    pub fn new(idle: Duration, awaiting_input: bool) -> Self {
        let message = if awaiting_input {
            format!(
                "No output for {}s; the command appears to be waiting for input",
                idle.as_secs()
            )
        } else {
            format!(
                "No output for {}s; the command may be hung",
                idle.as_secs()
            )
        };
        Self {
            idle,
            message,
            awaiting_input,
        }
    }
}

struct WatchState {
    last_activity: Instant,
    alerted: bool,
}

pub struct HangWatchdog {
    timeout: Duration,
    state: Arc<Mutex<WatchState>>,
    task: Option<JoinHandle<()>>,
}

fn lock(state: &Mutex<WatchState>) -> MutexGuard<'_, WatchState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HangWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Arc::new(Mutex::new(WatchState {
                last_activity: Instant::now(),
                alerted: false,
            })),
            task: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm the timer. `on_alert` receives the idle duration each time a
    /// fresh stretch of silence reaches the timeout.
    pub fn start<F>(&mut self, on_alert: F)
    where
        F: Fn(Duration) + Send + 'static,
    {
        self.stop();
        {
            let mut state = lock(&self.state);
            state.last_activity = Instant::now();
            state.alerted = false;
        }

        let state = Arc::clone(&self.state);
        let timeout = self.timeout;
        self.task = Some(tokio::spawn(async move {
            loop {
                let wake_at = {
                    let state = lock(&state);
                    if state.alerted {
                        // Nothing can fire until activity resets the clock.
                        Instant::now() + timeout
                    } else {
                        state.last_activity + timeout
                    }
                };
                tokio::time::sleep_until(wake_at).await;

                let fired = {
                    let mut state = lock(&state);
                    let idle = state.last_activity.elapsed();
                    if !state.alerted && idle >= timeout {
                        state.alerted = true;
                        Some(idle)
                    } else {
                        None
                    }
                };
                if let Some(idle) = fired {
                    on_alert(idle);
                }
            }
        }));
    }

    /// Record output activity: restart the idle clock and clear any alert.
    pub fn on_activity(&self) {
        let mut state = lock(&self.state);
        state.last_activity = Instant::now();
        state.alerted = false;
    }

    pub fn is_alerted(&self) -> bool {
        lock(&self.state).alerted
    }

    /// Disarm the timer.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HangWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// TESTS
// ============================================================================
