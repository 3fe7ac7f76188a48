//! Streaming execution under a hang watchdog.
//!
//! Composes [`CommandExecutor::run_streaming`] with a per-call
//! [`HangWatchdog`]. Every output chunk counts as activity and is shown to a
//! [`PromptClassifier`]; if the last chunk before a silence looked like a
//! prompt, the alert says the command is probably waiting for input.
//!
//! Alerts are advisory. The command always runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::Result;
use crate::exec::{CommandExecutor, ExecutionResult};
use crate::transport::StreamKind;
use crate::watchdog::{HangAlert, HangWatchdog};

/// Decides whether a piece of output looks like an interactive prompt.
pub trait PromptClassifier: Send + Sync {
    fn is_prompt(&self, text: &str) -> bool;
}

impl<F> PromptClassifier for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_prompt(&self, text: &str) -> bool {
        self(text)
    }
}

/// Classifier for callers that do not care about prompts.
pub fn no_prompts(_text: &str) -> bool {
    false
}

#[derive(Debug, Clone)]
pub struct MonitoredExecution {
    pub result: ExecutionResult,
    pub alerts: Vec<HangAlert>,
    /// Whether the final output chunk looked like a prompt.
    pub awaiting_input: bool,
}

/// Run `command` on `host_id`, collecting hang alerts raised while it runs.
pub async fn run_monitored<F>(
    executor: &CommandExecutor,
    host_id: &str,
    command: &str,
    hang_timeout: Duration,
    classifier: &dyn PromptClassifier,
    mut on_chunk: F,
) -> Result<MonitoredExecution>
where
    F: FnMut(&[u8], StreamKind) + Send,
{
    let prompting = Arc::new(AtomicBool::new(false));
    let alerts = Arc::new(Mutex::new(Vec::new()));

    let mut watchdog = HangWatchdog::new(hang_timeout);
    {
        let prompting = Arc::clone(&prompting);
        let alerts = Arc::clone(&alerts);
        let host = host_id.to_string();
        watchdog.start(move |idle| {
            let alert = HangAlert::new(idle, prompting.load(Ordering::SeqCst));
            log::warn!("[{host}] {}", alert.message);
            alerts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(alert);
        });
    }

    let outcome = executor
        .run_streaming(host_id, command, |data, stream| {
            watchdog.on_activity();
            let text = String::from_utf8_lossy(data);
            prompting.store(classifier.is_prompt(&text), Ordering::SeqCst);
            on_chunk(data, stream);
        })
        .await;
    watchdog.stop();

    let result = outcome?;
    let alerts = std::mem::take(&mut *alerts.lock().unwrap_or_else(PoisonError::into_inner));
    Ok(MonitoredExecution {
        result,
        alerts,
        awaiting_input: prompting.load(Ordering::SeqCst),
    })
}
