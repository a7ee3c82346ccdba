// ABOUTME: Background expiry sweep — periodically expires stale grants so expiry is audited promptly.
// ABOUTME: Runs as a tokio task with its own shutdown handle, independent of request handling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ledger::AccessGrantLedger;

/// Handle to a running sweep task. Dropping it aborts the task.
pub struct SweepHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Ask the sweep to stop and wait for it to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Spawn the periodic sweep on the current tokio runtime.
pub fn spawn_expiry_sweep(ledger: Arc<AccessGrantLedger>, period: Duration) -> SweepHandle {
    let (tx, mut rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut rx => break,
                _ = interval.tick() => {
                    // Sweeping writes audit entries, so it runs off the async workers.
                    let ledger = ledger.clone();
                    match tokio::task::spawn_blocking(move || ledger.sweep()).await {
                        Ok(expired) if !expired.is_empty() => {
                            debug!(count = expired.len(), "sweep expired grants");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "expiry sweep pass failed"),
                    }
                }
            }
        }
        debug!("expiry sweep stopped");
    });
    SweepHandle {
        shutdown: Some(tx),
        task: Some(task),
    }
}
