//! Session supervisor
//!
//! Owns task handles and the root shutdown signal. Children observe the
//! signal at their suspension points; the supervisor aborts stragglers
//! after a grace period rather than waiting forever.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use confab_core::TelemetryEvent;

/// Grace children get to observe shutdown before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Owns a session's tasks, shutdown root, and telemetry fan-out.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    telemetry: broadcast::Sender<TelemetryEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (telemetry, _) = broadcast::channel(256);
        Self {
            shutdown_tx,
            telemetry,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Track a task for shutdown.
    pub fn register(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Root shutdown signal for children to observe.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Out-of-band telemetry for local consumers (tests, UI bridges).
    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.telemetry.subscribe()
    }

    pub(crate) fn telemetry_sender(&self) -> broadcast::Sender<TelemetryEvent> {
        self.telemetry.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Raise the shutdown signal and reap tasks. Children get a grace
    /// period to unwind on their own.
    pub async fn shut_down(&self) {
        if self.is_shut_down() {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        tokio::time::sleep(SHUTDOWN_GRACE).await;
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            if !task.is_finished() {
                task.abort();
            }
        }
        tracing::info!("supervisor shut down");
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
