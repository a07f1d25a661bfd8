//! Shared shutdown signal and periodic background tasks.
//!
//! Every background loop (accept loop, heartbeat sweep, stale sweep,
//! adaptive tick) holds a clone of one [`ShutdownSignal`].  Triggering it
//! wakes all of them at once; there is no polling of a shared flag.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the signal.  Returns `false` if it had already fired.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired (immediately if it already has).
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so `changed` cannot fail here.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Runs `task` every `period` until `shutdown` fires.
///
/// The first run happens one full period after spawning.  A run that
/// overruns its period delays the next one instead of bursting.  Periods
/// shorter than a millisecond are raised to one.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: ShutdownSignal,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = interval(period.max(MIN_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick resolves immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => task().await,
            }
        }
        debug!("periodic task {name} stopped");
    })
}
