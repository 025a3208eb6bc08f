use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Session-scoped cooperative stop signal.
///
/// Clones share one flag. The flag is set at most once; later requests are
/// no-ops. Nothing here interrupts a running engine call: the scheduler
/// checks the flag before admitting each task and forwards the request to
/// the engine's own cancel primitive.
#[derive(Debug, Clone)]
pub struct CancellationController {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests a stop. Returns `true` only for the call that set the flag.
    pub fn request_stop(&self) -> bool {
        let first = self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
        if first {
            info!("Stop requested; no further downloads will start");
        }
        first
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new()
    }
}
