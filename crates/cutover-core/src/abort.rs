//! Operator abort signal.
//!
//! A rollout observes aborts only at its suspension points (step pauses
//! and health-poll sleeps), where it races the sleep against the signal.

use tokio::sync::watch;

/// Create a connected abort handle/signal pair.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

/// Sender side, held by whoever may cancel the rollout.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Request an abort. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// A new signal observing this handle.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiver side, polled by the rollout at suspension points.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once an abort has been requested. Pends forever if every
    /// handle has been dropped without aborting.
    pub async fn aborted(&mut self) {
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
