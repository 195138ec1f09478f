pub mod engine;
pub mod health;
pub mod supervisor;

pub use engine::Engine;
pub use health::{HealthCounters, HealthSnapshot, LifecycleState, watch_interval};
pub use supervisor::SupervisorHandle;

use crate::error::{EngineError, EngineResult};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Worker-side view of the pause switch: `Pause` stops fetching but keeps
/// the workers hot, waiting right here.
#[derive(Clone)]
pub struct PauseGate {
    rx: watch::Receiver<bool>,
    /// Keeps a standalone gate's sender alive (see [`PauseGate::open`]).
    _keepalive: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl PauseGate {
    /// A gate that is never paused (tests, standalone workers).
    pub fn open() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(std::sync::Arc::new(tx)),
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves on the next switch flip (or never, if the controller is
    /// gone and the gate is effectively frozen open).
    pub async fn changed(&mut self) {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Block while paused; cancellation wins over resumption.
    pub async fn wait_ready(&mut self, cancel: &CancellationToken) -> EngineResult<()> {
        loop {
            if !*self.rx.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                res = self.rx.changed() => {
                    if res.is_err() {
                        // Controller dropped; treat as resumed.
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Supervisor-side pause switch.
pub struct PauseControl {
    tx: watch::Sender<bool>,
}

impl PauseControl {
    pub fn new() -> (Self, PauseGate) {
        let (tx, rx) = watch::channel(false);
        (
            Self { tx },
            PauseGate {
                rx,
                _keepalive: None,
            },
        )
    }

    pub fn set_paused(&self, paused: bool) {
        let _ = self.tx.send(paused);
    }
}
