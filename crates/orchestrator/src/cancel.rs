//! Two-stage interruption. The first request asks for a graceful stop:
//! the in-flight batch finishes and is checkpointed, unless that takes
//! longer than the grace period. A second request stops immediately.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    Running,
    Graceful,
    Forced,
}

impl CancelMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Graceful => "graceful",
            Self::Forced => "forced",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CancelState {
    mode: CancelMode,
    graceful_deadline: Option<Instant>,
}

/// Process-local cancellation state shared by the signal handler and the
/// mapping loop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancellationManager {
    tx: Arc<watch::Sender<CancelState>>,
    grace: Duration,
}

impl CancellationManager {
    pub fn new(grace: Duration) -> Self {
        let (tx, _rx) = watch::channel(CancelState {
            mode: CancelMode::Running,
            graceful_deadline: None,
        });
        Self {
            tx: Arc::new(tx),
            grace,
        }
    }

    /// Escalate one step and return the new mode.
    pub fn request(&self) -> CancelMode {
        let grace = self.grace;
        self.tx.send_modify(|state| match state.mode {
            CancelMode::Running => {
                state.mode = CancelMode::Graceful;
                state.graceful_deadline = Some(Instant::now() + grace);
            }
            CancelMode::Graceful | CancelMode::Forced => state.mode = CancelMode::Forced,
        });
        let mode = self.mode();
        log::warn!("cancellation requested ({})", mode.as_str());
        mode
    }

    pub fn mode(&self) -> CancelMode {
        self.tx.borrow().mode
    }

    pub fn is_requested(&self) -> bool {
        self.mode() != CancelMode::Running
    }

    /// Whether in-flight work should be dropped right now.
    pub fn should_abandon(&self) -> bool {
        let state = *self.tx.borrow();
        match state.mode {
            CancelMode::Running => false,
            CancelMode::Forced => true,
            CancelMode::Graceful => state
                .graceful_deadline
                .map_or(false, |deadline| Instant::now() >= deadline),
        }
    }

    /// Resolves once in-flight work must be dropped: on a forced request,
    /// or when a graceful stop outlives the grace period.
    pub async fn abandoned(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match (state.mode, state.graceful_deadline) {
                (CancelMode::Forced, _) => return,
                (CancelMode::Graceful, Some(deadline)) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                std::future::pending::<()>().await;
                            }
                        }
                    }
                }
                _ => {
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }
}

impl Default for CancellationManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
