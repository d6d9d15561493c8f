use chunkwise_orchestrator::{CancelMode, CancellationManager};
use tokio::task::JoinHandle;

/// Turn Ctrl-C into cancellation requests: the first asks for a graceful
/// stop, the second forces one.
pub(crate) fn forward_interrupts(cancel: CancellationManager) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(err) = tokio::signal::ctrl_c().await {
                log::warn!("cannot listen for interrupts: {err}");
                return;
            }
            match cancel.request() {
                CancelMode::Graceful => {
                    log::warn!("finishing the running batch; press Ctrl-C again to stop now")
                }
                CancelMode::Forced | CancelMode::Running => return,
            }
        }
    })
}
