//! Wake-up signal for the drain loop.

use std::sync::Arc;

use tokio::sync::Notify;

/// Fired when draining may make progress: backlog found at start-up, a
/// record was just queued, or the network attachment changed.
///
/// Signals raised while nobody waits are kept (one permit), so a fire during
/// a drain cycle is not lost.
#[derive(Debug, Clone, Default)]
pub struct DrainTrigger {
    notify: Arc<Notify>,
}

impl DrainTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.notify.notify_one();
    }

    pub async fn fired(&self) {
        self.notify.notified().await;
    }
}
