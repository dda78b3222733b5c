//! Shutdown coordination.

use crate::context::Context;

/// Owns the root context of the process.
///
/// Cancelling it through [`trigger`](Self::trigger) stops every server built
/// from [`context`](Self::context).
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    root: Context,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// The root context. Hand this to long-lived components.
    pub fn context(&self) -> Context {
        self.root.clone()
    }

    /// Trigger shutdown. Idempotent.
    pub fn trigger(&self) {
        if !self.root.is_cancelled() {
            tracing::info!("Shutdown triggered");
        }
        self.root.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Wait until shutdown is triggered.
    pub async fn wait(&self) {
        self.root.cancelled().await;
    }

    /// Trigger shutdown on Ctrl-C, or return once triggered elsewhere.
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Shutdown signal received");
                self.trigger();
            }
            _ = self.wait() => {}
        }
        Ok(())
    }
}
