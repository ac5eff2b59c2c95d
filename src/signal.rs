//! Process-wide termination signal handling
//!
//! Every server registers its `stop` callable under a numeric id; `wait`
//! blocks the main task until the OS delivers SIGINT or SIGTERM, invokes
//! every registered callable, and returns the ids that were stopped.

use tracing::{info, warn};

type StopFn = Box<dyn FnOnce() + Send>;

/// Maps server ids to their stop callables.
#[derive(Default)]
pub struct SignalHandler {
    handlers: Vec<(u32, StopFn)>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stop callable under `id`.
    pub fn add_action(&mut self, id: u32, stop: impl FnOnce() + Send + 'static) {
        self.handlers.push((id, Box::new(stop)));
    }

    /// Invoke every registered callable and return their ids.
    pub fn fire(&mut self) -> Vec<u32> {
        let mut stopped = Vec::with_capacity(self.handlers.len());
        for (id, stop) in self.handlers.drain(..) {
            stop();
            stopped.push(id);
        }
        stopped
    }

    /// Block until SIGINT/SIGTERM, then stop everything that registered.
    pub async fn wait(mut self) -> Vec<u32> {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = wait_for_sigterm() => {
                info!("received SIGTERM, shutting down");
            }
        }
        // Stop callables may block (the UDP server waits for its workers),
        // so leave the async context before invoking them.
        tokio::task::spawn_blocking(move || self.fire())
            .await
            .unwrap_or_default()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(err) => {
            warn!("failed to register SIGTERM handler: {}", err);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
