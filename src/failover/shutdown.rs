// ABOUTME: Cooperative shutdown signal shared by the console's suspension points
// ABOUTME: Lets a stop request interrupt inter-tick sleeps, reconnect backoff and script waits

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Receiving side of a shutdown request
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// New signal plus the sender that triggers it
    pub fn channel() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown { rx })
    }

    /// A signal that never fires
    pub fn never() -> Shutdown {
        let (_tx, shutdown) = Self::channel();
        shutdown
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested
    pub async fn requested(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without requesting shutdown
                std::future::pending::<()>().await;
            }
        }
    }

    /// A signal fired by SIGINT or SIGTERM. Must be called inside a runtime.
    pub fn on_signals() -> Shutdown {
        let (tx, shutdown) = Self::channel();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("Termination signal received");
            let _ = tx.send(true);
        });
        shutdown
    }

    /// Sleep for `duration`; returns `true` if interrupted by shutdown
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        self.run(tokio::time::sleep(duration)).await.is_none()
    }

    /// Drive `future` to completion unless shutdown arrives first
    pub async fn run<F: Future>(&mut self, future: F) -> Option<F::Output> {
        if self.is_requested() {
            return None;
        }
        tokio::select! {
            output = future => Some(output),
            _ = self.requested() => None,
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = interrupt() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Cannot install SIGTERM handler: {}", e);
            interrupt().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    interrupt().await;
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot install SIGINT handler: {}", e);
        std::future::pending::<()>().await;
    }
}
