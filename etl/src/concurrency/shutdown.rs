//! Broadcast cancellation for an in-flight transfer.

use std::future::Future;

use tokio::sync::watch;

/// Sending half of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

/// Receiving half of the shutdown channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

/// Outcome of a future raced against shutdown.
#[derive(Debug)]
pub enum ShutdownResult<T> {
    Ok(T),
    Shutdown,
}

/// Creates a new shutdown channel in the non shut down state.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}

impl ShutdownTx {
    /// Requests shutdown of every subscribed receiver.
    ///
    /// The flag is sticky: receivers created afterwards observe it as well.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

impl ShutdownRx {
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been requested.
    ///
    /// If every sender is dropped without requesting shutdown this never resolves.
    pub async fn wait(&mut self) {
        if self.0.wait_for(|shutdown| *shutdown).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Polls `future` to completion unless shutdown is requested first.
    pub async fn run<F>(&mut self, future: F) -> ShutdownResult<F::Output>
    where
        F: Future,
    {
        if self.is_shutdown() {
            return ShutdownResult::Shutdown;
        }

        tokio::select! {
            biased;
            _ = self.wait() => ShutdownResult::Shutdown,
            output = future => ShutdownResult::Ok(output),
        }
    }
}
