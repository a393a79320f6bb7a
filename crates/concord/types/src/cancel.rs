//! Cooperative cancellation for DAG and Saga executions.
//!
//! Cancelling stops new work from being issued; work already in flight is
//! left to finish (or to hit its own timeout).

use std::sync::Arc;

use tokio::sync::watch;

/// Trigger side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

/// Observer side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct Cancellation {
    receiver: watch::Receiver<bool>,
}

impl Cancellation {
    /// Create a linked handle/observer pair.
    pub fn new() -> (CancellationHandle, Cancellation) {
        let (sender, receiver) = watch::channel(false);
        (
            CancellationHandle {
                sender: Arc::new(sender),
            },
            Cancellation { receiver },
        )
    }

    /// An observer that is never cancelled.
    pub fn never() -> Cancellation {
        Self::new().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once cancellation is requested; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::never()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_observers() {
        let (handle, cancellation) = Cancellation::new();
        let observer = cancellation.clone();
        let waiter = tokio::spawn(async move { observer.cancelled().await });

        assert!(!cancellation.is_cancelled());
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(cancellation.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn never_does_not_resolve() {
        let cancellation = Cancellation::never();
        let result =
            tokio::time::timeout(Duration::from_millis(50), cancellation.cancelled()).await;
        assert!(result.is_err());
    }
}
