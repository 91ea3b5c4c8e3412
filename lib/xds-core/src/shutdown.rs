//! Process-wide cancellation signal shared by every background task

use tokio::sync::watch;

/// Owner side of the cancellation signal
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A handle for one task to observe cancellation
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side; cheap to clone into spawned tasks
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered or the owner is dropped
    pub async fn recv(&mut self) {
        // An error means the owner is gone, which counts as shutdown
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_wakes_all_observers() {
        let shutdown = Shutdown::new();
        let mut a = shutdown.signal();
        let mut b = a.clone();
        assert!(!a.is_triggered());

        let waiter = tokio::spawn(async move {
            a.recv().await;
        });

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("observer woke")
            .unwrap();
        b.recv().await;
        assert!(b.is_triggered());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_owner_counts_as_shutdown() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        drop(shutdown);
        tokio::time::timeout(Duration::from_secs(1), signal.recv())
            .await
            .expect("recv resolves when owner is dropped");
    }
}
