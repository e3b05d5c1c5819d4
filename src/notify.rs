use std::time::Duration;
use tokio::sync::watch;

/// Process-wide "new feed data" signal. Coalesces notifications
/// (latest-wins, like PostgreSQL `LISTEN/NOTIFY`): a consumer that wakes up
/// sees that *something* happened, not how many times.
#[derive(Clone)]
pub struct Notifier {
    tx: watch::Sender<u64>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    pub fn notify(&self) {
        self.tx.send_modify(|counter| *counter = counter.wrapping_add(1));
    }

    pub fn subscribe(&self) -> NotifierHandle {
        NotifierHandle {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

pub struct NotifierHandle {
    rx: watch::Receiver<u64>,
}

impl NotifierHandle {
    /// Wait until `notify()` fires or `timeout` elapses. Returns `true` if
    /// notified, `false` on timeout.
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        tokio::select! {
            result = self.rx.changed() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_times_out_with_no_notification() {
        let notifier = Notifier::new();
        let mut handle = notifier.subscribe();
        assert!(!handle.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn wait_returns_true_on_notify() {
        let notifier = Notifier::new();
        let mut handle = notifier.subscribe();
        notifier.notify();
        assert!(handle.wait(Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn notifications_coalesce_latest_wins() {
        let notifier = Notifier::new();
        let mut handle = notifier.subscribe();
        notifier.notify();
        notifier.notify();
        notifier.notify();
        assert!(handle.wait(Duration::from_millis(500)).await);
        assert!(!handle.wait(Duration::from_millis(20)).await);
    }
}
