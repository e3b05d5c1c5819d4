//! Feed ingestor: backfill-then-listen lifecycle for one `(subject, kind,
//! granularity)` scope, plus retention pruning.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::model::{FeedKind, FeedScope};
use crate::notify::Notifier;
use crate::providers::MarketProvider;
use crate::store::FeedStore;

pub struct FeedIngestor {
    scope: FeedScope,
    scope_key: String,
    provider: Arc<dyn MarketProvider>,
    store: Arc<FeedStore>,
    notifier: Notifier,
    backfill_window: chrono::Duration,
    poll_interval: Duration,
}

impl FeedIngestor {
    pub fn new(
        scope: FeedScope,
        provider: Arc<dyn MarketProvider>,
        store: Arc<FeedStore>,
        notifier: Notifier,
        backfill_minutes: i64,
        poll_seconds: u64,
    ) -> Self {
        let scope_key = format!("{}:{}:{}:{}", scope.source, scope.subject, scope.kind.as_str(), scope.granularity);
        Self {
            scope,
            scope_key,
            provider,
            store,
            notifier,
            backfill_window: chrono::Duration::minutes(backfill_minutes),
            poll_interval: Duration::from_secs(poll_seconds),
        }
    }

    /// Backfill phase: page forward from the stored watermark (or
    /// `now - backfill_window` if absent) until a page makes no progress,
    /// then switch to listen mode.
    pub async fn run(&self, cancel: tokio::sync::watch::Receiver<bool>) -> crate::error::Result<()> {
        self.backfill().await?;
        self.listen(cancel).await
    }

    async fn backfill(&self) -> crate::error::Result<()> {
        let now = chrono::Utc::now();
        let mut cursor = self
            .store
            .get_watermark(&self.scope, &self.scope_key)?
            .and_then(|wm| wm.last_event_ts)
            .unwrap_or(now - self.backfill_window);

        loop {
            let page = self.provider.fetch(cursor, now).await?;
            if page.is_empty() {
                break;
            }

            let max_ts = page.iter().map(|r| r.ts_event).max().unwrap();
            self.store.append_records(&page)?;

            if max_ts <= cursor {
                debug!(scope = %self.scope_key, "backfill page made no progress, stopping");
                break;
            }

            self.store
                .set_watermark(&self.scope_key, max_ts.timestamp_millis(), "backfill")?;
            cursor = max_ts;

            if max_ts >= now {
                break;
            }
        }

        info!(scope = %self.scope_key, "backfill phase complete");
        Ok(())
    }

    /// Reconnect loop around one push-mode session: a dropped/erroring
    /// `provider.listen` session is retried on `poll_interval` backoff until
    /// cancelled, rather than leaving the scope silently unfed.
    async fn listen(&self, mut cancel: tokio::sync::watch::Receiver<bool>) -> crate::error::Result<()> {
        loop {
            let session_ended = self.listen_once(&mut cancel).await?;
            if !session_ended {
                break;
            }
            let jitter = Duration::from_millis(rand::random::<u64>() % 250);
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval + jitter) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// One push-mode session. Returns `true` if the session ended on its own
    /// (should reconnect), `false` if cancellation ended it.
    async fn listen_once(&self, cancel: &mut tokio::sync::watch::Receiver<bool>) -> crate::error::Result<bool> {
        let (tx, mut rx) = tokio::sync::mpsc::channel(256);
        let provider = self.provider.clone();
        let notifier = self.notifier.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = provider.listen(tx, notifier).await {
                warn!(error = %e, "provider listen loop ended");
            }
        });

        loop {
            tokio::select! {
                maybe_record = rx.recv() => {
                    let Some(record) = maybe_record else {
                        return Ok(true);
                    };
                    self.store.append_records(std::slice::from_ref(&record))?;
                    self.store
                        .set_watermark(&self.scope_key, record.ts_event.timestamp_millis(), "listen")?;
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        handle.abort();
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Delete rows older than `retention_days` and run on `retention_check_seconds` cadence.
    pub async fn run_retention_loop(&self, retention_days: i64, check_seconds: u64) {
        let mut ticker = tokio::time::interval(Duration::from_secs(check_seconds));
        loop {
            ticker.tick().await;
            let cutoff = (chrono::Utc::now() - chrono::Duration::days(retention_days)).timestamp_millis();
            match self.store.prune_before(cutoff) {
                Ok(deleted) if deleted > 0 => info!(scope = %self.scope_key, deleted, "retention prune"),
                Ok(_) => {}
                Err(e) => warn!(scope = %self.scope_key, error = %e, "retention prune failed"),
            }
        }
    }

    pub fn scope(&self) -> &FeedScope {
        &self.scope
    }
}

pub fn scope_for(source: &str, subject: &str, kind: FeedKind, granularity: &str) -> FeedScope {
    FeedScope::new(source, subject, kind, granularity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;

    #[tokio::test]
    async fn backfill_persists_records_and_advances_watermark() {
        let store = Arc::new(FeedStore::open_in_memory().unwrap());
        let provider: Arc<dyn MarketProvider> = Arc::new(MockProvider::new("BTC", "1m"));
        let scope = scope_for("mock", "BTC", FeedKind::Candle, "1m");
        let ingestor = FeedIngestor::new(scope.clone(), provider, store.clone(), Notifier::new(), 5, 1);

        ingestor.backfill().await.unwrap();

        let latest = store
            .fetch_latest_record("mock", "BTC", FeedKind::Candle, "1m")
            .unwrap();
        assert!(latest.is_some());

        let wm = store.get_watermark(&scope, &ingestor.scope_key).unwrap();
        assert!(wm.is_some());
    }
}
