//! Market data provider abstraction: pluggable REST backfill + push listen.

pub mod binance;
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::FeedRecord;
use crate::notify::Notifier;

pub use binance::BinanceSpotProvider;
pub use mock::MockProvider;

/// A source of market observations for one `(subject, kind, granularity)` scope.
#[async_trait]
pub trait MarketProvider: Send + Sync {
    /// REST-style backfill: fetch records in `[from, to]`, oldest first.
    /// Implementations should return an empty vec (not an error) when the
    /// window holds nothing new, so the ingestor's no-progress check works.
    async fn fetch(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<FeedRecord>>;

    /// Push-mode subscription: run until cancelled, appending each record it
    /// observes via `on_record` and pinging `notifier` after each append.
    async fn listen(
        &self,
        on_record: tokio::sync::mpsc::Sender<FeedRecord>,
        notifier: Notifier,
    ) -> Result<()>;
}

/// Resolve a provider implementation by configured name.
pub fn create_provider(name: &str, subject: &str, granularity: &str) -> std::sync::Arc<dyn MarketProvider> {
    match name {
        "mock" => std::sync::Arc::new(MockProvider::new(subject, granularity)),
        _ => std::sync::Arc::new(BinanceSpotProvider::new(subject, granularity)),
    }
}
