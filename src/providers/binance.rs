//! Binance Spot market provider: REST klines for backfill, L1 order book
//! mid-price stream for push-mode listening.
//!
//! Adapted from the teacher's `scrapers/binance_price_feed.rs`: same
//! `barter-data` streams wiring for `listen`, stripped of the HFT-specific
//! EWMA/latency instrumentation that has no counterpart here.

use async_trait::async_trait;
use barter_data::{
    exchange::binance::spot::BinanceSpot,
    streams::{reconnect::Event as ReconnectEvent, Streams},
    subscription::book::OrderBooksL1,
};
use barter_instrument::instrument::market_data::kind::MarketDataInstrumentKind;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::CoordinatorError;
use crate::model::{FeedKind, FeedRecord};
use crate::notify::Notifier;

use super::MarketProvider;

pub struct BinanceSpotProvider {
    subject: String,
    granularity: String,
    http: reqwest::Client,
}

impl BinanceSpotProvider {
    pub fn new(subject: impl Into<String>, granularity: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            granularity: granularity.into(),
            http: reqwest::Client::new(),
        }
    }

    fn symbol(&self) -> String {
        format!("{}USDT", self.subject.to_ascii_uppercase())
    }
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawKline(
    i64,    // open time
    String, // open
    String, // high
    String, // low
    String, // close
    String, // volume
    i64,    // close time
);

#[async_trait]
impl MarketProvider for BinanceSpotProvider {
    async fn fetch(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> crate::error::Result<Vec<FeedRecord>> {
        let url = "https://api.binance.com/api/v3/klines";
        let resp = self
            .http
            .get(url)
            .query(&[
                ("symbol", self.symbol()),
                ("interval", self.granularity.clone()),
                ("startTime", from.timestamp_millis().to_string()),
                ("endTime", to.timestamp_millis().to_string()),
                ("limit", "1000".to_string()),
            ])
            .send()
            .await
            .map_err(|e| CoordinatorError::TransientNetwork(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CoordinatorError::TransientNetwork(format!(
                "binance klines returned {}",
                resp.status()
            )));
        }

        let klines: Vec<RawKline> = resp
            .json()
            .await
            .map_err(|e| CoordinatorError::TransientNetwork(e.to_string()))?;

        let now = Utc::now();
        let records = klines
            .into_iter()
            .filter_map(|k| {
                let close: f64 = k.4.parse().ok()?;
                let ts_event = DateTime::from_timestamp_millis(k.0)?;
                let mut values = BTreeMap::new();
                values.insert("close".to_string(), serde_json::json!(close));
                Some(FeedRecord {
                    source: "binance".to_string(),
                    subject: self.subject.clone(),
                    kind: FeedKind::Candle,
                    granularity: self.granularity.clone(),
                    ts_event,
                    values,
                    meta: BTreeMap::new(),
                    ts_ingested: now,
                })
            })
            .collect();

        Ok(records)
    }

    async fn listen(
        &self,
        on_record: tokio::sync::mpsc::Sender<FeedRecord>,
        notifier: Notifier,
    ) -> crate::error::Result<()> {
        let subject = self.subject.clone();
        let granularity = self.granularity.clone();

        // `barter-data`'s `StreamBuilder` futures are `!Send`, so the whole
        // init-then-consume loop runs on a dedicated single-threaded runtime
        // via `spawn_blocking` rather than inline in this (Send-bound) future.
        tokio::task::spawn_blocking(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| CoordinatorError::TransientNetwork(e.to_string()))?;
            rt.block_on(run_stream_loop(subject, granularity, on_record, notifier))
        })
        .await
        .map_err(|e| CoordinatorError::TransientNetwork(e.to_string()))?
    }
}

async fn run_stream_loop(
    subject: String,
    granularity: String,
    on_record: tokio::sync::mpsc::Sender<FeedRecord>,
    notifier: Notifier,
) -> crate::error::Result<()> {
    let base = subject.to_ascii_lowercase();
    let streams = Streams::<OrderBooksL1>::builder()
        .subscribe([(
            BinanceSpot::default(),
            base.as_str(),
            "usdt",
            MarketDataInstrumentKind::Spot,
            OrderBooksL1,
        )])
        .init()
        .await
        .map_err(|e| CoordinatorError::TransientNetwork(e.to_string()))?;

    let mut joined = streams.select_all();
    while let Some(event) = joined.next().await {
        match event {
            ReconnectEvent::Reconnecting(exchange) => {
                warn!(?exchange, "binance stream reconnecting");
            }
            ReconnectEvent::Item(Ok(market_event)) => {
                let Some(mid) = market_event
                    .kind
                    .mid_price()
                    .and_then(|d| d.to_string().parse::<f64>().ok())
                    .filter(|m| m.is_finite() && *m > 0.0)
                else {
                    continue;
                };

                let mut values = BTreeMap::new();
                values.insert("price".to_string(), serde_json::json!(mid));

                let record = FeedRecord {
                    source: "binance".to_string(),
                    subject: subject.clone(),
                    kind: FeedKind::Tick,
                    granularity: granularity.clone(),
                    ts_event: market_event.time_received,
                    values,
                    meta: BTreeMap::new(),
                    ts_ingested: Utc::now(),
                };

                if on_record.send(record).await.is_err() {
                    break;
                }
                notifier.notify();
            }
            ReconnectEvent::Item(Err(e)) => {
                debug!(error = %e, "binance market stream error");
            }
        }
    }

    Ok(())
}
