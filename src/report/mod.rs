//! Read-only reporting surface. Projects leaderboard, model and feed state
//! as JSON; no mutation routes. Only `report_worker` links the HTTP server.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::model::{FeedKind, FeedRecord, Leaderboard, Model};
use crate::store::{FeedStore, ModelStore};

#[derive(Clone)]
pub struct ReportState {
    pub model_store: Arc<ModelStore>,
    pub feed_store: Arc<FeedStore>,
}

pub fn router(state: ReportState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/leaderboard/latest", get(leaderboard_latest))
        .route("/models/:id", get(model_by_id))
        .route("/feeds/:scope/tail", get(feed_tail))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn leaderboard_latest(
    State(state): State<ReportState>,
) -> Result<Json<Leaderboard>, StatusCode> {
    match state.model_store.fetch_latest_leaderboard() {
        Ok(Some(board)) => Ok(Json(board)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn model_by_id(
    State(state): State<ReportState>,
    Path(id): Path<String>,
) -> Result<Json<Model>, StatusCode> {
    match state.model_store.fetch_model(&id) {
        Ok(Some(model)) => Ok(Json(model)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(Debug, Deserialize)]
pub struct TailQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct FeedTailResponse {
    pub scope: String,
    pub records: Vec<FeedRecord>,
}

/// `scope` is the `source:subject:kind:granularity` key as emitted by the
/// ingestor (see `ingest::scope_for`). Returns the most recent `limit`
/// records (default 100) from the last 24 hours, oldest first.
async fn feed_tail(
    State(state): State<ReportState>,
    Path(scope): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Json<FeedTailResponse>, StatusCode> {
    let parts: Vec<&str> = scope.split(':').collect();
    let [source, subject, kind, granularity] = parts[..] else {
        return Err(StatusCode::BAD_REQUEST);
    };

    let now = chrono::Utc::now();
    let from = now - chrono::Duration::hours(24);
    let records = state
        .feed_store
        .fetch_records(source, subject, FeedKind::parse(kind), granularity, from.timestamp_millis(), now.timestamp_millis())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let limit = query.limit.unwrap_or(100);
    let tail: Vec<FeedRecord> = records.into_iter().rev().take(limit).rev().collect();

    Ok(Json(FeedTailResponse { scope, records: tail }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> ReportState {
        ReportState {
            model_store: Arc::new(ModelStore::open_in_memory().unwrap()),
            feed_store: Arc::new(FeedStore::open_in_memory().unwrap()),
        }
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = router(state());
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn leaderboard_latest_404s_when_empty() {
        let app = router(state());
        let resp = app
            .oneshot(Request::builder().uri("/leaderboard/latest").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn model_by_id_404s_when_missing() {
        let app = router(state());
        let resp = app
            .oneshot(Request::builder().uri("/models/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
