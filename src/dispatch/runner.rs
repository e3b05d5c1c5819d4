//! HTTP+JSON client for the model runner's `tick`/`predict` RPC contract.
//!
//! The original's gRPC proto plumbing is out of scope; this crate only needs
//! the two call shapes, so a thin `reqwest` client stands in for the
//! transport, following the teacher's `reqwest::Client` usage in
//! `scrapers/dome_rest.rs`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CoordinatorError, Result};
use crate::model::PredictionScope;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub cruncher_id: String,
    pub cruncher_name: String,
    pub model_name: String,
    pub deployment_id: String,
}

pub struct ModelTickResult {
    pub info: ModelInfo,
}

#[async_trait]
pub trait ModelRunnerClient: Send + Sync {
    /// Currently registered model ids, as reported by the runner.
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Fire-and-forget state update call; returns the model's self-reported identity.
    async fn tick(&self, model_id: &str, inference_input: &Value) -> Result<ModelInfo>;

    /// Prediction request; returns the raw inference output for validation upstream.
    async fn predict(&self, model_id: &str, scope: &PredictionScope) -> Result<Value>;
}

pub struct HttpModelRunnerClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpModelRunnerClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builder");
        Self {
            http,
            base_url: format!("http://{host}:{port}"),
        }
    }
}

#[async_trait]
impl ModelRunnerClient for HttpModelRunnerClient {
    async fn list_models(&self) -> Result<Vec<String>> {
        let resp = self
            .http
            .get(format!("{}/models", self.base_url))
            .send()
            .await
            .map_err(|e| CoordinatorError::TransientNetwork(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| CoordinatorError::TransientNetwork(e.to_string()))
    }

    async fn tick(&self, model_id: &str, inference_input: &Value) -> Result<ModelInfo> {
        let resp = self
            .http
            .post(format!("{}/models/{model_id}/tick", self.base_url))
            .json(inference_input)
            .send()
            .await
            .map_err(|e| CoordinatorError::TransientNetwork(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoordinatorError::ModelAbsent);
        }

        resp.json()
            .await
            .map_err(|e| CoordinatorError::TransientNetwork(e.to_string()))
    }

    async fn predict(&self, model_id: &str, scope: &PredictionScope) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/models/{model_id}/predict", self.base_url))
            .json(&serde_json::json!({
                "subject": scope.subject,
                "horizon_seconds": scope.horizon_seconds,
                "step_seconds": scope.step_seconds,
            }))
            .send()
            .await
            .map_err(|e| CoordinatorError::TransientNetwork(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoordinatorError::ModelAbsent);
        }

        resp.json()
            .await
            .map_err(|e| CoordinatorError::TransientNetwork(e.to_string()))
    }
}

/// Deterministic runner for dispatcher tests.
pub struct MockRunner {
    model_id: String,
    mode: MockMode,
}

enum MockMode {
    Succeed,
    Timeout,
    Absent,
}

impl MockRunner {
    pub fn always_succeeds() -> Self {
        Self { model_id: "mock-model".to_string(), mode: MockMode::Succeed }
    }

    pub fn always_times_out() -> Self {
        Self { model_id: "mock-model".to_string(), mode: MockMode::Timeout }
    }

    pub fn always_absent() -> Self {
        Self { model_id: "mock-model".to_string(), mode: MockMode::Absent }
    }
}

#[async_trait]
impl ModelRunnerClient for MockRunner {
    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec![self.model_id.clone()])
    }

    async fn tick(&self, model_id: &str, _inference_input: &Value) -> Result<ModelInfo> {
        Ok(ModelInfo {
            cruncher_id: "cruncher-1".to_string(),
            cruncher_name: "Cruncher One".to_string(),
            model_name: model_id.to_string(),
            deployment_id: "deploy-1".to_string(),
        })
    }

    async fn predict(&self, _model_id: &str, _scope: &PredictionScope) -> Result<Value> {
        match self.mode {
            MockMode::Succeed => Ok(serde_json::json!({"p_up": 0.62})),
            MockMode::Timeout => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
            MockMode::Absent => Err(CoordinatorError::ModelAbsent),
        }
    }
}

pub fn http_client(host: &str, port: u16, timeout: Duration) -> Arc<dyn ModelRunnerClient> {
    Arc::new(HttpModelRunnerClient::new(host, port, timeout))
}
