//! The synchronization job lifecycle and chunk-upload surface, abstracted
//! behind a trait so tests run against an in-process fake instead of a
//! real HTTP endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::types::SynchronizationJob;

#[derive(Debug, Serialize)]
pub struct InitiateRequest {
    pub source: &'static str,
    pub integration_instance_id: String,
}

#[derive(Debug, Deserialize)]
pub struct JobEnvelope {
    pub job: SynchronizationJob,
}

#[derive(Debug, Deserialize, Default)]
pub struct ApiErrorBody {
    pub error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// The `JOB_NOT_AWAITING_UPLOADS` code the fatal-stop path watches for.
pub const JOB_NOT_AWAITING_UPLOADS: &str = "JOB_NOT_AWAITING_UPLOADS";
pub const CREDENTIALS_ERROR: &str = "CredentialsError";
pub const REQUEST_ENTITY_TOO_LARGE: &str = "RequestEntityTooLargeException";

/// A transport-level response the retry logic in `pipeline.rs` branches
/// on (§4.5's error-handling table).
#[derive(Debug)]
pub enum UploadOutcome {
    Success,
    /// HTTP 413, or an embedded `RequestEntityTooLargeException` code.
    TooLarge,
    /// The server reports the job is no longer accepting uploads.
    JobEnded { message: String },
    /// Any other failure, with an optional stable API error code.
    Failed {
        code: Option<String>,
        message: String,
    },
}

#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn initiate(&self, integration_instance_id: &str) -> EngineResult<SynchronizationJob>;

    async fn upload_data_chunk(
        &self,
        job_id: &str,
        kind: &str,
        correlation_id: &str,
        batch: &Value,
    ) -> UploadOutcome;

    async fn finalize(
        &self,
        job_id: &str,
        partial_datasets: &Value,
    ) -> EngineResult<SynchronizationJob>;

    async fn abort(&self, job_id: &str, reason: &str) -> EngineResult<SynchronizationJob>;
}

/// `reqwest`-backed implementation of the synchronization API described in
/// the external-interfaces section.
pub struct HttpSyncClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpSyncClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpSyncClient {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl SyncClient for HttpSyncClient {
    async fn initiate(&self, integration_instance_id: &str) -> EngineResult<SynchronizationJob> {
        let body = InitiateRequest {
            source: "integration-managed",
            integration_instance_id: integration_instance_id.to_string(),
        };
        let resp = self
            .http
            .post(self.url("/persister/synchronization/jobs"))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::synchronization_api("TRANSPORT", e.to_string(), false))?;

        let envelope: JobEnvelope = resp
            .json()
            .await
            .map_err(|e| EngineError::synchronization_api("TRANSPORT", e.to_string(), false))?;
        Ok(envelope.job)
    }

    async fn upload_data_chunk(
        &self,
        job_id: &str,
        kind: &str,
        correlation_id: &str,
        batch: &Value,
    ) -> UploadOutcome {
        let url = self.url(&format!("/persister/synchronization/jobs/{job_id}/{kind}"));
        let resp = match self
            .http
            .post(url)
            .header("JupiterOne-Correlation-Id", correlation_id)
            .json(batch)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                return UploadOutcome::Failed {
                    code: None,
                    message: e.to_string(),
                }
            }
        };

        let status = resp.status();
        let body: ApiErrorBody = resp.json().await.unwrap_or_default();

        if status == reqwest::StatusCode::PAYLOAD_TOO_LARGE {
            return UploadOutcome::TooLarge;
        }
        if let Some(detail) = &body.error {
            if detail.code == REQUEST_ENTITY_TOO_LARGE {
                return UploadOutcome::TooLarge;
            }
            if detail.code == JOB_NOT_AWAITING_UPLOADS {
                return UploadOutcome::JobEnded {
                    message: detail.message.clone(),
                };
            }
            if !status.is_success() {
                return UploadOutcome::Failed {
                    code: Some(detail.code.clone()),
                    message: detail.message.clone(),
                };
            }
        }
        if !status.is_success() {
            return UploadOutcome::Failed {
                code: None,
                message: format!("unexpected status {status}"),
            };
        }
        UploadOutcome::Success
    }

    async fn finalize(
        &self,
        job_id: &str,
        partial_datasets: &Value,
    ) -> EngineResult<SynchronizationJob> {
        let resp = self
            .http
            .post(self.url(&format!(
                "/persister/synchronization/jobs/{job_id}/finalize"
            )))
            .json(&serde_json::json!({ "partialDatasets": partial_datasets }))
            .send()
            .await
            .map_err(|e| EngineError::synchronization_api("TRANSPORT", e.to_string(), false))?;
        let envelope: JobEnvelope = resp
            .json()
            .await
            .map_err(|e| EngineError::synchronization_api("TRANSPORT", e.to_string(), false))?;
        Ok(envelope.job)
    }

    async fn abort(&self, job_id: &str, reason: &str) -> EngineResult<SynchronizationJob> {
        let resp = self
            .http
            .post(self.url(&format!("/persister/synchronization/jobs/{job_id}/abort")))
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await
            .map_err(|e| EngineError::synchronization_api("TRANSPORT", e.to_string(), false))?;
        let envelope: JobEnvelope = resp
            .json()
            .await
            .map_err(|e| EngineError::synchronization_api("TRANSPORT", e.to_string(), false))?;
        Ok(envelope.job)
    }
}

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
