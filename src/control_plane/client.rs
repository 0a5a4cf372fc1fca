//! Per-job control-plane client. Every RPC carries the job's bearer
//! token; this mirrors the original's `AjobCliService`.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{DispatchError, Result};
use crate::model::JobStatus;

/// Number of attempts for transient HTTP failures, matching the
/// teacher's `ScpClient::retry_request` backoff shape (1s, 2s, 4s).
const MAX_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    job_token: String,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, job_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build control-plane HTTP client"),
            base_url: base_url.into(),
            job_token: job_token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn retrying<F, Fut>(&self, op: &str, mut attempt: F) -> Result<reqwest::Response>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
    {
        let mut last_err = None;
        for n in 0..MAX_ATTEMPTS {
            match attempt().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    warn!(op, status = %resp.status(), attempt = n + 1, "control-plane request failed");
                    last_err = Some(DispatchError::RetryNeeded(format!(
                        "{op} returned status {}",
                        resp.status()
                    )));
                }
                Err(e) => {
                    warn!(op, error = %e, attempt = n + 1, "control-plane request error");
                    last_err = Some(DispatchError::ReqwestError(e));
                }
            }
            if n + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(2u64.pow(n))).await;
            }
        }
        Err(last_err.unwrap_or_else(|| DispatchError::RetryNeeded(op.to_string())))
    }

    pub async fn update_job_status(&self, status: JobStatus) -> Result<()> {
        debug!(status = status.as_str(), "updating job status");
        self.retrying("update_job_status", || {
            self.http
                .post(self.url("/v1/projects/job-status/"))
                .bearer_auth(&self.job_token)
                .json(&json!({ "status": status.as_str() }))
                .send()
        })
        .await?;
        Ok(())
    }

    /// Upload a log chunk. Returns the health flag the control plane
    /// attaches to the response — `false` means the job has been
    /// declared unhealthy and the caller must raise the unhealthy
    /// signal.
    ///
    /// `reqwest::multipart::Form` isn't `Clone`, so the retry loop is
    /// written out directly here instead of going through `retrying`.
    pub async fn add_log_file(&self, chunk: Vec<u8>, filename: &str) -> Result<bool> {
        let mut last_err = None;
        for n in 0..MAX_ATTEMPTS {
            let form = reqwest::multipart::Form::new().part(
                "file",
                reqwest::multipart::Part::bytes(chunk.clone()).file_name(filename.to_string()),
            );
            match self
                .http
                .post(self.url("/v1/projects/job-logs/"))
                .bearer_auth(&self.job_token)
                .multipart(form)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    let body: Value = resp.json().await?;
                    return Ok(body["is_healthy"].as_bool().unwrap_or(true));
                }
                Ok(resp) => {
                    warn!(status = %resp.status(), attempt = n + 1, "add_log_file failed");
                    last_err = Some(DispatchError::RetryNeeded(format!(
                        "add_log_file returned status {}",
                        resp.status()
                    )));
                }
                Err(e) => {
                    warn!(error = %e, attempt = n + 1, "add_log_file error");
                    last_err = Some(DispatchError::ReqwestError(e));
                }
            }
            if n + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(2u64.pow(n))).await;
            }
        }
        Err(last_err.unwrap_or_else(|| DispatchError::RetryNeeded("add_log_file".to_string())))
    }

    pub async fn check_job_health(&self) -> Result<bool> {
        let resp = self
            .retrying("check_job_health", || {
                self.http
                    .get(self.url("/v1/projects/job-health/"))
                    .bearer_auth(&self.job_token)
                    .send()
            })
            .await?;
        let body: Value = resp.json().await?;
        Ok(body["is_healthy"].as_bool().unwrap_or(true))
    }

    /// Stream the bytes of a stored bucket object in chunks.
    pub async fn get_file_stream(
        &self,
        bucket_object_id: &str,
    ) -> Result<impl futures::Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>>>
    {
        let resp = self
            .http
            .get(self.url(&format!("/v1/projects/bucket-objects/{bucket_object_id}/content/")))
            .bearer_auth(&self.job_token)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes_stream())
    }

    pub async fn add_filestream_as_job_output(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string()),
        );
        let resp = self
            .http
            .post(self.url("/v1/projects/job-outputs/"))
            .bearer_auth(&self.job_token)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;
        Ok(body["bucket_object_id"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    pub async fn replace_bucket_object_id_content(
        &self,
        bucket_object_id: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        self.http
            .put(self.url(&format!(
                "/v1/projects/bucket-objects/{bucket_object_id}/content/"
            )))
            .bearer_auth(&self.job_token)
            .body(bytes)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn get_bucket_object_validation_type(&self, bucket_object_id: &str) -> Result<String> {
        let resp = self
            .http
            .get(self.url(&format!(
                "/v1/projects/bucket-objects/{bucket_object_id}/validation-type/"
            )))
            .bearer_auth(&self.job_token)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;
        Ok(body["validation_type"].as_str().unwrap_or_default().to_string())
    }

    pub async fn get_bucket_object_validation_details(
        &self,
        bucket_object_id: &str,
    ) -> Result<Value> {
        let resp = self
            .http
            .get(self.url(&format!(
                "/v1/projects/bucket-objects/{bucket_object_id}/validation-details/"
            )))
            .bearer_auth(&self.job_token)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn get_dataset_template_details(&self, dataset_template_id: &str) -> Result<Value> {
        let resp = self
            .http
            .get(self.url(&format!(
                "/v1/projects/dataset-templates/{dataset_template_id}/"
            )))
            .bearer_auth(&self.job_token)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn register_validation(
        &self,
        bucket_object_id: &str,
        dataset_template_id: &str,
        metadata: Value,
    ) -> Result<()> {
        self.http
            .post(self.url("/v1/projects/validations/"))
            .bearer_auth(&self.job_token)
            .json(&json!({
                "bucket_object_id": bucket_object_id,
                "dataset_template_id": dataset_template_id,
                "metadata": metadata,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

