//! App-token-scoped control-plane calls: the event webhook and the two
//! periodic-loop RPCs. These use `x-authorization: <app token>` rather
//! than the per-job bearer, matching the original `events_worker.py`
//! and `periodic_tasks.py`, which both read `ACCELERATOR_APP_TOKEN`
//! instead of a job token.

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::error::{DispatchError, Result};
use crate::model::EventRecord;

#[derive(Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    base_url: String,
    app_token: String,
}

impl WebhookClient {
    pub fn new(base_url: impl Into<String>, app_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("failed to build webhook HTTP client"),
            base_url: base_url.into(),
            app_token: app_token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// POST `{type: "WKUBE_POD_EVENT", data: EventRecord}` to the webhook.
    pub async fn post_event(&self, event: &EventRecord) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/v1/projects/webhook-event/"))
            .header("x-authorization", &self.app_token)
            .json(&serde_json::json!({
                "type": "WKUBE_POD_EVENT",
                "data": event,
            }))
            .send()
            .await?;
        #[cfg(feature = "metrics")]
        crate::metrics::inc_webhook_post();
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, %body, "webhook POST returned an error status");
        }
        Ok(())
    }

    /// Submit candidate PVC names for the "still pending" filter used
    /// by the orphan sweep. Batches of up to 500 are the caller's
    /// responsibility (see `periodic::orphan_sweep`).
    pub async fn filter_pending_pvcs(&self, names: &[String]) -> Result<Vec<String>> {
        let resp = self
            .http
            .post(self.url("/v1/projects/periodic-tasks/filter-pending-pvcs/"))
            .header("x-authorization", &self.app_token)
            .json(names)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;
        Ok(body
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn update_stalled_jobs_status(&self) -> Result<()> {
        let resp = self
            .http
            .get(self.url("/v1/projects/periodic-tasks/update-stalled-jobs-status/"))
            .header("x-authorization", &self.app_token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(DispatchError::RetryNeeded(format!(
                "update_stalled_jobs_status returned status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
