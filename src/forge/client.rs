//! Typed HTTP client for the four forge endpoints the dispatcher calls.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::errors::{ForgeError, ForgeResult};
use super::types::*;

const MAX_RETRIES: u32 = 3;
const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Thin, stateless (beyond the bearer token) wrapper around the forge's
/// REST surface.
pub struct ForgeClient {
    client: Client,
    base_url: String,
    token: String,
}

impl ForgeClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> ForgeResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<impl Serialize>,
        cancel: &CancellationToken,
    ) -> ForgeResult<T> {
        let url = self.url(path);
        let mut last_error: Option<ForgeError> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = Self::backoff(attempt);
                debug!(path, attempt, ?delay, "retrying forge request");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ForgeError::Timeout),
                }
            }

            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.token)
                .header("Accept", "application/vnd.github+json");

            if let Some(ref body) = body {
                request = request.json(body);
            }

            let attempted = tokio::select! {
                result = self.execute(request) => result,
                _ = cancel.cancelled() => Err(ForgeError::Timeout),
            };

            match attempted {
                Ok(response) => return self.parse(response).await,
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    warn!(path, attempt, error = %e, "forge request failed, retrying");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ForgeError::RetryExhausted(
            last_error.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    async fn execute(&self, request: RequestBuilder) -> ForgeResult<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ForgeError::Timeout
            } else {
                ForgeError::Request(e)
            }
        })?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "no response body".to_string());
            return Err(ForgeError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }

    async fn parse<T: DeserializeOwned>(&self, response: Response) -> ForgeResult<T> {
        if response.status() == StatusCode::NO_CONTENT {
            return serde_json::from_str("null").map_err(ForgeError::Parse);
        }
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(ForgeError::Parse)
    }

    fn backoff(attempt: u32) -> Duration {
        let delay = BASE_RETRY_DELAY * 2u32.pow(attempt - 1);
        std::cmp::min(delay, MAX_RETRY_DELAY)
    }

    /// `GET repos/{owner}/{repo}/actions/runs?status=queued&per_page=10`
    pub async fn list_queued_runs(
        &self,
        owner: &str,
        repo: &str,
        cancel: &CancellationToken,
    ) -> ForgeResult<Vec<QueuedRun>> {
        let path = format!("repos/{owner}/{repo}/actions/runs?status=queued&per_page=10");
        let response: ListRunsResponse = self.request(Method::GET, &path, None::<()>, cancel).await?;
        Ok(response.workflow_runs)
    }

    /// `GET repos/{owner}/{repo}/actions/runs/{run_id}/jobs?filter=latest&per_page=100`
    pub async fn list_jobs_for_run(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
        cancel: &CancellationToken,
    ) -> ForgeResult<Vec<QueuedJob>> {
        let path =
            format!("repos/{owner}/{repo}/actions/runs/{run_id}/jobs?filter=latest&per_page=100");
        let response: ListJobsResponse = self.request(Method::GET, &path, None::<()>, cancel).await?;
        Ok(response.jobs)
    }

    /// `POST repos/{owner}/{repo}/actions/runners/generate-jitconfig`
    pub async fn generate_jit_config(
        &self,
        owner: &str,
        repo: &str,
        runner_name: &str,
        labels: &[String],
        cancel: &CancellationToken,
    ) -> ForgeResult<JitCredential> {
        let path = format!("repos/{owner}/{repo}/actions/runners/generate-jitconfig");
        let body = GenerateJitConfigRequest {
            name: runner_name,
            runner_group_id: 1,
            labels,
        };
        let response: GenerateJitConfigResponse =
            self.request(Method::POST, &path, Some(body), cancel).await?;

        let encoded_jit_config = response
            .encoded_jit_config
            .ok_or_else(|| ForgeError::Malformed("response missing encoded_jit_config".into()))?;

        Ok(JitCredential {
            runner_id: response.runner.id,
            encoded_jit_config,
        })
    }

    /// `GET repos/{owner}/{repo}` — best-effort: any transport error yields `false`.
    pub async fn check_admin_permission(
        &self,
        owner: &str,
        repo: &str,
        cancel: &CancellationToken,
    ) -> bool {
        let path = format!("repos/{owner}/{repo}");
        match self
            .request::<RepositoryResponse>(Method::GET, &path, None::<()>, cancel)
            .await
        {
            Ok(response) => Self::admin_flag(response),
            Err(_) => false,
        }
    }

    fn admin_flag(response: RepositoryResponse) -> bool {
        response.permissions.map(|p| p.admin).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_and_path() {
        let client = ForgeClient::new("https://api.example.com/", "tok").unwrap();
        assert_eq!(client.url("repos/a/b"), "https://api.example.com/repos/a/b");
        assert_eq!(client.url("/repos/a/b"), "https://api.example.com/repos/a/b");
    }

    #[test]
    fn backoff_doubles_each_attempt_and_caps() {
        assert_eq!(ForgeClient::backoff(1), Duration::from_millis(500));
        assert_eq!(ForgeClient::backoff(2), Duration::from_millis(1000));
        assert_eq!(ForgeClient::backoff(3), Duration::from_millis(2000));
        assert_eq!(ForgeClient::backoff(7), MAX_RETRY_DELAY);
    }

    #[test]
    fn admin_flag_requires_explicit_true() {
        let granted: RepositoryResponse = serde_json::from_str(r#"{"permissions":{"admin":true}}"#).unwrap();
        assert!(ForgeClient::admin_flag(granted));

        let denied: RepositoryResponse = serde_json::from_str(r#"{"permissions":{"admin":false}}"#).unwrap();
        assert!(!ForgeClient::admin_flag(denied));

        let absent: RepositoryResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(!ForgeClient::admin_flag(absent));
    }
}
