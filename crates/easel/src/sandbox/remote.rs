//! Client for the external Python execution service.
//!
//! The service keeps one interpreter session per workspace, so variables
//! survive between calls. It is what spreadsheet refusals from `read` point
//! at.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Errors talking to the execution service.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The configured base URL is unusable.
    #[error("invalid python sandbox URL: {0}")]
    InvalidUrl(String),

    /// Transport failure.
    #[error("python sandbox request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status.
    #[error("python sandbox returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
}

/// A file or image produced by the code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact kind, e.g. `image`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Encoded payload.
    #[serde(default)]
    pub data: String,
}

/// Outcome of one remote execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PythonResult {
    /// Whether the code exited cleanly.
    pub success: bool,
    /// Captured standard output.
    #[serde(default)]
    pub stdout: String,
    /// Captured standard error.
    #[serde(default)]
    pub stderr: String,
    /// Produced artifacts.
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl PythonResult {
    /// Render as tool-result text.
    pub fn to_text(&self) -> String {
        let mut sections = Vec::new();
        if !self.success {
            sections.push("Execution failed.".to_string());
        }
        if !self.stdout.trim().is_empty() {
            sections.push(self.stdout.trim_end().to_string());
        }
        if !self.stderr.trim().is_empty() {
            sections.push(format!("stderr:\n{}", self.stderr.trim_end()));
        }
        if !self.artifacts.is_empty() {
            sections.push(format!("[{} artifact(s) produced]", self.artifacts.len()));
        }
        if sections.is_empty() {
            return "(no output)".to_string();
        }
        sections.join("\n\n")
    }
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    workspace_id: &'a str,
    code: &'a str,
    timeout: u64,
}

/// HTTP client for the execution service.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    client: reqwest::Client,
    base_url: Url,
}

impl RemoteExecutor {
    /// Default per-call timeout, matching the service's own default.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a client for the service at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, RemoteError> {
        let mut base_url = Url::parse(base_url).map_err(|e| RemoteError::InvalidUrl(format!("{base_url}: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|e| RemoteError::InvalidUrl(format!("{path}: {e}")))
    }

    /// Run `code` in the workspace's Python session.
    pub async fn execute(&self, workspace_id: &str, code: &str, timeout: Duration) -> Result<PythonResult, RemoteError> {
        let started = std::time::Instant::now();
        let response = self
            .client
            .post(self.endpoint("execute")?)
            // The service enforces `timeout` itself; leave room for the round trip.
            .timeout(timeout + Duration::from_secs(10))
            .json(&ExecuteRequest {
                workspace_id,
                code,
                timeout: timeout.as_secs().max(1),
            })
            .send()
            .await?;
        let result: PythonResult = check(response).await?.json().await?;

        tracing::info!(
            workspace_id = %workspace_id,
            success = result.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "python execution finished"
        );
        Ok(result)
    }

    /// Tear down the workspace's Python session.
    pub async fn destroy_session(&self, workspace_id: &str) -> Result<(), RemoteError> {
        let url = self.endpoint(&format!("sessions/{workspace_id}"))?;
        check(self.client.delete(url).send().await?).await?;
        Ok(())
    }

    /// Whether the service answers its health check.
    pub async fn health(&self) -> bool {
        let Ok(url) = self.endpoint("health") else {
            return false;
        };
        match self.client.get(url).timeout(Duration::from_secs(5)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "python sandbox health check failed");
                false
            }
        }
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        status: status.as_u16(),
        body,
    })
}
