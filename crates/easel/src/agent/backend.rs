//! The model side of a query.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::messages::StreamMessage;
use super::tools::ToolHandler;
use crate::store::models::Message;

/// Errors raised by an [`LlmBackend`].
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// The provider answered with a non-success status.
    #[error("provider returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Provider error message.
        message: String,
    },

    /// The provider sent something unparseable.
    #[error("failed to decode provider response: {0}")]
    Decode(String),

    /// The request was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// One query as seen by the backend.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    /// System prompt.
    pub system: Option<String>,
    /// Earlier conversation turns, oldest first.
    pub history: Vec<Message>,
    /// The new user prompt.
    pub prompt: String,
}

impl LlmRequest {
    /// A request with no history.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// A source of model events.
///
/// Implementations run the whole tool loop themselves: they call `tools`
/// for every tool use the model requests and report the results as `user`
/// messages. The stream ends after a `result` message or an error. Once
/// `cancel` fires, no further provider requests may be started.
pub trait LlmBackend: Send + Sync {
    /// Start streaming a response to `request`.
    fn stream(
        &self,
        request: LlmRequest,
        tools: Arc<dyn ToolHandler>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<StreamMessage, ProviderError>>;
}
