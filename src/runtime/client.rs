//! HTTP transport to the agent runtime's message API.

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::types::{MessagesResponse, RuntimeMessage, SendMessageRequest};
use crate::config::RuntimeSection;
use crate::errors::{WorkflowError, WorkflowResult};

/// Transport to the remote agent runtime.
/// Real implementation: `HttpRuntimeClient`. Tests script their own.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// `POST /message`. Fire-and-forget; an error means the runtime was unreachable.
    async fn send_message(&self, conversation_id: &str, message: &str) -> WorkflowResult<()>;

    /// `GET /messages/{conversationId}`, in arrival order.
    async fn get_messages(&self, conversation_id: &str) -> WorkflowResult<Vec<RuntimeMessage>>;

    /// `DELETE /messages/{conversationId}`.
    async fn clear_messages(&self, conversation_id: &str) -> WorkflowResult<()>;
}

/// reqwest-backed client for the runtime's test-adapter HTTP API.
#[derive(Clone)]
pub struct HttpRuntimeClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRuntimeClient {
    pub fn new(config: &RuntimeSection) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client for agent runtime")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn messages_url(&self, conversation_id: &str) -> String {
        format!("{}/messages/{}", self.base_url, conversation_id)
    }
}

fn connectivity(context: &str, err: reqwest::Error) -> WorkflowError {
    WorkflowError::Connectivity(format!("{}: {}", context, err))
}

#[async_trait]
impl RuntimeClient for HttpRuntimeClient {
    async fn send_message(&self, conversation_id: &str, message: &str) -> WorkflowResult<()> {
        let body = SendMessageRequest {
            conversation_id: conversation_id.to_string(),
            message: message.to_string(),
        };
        self.client
            .post(format!("{}/message", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| connectivity("Failed to send message", e))?
            .error_for_status()
            .map_err(|e| connectivity("Runtime rejected message", e))?;
        tracing::debug!(conversation_id, "Sent message to agent runtime");
        Ok(())
    }

    async fn get_messages(&self, conversation_id: &str) -> WorkflowResult<Vec<RuntimeMessage>> {
        let resp = self
            .client
            .get(self.messages_url(conversation_id))
            .send()
            .await
            .map_err(|e| connectivity("Failed to fetch messages", e))?
            .error_for_status()
            .map_err(|e| connectivity("Runtime returned error for messages", e))?
            .json::<MessagesResponse>()
            .await
            .map_err(|e| WorkflowError::Execution(format!("Malformed messages response: {}", e)))?;
        Ok(resp.messages)
    }

    async fn clear_messages(&self, conversation_id: &str) -> WorkflowResult<()> {
        self.client
            .delete(self.messages_url(conversation_id))
            .send()
            .await
            .map_err(|e| connectivity("Failed to clear messages", e))?
            .error_for_status()
            .map_err(|e| connectivity("Runtime refused to clear messages", e))?;
        tracing::debug!(conversation_id, "Cleared agent runtime conversation");
        Ok(())
    }
}
