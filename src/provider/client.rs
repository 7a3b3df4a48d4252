//! HTTP client for the conversational AI provider.
//!
//! Blocking chat calls carry the configured request timeout; streaming
//! calls never time out and end when the caller stops consuming or the
//! provider closes the stream.

use std::time::Duration;

use futures::stream::BoxStream;
use futures::{future, stream, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::config;
use crate::provider::error::ProviderError;
use crate::provider::sse::SseDecoder;
use crate::provider::types::{ChatMessageResponse, ChatRequest, StreamEvent};

#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    request_timeout: Duration,
}

impl ProviderClient {
    pub fn from_config() -> Self {
        let provider = &config().provider;
        Self::new(&provider.base_url, &provider.api_key, provider.request_timeout_secs)
    }

    pub fn new(base_url: &str, api_key: &str, request_timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            request_timeout: Duration::from_secs(request_timeout_secs),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Blocking chat completion.
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatMessageResponse, ProviderError> {
        let mut body = serde_json::to_value(request)
            .map_err(|e| ProviderError::Stream(e.to_string()))?;
        body["response_mode"] = json!("blocking");

        let response = self
            .http
            .post(self.url("chat-messages"))
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Streaming chat completion. No timeout: long generations are
    /// expected, and abandonment (dropping the returned stream) is the
    /// cancellation mechanism.
    pub async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent, ProviderError>>, ProviderError> {
        let mut body = serde_json::to_value(request)
            .map_err(|e| ProviderError::Stream(e.to_string()))?;
        body["response_mode"] = json!("streaming");

        let response = self
            .http
            .post(self.url("chat-messages"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = Self::check(response).await?;
        debug!("Provider stream opened");

        let events = response
            .bytes_stream()
            .scan(SseDecoder::new(), |decoder, chunk| {
                let items = match chunk {
                    Ok(bytes) => decoder.push(&bytes),
                    Err(e) => vec![Err(ProviderError::from(e))],
                };
                future::ready(Some(stream::iter(items)))
            })
            .flatten()
            .boxed();
        Ok(events)
    }

    /// Ask the provider to stop an in-flight generation.
    pub async fn stop_generation(&self, task_id: &str, user: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .post(self.url(&format!("chat-messages/{task_id}/stop")))
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(&json!({ "user": user }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Provider-side conversation list.
    pub async fn conversations(
        &self,
        user: &str,
        last_id: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Value, ProviderError> {
        let mut query: Vec<(&str, String)> = vec![("user", user.to_string())];
        if let Some(last_id) = last_id {
            query.push(("last_id", last_id.to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        let response = self
            .http
            .get(self.url("conversations"))
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .query(&query)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Provider-side message history for one conversation.
    pub async fn messages(
        &self,
        conversation_id: &str,
        user: &str,
        limit: Option<i64>,
    ) -> Result<Value, ProviderError> {
        let mut query: Vec<(&str, String)> =
            vec![("conversation_id", conversation_id.to_string()), ("user", user.to_string())];
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        let response = self
            .http
            .get(self.url("messages"))
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .query(&query)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn rename_conversation(
        &self,
        conversation_id: &str,
        name: &str,
        user: &str,
    ) -> Result<Value, ProviderError> {
        let response = self
            .http
            .post(self.url(&format!("conversations/{conversation_id}/name")))
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(&json!({ "name": name, "user": user }))
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn delete_conversation(
        &self,
        conversation_id: &str,
        user: &str,
    ) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(self.url(&format!("conversations/{conversation_id}")))
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(&json!({ "user": user }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Conversation variables exposed by the provider.
    pub async fn conversation_variables(
        &self,
        conversation_id: &str,
        user: &str,
    ) -> Result<Value, ProviderError> {
        let response = self
            .http
            .get(self.url(&format!("conversations/{conversation_id}/variables")))
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .query(&[("user", user)])
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Set one conversation variable by id.
    pub async fn update_conversation_variable(
        &self,
        conversation_id: &str,
        variable_id: &str,
        user: &str,
        value: &str,
    ) -> Result<Value, ProviderError> {
        let response = self
            .http
            .put(self.url(&format!("conversations/{conversation_id}/variables/{variable_id}")))
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(&json!({ "user": user, "value": value }))
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status.as_u16(), &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_join_handles_slashes() {
        let client = ProviderClient::new("http://api.example.com/v1/", "k", 30);
        assert_eq!(client.url("/chat-messages"), "http://api.example.com/v1/chat-messages");
        assert_eq!(client.url("messages"), "http://api.example.com/v1/messages");
        assert_eq!(
            client.url(&format!("conversations/{}/variables/{}", "c1", "v1")),
            "http://api.example.com/v1/conversations/c1/variables/v1"
        );
    }
}
