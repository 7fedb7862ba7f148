//! LLM transport (§6, out-of-scope collaborator) — chat-completion calls for
//! the four Debug task names (`simple`, `complex`, `explain`, `middle`).

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Result, ServerError};

/// One message in a chat-completion request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl From<&speql::debug::Message> for ChatMessage {
    fn from(m: &speql::debug::Message) -> Self {
        Self {
            role: m.role.clone(),
            content: m.content.clone(),
        }
    }
}

/// Abstracts the LLM provider so the orchestrator and tests never depend on
/// a concrete HTTP transport.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one chat-completion call for `task` (`simple`/`complex`/
    /// `explain`/`middle`), returning the raw assistant text.
    async fn complete(
        &self,
        task: &str,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
        prediction: Option<&str>,
    ) -> Result<String>;
}

/// Production client: a chat-completions endpoint over `reqwest`.
pub struct ReqwestLlm {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl ReqwestLlm {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    task: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prediction: Option<&'a str>,
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    content: String,
}

#[async_trait]
impl LlmClient for ReqwestLlm {
    async fn complete(
        &self,
        task: &str,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
        prediction: Option<&str>,
    ) -> Result<String> {
        let body = ChatRequest {
            task,
            messages,
            max_tokens,
            prediction,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServerError::Llm(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ServerError::Llm(format!(
                "llm endpoint returned {}",
                response.status()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ServerError::Llm(e.to_string()))?;
        Ok(parsed.content)
    }
}

/// Deterministic client for tests: returns canned responses keyed by task
/// name, recording every call for assertions.
#[derive(Default)]
pub struct MockLlm {
    responses: std::sync::Mutex<std::collections::HashMap<String, Vec<String>>>,
    calls: std::sync::Mutex<Vec<String>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response to hand back the next time `task` is called.
    pub fn push_response(&self, task: &str, response: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .entry(task.to_string())
            .or_default()
            .push(response.into());
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(
        &self,
        task: &str,
        _messages: &[ChatMessage],
        _max_tokens: Option<u32>,
        _prediction: Option<&str>,
    ) -> Result<String> {
        self.calls.lock().unwrap().push(task.to_string());
        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(task).and_then(|q| {
            if q.is_empty() {
                None
            } else {
                Some(q.remove(0))
            }
        }) {
            Some(resp) => Ok(resp),
            None => Err(ServerError::Llm(format!("no mock response queued for task {task}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_llm_replays_queued_responses_in_order() {
        let mock = MockLlm::new();
        mock.push_response("simple", "```json[]```");
        mock.push_response("simple", "```json[{\"old\":\"a\",\"new\":\"b\"}]```");

        let first = mock.complete("simple", &[], None, None).await.unwrap();
        let second = mock.complete("simple", &[], None, None).await.unwrap();
        assert_eq!(first, "```json[]```");
        assert!(second.contains("old"));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn mock_llm_errors_when_no_response_queued() {
        let mock = MockLlm::new();
        assert!(mock.complete("middle", &[], None, None).await.is_err());
    }
}
