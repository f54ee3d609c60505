//! OpenAI-compatible HTTP client
//!
//! Talks to any server exposing `/v1/chat/completions` and `/v1/embeddings`
//! (vLLM, llama.cpp server, text-embeddings-inference, ...). No retries
//! happen here; wrap the client in [`super::retry::Resilient`] for that.

use async_trait::async_trait;
use reqwest::Client;
use sdk::errors::{EngineError, ModelError};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};

use super::{Embedder, GenerationParams, Result, TextGenerator};
use crate::config::ModelConfig;

/// Chat + embeddings client for one pair of endpoints
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    chat_url: String,
    chat_model: String,
    embeddings_url: String,
    embeddings_model: String,
    client: Client,
}

impl OpenAiCompatClient {
    pub fn new(
        chat_url: impl Into<String>,
        chat_model: impl Into<String>,
        embeddings_url: impl Into<String>,
        embeddings_model: impl Into<String>,
    ) -> std::result::Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            chat_url: chat_url.into(),
            chat_model: chat_model.into(),
            embeddings_url: embeddings_url.into(),
            embeddings_model: embeddings_model.into(),
            client,
        })
    }

    pub fn from_config(config: &ModelConfig) -> std::result::Result<Self, EngineError> {
        Self::new(
            &config.chat_url,
            config.active_model(),
            &config.embeddings_url,
            &config.embeddings_model,
        )
    }

    async fn post(&self, url: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let start = Instant::now();
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout {
                        after: start.elapsed(),
                    }
                } else if e.is_connect() {
                    ModelError::Connection(format!("Cannot connect to {}", url))
                } else {
                    ModelError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Server {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Response(format!("HTTP {}: {}", status, body)));
        }

        let value = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ModelError::Response(format!("Invalid JSON body: {}", e)))?;

        tracing::debug!(
            url,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Model endpoint responded"
        );
        Ok(value)
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

#[async_trait]
impl TextGenerator for OpenAiCompatClient {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let model = params.model.as_deref().unwrap_or(&self.chat_model);
        let messages: Vec<serde_json::Value> = params
            .messages(prompt)
            .into_iter()
            .map(|m| json!({"role": m.role.to_string(), "content": m.content}))
            .collect();

        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });

        let value = self.post(&self.chat_url, body).await?;
        let parsed: ChatResponse = serde_json::from_value(value)
            .map_err(|e| ModelError::Response(format!("Unexpected chat payload: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| ModelError::Response("No choices in response".to_string()))
    }
}

#[async_trait]
impl Embedder for OpenAiCompatClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({
            "model": self.embeddings_model,
            "input": text,
        });
        let value = self.post(&self.embeddings_url, body).await?;
        let parsed: EmbeddingResponse = serde_json::from_value(value)
            .map_err(|e| ModelError::Response(format!("Unexpected embedding payload: {}", e)))?;

        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| ModelError::Response("No embedding in response".to_string()))?;

        if embedding.is_empty() {
            return Err(ModelError::Response("Empty embedding".to_string()));
        }
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_payload_parsing() {
        let raw = json!({
            "id": "cmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": " Hello "}}]
        });
        let parsed: ChatResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some(" Hello ")
        );
    }

    #[tokio::test]
    async fn test_connection_error_is_typed() {
        let client = OpenAiCompatClient::new(
            "http://127.0.0.1:9/v1/chat/completions",
            "m",
            "http://127.0.0.1:9/v1/embeddings",
            "e",
        )
        .unwrap();
        let err = client
            .generate("hi", &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Connection(_)));
    }
}
