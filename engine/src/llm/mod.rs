//! Model call boundary
//!
//! Agents see two capabilities: [`TextGenerator`] (prompt in, text out) and
//! [`Embedder`] (text in, vector out). The HTTP implementation speaks the
//! OpenAI-compatible chat/embeddings API; [`retry::Resilient`] wraps any
//! implementation with a per-attempt deadline and exponential backoff so a
//! hung server surfaces as a typed `ModelError` instead of stalling a step.

use async_trait::async_trait;
use sdk::errors::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::ModelConfig;

pub mod openai;
pub mod retry;

/// Result type for model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Message in a chat request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// Sampling parameters for one generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Overrides the client's default model when set
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system: Option<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.8,
            max_tokens: 1000,
            system: None,
        }
    }
}

impl GenerationParams {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            model: Some(config.active_model().to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            system: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Build the chat message list for a single-turn prompt.
    pub fn messages(&self, prompt: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(prompt));
        messages
    }
}

/// Text generation capability
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;
}

/// Embedding capability
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[async_trait]
impl<T: TextGenerator + ?Sized> TextGenerator for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        (**self).generate(prompt, params).await
    }
}

#[async_trait]
impl<T: Embedder + ?Sized> Embedder for Arc<T> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text).await
    }
}

/// A generator bundled with the defaults agents should use with it
#[derive(Clone)]
pub struct ModelEndpoint {
    pub generator: Arc<dyn TextGenerator>,
    pub defaults: GenerationParams,
}

impl ModelEndpoint {
    pub fn new(generator: Arc<dyn TextGenerator>, defaults: GenerationParams) -> Self {
        Self {
            generator,
            defaults,
        }
    }

    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        let mut params = self.defaults.clone();
        if let Some(system) = system {
            params.system = Some(system.to_string());
        }
        self.generator.generate(prompt, &params).await
    }
}

impl fmt::Debug for ModelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelEndpoint")
            .field("generator", &self.generator.name())
            .field("defaults", &self.defaults)
            .finish()
    }
}
