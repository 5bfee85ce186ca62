//! Text-transform collaborator — turns an email into a short post in the
//! target language.
//!
//! Uses the rig-core crate for the hosted-model call, behind a crate-local
//! `PostGenerator` trait so the summarizer stage can be tested without a
//! network. The generator is NOT trusted to respect length limits; the
//! summarizer enforces the bound after generation.

use std::sync::Arc;

use async_trait::async_trait;
use rig::agent::Agent;
use rig::client::CompletionClient;
use rig::completion::{CompletionModel, Prompt};
use secrecy::ExposeSecret;

use crate::error::{ConfigError, TransformError};

/// System prompt for the post conversion, carried over from the original
/// deployment: English email in, concise Japanese post out.
const POST_PROMPT: &str = "あなたは英語のメールを日本語のソーシャル投稿に変換する専門家です。\n\
受け取ったメールの内容を、魅力的で簡潔な日本語の投稿（280文字以内）に変換してください。\n\
要件：\n\
- 自然な日本語で書く\n\
- 重要な情報を保持する\n\
- カジュアルなトーンを使う\n\
- 絵文字は使用しない\n\
- ハッシュタグを1-2個提案する\n\
投稿本文のみを返してください。";

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

/// Configuration for creating a generator.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

impl LlmConfig {
    /// Build config from environment variables.
    ///
    /// `MAILCAST_LLM_BACKEND` selects the backend (default `anthropic`);
    /// the API key comes from the backend's conventional variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("MAILCAST_LLM_BACKEND")
            .unwrap_or_else(|_| "anthropic".to_string())
            .to_lowercase()
            .as_str()
        {
            "anthropic" => LlmBackend::Anthropic,
            "openai" => LlmBackend::OpenAi,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "MAILCAST_LLM_BACKEND".to_string(),
                    message: format!("unknown backend: {other}"),
                });
            }
        };

        let key_var = match backend {
            LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
            LlmBackend::OpenAi => "OPENAI_API_KEY",
        };
        let api_key = std::env::var(key_var)
            .map(secrecy::SecretString::from)
            .map_err(|_| ConfigError::MissingEnvVar(key_var.to_string()))?;

        let model = std::env::var("MAILCAST_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());

        Ok(Self {
            backend,
            api_key,
            model,
        })
    }
}

/// Text-transform collaborator.
#[async_trait]
pub trait PostGenerator: Send + Sync {
    /// Generate a post from a message's subject and body.
    async fn generate(&self, subject: &str, body: &str) -> Result<String, TransformError>;
}

/// Format the per-message user prompt.
fn build_user_message(subject: &str, body: &str) -> String {
    format!("件名: {subject}\n本文: {body}")
}

/// rig-core backed generator.
struct RigGenerator<M: CompletionModel> {
    agent: Agent<M>,
    provider: &'static str,
}

#[async_trait]
impl<M: CompletionModel> PostGenerator for RigGenerator<M> {
    async fn generate(&self, subject: &str, body: &str) -> Result<String, TransformError> {
        let message = build_user_message(subject, body);
        let text = self.agent.prompt(message).await.map_err(|e| {
            TransformError::RequestFailed {
                provider: self.provider.to_string(),
                reason: e.to_string(),
            }
        })?;

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(TransformError::EmptyOutput);
        }
        Ok(text)
    }
}

/// Create a generator from configuration.
pub fn create_generator(config: &LlmConfig) -> Result<Arc<dyn PostGenerator>, TransformError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_generator(config),
        LlmBackend::OpenAi => create_openai_generator(config),
    }
}

fn create_anthropic_generator(
    config: &LlmConfig,
) -> Result<Arc<dyn PostGenerator>, TransformError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            TransformError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let agent = client
        .agent(&config.model)
        .preamble(POST_PROMPT)
        .temperature(0.7)
        .build();
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigGenerator {
        agent,
        provider: "anthropic",
    }))
}

fn create_openai_generator(config: &LlmConfig) -> Result<Arc<dyn PostGenerator>, TransformError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            TransformError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let agent = client
        .agent(&config.model)
        .preamble(POST_PROMPT)
        .temperature(0.7)
        .build();
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigGenerator {
        agent,
        provider: "openai",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_carries_subject_and_body() {
        let msg = build_user_message("Release notes", "We shipped v2.");
        assert!(msg.contains("件名: Release notes"));
        assert!(msg.contains("本文: We shipped v2."));
    }

    #[tokio::test]
    async fn create_generator_constructs_without_network() {
        // rig-core clients accept any string as API key at construction time;
        // auth failures only surface on the first request.
        let config = LlmConfig {
            backend: LlmBackend::Anthropic,
            api_key: secrecy::SecretString::from("test-key"),
            model: "claude-sonnet-4-20250514".to_string(),
        };
        assert!(create_generator(&config).is_ok());
    }

    #[tokio::test]
    async fn create_openai_generator_constructs() {
        let config = LlmConfig {
            backend: LlmBackend::OpenAi,
            api_key: secrecy::SecretString::from("sk-test"),
            model: "gpt-4o".to_string(),
        };
        assert!(create_generator(&config).is_ok());
    }
}
