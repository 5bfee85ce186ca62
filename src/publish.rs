//! Publish collaborator — posts generated text to the social network.
//!
//! The only behavior the pipeline depends on is the error split: a
//! rate-limit response is non-terminal (the publisher stage re-raises it so
//! the transport redelivers), everything else is a terminal rejection.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::info;

use crate::error::{ConfigError, PublishError};

/// Publish collaborator: text in, external post identifier out.
#[async_trait]
pub trait SocialNetwork: Send + Sync {
    async fn publish(&self, text: &str) -> Result<String, PublishError>;
}

/// Social network configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub api_base: String,
    pub bearer_token: SecretString,
}

impl PublisherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bearer_token = std::env::var("SOCIAL_BEARER_TOKEN")
            .map(SecretString::from)
            .map_err(|_| ConfigError::MissingEnvVar("SOCIAL_BEARER_TOKEN".to_string()))?;

        let api_base = std::env::var("SOCIAL_API_BASE")
            .unwrap_or_else(|_| "https://api.twitter.com".to_string());

        Ok(Self {
            api_base,
            bearer_token,
        })
    }
}

/// REST publisher client.
pub struct HttpPublisher {
    http: reqwest::Client,
    config: PublisherConfig,
}

impl HttpPublisher {
    pub fn new(config: &PublisherConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: config.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    data: Option<PublishedPost>,
}

#[derive(Debug, Deserialize)]
struct PublishedPost {
    id: String,
}

/// Pull the external post id out of a publish response body.
fn parse_publish_response(body: &str) -> Result<String, PublishError> {
    let response: PublishResponse = serde_json::from_str(body)
        .map_err(|e| PublishError::InvalidResponse(e.to_string()))?;
    response
        .data
        .map(|post| post.id)
        .ok_or_else(|| PublishError::InvalidResponse("no data in publish response".to_string()))
}

#[async_trait]
impl SocialNetwork for HttpPublisher {
    async fn publish(&self, text: &str) -> Result<String, PublishError> {
        let url = format!("{}/2/tweets", self.config.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.config.bearer_token.expose_secret())
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| PublishError::Http(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(PublishError::RateLimited);
        }

        let body = response
            .text()
            .await
            .map_err(|e| PublishError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                reason: body,
            });
        }

        let post_id = parse_publish_response(&body)?;
        info!(post_id = %post_id, "Post published");
        Ok(post_id)
    }
}
