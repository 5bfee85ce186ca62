//! Mailbox collaborator — Gmail-style REST API over reqwest.
//!
//! The pipeline only needs three operations: list message ids newer than a
//! watermark, fetch one full message, and renew the push-notification watch.
//! Credentials are resolved at `connect()` time by exchanging a long-lived
//! refresh token for a short-lived access token, so each stage invocation
//! gets a freshly scoped capability handle.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ConfigError, MailboxError};

// ── Domain types ────────────────────────────────────────────────────

/// A fetched mailbox message, reduced to what the pipeline ingests.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
}

/// Result of a watch renewal.
#[derive(Debug, Clone)]
pub struct WatchRenewal {
    pub expires_at: DateTime<Utc>,
    pub history_cursor: Option<String>,
}

/// Mailbox query collaborator.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// List identifiers of messages received strictly after the watermark.
    async fn list_message_ids(
        &self,
        newer_than: DateTime<Utc>,
    ) -> Result<Vec<String>, MailboxError>;

    /// Fetch a full message by identifier.
    async fn fetch_message(&self, id: &str) -> Result<MailMessage, MailboxError>;

    /// Re-register the push-notification watch, resetting its expiry.
    async fn renew_watch(&self) -> Result<WatchRenewal, MailboxError>;
}

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub api_base: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub refresh_token: SecretString,
    /// `to:` filter appended to every list query.
    pub recipient_filter: String,
    pub max_results: u32,
    pub watch_labels: Vec<String>,
    /// Pub/sub topic for the watch. Renewal is disabled when unset.
    pub watch_topic: Option<String>,
}

impl MailboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id = require_env("MAILBOX_CLIENT_ID")?;
        let client_secret = SecretString::from(require_env("MAILBOX_CLIENT_SECRET")?);
        let refresh_token = SecretString::from(require_env("MAILBOX_REFRESH_TOKEN")?);
        let recipient_filter = require_env("MAILBOX_RECIPIENT_FILTER")?;

        let api_base = std::env::var("MAILBOX_API_BASE")
            .unwrap_or_else(|_| "https://gmail.googleapis.com/gmail/v1".to_string());
        let token_url = std::env::var("MAILBOX_TOKEN_URL")
            .unwrap_or_else(|_| "https://oauth2.googleapis.com/token".to_string());

        let max_results: u32 = std::env::var("MAILBOX_MAX_RESULTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let watch_labels: Vec<String> = std::env::var("MAILBOX_WATCH_LABELS")
            .unwrap_or_else(|_| "INBOX".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let watch_topic = std::env::var("MAILBOX_WATCH_TOPIC").ok();

        Ok(Self {
            api_base,
            token_url,
            client_id,
            client_secret,
            refresh_token,
            recipient_filter,
            max_results,
            watch_labels,
            watch_topic,
        })
    }
}

fn require_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

// ── REST client ─────────────────────────────────────────────────────

/// Gmail-style mailbox client.
pub struct GmailMailbox {
    http: reqwest::Client,
    access_token: SecretString,
    config: MailboxConfig,
}

impl GmailMailbox {
    /// Resolve credentials and build a scoped client handle.
    pub async fn connect(config: &MailboxConfig) -> Result<Self, MailboxError> {
        let http = reqwest::Client::new();
        let access_token = resolve_access_token(&http, config).await?;
        Ok(Self {
            http,
            access_token,
            config: config.clone(),
        })
    }
}

/// Exchange the refresh token for a short-lived access token.
async fn resolve_access_token(
    http: &reqwest::Client,
    config: &MailboxConfig,
) -> Result<SecretString, MailboxError> {
    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: String,
    }

    let response = http
        .post(&config.token_url)
        .form(&[
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.expose_secret()),
            ("refresh_token", config.refresh_token.expose_secret()),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await
        .map_err(|e| MailboxError::Http(e.to_string()))?;

    if !response.status().is_success() {
        return Err(MailboxError::Auth(format!(
            "token endpoint returned {}",
            response.status()
        )));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| MailboxError::Auth(format!("malformed token response: {e}")))?;

    Ok(SecretString::from(token.access_token))
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    id: String,
    payload: MessagePart,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MessagePart {
    mime_type: String,
    headers: Vec<Header>,
    body: PartBody,
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartBody {
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    expiration: Option<String>,
    history_id: Option<String>,
}

// ── Parsing helpers ─────────────────────────────────────────────────

/// Provider search query: receive-time strictly after the watermark,
/// limited to the configured recipient.
fn build_search_query(newer_than: DateTime<Utc>, recipient: &str) -> String {
    format!("after:{} to:{}", newer_than.timestamp(), recipient)
}

fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Extract the plain-text body: first `text/plain` part of a multipart
/// message, or the flat body when there is no part structure.
fn extract_body(payload: &MessagePart) -> String {
    if !payload.parts.is_empty() {
        let mut body = String::new();
        for part in &payload.parts {
            if part.mime_type == "text/plain" {
                if let Some(data) = &part.body.data {
                    body.push_str(&decode_body_data(data));
                }
            }
        }
        return body;
    }
    payload
        .body
        .data
        .as_deref()
        .map(decode_body_data)
        .unwrap_or_default()
}

/// URL-safe base64, tolerant of padded and unpadded input; invalid UTF-8
/// is replaced rather than rejected.
fn decode_body_data(data: &str) -> String {
    let bytes = URL_SAFE
        .decode(data)
        .or_else(|_| URL_SAFE_NO_PAD.decode(data))
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// The provider reports watch expiry as a stringified epoch-milliseconds value.
fn parse_expiry_millis(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
}

// ── Mailbox trait ───────────────────────────────────────────────────

#[async_trait]
impl Mailbox for GmailMailbox {
    async fn list_message_ids(
        &self,
        newer_than: DateTime<Utc>,
    ) -> Result<Vec<String>, MailboxError> {
        let query = build_search_query(newer_than, &self.config.recipient_filter);
        debug!(query = %query, "Listing mailbox messages");

        let url = format!("{}/users/me/messages", self.config.api_base);
        let max_results = self.config.max_results.to_string();
        let response = self
            .http
            .get(&url)
            .bearer_auth(self.access_token.expose_secret())
            .query(&[("q", query.as_str()), ("maxResults", max_results.as_str())])
            .send()
            .await
            .map_err(|e| MailboxError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailboxError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let list: ListResponse = response
            .json()
            .await
            .map_err(|e| MailboxError::Http(format!("malformed list response: {e}")))?;

        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn fetch_message(&self, id: &str) -> Result<MailMessage, MailboxError> {
        let url = format!("{}/users/me/messages/{}", self.config.api_base, id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(self.access_token.expose_secret())
            .query(&[("format", "full")])
            .send()
            .await
            .map_err(|e| MailboxError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailboxError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let message: MessageResponse = response.json().await.map_err(|e| MailboxError::Decode {
            id: id.to_string(),
            reason: e.to_string(),
        })?;

        let subject = header_value(&message.payload.headers, "Subject")
            .unwrap_or("No Subject")
            .to_string();
        let sender = header_value(&message.payload.headers, "From")
            .unwrap_or("Unknown")
            .to_string();
        let body = extract_body(&message.payload);

        Ok(MailMessage {
            id: message.id,
            sender,
            subject,
            body,
        })
    }

    async fn renew_watch(&self) -> Result<WatchRenewal, MailboxError> {
        let topic = self
            .config
            .watch_topic
            .as_deref()
            .ok_or_else(|| MailboxError::Auth("no watch topic configured".to_string()))?;

        let url = format!("{}/users/me/watch", self.config.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.access_token.expose_secret())
            .json(&serde_json::json!({
                "labelIds": self.config.watch_labels,
                "topicName": topic,
            }))
            .send()
            .await
            .map_err(|e| MailboxError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailboxError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let watch: WatchResponse = response
            .json()
            .await
            .map_err(|e| MailboxError::Http(format!("malformed watch response: {e}")))?;

        let expires_at = watch
            .expiration
            .as_deref()
            .and_then(parse_expiry_millis)
            .ok_or_else(|| MailboxError::Http("watch response missing expiration".to_string()))?;

        Ok(WatchRenewal {
            expires_at,
            history_cursor: watch.history_id,
        })
    }
}
