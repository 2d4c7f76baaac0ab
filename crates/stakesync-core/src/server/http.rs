//! HTTP sync server client.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use super::{PullPage, PushOutcome, SyncServer};
use crate::error::{Error, Result, TransportError};
use crate::models::QueuedMutation;
use crate::util::{non_blank, parse_server_url};

const MAX_ERROR_BODY_CHARS: usize = 180;

/// JSON-over-HTTP implementation of [`SyncServer`]
#[derive(Clone)]
pub struct HttpSyncServer {
    base_url: String,
    api_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpSyncServer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpSyncServer")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpSyncServer {
    pub fn new(
        base_url: impl AsRef<str>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = normalize_base_url(base_url.as_ref())?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Config(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            base_url,
            api_token: non_blank(api_token),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl SyncServer for HttpSyncServer {
    async fn push(&self, mutation: &QueuedMutation) -> std::result::Result<PushOutcome, TransportError> {
        let response = self
            .authorize(self.client.post(format!("{}/v1/sync/push", self.base_url)))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(mutation)
            .send()
            .await?;

        let response = ensure_success(response).await?;
        let outcome = response.json::<PushOutcome>().await?;
        tracing::debug!("Server answered push of {}: {:?}", mutation.id, outcome);
        Ok(outcome)
    }

    async fn pull(
        &self,
        entity_type: &str,
        since: i64,
    ) -> std::result::Result<PullPage, TransportError> {
        let response = self
            .authorize(self.client.get(format!("{}/v1/sync/pull", self.base_url)))
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[("type", entity_type.to_string()), ("since", since.to_string())])
            .send()
            .await?;

        let response = ensure_success(response).await?;
        let page = response.json::<PullPage>().await?;
        tracing::debug!(
            "Pulled {} '{}' records (cursor {} -> {})",
            page.records.len(),
            entity_type,
            since,
            page.cursor
        );
        Ok(page)
    }
}

async fn ensure_success(
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, TransportError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Http {
        status: status.as_u16(),
        message: parse_api_error(status, &body),
    })
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return message.trim().to_string();
        }
    }

    let trimmed: String = body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed
    }
}

fn normalize_base_url(raw: &str) -> Result<String> {
    parse_server_url(raw).map_err(|reason| Error::Config(format!("sync {reason}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_url_rejects_invalid_values() {
        assert!(normalize_base_url("").is_err());
        assert!(normalize_base_url("sync.example.com").is_err());
    }

    #[test]
    fn normalize_base_url_trims_trailing_slash() {
        assert_eq!(
            normalize_base_url(" https://sync.example.com/ ").unwrap(),
            "https://sync.example.com"
        );
    }

    #[test]
    fn parse_api_error_prefers_json_message() {
        let message = parse_api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"error":"busy","message":"try again later"}"#,
        );
        assert_eq!(message, "try again later");
    }

    #[test]
    fn parse_api_error_falls_back_to_status_reason() {
        let message = parse_api_error(StatusCode::BAD_GATEWAY, "   ");
        assert_eq!(message, "Bad Gateway");
    }

    #[test]
    fn debug_redacts_api_token() {
        let server = HttpSyncServer::new(
            "https://sync.example.com",
            Some("secret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        let debug = format!("{server:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
