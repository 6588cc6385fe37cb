//! HTTP client for the agent's API.

use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::types::{excerpt, AgentError, ProviderCatalog, ERROR_EXCERPT_CHARS};

#[derive(Debug, Deserialize)]
struct CreatedSession {
    id: String,
}

pub struct AgentApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl AgentApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /session`; returns the new remote session id.
    pub async fn create_session(&self, title: &str) -> Result<String, AgentError> {
        let url = format!("{}/session", self.base_url);
        log::debug!("Creating remote session '{}'", excerpt(title, 50));

        let response = self.http.post(&url).json(&json!({ "title": title })).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Api {
                status: status.as_u16(),
                body: excerpt(&body, ERROR_EXCERPT_CHARS),
            });
        }

        let created: CreatedSession = response
            .json()
            .await
            .map_err(|e| AgentError::InvalidResponse(format!("session response: {}", e)))?;
        if created.id.is_empty() {
            return Err(AgentError::InvalidResponse("empty session id".to_string()));
        }
        log::debug!("Remote session {} created", created.id);
        Ok(created.id)
    }

    /// `GET /provider`.
    pub async fn providers(&self) -> Result<ProviderCatalog, AgentError> {
        let url = format!("{}/provider", self.base_url);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Api {
                status: status.as_u16(),
                body: excerpt(&body, ERROR_EXCERPT_CHARS),
            });
        }

        let catalog: ProviderCatalog = response
            .json()
            .await
            .map_err(|e| AgentError::InvalidResponse(format!("provider response: {}", e)))?;
        log::info!(
            "Got providers: all={}, connected={:?}",
            catalog.all.len(),
            catalog.connected
        );
        Ok(catalog)
    }
}
