use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use repeater_proto::{DiscoveryView, ErrorCode};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::error::{code_from_reqwest, WithErrorCode};

#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    #[error("discovery {0} was not found")]
    NotFound(String),
    #[error("status api returned HTTP {0}")]
    Status(u16),
    #[error("{message}")]
    Network {
        code: Option<ErrorCode>,
        message: String,
    },
    #[error("invalid status api response: {0}")]
    Decode(String),
    #[error("invalid status api url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl DiscoveryError {
    /// Server-side failures and transient network conditions.
    pub fn is_retryable(&self) -> bool {
        match self {
            DiscoveryError::Status(status) => *status >= 500,
            DiscoveryError::Network { code, .. } => {
                code.as_ref().map_or(false, ErrorCode::is_transient)
            }
            _ => false,
        }
    }
}

impl WithErrorCode for DiscoveryError {
    fn error_code(&self) -> Option<ErrorCode> {
        match self {
            DiscoveryError::Network { code, .. } => code.clone(),
            DiscoveryError::InvalidUrl { .. } => Some(ErrorCode::InvalidUrl),
            _ => None,
        }
    }
}

#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn get_discovery(
        &self,
        project_id: &str,
        discovery_id: &str,
    ) -> Result<DiscoveryView, DiscoveryError>;
}

/// Status API over HTTP, authenticated with an api key.
pub struct HttpDiscoveryClient {
    base: Url,
    token: String,
    client: reqwest::Client,
}

impl HttpDiscoveryClient {
    pub fn new(api: &str, token: impl Into<String>) -> Result<Self, DiscoveryError> {
        let invalid = |reason: String| DiscoveryError::InvalidUrl {
            url: api.to_string(),
            reason,
        };
        let normalized = if api.ends_with('/') {
            api.to_string()
        } else {
            format!("{api}/")
        };
        let base = Url::parse(&normalized).map_err(|err| invalid(err.to_string()))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| invalid(err.to_string()))?;
        Ok(Self {
            base,
            token: token.into(),
            client,
        })
    }

    fn endpoint(&self, project_id: &str, discovery_id: &str) -> Result<Url, DiscoveryError> {
        self.base
            .join(&format!(
                "api/v2/projects/{project_id}/discoveries/{discovery_id}"
            ))
            .map_err(|err| DiscoveryError::InvalidUrl {
                url: self.base.to_string(),
                reason: err.to_string(),
            })
    }
}

#[async_trait]
impl DiscoveryClient for HttpDiscoveryClient {
    async fn get_discovery(
        &self,
        project_id: &str,
        discovery_id: &str,
    ) -> Result<DiscoveryView, DiscoveryError> {
        let endpoint = self.endpoint(project_id, discovery_id)?;
        let response = self
            .client
            .get(endpoint)
            .header(AUTHORIZATION, format!("api-key {}", self.token))
            .send()
            .await
            .map_err(|err| DiscoveryError::Network {
                code: code_from_reqwest(&err),
                message: err.to_string(),
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(DiscoveryError::NotFound(discovery_id.to_string())),
            status if !status.is_success() => return Err(DiscoveryError::Status(status.as_u16())),
            _ => {}
        }
        response
            .json::<DiscoveryView>()
            .await
            .map_err(|err| DiscoveryError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_api_prefix() {
        let client = HttpDiscoveryClient::new("https://app.example/scanner", "key").unwrap();
        assert_eq!(
            client.endpoint("p1", "d1").unwrap().as_str(),
            "https://app.example/scanner/api/v2/projects/p1/discoveries/d1"
        );
    }

    #[test]
    fn only_server_and_transient_failures_retry() {
        assert!(DiscoveryError::Status(503).is_retryable());
        assert!(!DiscoveryError::Status(401).is_retryable());
        assert!(!DiscoveryError::NotFound("d1".into()).is_retryable());
        assert!(DiscoveryError::Network {
            code: Some(ErrorCode::ConnectionReset),
            message: "reset".into(),
        }
        .is_retryable());
        assert!(!DiscoveryError::Network {
            code: Some(ErrorCode::DnsNotFound),
            message: "no such host".into(),
        }
        .is_retryable());
    }
}
