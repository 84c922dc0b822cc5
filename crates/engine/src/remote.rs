//! HTTP collaborators for a storefront platform API.
//!
//! Uses `ureq` (sync) wrapped in `tokio::task::spawn_blocking` to avoid
//! blocking the async runtime. Endpoints, relative to `base_url`:
//!
//! - `POST /merchants/{id}/actions/capture`  `{opportunity}` -> prior state
//! - `POST /merchants/{id}/actions/apply`    `{opportunity}` -> receipt
//! - `POST /merchants/{id}/actions/revert`   `{opportunity, prior_state}`
//! - `GET  /merchants/{id}/opportunities`    -> ranked `[Opportunity]`
//! - `GET  /merchants/{id}/readiness`        -> `"ready"` or `{"readiness": "ready"}`
//!
//! The bearer token comes from the caller or the `NEXTMOVE_STOREFRONT_TOKEN`
//! env var.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::connector::{ConnectorError, StorefrontConnector};
use crate::readiness::{Readiness, ReadinessGate};
use crate::source::{OpportunitySource, SourceError};
use crate::types::Opportunity;

pub const TOKEN_ENV: &str = "NEXTMOVE_STOREFRONT_TOKEN";

/// Connection settings shared by the HTTP collaborators.
#[derive(Debug, Clone)]
pub struct PlatformClient {
    base_url: String,
    auth_token: Option<String>,
}

/// Failure of a single platform call.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CallError {
    /// The platform answered with an error status.
    Status(u16),
    /// Transport, decoding, or task failure.
    Transport(String),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Status(code) => write!(f, "HTTP {}", code),
            CallError::Transport(msg) => f.write_str(msg),
        }
    }
}

impl From<CallError> for ConnectorError {
    /// Client errors mean the platform refused the change; timeouts, rate
    /// limits and server errors are worth retrying.
    fn from(err: CallError) -> Self {
        match &err {
            CallError::Status(code) if (400..500).contains(code) && *code != 408 && *code != 429 => {
                ConnectorError::Rejected(err.to_string())
            }
            _ => ConnectorError::Unavailable(err.to_string()),
        }
    }
}

impl PlatformClient {
    /// Falls back to `NEXTMOVE_STOREFRONT_TOKEN` when `auth_token` is `None`.
    pub fn new(base_url: &str, auth_token: Option<String>) -> Self {
        let auth_token = auth_token.or_else(|| std::env::var(TOKEN_ENV).ok());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    fn merchant_url(&self, merchant_id: &str, path: &str) -> String {
        format!("{}/merchants/{}/{}", self.base_url, merchant_id, path)
    }

    async fn get(&self, url: String) -> Result<Value, CallError> {
        let auth_token = self.auth_token.clone();
        tokio::task::spawn_blocking(move || {
            let agent = ureq::Agent::new_with_defaults();
            let mut request = agent.get(&url);
            if let Some(ref token) = auth_token {
                request = request.header("Authorization", &format!("Bearer {}", token));
            }
            let response = request.call().map_err(call_error)?;
            response
                .into_body()
                .read_json::<Value>()
                .map_err(|e| CallError::Transport(format!("invalid JSON response: {}", e)))
        })
        .await
        .map_err(|e| CallError::Transport(format!("task join error: {}", e)))?
    }

    async fn post(&self, url: String, body: Value) -> Result<Value, CallError> {
        let auth_token = self.auth_token.clone();
        tokio::task::spawn_blocking(move || {
            let agent = ureq::Agent::new_with_defaults();
            let mut request = agent.post(&url);
            if let Some(ref token) = auth_token {
                request = request.header("Authorization", &format!("Bearer {}", token));
            }
            let response = request.send_json(&body).map_err(call_error)?;
            // Some endpoints answer 204 with no body.
            Ok(response
                .into_body()
                .read_json::<Value>()
                .unwrap_or(Value::Null))
        })
        .await
        .map_err(|e| CallError::Transport(format!("task join error: {}", e)))?
    }
}

fn call_error(err: ureq::Error) -> CallError {
    match err {
        ureq::Error::StatusCode(code) => CallError::Status(code),
        other => CallError::Transport(other.to_string()),
    }
}

/// Parse a readiness response: a bare string or `{"readiness": ...}`.
fn parse_readiness(value: &Value) -> Option<Readiness> {
    let raw = match value {
        Value::Object(map) => map.get("readiness")?.clone(),
        other => other.clone(),
    };
    serde_json::from_value(raw).ok()
}

// ──────────────────────────────────────────────
// Collaborators
// ──────────────────────────────────────────────

/// Storefront connector backed by the platform API.
#[derive(Debug, Clone)]
pub struct HttpStorefront {
    client: PlatformClient,
}

impl HttpStorefront {
    pub fn new(client: PlatformClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StorefrontConnector for HttpStorefront {
    async fn capture(
        &self,
        merchant_id: &str,
        opportunity: &Opportunity,
    ) -> Result<Value, ConnectorError> {
        let url = self.client.merchant_url(merchant_id, "actions/capture");
        Ok(self
            .client
            .post(url, json!({ "opportunity": opportunity }))
            .await?)
    }

    async fn apply(
        &self,
        merchant_id: &str,
        opportunity: &Opportunity,
    ) -> Result<Value, ConnectorError> {
        let url = self.client.merchant_url(merchant_id, "actions/apply");
        Ok(self
            .client
            .post(url, json!({ "opportunity": opportunity }))
            .await?)
    }

    async fn revert(
        &self,
        merchant_id: &str,
        opportunity: &Opportunity,
        prior_state: &Value,
    ) -> Result<(), ConnectorError> {
        let url = self.client.merchant_url(merchant_id, "actions/revert");
        self.client
            .post(
                url,
                json!({ "opportunity": opportunity, "prior_state": prior_state }),
            )
            .await?;
        Ok(())
    }
}

/// Opportunity feed pulled from the platform.
#[derive(Debug, Clone)]
pub struct HttpOpportunitySource {
    client: PlatformClient,
}

impl HttpOpportunitySource {
    pub fn new(client: PlatformClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OpportunitySource for HttpOpportunitySource {
    async fn opportunities(&self, merchant_id: &str) -> Result<Vec<Opportunity>, SourceError> {
        let url = self.client.merchant_url(merchant_id, "opportunities");
        let value = self
            .client
            .get(url)
            .await
            .map_err(|e| SourceError::Provider(e.to_string()))?;
        serde_json::from_value(value)
            .map_err(|e| SourceError::Provider(format!("malformed opportunity feed: {}", e)))
    }
}

/// Readiness pulled from the platform. Any failure reads as
/// `not_connected`.
#[derive(Debug, Clone)]
pub struct HttpReadinessGate {
    client: PlatformClient,
}

impl HttpReadinessGate {
    pub fn new(client: PlatformClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReadinessGate for HttpReadinessGate {
    async fn readiness(&self, merchant_id: &str) -> Readiness {
        let url = self.client.merchant_url(merchant_id, "readiness");
        match self.client.get(url).await {
            Ok(value) => parse_readiness(&value).unwrap_or_else(|| {
                warn!(merchant_id, %value, "unrecognized readiness response");
                Readiness::NotConnected
            }),
            Err(e) => {
                warn!(merchant_id, error = %e, "readiness check failed");
                Readiness::NotConnected
            }
        }
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merchant_url_joins_segments() {
        let client = PlatformClient::new("https://shop.example/api/", Some("t".to_string()));
        assert_eq!(
            client.merchant_url("m1", "actions/apply"),
            "https://shop.example/api/merchants/m1/actions/apply"
        );
    }

    #[test]
    fn explicit_token_wins() {
        let client = PlatformClient::new("https://shop.example", Some("my-token".to_string()));
        assert_eq!(client.auth_token, Some("my-token".to_string()));
    }

    #[test]
    fn status_codes_map_to_retryability() {
        let rejected = ConnectorError::from(CallError::Status(422));
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.to_string(), "storefront rejected the change: HTTP 422");

        assert!(ConnectorError::from(CallError::Status(503)).is_retryable());
        assert!(ConnectorError::from(CallError::Status(429)).is_retryable());
        assert!(ConnectorError::from(CallError::Transport("connection refused".to_string()))
            .is_retryable());
    }

    #[test]
    fn readiness_accepts_both_shapes() {
        assert_eq!(parse_readiness(&json!("ready")), Some(Readiness::Ready));
        assert_eq!(
            parse_readiness(&json!({"readiness": "warming_up"})),
            Some(Readiness::WarmingUp)
        );
        assert_eq!(parse_readiness(&json!({"state": "ready"})), None);
        assert_eq!(parse_readiness(&json!("syncing")), None);
    }

    #[tokio::test]
    async fn unreachable_platform_reads_not_connected() {
        let gate = HttpReadinessGate::new(PlatformClient::new("http://127.0.0.1:1", None));
        assert_eq!(gate.readiness("m1").await, Readiness::NotConnected);
    }
}
