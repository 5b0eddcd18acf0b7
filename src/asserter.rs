//! Token assertion: turn a bearer token into principals through an
//! external identity webhook.
//!
//! The asserter is an injected dependency of the engine, never a global.
//! A webhook client is provided; anything implementing [`TokenAsserter`]
//! works, which is what tests use.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::api::Principal;
use crate::errors::PdpError;
use crate::settings;

/// Header names of the assertion webhook contract.
pub const TOKEN_HEADER: &str = "x-token";
pub const IDP_TYPE_HEADER: &str = "x-idp";
pub const ALLOWED_IDD_HEADER: &str = "x-allowedIDD";
pub const REQUEST_HEADER_KEYS: &str = "x-ecid";

#[async_trait]
pub trait TokenAsserter: Send + Sync {
    /// Assert a token and return the principals it represents.
    async fn assert_token(
        &self,
        token: &str,
        token_type: &str,
        allowed_idd: Option<&str>,
        extra_headers: &HashMap<String, String>,
    ) -> Result<Vec<Principal>, PdpError>;
}

#[derive(Debug, Deserialize)]
struct AssertResponse {
    #[serde(default)]
    principals: Vec<Principal>,
    #[serde(default, rename = "errCode")]
    err_code: i64,
    #[serde(default, rename = "errMessage")]
    err_message: String,
}

/// Webhook implementation of [`TokenAsserter`].
#[derive(Debug)]
pub struct WebhookAsserter {
    endpoint: String,
    allowed_idd: Option<String>,
    client: reqwest::Client,
}

impl WebhookAsserter {
    pub fn new(settings: &settings::Asserter) -> Result<Self, PdpError> {
        if settings.endpoint.is_empty() {
            return Err(PdpError::Assertion("asserter endpoint is empty".into()));
        }
        let timeout = if settings.timeout_secs == 0 {
            10
        } else {
            settings.timeout_secs
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| PdpError::Assertion(e.to_string()))?;
        Ok(Self {
            endpoint: settings.endpoint.to_lowercase(),
            allowed_idd: settings.allowed_idd.clone(),
            client,
        })
    }
}

#[async_trait]
impl TokenAsserter for WebhookAsserter {
    async fn assert_token(
        &self,
        token: &str,
        token_type: &str,
        allowed_idd: Option<&str>,
        extra_headers: &HashMap<String, String>,
    ) -> Result<Vec<Principal>, PdpError> {
        if token.is_empty() {
            return Err(PdpError::Assertion("token is empty".into()));
        }

        let mut request = self
            .client
            .get(&self.endpoint)
            .header(TOKEN_HEADER, token)
            .header(IDP_TYPE_HEADER, token_type);

        let idd = allowed_idd.or(self.allowed_idd.as_deref());
        if let Some(idd) = idd.filter(|i| !i.is_empty()) {
            request = request.header(ALLOWED_IDD_HEADER, idd);
        }
        if !extra_headers.is_empty() {
            let mut keys: Vec<&str> = extra_headers.keys().map(String::as_str).collect();
            keys.sort();
            for key in &keys {
                request = request.header(*key, &extra_headers[*key]);
            }
            request = request.header(REQUEST_HEADER_KEYS, keys.join(","));
        }

        let response = request
            .send()
            .await
            .map_err(|e| PdpError::Assertion(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PdpError::Assertion(format!(
                "asserter returned status {status}"
            )));
        }
        let body: AssertResponse = response
            .json()
            .await
            .map_err(|e| PdpError::Assertion(e.to_string()))?;
        if body.err_code != 0 {
            return Err(PdpError::Assertion(format!(
                "errCode: {}, errMessage: {}",
                body.err_code, body.err_message
            )));
        }
        tracing::debug!(principals = body.principals.len(), "token asserted");
        Ok(body.principals)
    }
}
