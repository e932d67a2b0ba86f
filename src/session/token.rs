//! Bearer token acquisition
//!
//! Every connect attempt exchanges the configured API key for a fresh access
//! token at an IAM-style endpoint (`grant_type=...:apikey`).

use crate::error::TokenError;
use serde::Deserialize;
use std::time::Duration;

const GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Source of bearer tokens for the session server
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<String, TokenError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Token provider posting the API key to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct IamTokenProvider {
    url: String,
    api_key: String,
    timeout: Duration,
}

impl IamTokenProvider {
    pub fn new(url: &str, api_key: &str) -> Self {
        Self {
            url: url.to_string(),
            api_key: api_key.to_string(),
            timeout: REQUEST_TIMEOUT,
        }
    }

    fn request_token(&self) -> Result<String, TokenError> {
        let response = ureq::post(&self.url)
            .timeout(self.timeout)
            .set("Accept", "application/json")
            .set("Cache-Control", "no-cache")
            .send_form(&[("apikey", self.api_key.as_str()), ("grant_type", GRANT_TYPE)])
            .map_err(|e| match e {
                ureq::Error::Status(status, _) => classify_status(status),
                ureq::Error::Transport(t) => TokenError::Connection(t.to_string()),
            })?;

        let body: TokenResponse = response.into_json().map_err(|e| {
            TokenError::Connection(format!("Could not process token response: {}", e))
        })?;

        Ok(body.access_token)
    }
}

/// Map an HTTP error status from the token endpoint
fn classify_status(status: u16) -> TokenError {
    match status {
        400 | 404 => TokenError::Authentication { status },
        other => TokenError::Connection(format!("Token endpoint returned HTTP {}", other)),
    }
}

#[async_trait::async_trait]
impl TokenProvider for IamTokenProvider {
    async fn fetch_token(&self) -> Result<String, TokenError> {
        let provider = self.clone();
        tokio::task::spawn_blocking(move || provider.request_token())
            .await
            .map_err(|e| TokenError::Connection(format!("Token request task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(400),
            TokenError::Authentication { status: 400 }
        ));
        assert!(matches!(
            classify_status(404),
            TokenError::Authentication { status: 404 }
        ));
        assert!(matches!(classify_status(503), TokenError::Connection(_)));
    }

    #[test]
    fn test_token_response_parses() {
        let body: TokenResponse =
            serde_json::from_str(r#"{"access_token":"abc","expires_in":3600}"#).unwrap();
        assert_eq!(body.access_token, "abc");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_error() {
        let mut provider = IamTokenProvider::new("http://127.0.0.1:9/token", "key");
        provider.timeout = Duration::from_secs(2);
        let err = provider.fetch_token().await.unwrap_err();
        assert!(matches!(err, TokenError::Connection(_)));
    }
}
