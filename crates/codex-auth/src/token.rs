//! OAuth token refresh
//!
//! `TokenRefresher` is the seam the account pool calls when an access token is
//! close to expiry. The HTTP implementation POSTs a `refresh_token` grant to
//! `TOKEN_ENDPOINT`. Failures are reported as data, not errors: the pool only
//! needs a reason string to count the failure and to spot revoked grants.

use std::future::Future;
use std::pin::Pin;

use common::{Clock, Secret};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{CODEX_CLIENT_ID, REFRESH_SCOPES, TOKEN_ENDPOINT};
use crate::error::{Error, Result};

/// Response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time. Some refreshes
/// omit `refresh_token`, in which case the previous one stays valid.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
}

/// Fresh credentials after a successful refresh.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access: Secret<String>,
    pub refresh: Secret<String>,
    /// Expiration as unix timestamp in milliseconds
    pub expires: u64,
}

/// Outcome of one refresh attempt.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Success(TokenSet),
    Failed { reason: String },
}

/// Credential refresh collaborator.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn TokenRefresher>`).
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = RefreshOutcome> + Send + 'a>>;
}

/// Refreshes tokens against the OAuth token endpoint.
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    endpoint: String,
    clock: Clock,
}

impl HttpTokenRefresher {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoint(client, TOKEN_ENDPOINT.to_string(), Clock::System)
    }

    pub fn with_endpoint(client: reqwest::Client, endpoint: String, clock: Clock) -> Self {
        Self {
            client,
            endpoint,
            clock,
        }
    }

    /// POST the refresh grant and decode the token response.
    async fn request_refresh(&self, refresh: &str) -> Result<TokenResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh),
                ("client_id", CODEX_CLIENT_ID),
                ("scope", REFRESH_SCOPES),
            ])
            .send()
            .await
            .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 401/403 means the refresh token is revoked or invalid
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(Error::InvalidCredentials(format!(
                    "refresh token rejected ({status}): {body}"
                )));
            }

            return Err(Error::Refresh(format!(
                "token refresh returned {status}: {body}"
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::Refresh(format!("invalid refresh response: {e}")))
    }
}

impl TokenRefresher for HttpTokenRefresher {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = RefreshOutcome> + Send + 'a>> {
        Box::pin(async move {
            match self.request_refresh(refresh_token).await {
                Ok(token) => {
                    let expires = self
                        .clock
                        .now_millis()
                        .saturating_add(token.expires_in.saturating_mul(1000));
                    debug!(expires, "token endpoint returned fresh credentials");
                    RefreshOutcome::Success(TokenSet {
                        access: Secret::new(token.access_token),
                        refresh: Secret::new(
                            token
                                .refresh_token
                                .unwrap_or_else(|| refresh_token.to_string()),
                        ),
                        expires,
                    })
                }
                Err(e) => RefreshOutcome::Failed {
                    reason: e.to_string(),
                },
            }
        })
    }
}
