//! Authentication for MCP endpoints.
//!
//! Bearer tokens are attached as-is. OAuth2 client-credentials tokens are
//! fetched on demand from the token endpoint and cached per endpoint with a
//! 60-second safety margin before expiry. Header values are handed to the
//! connection that needs them and nowhere else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

use super::handle::McpAuth;

/// Safety margin subtracted from token lifetimes.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// A token grant from the OAuth endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    /// The bearer token.
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

/// Fetches client-credentials tokens. The default implementation posts to
/// the token endpoint over HTTP; tests substitute a scripted fetcher.
#[async_trait::async_trait]
pub trait TokenFetcher: Send + Sync {
    /// Exchange client credentials for a token.
    async fn fetch(
        &self,
        client_id: &str,
        client_secret: &str,
        token_endpoint: &str,
    ) -> Result<TokenGrant>;
}

/// HTTP-backed token fetcher.
#[derive(Debug, Default)]
pub struct HttpTokenFetcher {
    client: reqwest::Client,
}

#[async_trait::async_trait]
impl TokenFetcher for HttpTokenFetcher {
    async fn fetch(
        &self,
        client_id: &str,
        client_secret: &str,
        token_endpoint: &str,
    ) -> Result<TokenGrant> {
        let response = self
            .client
            .post(token_endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await
            .map_err(|e| {
                Error::mcp_connection(format!("token endpoint '{token_endpoint}' unreachable: {e}"))
            })?;

        let status = response.status();
        if status.is_client_error() {
            // Bad credentials or a bad request will not get better on retry.
            return Err(Error::mcp_misconfigured(format!(
                "token endpoint '{token_endpoint}' rejected credentials ({status})"
            )));
        }
        if !status.is_success() {
            return Err(Error::mcp_connection(format!(
                "token endpoint '{token_endpoint}' returned {status}"
            )));
        }

        response.json::<TokenGrant>().await.map_err(|e| {
            Error::mcp_connection(format!("invalid token response from '{token_endpoint}': {e}"))
        })
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_live(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

/// Acquires and caches authorization header values for MCP endpoints.
pub struct AuthManager {
    fetcher: Arc<dyn TokenFetcher>,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("cached", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for AuthManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthManager {
    /// Create a manager with the HTTP token fetcher.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fetcher(Arc::new(HttpTokenFetcher::default()))
    }

    /// Create a manager with a custom token fetcher.
    #[must_use]
    pub fn with_fetcher(fetcher: Arc<dyn TokenFetcher>) -> Self {
        Self {
            fetcher,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the `Authorization` header value for the given auth config.
    pub async fn authorization_header(&self, auth: &McpAuth) -> Result<String> {
        match auth {
            McpAuth::Bearer { token } => Ok(format!("Bearer {token}")),
            McpAuth::OAuth2 {
                client_id,
                client_secret,
                token_endpoint,
            } => {
                if let Some(cached) = self.cache.lock().get(token_endpoint) {
                    if cached.is_live() {
                        return Ok(format!("Bearer {}", cached.token));
                    }
                }

                let grant = self
                    .fetcher
                    .fetch(client_id, client_secret, token_endpoint)
                    .await?;
                debug!(endpoint = %token_endpoint, expires_in = grant.expires_in, "issued OAuth token");

                let token = grant.access_token.clone();
                self.cache.lock().insert(
                    token_endpoint.clone(),
                    CachedToken {
                        token: grant.access_token,
                        expires_at: Instant::now() + Duration::from_secs(grant.expires_in),
                    },
                );
                Ok(format!("Bearer {token}"))
            }
        }
    }

    /// Number of cached tokens (live or expired).
    #[must_use]
    pub fn cached_tokens(&self) -> usize {
        self.cache.lock().len()
    }
}
