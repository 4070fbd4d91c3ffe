//! Token issuance: login and refresh against an OAuth2 token endpoint
//!
//! `TokenIssuer` is the seam to the external authorization server. The
//! session layer only ever calls it through the trait, so tests substitute
//! scripted issuers and deployments can plug in other grant types.
//!
//! `HttpTokenIssuer` POSTs form-encoded requests to a single token endpoint:
//! 1. `grant_type=password` for an interactive login
//! 2. `grant_type=refresh_token` for a refresh

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credential::{Credential, now_millis};
use crate::error::{Error, Result};
use crate::kv::BoxFuture;

/// The external collaborator that mints credentials.
///
/// `refresh` must report a rejected refresh secret as
/// `Error::InvalidCredentials` so callers can tell it apart from a
/// transient failure.
pub trait TokenIssuer: Send + Sync {
    /// Exchange user-supplied secrets for a credential.
    fn login<'a>(
        &'a self,
        username: &'a str,
        password: &'a Secret<String>,
    ) -> BoxFuture<'a, Result<Credential>>;

    /// Trade a refresh secret for a new credential.
    fn refresh<'a>(&'a self, refresh: &'a Secret<String>) -> BoxFuture<'a, Result<Credential>>;
}

/// Response from the token endpoint for both login and refresh.
///
/// `expires_in` is a delta in seconds from the response time. Some issuers
/// omit `refresh_token` on refresh when they do not rotate it.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
}

impl TokenResponse {
    /// Convert to an absolute credential.
    ///
    /// Without a rotated refresh token the `previous` refresh secret is kept.
    pub fn into_credential(self, now: u64, previous: Option<&Secret<String>>) -> Result<Credential> {
        let refresh = match (self.refresh_token, previous) {
            (Some(rotated), _) => Secret::new(rotated),
            (None, Some(previous)) => previous.clone(),
            (None, None) => {
                return Err(Error::TokenExchange(
                    "token response carried no refresh_token".into(),
                ));
            }
        };
        Ok(Credential {
            access: Secret::new(self.access_token),
            refresh,
            expires_at: now.saturating_add(self.expires_in.saturating_mul(1000)),
        })
    }
}

/// OAuth2 token endpoint client.
pub struct HttpTokenIssuer {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<Secret<String>>,
}

impl HttpTokenIssuer {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<Secret<String>>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }

    async fn post_form(&self, form: &[(&str, &str)], what: &str) -> Result<TokenResponse> {
        let mut params: Vec<(&str, &str)> = form.to_vec();
        params.push(("client_id", self.client_id.as_str()));
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.expose().as_str()));
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Http(format!("{what} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 400 is invalid_grant per RFC 6749 section 5.2; 401/403 are
            // revoked or unknown secrets
            if matches!(status.as_u16(), 400 | 401 | 403) {
                return Err(Error::InvalidCredentials(format!(
                    "{what} rejected ({status}): {body}"
                )));
            }

            return Err(Error::TokenExchange(format!(
                "{what} returned {status}: {body}"
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid {what} response: {e}")))
    }
}

impl TokenIssuer for HttpTokenIssuer {
    fn login<'a>(
        &'a self,
        username: &'a str,
        password: &'a Secret<String>,
    ) -> BoxFuture<'a, Result<Credential>> {
        Box::pin(async move {
            let response = self
                .post_form(
                    &[
                        ("grant_type", "password"),
                        ("username", username),
                        ("password", password.expose().as_str()),
                    ],
                    "login",
                )
                .await?;
            debug!(username, expires_in = response.expires_in, "login succeeded");
            response.into_credential(now_millis(), None)
        })
    }

    fn refresh<'a>(&'a self, refresh: &'a Secret<String>) -> BoxFuture<'a, Result<Credential>> {
        Box::pin(async move {
            let response = self
                .post_form(
                    &[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh.expose().as_str()),
                    ],
                    "token refresh",
                )
                .await?;
            debug!(expires_in = response.expires_in, "token refresh succeeded");
            response.into_credential(now_millis(), Some(refresh))
        })
    }
}
