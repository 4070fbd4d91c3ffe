//! HTTP adapters for gateway calls
//!
//! Maps a reqwest round trip onto the `CallError` contract: 401 becomes
//! `Unauthorized`, network failures become `Transport`, and every other
//! response (including other error statuses) is handed back untouched for
//! the caller to interpret.

use credential::Credential;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};

use crate::error::CallError;

/// How the gateway treats an upstream status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// The credential was rejected; refresh and retry.
    Unauthorized,
    /// Anything else, returned to the caller as is.
    PassThrough,
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        401 => StatusClass::Unauthorized,
        _ => StatusClass::PassThrough,
    }
}

/// Set `Authorization: Bearer <access>`, replacing any existing value.
///
/// The header is marked sensitive so it is never printed by `Debug`.
pub fn authorize(headers: &mut HeaderMap, credential: &Credential) -> Result<(), CallError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", credential.access.expose()))
        .map_err(|_| CallError::Transport("access secret is not a valid header value".into()))?;
    value.set_sensitive(true);
    headers.insert(AUTHORIZATION, value);
    Ok(())
}

/// Send `request` with `credential` attached.
///
/// A 401 response is consumed and reported as `CallError::Unauthorized`
/// with the response body as the reason.
pub async fn send(
    request: reqwest::RequestBuilder,
    credential: &Credential,
) -> Result<reqwest::Response, CallError> {
    let mut headers = HeaderMap::new();
    authorize(&mut headers, credential)?;

    let response = request
        .headers(headers)
        .send()
        .await
        .map_err(|e| CallError::Transport(e.to_string()))?;

    match classify_status(response.status().as_u16()) {
        StatusClass::PassThrough => Ok(response),
        StatusClass::Unauthorized => {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            Err(CallError::Unauthorized(format!("upstream returned {status}: {body}")))
        }
    }
}
