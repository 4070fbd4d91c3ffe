//! Session management API
//!
//! Starts and ends the proxy's session and reports its state. Nothing here
//! ever returns a secret; the session is described by its state label,
//! subject and credential fingerprint.
//!
//! Endpoints:
//! - GET  /session           : current state, subject, fingerprint, expiry
//! - POST /session/login     : password login at the issuer
//! - POST /session/credential: start a session with an externally issued credential
//! - POST /session/logout    : end the session

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use common::Secret;
use credential::{Credential, TokenIssuer};
use serde::Deserialize;
use session::{AuthState, SessionControl};
use tracing::{info, warn};

/// Shared state for session API handlers.
#[derive(Clone)]
pub struct SessionApiState {
    control: Arc<SessionControl>,
    issuer: Arc<dyn TokenIssuer>,
}

impl SessionApiState {
    pub fn new(control: Arc<SessionControl>, issuer: Arc<dyn TokenIssuer>) -> Self {
        Self { control, issuer }
    }
}

/// Build the router for the session endpoints.
pub fn build_session_router(state: SessionApiState) -> Router {
    Router::new()
        .route("/session", get(get_session))
        .route("/session/login", post(login))
        .route("/session/credential", post(set_credential))
        .route("/session/logout", post(logout))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Describe an `AuthState` without secrets.
pub fn describe(state: &AuthState) -> serde_json::Value {
    let mut body = serde_json::json!({ "state": state.label() });
    match state {
        AuthState::Authenticated {
            credential,
            subject,
        } => {
            body["subject"] = subject.clone().into();
            body["fingerprint"] = credential.fingerprint().into();
            body["expires_at"] = credential.expires_at.into();
        }
        AuthState::Expired { last_credential } => {
            body["fingerprint"] = last_credential.fingerprint().into();
            body["expires_at"] = last_credential.expires_at.into();
        }
        AuthState::RefreshFailed { reason } => {
            body["reason"] = reason.clone().into();
        }
        AuthState::Unauthenticated => {}
    }
    body
}

/// GET /session: current session state.
async fn get_session(State(state): State<SessionApiState>) -> Response {
    let current = state.control.state().current();
    json_response(StatusCode::OK, describe(&current))
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: Secret<String>,
}

/// POST /session/login: exchange username/password at the issuer.
///
/// A rejected login is 401; an unreachable or failing issuer is 502.
async fn login(
    State(state): State<SessionApiState>,
    axum::Json(body): axum::Json<LoginRequest>,
) -> Response {
    let credential = match state.issuer.login(&body.username, &body.password).await {
        Ok(c) => c,
        Err(e) if e.is_denied() => {
            warn!(username = body.username, error = %e, "login rejected by issuer");
            return json_response(
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": format!("login rejected: {e}") }),
            );
        }
        Err(e) => {
            warn!(username = body.username, error = %e, "login failed");
            return json_response(
                StatusCode::BAD_GATEWAY,
                serde_json::json!({ "error": format!("issuer unavailable: {e}") }),
            );
        }
    };

    start_session(&state, credential, body.username).await
}

#[derive(Deserialize)]
struct CredentialRequest {
    access: Secret<String>,
    refresh: Secret<String>,
    /// Unix milliseconds
    expires_at: u64,
    subject: String,
}

/// POST /session/credential: start a session with a credential obtained
/// outside the proxy.
async fn set_credential(
    State(state): State<SessionApiState>,
    axum::Json(body): axum::Json<CredentialRequest>,
) -> Response {
    if body.access.expose().is_empty() || body.refresh.expose().is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "access and refresh must be non-empty" }),
        );
    }
    let credential = Credential {
        access: body.access,
        refresh: body.refresh,
        expires_at: body.expires_at,
    };
    start_session(&state, credential, body.subject).await
}

async fn start_session(
    state: &SessionApiState,
    credential: Credential,
    subject: String,
) -> Response {
    let fingerprint = credential.fingerprint();
    if let Err(e) = state.control.login(credential, subject.clone()).await {
        // Session is live in memory; only persistence failed
        warn!(subject, error = %e, "session started but not persisted");
        return json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": format!("session not persisted: {e}") }),
        );
    }
    info!(subject, fingerprint, "session started via API");
    json_response(StatusCode::OK, describe(&state.control.state().current()))
}

/// POST /session/logout: clear the credential and end the session.
async fn logout(State(state): State<SessionApiState>) -> Response {
    if let Err(e) = state.control.logout().await {
        warn!(error = %e, "logout did not clear persisted credential");
        return json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": format!("credential not removed: {e}") }),
        );
    }
    json_response(StatusCode::OK, describe(&AuthState::Unauthenticated))
}
