use crate::oauth::OAuthClient;
use crate::registry::MetricRegistry;
use crate::token::TokenStore;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use prometheus::{Encoder, TextEncoder};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

const MAX_PENDING_STATES: usize = 64;

/// Outstanding `state` nonces handed out by the authorization page. Once full,
/// issuing a new nonce evicts the oldest one.
#[derive(Debug, Default)]
pub struct PendingStates {
    nonces: VecDeque<String>,
}

impl PendingStates {
    pub fn issue(&mut self, nonce: String) {
        if self.nonces.len() >= MAX_PENDING_STATES {
            if let Some(evicted) = self.nonces.pop_front() {
                debug!("Evicting oldest pending authorization state {}", evicted);
            }
        }
        self.nonces.push_back(nonce);
    }

    /// Consumes `nonce`, returning whether it was outstanding.
    pub fn take(&mut self, nonce: &str) -> bool {
        match self.nonces.iter().position(|n| n == nonce) {
            Some(index) => self.nonces.remove(index).is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.nonces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }
}

#[derive(Clone)]
pub struct AppState {
    registry: Arc<MetricRegistry>,
    tokens: Arc<TokenStore>,
    oauth: Arc<OAuthClient>,
    pending_states: Arc<Mutex<PendingStates>>,
}

impl AppState {
    pub fn new(
        registry: Arc<MetricRegistry>,
        tokens: Arc<TokenStore>,
        oauth: Arc<OAuthClient>,
    ) -> Self {
        Self {
            registry,
            tokens,
            oauth,
            pending_states: Arc::new(Mutex::new(PendingStates::default())),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(authorize_page))
        .route("/callback", get(callback))
        .route("/metrics", get(metrics_handler))
        .route("/version", get(version))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Result<Response, AppError> {
    let body = state.registry.snapshot()?;
    let encoder = TextEncoder::new();
    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_string())], body).into_response())
}

async fn version() -> String {
    format!("Version: {}", env!("CARGO_PKG_VERSION"))
}

async fn authorize_page(State(state): State<AppState>) -> Result<Html<String>, AppError> {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let url = state.oauth.authorize_url(&nonce)?;

    state
        .pending_states
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .issue(nonce);

    let status = if state.tokens.is_authorized() {
        "The exporter already holds a refresh token. Authorizing again replaces it."
    } else {
        "The exporter is not authorized yet."
    };
    Ok(Html(format!(
        "<p>{}</p><p><a href=\"{}\">Authorize the application</a></p>",
        status,
        html_escape(&url)
    )))
}

async fn callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackQuery>,
) -> Response {
    if let Some(reason) = params.error {
        warn!("Authorization declined: {}", reason);
        return (StatusCode::BAD_REQUEST, "Authorization was declined.").into_response();
    }

    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing `code` parameter.").into_response();
    };

    let known_state = params.state.is_some_and(|s| {
        state
            .pending_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take(&s)
    });
    if !known_state {
        return (StatusCode::BAD_REQUEST, "Unknown or missing `state` parameter.").into_response();
    }

    let credential = match state.oauth.exchange_code(&code).await {
        Ok(credential) => credential,
        Err(e) => {
            error!("Authorization code exchange failed: {}", e);
            return (
                StatusCode::BAD_GATEWAY,
                "The identity provider refused the authorization code.",
            )
                .into_response();
        }
    };

    if let Err(e) = state.tokens.authorize(credential).await {
        error!("Authorized, but the credential could not be persisted: {}", e);
        return AppError(e.into()).into_response();
    }

    info!("Exporter authorized through the callback");
    "Authorization successful, you can close this window.".into_response()
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
