use crate::errors::{AuthError, Result};
use crate::model::{Credential, TokenResponse};
use crate::token::TokenEndpoint;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use tracing::{debug, warn};

/// Client-side settings for the identity endpoint.
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub auth_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scope: String,
}

pub struct OAuthClient {
    http: Client,
    settings: OAuthSettings,
}

impl OAuthClient {
    pub fn new(settings: OAuthSettings, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, settings })
    }

    /// Consent page URL the operator follows to grant access.
    pub fn authorize_url(&self, state: &str) -> Result<String> {
        let url = Url::parse_with_params(
            &self.settings.auth_url,
            &[
                ("client_id", self.settings.client_id.as_str()),
                ("redirect_uri", self.settings.redirect_uri.as_str()),
                ("scope", self.settings.scope.as_str()),
                ("response_type", "code"),
                ("state", state),
            ],
        )
        .map_err(|e| crate::errors::Error::Config(format!("invalid auth URL: {}", e)))?;
        Ok(url.into())
    }

    /// Exchanges the code returned to the callback for the first credential.
    pub async fn exchange_code(&self, code: &str) -> std::result::Result<Credential, AuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", self.settings.redirect_uri.as_str()),
            ("scope", self.settings.scope.as_str()),
        ];
        self.token_request(&form).await
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
    ) -> std::result::Result<Credential, AuthError> {
        let response = self
            .http
            .post(&self.settings.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| AuthError::Transient(describe(&e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Identity endpoint returned {}: {}", status, body);
            return Err(classify(status, body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Transient(format!("unreadable token response: {}", e)))?;
        if token.refresh_token.is_empty() || token.access_token.is_empty() {
            return Err(AuthError::Transient(
                "token response carried an empty token".to_string(),
            ));
        }

        debug!("Identity endpoint issued a new token pair");
        Ok(token.into_credential(Utc::now()))
    }
}

#[async_trait]
impl TokenEndpoint for OAuthClient {
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<Credential, AuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];
        self.token_request(&form).await
    }
}

/// 4xx means the grant or client is bad and retrying will not help.
fn classify(status: StatusCode, body: String) -> AuthError {
    let detail = format!("HTTP {}: {}", status.as_u16(), body);
    if status.is_client_error() {
        AuthError::Permanent(detail)
    } else {
        AuthError::Transient(detail)
    }
}

pub(crate) fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out: {}", err)
    } else {
        err.to_string()
    }
}
