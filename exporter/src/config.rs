use crate::errors::{Error, Result};
use crate::oauth::OAuthSettings;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

const MAX_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Parser)]
#[command(name = "netatmo-exporter", version, about = "Prometheus exporter for Netatmo Home Coach sensors")]
pub struct Config {
    /// OAuth2 client id of the Netatmo app
    #[arg(long, env = "NETATMO_CLIENT_ID")]
    pub client_id: String,

    /// OAuth2 client secret of the Netatmo app
    #[arg(long, env = "NETATMO_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: String,

    /// Initial refresh token. Optional when a token file already exists or
    /// when the exporter is authorized through its web page.
    #[arg(long, env = "NETATMO_REFRESH_TOKEN", hide_env_values = true)]
    pub refresh_token: Option<String>,

    /// File rotated credentials are written to
    #[arg(long, env = "NETATMO_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    #[arg(
        long,
        env = "NETATMO_AUTH_URL",
        default_value = "https://api.netatmo.com/oauth2/authorize"
    )]
    pub auth_url: String,

    #[arg(
        long,
        env = "NETATMO_TOKEN_URL",
        default_value = "https://api.netatmo.com/oauth2/token"
    )]
    pub token_url: String,

    #[arg(
        long,
        env = "NETATMO_API_URL",
        default_value = "https://api.netatmo.com/api/gethomecoachsdata"
    )]
    pub api_url: String,

    /// Seconds between two collection cycles
    #[arg(long, env = "NETATMO_EXPORTER_REFRESH_INTERVAL", default_value_t = 300)]
    pub refresh_interval: u64,

    #[arg(long, env = "NETATMO_EXPORTER_PORT", default_value_t = 8000)]
    pub port: u16,

    #[arg(long, env = "NETATMO_EXPORTER_LISTEN_ADDR", default_value = "0.0.0.0")]
    pub listen_addr: IpAddr,

    /// Defaults to http://localhost:<port>/callback
    #[arg(long, env = "NETATMO_REDIRECT_URI")]
    pub redirect_uri: Option<String>,

    #[arg(long, env = "NETATMO_SCOPE", default_value = "read_homecoach")]
    pub scope: String,

    /// Seconds before an outbound request is abandoned. Defaults to a tenth
    /// of the refresh interval, between 1 and 30 seconds.
    #[arg(long, env = "NETATMO_HTTP_TIMEOUT")]
    pub http_timeout: Option<u64>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Config("NETATMO_CLIENT_ID is empty".to_string()));
        }
        if self.client_secret.trim().is_empty() {
            return Err(Error::Config("NETATMO_CLIENT_SECRET is empty".to_string()));
        }
        if self.refresh_interval == 0 {
            return Err(Error::Config(
                "NETATMO_EXPORTER_REFRESH_INTERVAL must be greater than 0".to_string(),
            ));
        }
        if self.http_timeout == Some(0) {
            return Err(Error::Config(
                "NETATMO_HTTP_TIMEOUT must be greater than 0".to_string(),
            ));
        }
        for (name, url) in [
            ("NETATMO_AUTH_URL", &self.auth_url),
            ("NETATMO_TOKEN_URL", &self.token_url),
            ("NETATMO_API_URL", &self.api_url),
        ] {
            reqwest::Url::parse(url)
                .map_err(|e| Error::Config(format!("{} is not a valid URL: {}", name, e)))?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }

    pub fn http_timeout(&self) -> Duration {
        let secs = self
            .http_timeout
            .unwrap_or_else(|| (self.refresh_interval / 10).clamp(1, MAX_HTTP_TIMEOUT_SECS));
        Duration::from_secs(secs)
    }

    pub fn listen_socket(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.port)
    }

    pub fn redirect_uri(&self) -> String {
        self.redirect_uri
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}/callback", self.port))
    }

    pub fn oauth_settings(&self) -> OAuthSettings {
        OAuthSettings {
            auth_url: self.auth_url.clone(),
            token_url: self.token_url.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri(),
            scope: self.scope.clone(),
        }
    }
}
