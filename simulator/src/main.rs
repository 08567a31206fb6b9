mod telemetry;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use telemetry::Station;
use tracing::{info, warn};

/// Fake Netatmo cloud API for running the exporter locally.
#[derive(Debug, Parser)]
struct Args {
    #[arg(long, env = "SIMULATOR_ADDR", default_value = "0.0.0.0:8090")]
    addr: String,

    #[arg(long, env = "SIMULATOR_CLIENT_ID", default_value = "sim-client")]
    client_id: String,

    #[arg(long, env = "SIMULATOR_CLIENT_SECRET", default_value = "sim-secret")]
    client_secret: String,

    /// Refresh token accepted for the first exchange
    #[arg(long, env = "SIMULATOR_REFRESH_TOKEN", default_value = "sim-refresh-0")]
    refresh_token: String,

    /// Lifetime of issued access tokens, in seconds
    #[arg(long, env = "SIMULATOR_TOKEN_TTL", default_value_t = 10800)]
    token_ttl: u64,

    #[arg(long, env = "DEVICES", default_value_t = 3)]
    devices: usize,

    /// Probability that any single measurement is missing from a reading
    #[arg(long, env = "SIMULATOR_GAP_RATE", default_value_t = 0.05, value_parser = parse_probability)]
    gap_rate: f64,
}

fn parse_probability(raw: &str) -> Result<f64, String> {
    let value: f64 = raw.parse().map_err(|e| format!("{}", e))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("{} is not a probability between 0 and 1", raw));
    }
    Ok(value)
}

struct Tokens {
    refresh_token: String,
    access: HashMap<String, Instant>,
}

struct Simulator {
    args: Args,
    stations: Vec<Station>,
    tokens: Mutex<Tokens>,
}

#[derive(Debug, Deserialize)]
struct TokenForm {
    grant_type: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
    code: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting Netatmo API simulator");
    info!(
        "Address: {}, Devices: {}, Gap rate: {}",
        args.addr, args.devices, args.gap_rate
    );

    let sim = Arc::new(Simulator {
        stations: Station::fleet(args.devices),
        tokens: Mutex::new(Tokens {
            refresh_token: args.refresh_token.clone(),
            access: HashMap::new(),
        }),
        args,
    });
    let addr = sim.args.addr.clone();

    let app = Router::new()
        .route("/oauth2/authorize", get(authorize))
        .route("/oauth2/token", post(token))
        .route("/api/gethomecoachsdata", get(homecoachs))
        .with_state(sim);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("Simulator listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Simulator server error: {}", e);
    }
}

/// Skips the consent screen and redirects straight back with a code.
async fn authorize(axum::extract::Query(params): axum::extract::Query<HashMap<String, String>>) -> Response {
    let (Some(redirect), Some(state)) = (params.get("redirect_uri"), params.get("state")) else {
        return (StatusCode::BAD_REQUEST, "redirect_uri and state are required").into_response();
    };
    match redirect_location(redirect, state) {
        Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
        Err(e) => {
            warn!("Rejected authorize request: {}", e);
            (StatusCode::BAD_REQUEST, "redirect_uri is not a valid URL").into_response()
        }
    }
}

fn redirect_location(redirect: &str, state: &str) -> Result<String, url::ParseError> {
    let mut location = url::Url::parse(redirect)?;
    location
        .query_pairs_mut()
        .append_pair("code", "sim-code")
        .append_pair("state", state);
    Ok(location.into())
}

async fn token(State(sim): State<Arc<Simulator>>, Form(form): Form<TokenForm>) -> Response {
    if form.client_id.as_deref() != Some(sim.args.client_id.as_str())
        || form.client_secret.as_deref() != Some(sim.args.client_secret.as_str())
    {
        warn!("Rejected token request with bad client credentials");
        return invalid("invalid_client");
    }

    let mut tokens = sim.tokens.lock().unwrap_or_else(PoisonError::into_inner);
    let accepted = match form.grant_type.as_str() {
        "refresh_token" => form.refresh_token.as_deref() == Some(tokens.refresh_token.as_str()),
        "authorization_code" => form.code.as_deref() == Some("sim-code"),
        _ => false,
    };
    if !accepted {
        warn!("Rejected {} grant", form.grant_type);
        return invalid("invalid_grant");
    }

    let access_token = uuid::Uuid::new_v4().simple().to_string();
    let refresh_token = uuid::Uuid::new_v4().simple().to_string();
    let ttl = Duration::from_secs(sim.args.token_ttl);

    tokens.access.retain(|_, expiry| *expiry > Instant::now());
    tokens.access.insert(access_token.clone(), Instant::now() + ttl);
    tokens.refresh_token = refresh_token.clone();
    info!("Issued new token pair via {} grant", form.grant_type);

    Json(json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "expires_in": ttl.as_secs(),
        "expire_in": ttl.as_secs(),
        "scope": ["read_homecoach"],
    }))
    .into_response()
}

async fn homecoachs(State(sim): State<Arc<Simulator>>, headers: HeaderMap) -> Response {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();

    let valid = {
        let tokens = sim.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens
            .access
            .get(bearer)
            .is_some_and(|expiry| *expiry > Instant::now())
    };
    if !valid {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": { "code": 3, "message": "Access token expired" } })),
        )
            .into_response();
    }

    let mut rng = rand::thread_rng();
    let devices: Vec<_> = sim
        .stations
        .iter()
        .map(|station| station.reading(&mut rng, sim.args.gap_rate))
        .collect();

    Json(json!({ "body": { "devices": devices }, "status": "ok" })).into_response()
}

fn invalid(error: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": error }))).into_response()
}
