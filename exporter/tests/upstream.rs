//! End-to-end cycles against an in-process fake of the Netatmo API.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use netatmo_exporter::collector::{Collector, Phase};
use netatmo_exporter::errors::{AuthError, CycleError, FetchError};
use netatmo_exporter::oauth::{OAuthClient, OAuthSettings};
use netatmo_exporter::registry::MetricRegistry;
use netatmo_exporter::server::{create_router, AppState};
use netatmo_exporter::telemetry::TelemetryClient;
use netatmo_exporter::token::{NoopPersister, TokenStore};
use prometheus::Encoder;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CODE: &str = "good-code";

#[derive(Default)]
struct Upstream {
    refresh_calls: AtomicUsize,
    data_calls: AtomicUsize,
    reject_data: AtomicUsize,
    token_status: Mutex<Option<StatusCode>>,
    data_status: Mutex<Option<StatusCode>>,
    data_delay_ms: AtomicU64,
    refresh_token: Mutex<String>,
    access_token: Mutex<String>,
    devices: Mutex<Vec<Value>>,
}

impl Upstream {
    fn new(refresh_token: &str) -> Arc<Self> {
        let upstream = Self::default();
        *upstream.refresh_token.lock().unwrap() = refresh_token.to_string();
        *upstream.devices.lock().unwrap() = vec![kitchen()];
        Arc::new(upstream)
    }

    fn issue(&self) -> Value {
        let n = self.refresh_calls.load(Ordering::SeqCst);
        let access = format!("access-{}", n);
        let refresh = format!("refresh-{}", n);
        *self.access_token.lock().unwrap() = access.clone();
        *self.refresh_token.lock().unwrap() = refresh.clone();
        json!({ "access_token": access, "refresh_token": refresh, "expires_in": 10800 })
    }
}

fn kitchen() -> Value {
    json!({
        "_id": "70:ee:50:00:00:01",
        "station_name": "Kitchen",
        "place": { "city": "Paris" },
        "dashboard_data": {
            "Temperature": 21.5,
            "Humidity": 44,
            "CO2": 600,
            "Noise": 35,
            "Pressure": 1012,
            "AbsolutePressure": 1010,
            "health_idx": 1
        },
        "wifi_status": 55
    })
}

async fn token(
    State(upstream): State<Arc<Upstream>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    if let Some(status) = *upstream.token_status.lock().unwrap() {
        return (status, Json(json!({ "error": "forced" }))).into_response();
    }

    let accepted = match form.get("grant_type").map(String::as_str) {
        Some("refresh_token") => {
            form.get("refresh_token") == Some(&*upstream.refresh_token.lock().unwrap())
        }
        Some("authorization_code") => form.get("code").map(String::as_str) == Some(CODE),
        _ => false,
    };
    if !accepted || form.get("client_secret").map(String::as_str) != Some("secret") {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_grant" }))).into_response();
    }

    upstream.refresh_calls.fetch_add(1, Ordering::SeqCst);
    Json(upstream.issue()).into_response()
}

async fn homecoachs(State(upstream): State<Arc<Upstream>>, headers: HeaderMap) -> Response {
    upstream.data_calls.fetch_add(1, Ordering::SeqCst);

    let delay = upstream.data_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if let Some(status) = *upstream.data_status.lock().unwrap() {
        return (status, "upstream trouble").into_response();
    }

    let expected = format!("Bearer {}", upstream.access_token.lock().unwrap());
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    let forced_reject = upstream
        .reject_data
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if !authorized || forced_reject {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": { "code": 3, "message": "Access token expired" } })),
        )
            .into_response();
    }

    let devices = upstream.devices.lock().unwrap().clone();
    Json(json!({ "body": { "devices": devices }, "status": "ok" })).into_response()
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct Harness {
    upstream: Arc<Upstream>,
    tokens: Arc<TokenStore>,
    oauth: Arc<OAuthClient>,
    registry: Arc<MetricRegistry>,
    collector: Collector,
}

async fn harness(initial_refresh_token: Option<&str>) -> Harness {
    let upstream = Upstream::new("refresh-0");
    let app = Router::new()
        .route("/oauth2/token", post(token))
        .route("/api/gethomecoachsdata", get(homecoachs))
        .with_state(upstream.clone());
    let addr = spawn(app).await;

    let timeout = Duration::from_millis(500);
    let oauth = Arc::new(
        OAuthClient::new(
            OAuthSettings {
                auth_url: format!("http://{}/oauth2/authorize", addr),
                token_url: format!("http://{}/oauth2/token", addr),
                client_id: "id".into(),
                client_secret: "secret".into(),
                redirect_uri: "http://localhost:8000/callback".into(),
                scope: "read_homecoach".into(),
            },
            timeout,
        )
        .unwrap(),
    );
    let telemetry = Arc::new(
        TelemetryClient::new(format!("http://{}/api/gethomecoachsdata", addr), timeout).unwrap(),
    );
    let tokens = Arc::new(
        TokenStore::load(
            oauth.clone(),
            Box::new(NoopPersister),
            initial_refresh_token.map(str::to_string),
        )
        .unwrap(),
    );
    let registry = Arc::new(MetricRegistry::new().unwrap());
    let collector = Collector::new(tokens.clone(), telemetry, registry.clone());

    Harness {
        upstream,
        tokens,
        oauth,
        registry,
        collector,
    }
}

#[tokio::test]
async fn test_cycle_rotates_token_and_serves_metrics() {
    let h = harness(Some("refresh-0")).await;

    let report = h.collector.run_cycle().await.unwrap();
    assert_eq!(report.devices, 1);
    assert_eq!(report.samples, 8);
    assert_eq!(h.tokens.current().refresh_token, "refresh-1");

    let exporter = spawn(create_router(AppState::new(
        h.registry.clone(),
        h.tokens.clone(),
        h.oauth.clone(),
    )))
    .await;
    let response = reqwest::get(format!("http://{}/metrics", exporter))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()[reqwest::header::CONTENT_TYPE],
        prometheus::TextEncoder::new().format_type()
    );
    let body = response.text().await.unwrap();
    assert!(body.contains(
        r#"netatmo_sensor_temperature_celsius{address_mac="70:ee:50:00:00:01",city="Paris",station_name="Kitchen"} 21.5"#
    ));
    assert!(body.contains(
        r#"netatmo_sensor_rf_signal_strength{address_mac="70:ee:50:00:00:01",city="Paris",station_name="Kitchen"} 55"#
    ));
}

#[tokio::test]
async fn test_second_cycle_reuses_access_token() {
    let h = harness(Some("refresh-0")).await;

    h.collector.run_cycle().await.unwrap();
    h.collector.run_cycle().await.unwrap();

    assert_eq!(h.upstream.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.upstream.data_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejected_token_is_refreshed_once() {
    let h = harness(Some("refresh-0")).await;
    h.upstream.reject_data.store(1, Ordering::SeqCst);

    let report = h.collector.run_cycle().await.unwrap();

    assert!(report.token_refreshed_on_rejection);
    assert_eq!(h.upstream.refresh_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.upstream.data_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.tokens.current().refresh_token, "refresh-2");
}

#[tokio::test]
async fn test_repeated_rejection_aborts_cycle() {
    let h = harness(Some("refresh-0")).await;
    h.upstream.reject_data.store(5, Ordering::SeqCst);

    let failure = h.collector.run_cycle().await.unwrap_err();

    assert_eq!(failure.phase, Phase::FetchingData);
    assert_eq!(failure.error, CycleError::Fetch(FetchError::AuthRejected(403)));
    assert_eq!(h.upstream.data_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.registry.series_count(), 0);
}

#[tokio::test]
async fn test_revoked_refresh_token_is_permanent() {
    let h = harness(Some("revoked")).await;

    let failure = h.collector.run_cycle().await.unwrap_err();

    assert_eq!(failure.phase, Phase::FetchingToken);
    assert!(matches!(failure.error, CycleError::Auth(AuthError::Permanent(_))));
    assert_eq!(h.upstream.data_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.tokens.current().refresh_token, "revoked");
}

#[tokio::test]
async fn test_identity_outage_is_transient() {
    let h = harness(Some("refresh-0")).await;
    *h.upstream.token_status.lock().unwrap() = Some(StatusCode::SERVICE_UNAVAILABLE);

    let failure = h.collector.run_cycle().await.unwrap_err();
    assert!(matches!(failure.error, CycleError::Auth(AuthError::Transient(_))));

    *h.upstream.token_status.lock().unwrap() = None;
    assert!(h.collector.run_cycle().await.is_ok());
}

#[tokio::test]
async fn test_failed_fetch_keeps_published_values() {
    let h = harness(Some("refresh-0")).await;
    h.collector.run_cycle().await.unwrap();
    let before = h.registry.snapshot().unwrap();

    *h.upstream.data_status.lock().unwrap() = Some(StatusCode::INTERNAL_SERVER_ERROR);
    let failure = h.collector.run_cycle().await.unwrap_err();
    assert!(matches!(failure.error, CycleError::Fetch(FetchError::Transient(_))));

    let sensors = |text: &str| {
        text.lines()
            .filter(|l| l.starts_with("netatmo_sensor_"))
            .map(str::to_string)
            .collect::<Vec<_>>()
    };
    assert_eq!(sensors(&h.registry.snapshot().unwrap()), sensors(&before));
}

#[tokio::test]
async fn test_hung_upstream_times_out_as_transient() {
    let h = harness(Some("refresh-0")).await;
    h.upstream.data_delay_ms.store(3_000, Ordering::SeqCst);

    let failure = h.collector.run_cycle().await.unwrap_err();

    assert!(matches!(failure.error, CycleError::Fetch(FetchError::Transient(_))));
}

#[tokio::test]
async fn test_partial_devices_are_published() {
    let h = harness(Some("refresh-0")).await;
    let mut no_noise = kitchen();
    no_noise["_id"] = json!("70:ee:50:00:00:02");
    no_noise["dashboard_data"].as_object_mut().unwrap().remove("Noise");
    let mut anonymous = kitchen();
    anonymous.as_object_mut().unwrap().remove("_id");
    *h.upstream.devices.lock().unwrap() = vec![kitchen(), no_noise, anonymous];

    let report = h.collector.run_cycle().await.unwrap();

    assert_eq!(report.devices, 2);
    assert_eq!(report.skipped_devices, 1);
    assert_eq!(report.samples, 15);
}

#[tokio::test]
async fn test_callback_authorizes_exporter() {
    let h = harness(None).await;
    assert!(!h.tokens.is_authorized());
    let exporter = spawn(create_router(AppState::new(
        h.registry.clone(),
        h.tokens.clone(),
        h.oauth.clone(),
    )))
    .await;

    let page = reqwest::get(format!("http://{}/", exporter))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let state = page
        .split("state=")
        .nth(1)
        .and_then(|rest| rest.split(['"', '&']).next())
        .unwrap()
        .to_string();

    let bogus = reqwest::get(format!(
        "http://{}/callback?code={}&state=forged",
        exporter, CODE
    ))
    .await
    .unwrap();
    assert_eq!(bogus.status(), 400);

    let missing_code = reqwest::get(format!("http://{}/callback?state={}", exporter, state))
        .await
        .unwrap();
    assert_eq!(missing_code.status(), 400);

    let ok = reqwest::get(format!(
        "http://{}/callback?code={}&state={}",
        exporter, CODE, state
    ))
    .await
    .unwrap();
    assert_eq!(ok.status(), 200);
    assert!(h.tokens.is_authorized());

    // The callback credential is used as-is by the next cycle.
    h.collector.run_cycle().await.unwrap();
    assert_eq!(h.upstream.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_version_endpoint() {
    let h = harness(None).await;
    let exporter = spawn(create_router(AppState::new(
        h.registry.clone(),
        h.tokens.clone(),
        h.oauth.clone(),
    )))
    .await;

    let body = reqwest::get(format!("http://{}/version", exporter))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, format!("Version: {}", env!("CARGO_PKG_VERSION")));
}
