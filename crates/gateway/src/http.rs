use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use engage_store::{EngagementStore, MemoryStore, PgStore};
use serde::Serialize;
use ulid::Ulid;

use crate::config::{EngageConfig, StartupError, StoreMode};
use crate::error::EngageError;
use crate::expiring::ExpiringKeyStore;
use crate::login::LoginAttemptLimiter;
use crate::ratings::RatingAggregator;
use crate::views::ViewDeduplicator;

mod login;
mod ratings;
mod views;

pub const FINGERPRINT_HEADER: &str = "x-fingerprint";
pub const REQUEST_ID_HEADER: &str = "x-engage-request-id";
pub const INTERNAL_SECRET_HEADER: &str = "x-engage-internal-secret";

#[derive(Clone)]
pub struct AppState {
    pub config: EngageConfig,
    store: Arc<dyn EngagementStore>,
    views: ViewDeduplicator,
    ratings: RatingAggregator,
    logins: LoginAttemptLimiter,
}

type ApiError = (StatusCode, HeaderMap, Json<ErrorResponse>);

pub async fn router(config: EngageConfig) -> Result<Router, StartupError> {
    let store: Arc<dyn EngagementStore> = match config.store_mode {
        StoreMode::Postgres => {
            let db_url = config.db_url.as_deref().ok_or_else(|| StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "postgres store mode requires ENGAGE_DB_URL".to_string(),
            })?;
            let store = PgStore::connect_and_migrate(db_url, config.store_write_timeout())
                .await
                .map_err(|err| StartupError {
                    code: "ERR_STORE_UNAVAILABLE",
                    message: format!("failed to initialize store: {}", err),
                })?;
            Arc::new(store)
        }
        StoreMode::Memory => {
            tracing::warn!("memory store mode: engagement state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    Ok(router_with_store(config, store))
}

/// Builds the router over an already-initialized store.
pub fn router_with_store(config: EngageConfig, store: Arc<dyn EngagementStore>) -> Router {
    let views = ViewDeduplicator::new(
        ExpiringKeyStore::new(config.dedup_sweep_high_water),
        config.view_dedup_window(),
    );
    let ratings = RatingAggregator::new(store.clone(), config.store_conflict_max_attempts);
    let logins = LoginAttemptLimiter::new(store.clone(), config.login_policy());

    let state = AppState {
        config,
        store,
        views,
        ratings,
        logins,
    };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/view", post(views::record_view))
        .route(
            "/rating",
            get(ratings::read_rating).post(ratings::submit_rating),
        )
        .route("/internal/login-attempts/check", post(login::check))
        .route("/internal/login-attempts/failure", post(login::failure))
        .route("/internal/login-attempts/success", post(login::success))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let store_ready = state.store.ping().await.is_ok();
    checks.insert("store", store_ready);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if state.config.metrics_require_auth
        && let Err(err) =
            validate_internal_secret(&headers, state.config.internal_shared_secret.as_deref())
    {
        return err.into_response();
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Records the request metric from a handler result and passes it through.
fn finish<T>(
    route: &'static str,
    method: &'static str,
    started: Instant,
    result: Result<T, ApiError>,
) -> Result<T, ApiError> {
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _, _)) => *status,
    };
    crate::metrics::observe_http_request(route, method, status.as_u16(), started.elapsed());
    result
}

fn record_span_outcome(started: Instant, outcome: &str) {
    let latency_ms = started.elapsed().as_millis() as u64;
    tracing::Span::current().record("latency_ms", latency_ms);
    tracing::Span::current().record("outcome", outcome);
    tracing::info!(outcome, latency_ms, "gateway.request_completed");
}

fn validate_internal_secret(
    headers: &HeaderMap,
    expected_secret: Option<&str>,
) -> Result<(), ApiError> {
    let Some(expected_secret) = expected_secret else {
        return Ok(());
    };

    let provided_secret = headers
        .get(INTERNAL_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_AUTH_REQUIRED",
                "missing internal shared secret".to_string(),
                false,
            )
        })?;

    if provided_secret != expected_secret {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_AUTH_INVALID",
            "invalid internal shared secret".to_string(),
            false,
        ));
    }

    Ok(())
}

fn extract_fingerprint(headers: &HeaderMap) -> Option<String> {
    headers
        .get(FINGERPRINT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        HeaderMap::new(),
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
            detail: None,
        }),
    )
}

fn invalid_body(message: &str) -> ApiError {
    json_error(
        StatusCode::BAD_REQUEST,
        "ERR_INVALID_INPUT",
        message.to_string(),
        false,
    )
}

fn engage_error_response(err: &EngageError) -> ApiError {
    let (status, retryable) = match err {
        EngageError::InvalidInput(_) | EngageError::InvalidIdentity => {
            (StatusCode::BAD_REQUEST, false)
        }
        EngageError::SubjectNotFound(_) => (StatusCode::NOT_FOUND, false),
        EngageError::StorageConflict => (StatusCode::SERVICE_UNAVAILABLE, true),
        EngageError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, false),
        EngageError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, true),
    };

    let mut response = json_error(status, err.code(), err.to_string(), retryable);

    if let EngageError::RateLimited {
        reset_at_epoch_ms,
        retry_after_secs,
    } = err
    {
        if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
            response.1.insert(header::RETRY_AFTER, value);
        }
        response.2.detail = Some(serde_json::json!({
            "allowed": false,
            "remaining": 0,
            "resetAt": reset_at_epoch_ms,
        }));
    }

    response
}
