use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use engage_contracts::identity::{login_identifier, resolve_client_ip};
use engage_contracts::{IdentityToken, LoginAttemptRequest, LoginCheck};
use tracing::Instrument;

use super::{
    ApiError, AppState, engage_error_response, extract_request_id, finish, invalid_body,
    record_span_outcome, validate_internal_secret,
};
use crate::error::EngageError;

fn identifier_for(
    state: &AppState,
    headers: &HeaderMap,
    req: Result<Json<LoginAttemptRequest>, JsonRejection>,
) -> Result<IdentityToken, ApiError> {
    validate_internal_secret(headers, state.config.internal_shared_secret.as_deref())?;
    let Json(req) = req.map_err(|_| invalid_body("invalid JSON body; expected username"))?;
    login_identifier(&req.username, &resolve_client_ip(headers))
        .map_err(|err| engage_error_response(&err.into()))
}

/// Allowance check before credentials are verified. A locked identifier
/// answers 429 with `Retry-After`.
pub(super) async fn check(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<LoginAttemptRequest>, JsonRejection>,
) -> Result<Json<LoginCheck>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result: Result<Json<LoginCheck>, ApiError> = async {
        let identifier = identifier_for(&state, &headers, req)?;
        let span = tracing::info_span!(
            "login.check",
            request_id = %request_id,
            identifier = %identifier,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let check = match state.logins.ensure_allowed(&identifier).await {
                Ok(check) => check,
                Err(err) => {
                    if matches!(err, EngageError::RateLimited { .. }) {
                        record_span_outcome(started, "locked");
                    }
                    return Err(engage_error_response(&err));
                }
            };

            crate::metrics::observe_login("allowed");
            record_span_outcome(started, "allowed");
            Ok(Json(check))
        }
        .instrument(span)
        .await
    }
    .await;

    finish("/internal/login-attempts/check", "POST", started, result)
}

pub(super) async fn failure(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<LoginAttemptRequest>, JsonRejection>,
) -> Result<Json<LoginCheck>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result: Result<Json<LoginCheck>, ApiError> = async {
        let identifier = identifier_for(&state, &headers, req)?;
        let span = tracing::info_span!(
            "login.failure",
            request_id = %request_id,
            identifier = %identifier,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let check = state
                .logins
                .record_failure(&identifier)
                .await
                .map_err(|err| engage_error_response(&err))?;
            crate::metrics::observe_login("rejected");
            record_span_outcome(started, if check.allowed { "recorded" } else { "locked" });
            Ok(Json(check))
        }
        .instrument(span)
        .await
    }
    .await;

    finish("/internal/login-attempts/failure", "POST", started, result)
}

pub(super) async fn success(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<LoginAttemptRequest>, JsonRejection>,
) -> Result<Json<LoginCheck>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result: Result<Json<LoginCheck>, ApiError> = async {
        let identifier = identifier_for(&state, &headers, req)?;
        let span = tracing::info_span!(
            "login.success",
            request_id = %request_id,
            identifier = %identifier,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            state
                .logins
                .record_success(&identifier)
                .await
                .map_err(|err| engage_error_response(&err))?;
            crate::metrics::observe_login("authenticated");
            record_span_outcome(started, "reset");
            Ok(Json(LoginCheck {
                allowed: true,
                remaining: state.logins.policy().max_attempts,
                reset_at: None,
            }))
        }
        .instrument(span)
        .await
    }
    .await;

    finish("/internal/login-attempts/success", "POST", started, result)
}
