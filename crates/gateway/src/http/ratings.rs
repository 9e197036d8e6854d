use std::time::Instant;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use engage_contracts::identity::{hash_identity, resolve_client_ip};
use engage_contracts::{RatingQuery, RatingRequest, RatingSummary};
use tracing::Instrument;

use super::{
    ApiError, AppState, engage_error_response, extract_request_id, finish, invalid_body,
    record_span_outcome,
};

pub(super) async fn submit_rating(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<RatingRequest>, JsonRejection>,
) -> Result<Json<RatingSummary>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result: Result<Json<RatingSummary>, ApiError> = async {
        let Json(req) = req.map_err(|_| {
            invalid_body("invalid JSON body; expected subjectId, integer rating and fingerprint")
        })?;

        // Votes are keyed by fingerprint only; the IP token is kept for audit.
        let identity = req
            .fingerprint
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid_body("fingerprint is required"))
            .and_then(|fp| hash_identity(fp).map_err(|err| engage_error_response(&err.into())))?;
        let ip_token = hash_identity(&resolve_client_ip(&headers))
            .map_err(|err| engage_error_response(&err.into()))?;

        let span = tracing::info_span!(
            "rating.submit",
            request_id = %request_id,
            subject_id = %req.subject_id.trim(),
            identity = %identity,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            match state
                .ratings
                .submit_rating(&req.subject_id, &identity, &ip_token, req.rating)
                .await
            {
                Ok(submission) => {
                    record_span_outcome(started, "ok");
                    Ok(Json(RatingSummary::from(submission)))
                }
                Err(err) => {
                    record_span_outcome(started, err.code());
                    Err(engage_error_response(&err))
                }
            }
        }
        .instrument(span)
        .await
    }
    .await;

    finish("/rating", "POST", started, result)
}

pub(super) async fn read_rating(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<RatingQuery>, QueryRejection>,
) -> Result<Json<RatingSummary>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result: Result<Json<RatingSummary>, ApiError> = async {
        let Query(query) = query.map_err(|_| invalid_body("subjectId query parameter is required"))?;

        let identity = match query
            .fingerprint
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(fp) => {
                Some(hash_identity(fp).map_err(|err| engage_error_response(&err.into()))?)
            }
            None => None,
        };

        let span = tracing::info_span!(
            "rating.read",
            request_id = %request_id,
            subject_id = %query.subject_id.trim(),
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            match state
                .ratings
                .rating_summary(&query.subject_id, identity.as_ref())
                .await
            {
                Ok(summary) => {
                    record_span_outcome(started, "ok");
                    Ok(Json(summary))
                }
                Err(err) => {
                    record_span_outcome(started, err.code());
                    Err(engage_error_response(&err))
                }
            }
        }
        .instrument(span)
        .await
    }
    .await;

    finish("/rating", "GET", started, result)
}
