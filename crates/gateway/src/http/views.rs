use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use engage_contracts::identity::{resolve_client_ip, resolve_identity};
use engage_contracts::{ViewRequest, ViewResponse};
use tracing::Instrument;

use super::{
    ApiError, AppState, engage_error_response, extract_fingerprint, extract_request_id, finish,
    invalid_body, record_span_outcome,
};

pub(super) async fn record_view(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<ViewRequest>, JsonRejection>,
) -> Result<Json<ViewResponse>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result: Result<Json<ViewResponse>, ApiError> = async {
        let Json(req) = req.map_err(|_| invalid_body("invalid JSON body"))?;
        let subject_id = req
            .subject_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid_body("subjectId is required"))?
            .to_string();

        let client_ip = resolve_client_ip(&headers);
        let fingerprint = extract_fingerprint(&headers);
        let identity = resolve_identity(fingerprint.as_deref(), &client_ip)
            .map_err(|err| engage_error_response(&err.into()))?;

        let span = tracing::info_span!(
            "view.record",
            request_id = %request_id,
            subject_id = %subject_id,
            identity = %identity,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            match state
                .views
                .record_view(state.store.as_ref(), &subject_id, &identity)
                .await
            {
                Ok(outcome) => {
                    record_span_outcome(started, outcome.as_str());
                    Ok(Json(ViewResponse::from(outcome)))
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

    finish("/view", "POST", started, result)
}
