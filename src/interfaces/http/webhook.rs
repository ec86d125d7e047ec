use super::AppState;
use super::payloads::{B2cResultEnvelope, CallbackAck, ErrorBody, StkCallbackEnvelope};
use crate::application::payout::PayoutOutcome;
use crate::application::reconciler::ReconcileOutcome;
use crate::domain::ids::CorrelationToken;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

/// `POST /callbacks/debit/:token`
pub async fn debit_callback(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Bytes,
) -> Response {
    let envelope: StkCallbackEnvelope = match parse(&body) {
        Ok(envelope) => envelope,
        Err(response) => return response,
    };
    let token = CorrelationToken::parse(&token);
    if token.is_none() {
        warn!("Debit callback with an unusable token, falling back to the request id");
    }
    let notification = match envelope.body.stk_callback.into_notification(token) {
        Ok(notification) => notification,
        Err(e) => return bad_request(&e.to_string()),
    };

    match state.services.reconciler.reconcile_debit(notification).await {
        Ok(ReconcileOutcome::UnknownCorrelation) => {
            debug!("Debit callback acknowledged without a matching payment")
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "Debit callback could not be applied"),
    }
    ack()
}

/// `POST /callbacks/payout/result`
pub async fn payout_result(State(state): State<AppState>, body: Bytes) -> Response {
    payout_callback(state, &body, false).await
}

/// `POST /callbacks/payout/timeout`
pub async fn payout_timeout(State(state): State<AppState>, body: Bytes) -> Response {
    payout_callback(state, &body, true).await
}

async fn payout_callback(state: AppState, body: &[u8], timed_out: bool) -> Response {
    let envelope: B2cResultEnvelope = match parse(body) {
        Ok(envelope) => envelope,
        Err(response) => return response,
    };
    let notification = match envelope.result.into_notification(timed_out) {
        Ok(notification) => notification,
        Err(e) => return bad_request(&e.to_string()),
    };

    let token = notification.token.clone();
    match state.services.reconciler.reconcile_payout(notification).await {
        Ok(PayoutOutcome::Anomaly(detail)) => {
            warn!(%token, %detail, "Payout callback flagged for review")
        }
        Ok(_) => {}
        Err(e) => error!(%token, error = %e, "Payout callback could not be applied"),
    }
    ack()
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "Malformed callback payload");
        bad_request(&e.to_string())
    })
}

fn bad_request(detail: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: detail.to_string(),
        }),
    )
        .into_response()
}

fn ack() -> Response {
    (StatusCode::OK, Json(CallbackAck::accepted())).into_response()
}
