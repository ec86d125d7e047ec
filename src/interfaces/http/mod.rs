//! Inbound HTTP: the gateway's callbacks plus the small API used by the
//! membership application and operators.

pub mod api;
pub mod payloads;
pub mod webhook;

use self::payloads::ErrorBody;
use crate::application::Services;
use crate::error::PaymentError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self {
            services: Arc::new(services),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/payments", post(api::initiate_payment))
        .route("/payments/:token", get(api::payment_status))
        .route("/operator/line-items", get(api::list_line_items))
        .route("/callbacks/debit/:token", post(webhook::debit_callback))
        .route("/callbacks/payout/result", post(webhook::payout_result))
        .route("/callbacks/payout/timeout", post(webhook::payout_timeout))
        .with_state(state)
}

/// Serves until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Maps service errors onto API responses.
pub struct ApiError(pub PaymentError);

impl From<PaymentError> for ApiError {
    fn from(e: PaymentError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PaymentError::ValidationError(_) => StatusCode::BAD_REQUEST,
            PaymentError::NotFound(_) => StatusCode::NOT_FOUND,
            PaymentError::CollectionNotSent { .. } | PaymentError::Gateway(_) => {
                StatusCode::BAD_GATEWAY
            }
            PaymentError::DuplicateCorrelation(_)
            | PaymentError::InvalidTransition(_)
            | PaymentError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
