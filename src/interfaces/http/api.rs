use super::payloads::{InitiatedPayment, LineItemQuery, PaymentStatusResponse};
use super::{ApiError, AppState};
use crate::application::collection::CollectionRequest;
use crate::domain::ids::{BatchId, CorrelationToken};
use crate::domain::ports::LineItemFilter;
use crate::domain::settlement::{CommissionPayoutLineItem, LineItemState};
use crate::error::PaymentError;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;

/// `POST /payments`
pub async fn initiate_payment(
    State(state): State<AppState>,
    Json(request): Json<CollectionRequest>,
) -> Result<(StatusCode, Json<InitiatedPayment>), ApiError> {
    let receipt = state.services.collection.initiate(request).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt.into())))
}

/// `GET /payments/:token`
pub async fn payment_status(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<PaymentStatusResponse>, ApiError> {
    let token = CorrelationToken::parse(&token)
        .ok_or_else(|| PaymentError::ValidationError(format!("invalid token '{token}'")))?;
    let status = state
        .services
        .collection
        .status(&token)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("payment {token}")))?;
    Ok(Json(PaymentStatusResponse { token, status }))
}

/// `GET /operator/line-items?state=&batch=`
pub async fn list_line_items(
    State(state): State<AppState>,
    Query(query): Query<LineItemQuery>,
) -> Result<Json<Vec<CommissionPayoutLineItem>>, ApiError> {
    let filter = LineItemFilter {
        batch: query
            .batch
            .as_deref()
            .map(|raw| {
                raw.parse::<BatchId>()
                    .map_err(|_| PaymentError::ValidationError(format!("invalid batch id '{raw}'")))
            })
            .transpose()?,
        state: query.state.as_deref().map(str::parse::<LineItemState>).transpose()?,
        recipient: None,
    };
    let items = state.services.settlements.line_items(&filter).await?;
    Ok(Json(items))
}
