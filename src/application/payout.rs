use super::audit::Auditor;
use crate::domain::audit::{AuditEvent, AuditSubject};
use crate::domain::gateway::{CreditRequest, GatewayError};
use crate::domain::ids::{CorrelationToken, LineItemId};
use crate::domain::money::Amount;
use crate::domain::ports::{
    DynClock, DynDisbursementGateway, DynRecipientDirectory, DynSettlementStore,
    DynTransferStore, LineItemFilter, TransitionOutcome,
};
use crate::domain::settlement::{CommissionPayoutLineItem, LineItemState, LineItemUpdate};
use crate::domain::transfer::{OutboundTransfer, TransferOutcome, TransferStatus};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub const NO_PAYABLE_DESTINATION: &str = "no payable destination";

/// Bounded exponential backoff for failed transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed per budget. An operator requeue grants a new budget.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::minutes(5),
            max_delay: Duration::hours(6),
        }
    }
}

impl RetryPolicy {
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        self.base_delay
            .checked_mul(1_i32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// When the next attempt may start, or `None` once the budget is spent.
    pub fn next_retry(&self, budget_used: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (budget_used < self.max_attempts).then(|| now + self.delay_for(budget_used))
    }
}

/// What the gateway finally reported for a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PayoutResult {
    Succeeded { transaction_id: String },
    Failed { code: String, description: String },
    /// The request expired in the gateway's queue; it was never processed.
    TimedOut { description: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutNotification {
    pub token: CorrelationToken,
    pub conversation_id: Option<String>,
    pub result: PayoutResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutOutcome {
    Paid(CommissionPayoutLineItem),
    RetryScheduled(CommissionPayoutLineItem),
    Failed(CommissionPayoutLineItem),
    /// The transfer was already settled with the same result.
    Duplicate,
    /// The notification contradicts recorded state and was not applied.
    Anomaly(String),
    UnknownCorrelation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayoutRunReport {
    pub started: usize,
    pub blocked: usize,
    pub failed_to_send: usize,
    pub skipped: usize,
    /// Sent, but the gateway's answer was lost; left in flight.
    pub unconfirmed: usize,
}

enum Attempt {
    Started,
    Blocked,
    NotSent,
    Skipped,
    Unconfirmed,
}

/// Disburses commission line items and applies the gateway's verdicts.
#[derive(Clone)]
pub struct PayoutProcessor {
    settlements: DynSettlementStore,
    transfers: DynTransferStore,
    directory: DynRecipientDirectory,
    gateway: DynDisbursementGateway,
    auditor: Auditor,
    clock: DynClock,
    policy: RetryPolicy,
}

impl PayoutProcessor {
    pub fn new(
        settlements: DynSettlementStore,
        transfers: DynTransferStore,
        directory: DynRecipientDirectory,
        gateway: DynDisbursementGateway,
        auditor: Auditor,
        clock: DynClock,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            settlements,
            transfers,
            directory,
            gateway,
            auditor,
            clock,
            policy,
        }
    }

    /// One pass over every pending line item whose retry time has come.
    pub async fn run_due(&self) -> Result<PayoutRunReport> {
        let now = self.clock.now();
        let filter = LineItemFilter {
            state: Some(LineItemState::Pending),
            ..Default::default()
        };
        let due: Vec<_> = self
            .settlements
            .line_items(&filter)
            .await?
            .into_iter()
            .filter(|item| item.is_due(now))
            .collect();

        let mut report = PayoutRunReport::default();
        for item in due {
            let id = item.id;
            match self.attempt(item).await {
                Ok(Attempt::Started) => report.started += 1,
                Ok(Attempt::Blocked) => report.blocked += 1,
                Ok(Attempt::NotSent) => report.failed_to_send += 1,
                Ok(Attempt::Skipped) => report.skipped += 1,
                Ok(Attempt::Unconfirmed) => report.unconfirmed += 1,
                Err(e) => {
                    error!(line_item = %id, error = %e, "Payout attempt failed");
                    report.skipped += 1;
                }
            }
        }
        if report != PayoutRunReport::default() {
            info!(?report, "Payout pass complete");
        }
        Ok(report)
    }

    async fn attempt(&self, item: CommissionPayoutLineItem) -> Result<Attempt> {
        let Some(phone) = self.directory.payable_destination(&item.recipient).await? else {
            let outcome = self
                .settlements
                .update_line_item(
                    item.id,
                    LineItemUpdate::Block {
                        reason: NO_PAYABLE_DESTINATION.to_string(),
                    },
                    self.clock.now(),
                )
                .await?;
            if !outcome.is_applied() {
                return Ok(Attempt::Skipped);
            }
            warn!(line_item = %item.id, recipient = %item.recipient, "Recipient has no payable destination");
            self.record_item(
                item.id,
                LineItemState::Pending,
                LineItemState::Failed,
                NO_PAYABLE_DESTINATION,
            )
            .await;
            return Ok(Attempt::Blocked);
        };

        let amount = Amount::new(item.amount.value())?;
        let attempt = item.attempts + 1;
        let token = CorrelationToken::generate();
        let now = self.clock.now();

        let begun = self
            .settlements
            .update_line_item(
                item.id,
                LineItemUpdate::BeginAttempt {
                    attempt,
                    transfer: token.clone(),
                },
                now,
            )
            .await?;
        if !begun.is_applied() {
            debug!(line_item = %item.id, "Line item claimed by another runner");
            return Ok(Attempt::Skipped);
        }
        self.record_item(
            item.id,
            LineItemState::Pending,
            LineItemState::Processing,
            &format!("attempt {attempt}"),
        )
        .await;

        let transfer = OutboundTransfer::start(item.id, attempt, token.clone(), now);
        if let Err(e) = self.transfers.insert_transfer(transfer).await {
            // Nothing was sent; hand the attempt back for the next pass.
            self.settlements
                .update_line_item(item.id, LineItemUpdate::Release { transfer: token }, now)
                .await?;
            self.record_item(
                item.id,
                LineItemState::Processing,
                LineItemState::Pending,
                &format!("attempt {attempt} released: {e}"),
            )
            .await;
            return Err(e);
        }
        self.auditor
            .record(
                AuditSubject::Transfer(token.clone()),
                AuditEvent::TransferStarted {
                    line_item: item.id,
                    attempt,
                },
            )
            .await;

        let request = CreditRequest {
            token: token.clone(),
            phone,
            amount,
            remarks: format!("{} commission", item.role),
            occasion: item.batch.to_string(),
        };
        match self.gateway.request_credit(request).await {
            Ok(accepted) => {
                self.transfers
                    .bind_conversation(&token, &accepted.conversation_id)
                    .await?;
                info!(
                    line_item = %item.id,
                    attempt,
                    %token,
                    conversation_id = %accepted.conversation_id,
                    "Payout transfer accepted"
                );
                Ok(Attempt::Started)
            }
            Err(GatewayError::Rejected { code, description }) => {
                warn!(line_item = %item.id, attempt, %token, %code, %description, "Payout transfer refused");
                self.settle(&token, TransferOutcome::Failed { code, description })
                    .await?;
                Ok(Attempt::NotSent)
            }
            Err(GatewayError::Auth(detail)) => {
                warn!(line_item = %item.id, attempt, %token, %detail, "Payout transfer not sent");
                self.settle(
                    &token,
                    TransferOutcome::Failed {
                        code: "not_sent".to_string(),
                        description: detail,
                    },
                )
                .await?;
                Ok(Attempt::NotSent)
            }
            // The gateway may have taken the request. The transfer stays in
            // flight until its result or queue-timeout callback arrives.
            Err(e @ (GatewayError::Unreachable(_) | GatewayError::Malformed(_))) => {
                error!(line_item = %item.id, attempt, %token, error = %e, "Payout transfer outcome unknown, awaiting gateway result");
                self.auditor
                    .record(
                        AuditSubject::Transfer(token.clone()),
                        AuditEvent::TransferUnconfirmed {
                            detail: e.to_string(),
                        },
                    )
                    .await;
                Ok(Attempt::Unconfirmed)
            }
        }
    }

    /// Applies an asynchronous result from the gateway.
    pub async fn reconcile(&self, notification: PayoutNotification) -> Result<PayoutOutcome> {
        let token = notification.token;
        if self.transfers.transfer_by_token(&token).await?.is_none() {
            warn!(%token, "Payout notification for unknown transfer");
            return Ok(PayoutOutcome::UnknownCorrelation);
        }
        if let Some(conversation_id) = &notification.conversation_id {
            self.transfers
                .bind_conversation(&token, conversation_id)
                .await?;
        }

        let outcome = match notification.result {
            PayoutResult::Succeeded { transaction_id } => {
                TransferOutcome::Succeeded { transaction_id }
            }
            PayoutResult::Failed { code, description } => {
                TransferOutcome::Failed { code, description }
            }
            PayoutResult::TimedOut { description } => TransferOutcome::Failed {
                code: "timeout".to_string(),
                description,
            },
        };
        self.settle(&token, outcome).await
    }

    async fn settle(&self, token: &CorrelationToken, outcome: TransferOutcome) -> Result<PayoutOutcome> {
        let now = self.clock.now();
        let transfer = match self
            .transfers
            .settle_transfer(token, outcome.clone(), now)
            .await?
        {
            TransitionOutcome::Applied(transfer) => transfer,
            TransitionOutcome::Unchanged(existing) => {
                return Ok(self.already_settled(existing, &outcome).await);
            }
        };
        self.auditor
            .record(
                AuditSubject::Transfer(token.clone()),
                AuditEvent::TransferSettled {
                    attempt: transfer.attempt,
                    status: transfer.status,
                    detail: transfer
                        .failure_description
                        .clone()
                        .or_else(|| transfer.transaction_id.clone()),
                },
            )
            .await;

        let line_item = transfer.line_item;
        match outcome {
            TransferOutcome::Succeeded { transaction_id } => {
                let update = LineItemUpdate::Paid {
                    transfer: token.clone(),
                    reference: transaction_id.clone(),
                };
                match self
                    .settlements
                    .update_line_item(line_item, update, now)
                    .await?
                {
                    TransitionOutcome::Applied(item) => {
                        info!(%line_item, attempt = transfer.attempt, %transaction_id, "Line item paid");
                        self.record_item(
                            line_item,
                            LineItemState::Processing,
                            LineItemState::Paid,
                            &transaction_id,
                        )
                        .await;
                        Ok(PayoutOutcome::Paid(item))
                    }
                    TransitionOutcome::Unchanged(item) => {
                        let detail = format!(
                            "transfer {token} succeeded ({transaction_id}) but line item is {}",
                            item.state
                        );
                        Ok(self.anomaly(token, detail).await)
                    }
                }
            }
            TransferOutcome::Failed { code, description } => {
                let reason = format!("{code}: {description}");
                let current = self
                    .settlements
                    .line_item(line_item)
                    .await?
                    .ok_or_else(|| PaymentError::NotFound(format!("line item {line_item}")))?;
                let retry_after = self.policy.next_retry(current.budget_used, now);
                let update = LineItemUpdate::AttemptFailed {
                    transfer: token.clone(),
                    reason: reason.clone(),
                    retry_after,
                };
                match self
                    .settlements
                    .update_line_item(line_item, update, now)
                    .await?
                {
                    TransitionOutcome::Applied(item) if item.state == LineItemState::Failed => {
                        error!(%line_item, attempts = item.attempts, %reason, "Payout retries exhausted");
                        self.record_item(
                            line_item,
                            LineItemState::Processing,
                            LineItemState::Failed,
                            &reason,
                        )
                        .await;
                        Ok(PayoutOutcome::Failed(item))
                    }
                    TransitionOutcome::Applied(item) => {
                        warn!(%line_item, attempt = transfer.attempt, %reason, retry_after = ?item.retry_after, "Payout attempt failed, retry scheduled");
                        self.record_item(
                            line_item,
                            LineItemState::Processing,
                            LineItemState::Pending,
                            &reason,
                        )
                        .await;
                        Ok(PayoutOutcome::RetryScheduled(item))
                    }
                    TransitionOutcome::Unchanged(item) => {
                        let detail = format!(
                            "transfer {token} failed ({reason}) but line item is {}",
                            item.state
                        );
                        Ok(self.anomaly(token, detail).await)
                    }
                }
            }
        }
    }

    async fn already_settled(
        &self,
        existing: OutboundTransfer,
        outcome: &TransferOutcome,
    ) -> PayoutOutcome {
        let token = &existing.correlation;
        match (existing.status, outcome) {
            (TransferStatus::Failed, TransferOutcome::Succeeded { transaction_id }) => {
                let detail = format!(
                    "success {transaction_id} reported for transfer {token} already recorded as failed"
                );
                self.anomaly(token, detail).await
            }
            (TransferStatus::Succeeded, TransferOutcome::Succeeded { transaction_id })
                if existing.transaction_id.as_deref() != Some(transaction_id.as_str()) =>
            {
                let detail = format!(
                    "second success {transaction_id} reported for transfer {token}"
                );
                self.anomaly(token, detail).await
            }
            _ => {
                debug!(%token, status = ?existing.status, "Duplicate payout notification");
                PayoutOutcome::Duplicate
            }
        }
    }

    async fn anomaly(&self, token: &CorrelationToken, detail: String) -> PayoutOutcome {
        error!(%token, %detail, "Payout anomaly needs operator attention");
        self.auditor
            .record(
                AuditSubject::Transfer(token.clone()),
                AuditEvent::PayoutAnomaly {
                    detail: detail.clone(),
                },
            )
            .await;
        PayoutOutcome::Anomaly(detail)
    }

    /// Operator action: give a failed line item a fresh retry budget.
    pub async fn requeue(&self, id: LineItemId) -> Result<CommissionPayoutLineItem> {
        match self
            .settlements
            .update_line_item(id, LineItemUpdate::Requeue, self.clock.now())
            .await?
        {
            TransitionOutcome::Applied(item) => {
                info!(line_item = %id, "Line item requeued by operator");
                self.record_item(
                    id,
                    LineItemState::Failed,
                    LineItemState::Pending,
                    "operator requeue",
                )
                .await;
                Ok(item)
            }
            TransitionOutcome::Unchanged(item) => Err(PaymentError::InvalidTransition(format!(
                "line item {id} is {}; only failed items can be requeued",
                item.state
            ))),
        }
    }

    async fn record_item(
        &self,
        id: LineItemId,
        from: LineItemState,
        to: LineItemState,
        detail: &str,
    ) {
        self.auditor
            .record(
                AuditSubject::LineItem(id),
                AuditEvent::LineItemTransitioned {
                    from,
                    to,
                    detail: Some(detail.to_string()),
                },
            )
            .await;
    }
}
