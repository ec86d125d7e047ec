use super::audit::Auditor;
use super::commission::CommissionService;
use super::payout::{PayoutNotification, PayoutOutcome, PayoutProcessor};
use crate::domain::audit::{AuditEvent, AuditSubject};
use crate::domain::gateway::DebitStatus;
use crate::domain::ids::{CorrelationToken, ReceiptId};
use crate::domain::money::Amount;
use crate::domain::payment::{
    CollectedFunds, Payment, PaymentFailure, PaymentState, PaymentTransition,
};
use crate::domain::ports::{DynClock, DynCollectionGateway, DynPaymentStore, TransitionOutcome};
use crate::error::{PaymentError, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Where a debit result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSource {
    Callback,
    StatusQuery,
}

impl fmt::Display for NotificationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationSource::Callback => f.write_str("callback"),
            NotificationSource::StatusQuery => f.write_str("status query"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DebitResult {
    Succeeded { receipt: ReceiptId, amount: Amount },
    Declined { code: i64, description: String },
}

/// The final result of a debit, already validated at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitNotification {
    /// Token from the callback URL, when present.
    pub token: Option<CorrelationToken>,
    /// Gateway request id (`CheckoutRequestID`), used when the token is
    /// missing or unknown.
    pub request_id: Option<String>,
    pub result: DebitResult,
    pub source: NotificationSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Confirmed(Payment),
    /// Funds collected, split could not be computed.
    ConfirmedUnsplit(Payment),
    Failed(Payment),
    /// The payment had already reached a terminal state; nothing changed.
    Duplicate(Payment),
    UnknownCorrelation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub queried: usize,
    pub resolved: usize,
    pub still_pending: usize,
    /// Stale payments with no gateway request id to query.
    pub unbound: usize,
    pub errors: usize,
}

/// Turns asynchronous gateway notifications into state transitions.
#[derive(Clone)]
pub struct CallbackReconciler {
    payments: DynPaymentStore,
    gateway: DynCollectionGateway,
    commission: CommissionService,
    payouts: PayoutProcessor,
    auditor: Auditor,
    clock: DynClock,
}

impl CallbackReconciler {
    pub fn new(
        payments: DynPaymentStore,
        gateway: DynCollectionGateway,
        commission: CommissionService,
        payouts: PayoutProcessor,
        auditor: Auditor,
        clock: DynClock,
    ) -> Self {
        Self {
            payments,
            gateway,
            commission,
            payouts,
            auditor,
            clock,
        }
    }

    pub async fn reconcile_debit(&self, notification: DebitNotification) -> Result<ReconcileOutcome> {
        let Some(payment) = self.find(&notification).await? else {
            warn!(
                token = ?notification.token,
                request_id = ?notification.request_id,
                "Debit notification for unknown payment"
            );
            return Ok(ReconcileOutcome::UnknownCorrelation);
        };
        if payment.state.is_terminal() {
            return Ok(self.duplicate(payment, &notification.result).await);
        }

        let token = payment.correlation.clone();
        let (transition, discrepancy) = match &notification.result {
            DebitResult::Declined { code, description } => (
                PaymentTransition::Fail(PaymentFailure::Declined {
                    code: *code,
                    description: description.clone(),
                }),
                None,
            ),
            DebitResult::Succeeded { receipt, amount } => {
                // The gateway's amount is what actually moved.
                let funds = CollectedFunds {
                    receipt: receipt.clone(),
                    amount: *amount,
                };
                let discrepancy = (*amount != payment.requested_amount).then_some(*amount);
                let transition = match self
                    .commission
                    .compute(&payment.subscription, &payment.payer, *amount)
                    .await
                {
                    Ok((split, recipients)) => PaymentTransition::Confirm {
                        funds,
                        split,
                        recipients,
                    },
                    Err(e) => {
                        warn!(%token, error = %e, "Commission split unavailable, payment needs manual resolution");
                        PaymentTransition::ConfirmUnsplit {
                            funds,
                            reason: e.to_string(),
                        }
                    }
                };
                (transition, discrepancy)
            }
        };

        let outcome = match self
            .payments
            .mark_terminal(&token, transition, self.clock.now())
            .await
        {
            Ok(outcome) => outcome,
            Err(PaymentError::DuplicateReceipt(receipt)) => {
                error!(%token, %receipt, "Receipt already recorded against another payment");
                return Err(PaymentError::DuplicateReceipt(receipt));
            }
            Err(e) => return Err(e),
        };

        let updated = match outcome {
            TransitionOutcome::Applied(updated) => updated,
            // Lost a race with a concurrent notification.
            TransitionOutcome::Unchanged(current) => {
                return Ok(self.duplicate(current, &notification.result).await);
            }
        };

        if let (Some(confirmed), Some(receipt)) = (discrepancy, &updated.receipt) {
            warn!(%token, requested = %updated.requested_amount, %confirmed, "Collected amount differs from requested amount");
            self.auditor
                .record(
                    AuditSubject::Payment(updated.id),
                    AuditEvent::AmountDiscrepancy {
                        requested: updated.requested_amount,
                        confirmed,
                        receipt: receipt.clone(),
                    },
                )
                .await;
        }
        let detail = match updated.state {
            PaymentState::Failed => updated.failure.as_ref().map(ToString::to_string),
            PaymentState::ConfirmedUnsplit => updated.unsplit_reason.clone(),
            _ => updated.receipt.as_ref().map(ToString::to_string),
        };
        self.auditor
            .record(
                AuditSubject::Payment(updated.id),
                AuditEvent::PaymentTransitioned {
                    from: PaymentState::Initiated,
                    to: updated.state,
                    detail: detail.map(|d| format!("{d} (via {})", notification.source)),
                },
            )
            .await;
        info!(%token, payment_id = %updated.id, state = %updated.state, source = %notification.source, "Payment reconciled");

        Ok(match updated.state {
            PaymentState::Confirmed => ReconcileOutcome::Confirmed(updated),
            PaymentState::ConfirmedUnsplit => ReconcileOutcome::ConfirmedUnsplit(updated),
            _ => ReconcileOutcome::Failed(updated),
        })
    }

    pub async fn reconcile_payout(&self, notification: PayoutNotification) -> Result<PayoutOutcome> {
        self.payouts.reconcile(notification).await
    }

    /// Queries the gateway for payments whose callback is overdue.
    ///
    /// A definitive answer goes through [`Self::reconcile_debit`]; anything
    /// else leaves the payment as it is.
    pub async fn sweep_stale(&self, older_than: Duration) -> Result<SweepReport> {
        let cutoff = self.clock.now() - older_than;
        let stale = self.payments.initiated_before(cutoff).await?;
        let mut report = SweepReport::default();

        for payment in stale {
            let token = payment.correlation.clone();
            let Some(request_id) = payment.gateway_request_id.clone() else {
                warn!(%token, payment_id = %payment.id, "Stale payment has no gateway request id");
                report.unbound += 1;
                continue;
            };

            report.queried += 1;
            let result = match self.gateway.query_debit(&request_id).await {
                Ok(DebitStatus::Pending) => {
                    debug!(%token, %request_id, "Debit still pending at gateway");
                    report.still_pending += 1;
                    continue;
                }
                Ok(DebitStatus::Completed {
                    result_code: 0,
                    receipt,
                    amount,
                    ..
                }) => DebitResult::Succeeded {
                    // The query response carries no receipt number; the
                    // request id is unique per debit and stands in for it.
                    receipt: receipt.unwrap_or_else(|| ReceiptId::new(request_id.clone())),
                    amount: amount.unwrap_or(payment.requested_amount),
                },
                Ok(DebitStatus::Completed {
                    result_code,
                    description,
                    ..
                }) => DebitResult::Declined {
                    code: result_code,
                    description,
                },
                Err(e) => {
                    warn!(%token, %request_id, error = %e, "Status query failed");
                    report.errors += 1;
                    continue;
                }
            };

            let notification = DebitNotification {
                token: Some(token.clone()),
                request_id: Some(request_id),
                result,
                source: NotificationSource::StatusQuery,
            };
            match self.reconcile_debit(notification).await {
                Ok(ReconcileOutcome::Duplicate(_)) | Ok(ReconcileOutcome::UnknownCorrelation) => {}
                Ok(_) => report.resolved += 1,
                Err(e) => {
                    error!(%token, error = %e, "Failed to apply status query result");
                    report.errors += 1;
                }
            }
        }

        if report != SweepReport::default() {
            info!(?report, "Stale payment sweep complete");
        }
        Ok(report)
    }

    async fn find(&self, notification: &DebitNotification) -> Result<Option<Payment>> {
        if let Some(token) = &notification.token
            && let Some(payment) = self.payments.lookup_by_token(token).await?
        {
            return Ok(Some(payment));
        }
        match &notification.request_id {
            Some(request_id) => self.payments.lookup_by_request_id(request_id).await,
            None => Ok(None),
        }
    }

    async fn duplicate(&self, payment: Payment, result: &DebitResult) -> ReconcileOutcome {
        let token = payment.correlation.clone();
        if payment.state == PaymentState::Failed && matches!(result, DebitResult::Succeeded { .. }) {
            // The debit call failed on our side but the payer was charged.
            error!(%token, payment_id = %payment.id, "Success reported for a payment already marked failed");
        } else {
            debug!(%token, state = %payment.state, "Duplicate debit notification");
        }
        self.auditor
            .record(
                AuditSubject::Payment(payment.id),
                AuditEvent::DuplicateNotification {
                    token,
                    state: payment.state,
                },
            )
            .await;
        ReconcileOutcome::Duplicate(payment)
    }
}
