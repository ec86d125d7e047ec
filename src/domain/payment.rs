use super::ids::{CorrelationToken, PayerId, PaymentId, ReceiptId, RecipientId, SubscriptionId};
use super::money::{Amount, Money};
use super::phone::Msisdn;
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Initiated,
    Confirmed,
    /// Funds were collected but the commission split could not be computed.
    /// Requires manual resolution before the payment can be settled.
    ConfirmedUnsplit,
    Failed,
}

impl PaymentState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentState::Initiated)
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentState::Initiated => "initiated",
            PaymentState::Confirmed => "confirmed",
            PaymentState::ConfirmedUnsplit => "confirmed_unsplit",
            PaymentState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The only status a payer ever sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayerStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentFailure {
    /// The debit request never reached the gateway (transport error or timeout).
    GatewayUnreachable { detail: String },
    /// The gateway refused the debit request synchronously.
    GatewayRejected { code: String, description: String },
    /// The gateway accepted the request but later reported a non-zero result.
    Declined { code: i64, description: String },
}

impl PaymentFailure {
    /// True when no debit prompt could have reached the payer.
    pub fn never_reached_gateway(&self) -> bool {
        matches!(
            self,
            PaymentFailure::GatewayUnreachable { .. } | PaymentFailure::GatewayRejected { .. }
        )
    }
}

impl fmt::Display for PaymentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentFailure::GatewayUnreachable { detail } => {
                write!(f, "never reached gateway: {detail}")
            }
            PaymentFailure::GatewayRejected { code, description } => {
                write!(f, "never reached gateway: rejected ({code}) {description}")
            }
            PaymentFailure::Declined { code, description } => {
                write!(f, "declined ({code}) {description}")
            }
        }
    }
}

/// The four portions a confirmed amount is split into.
///
/// Only the commission calculator constructs splits, and construction checks
/// that the portions add up to the confirmed amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSplit {
    insurer: Money,
    tier1: Money,
    tier2: Money,
    residual: Money,
}

impl CommissionSplit {
    pub(crate) fn from_parts(
        total: Amount,
        insurer: Money,
        tier1: Money,
        tier2: Money,
        residual: Money,
    ) -> Result<Self, PaymentError> {
        let split = Self {
            insurer,
            tier1,
            tier2,
            residual,
        };
        if split.total() != total.as_money() {
            return Err(PaymentError::ValidationError(format!(
                "split {} does not add up to {total}",
                split.total()
            )));
        }
        Ok(split)
    }

    pub fn insurer(&self) -> Money {
        self.insurer
    }

    pub fn tier1(&self) -> Money {
        self.tier1
    }

    pub fn tier2(&self) -> Money {
        self.tier2
    }

    pub fn residual(&self) -> Money {
        self.residual
    }

    pub fn total(&self) -> Money {
        self.insurer + self.tier1 + self.tier2 + self.residual
    }
}

/// Referral recipients frozen onto a payment when its split is computed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Recipients {
    pub tier1: Option<RecipientId>,
    pub tier2: Option<RecipientId>,
}

/// What the gateway says it actually collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedFunds {
    pub receipt: ReceiptId,
    pub amount: Amount,
}

/// A terminal transition for a payment.
///
/// `Confirm` cannot be built without a [`CommissionSplit`], so a payment can
/// never be observed as confirmed without its portions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentTransition {
    Confirm {
        funds: CollectedFunds,
        split: CommissionSplit,
        recipients: Recipients,
    },
    ConfirmUnsplit {
        funds: CollectedFunds,
        reason: String,
    },
    Fail(PaymentFailure),
}

impl PaymentTransition {
    pub fn receipt(&self) -> Option<&ReceiptId> {
        match self {
            PaymentTransition::Confirm { funds, .. }
            | PaymentTransition::ConfirmUnsplit { funds, .. } => Some(&funds.receipt),
            PaymentTransition::Fail(_) => None,
        }
    }
}

/// One attempted collection from a payer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub payer: PayerId,
    pub subscription: SubscriptionId,
    pub phone: Msisdn,
    pub description: String,
    pub requested_amount: Amount,
    pub correlation: CorrelationToken,
    pub gateway_request_id: Option<String>,
    pub receipt: Option<ReceiptId>,
    pub confirmed_amount: Option<Amount>,
    pub state: PaymentState,
    pub failure: Option<PaymentFailure>,
    pub unsplit_reason: Option<String>,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub split: Option<CommissionSplit>,
    pub recipients: Option<Recipients>,
}

impl Payment {
    pub fn initiate(
        payer: PayerId,
        subscription: SubscriptionId,
        phone: Msisdn,
        description: String,
        requested_amount: Amount,
        initiated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            payer,
            subscription,
            phone,
            description,
            requested_amount,
            correlation: CorrelationToken::generate(),
            gateway_request_id: None,
            receipt: None,
            confirmed_amount: None,
            state: PaymentState::Initiated,
            failure: None,
            unsplit_reason: None,
            initiated_at,
            completed_at: None,
            split: None,
            recipients: None,
        }
    }

    pub fn payer_status(&self) -> PayerStatus {
        match self.state {
            PaymentState::Initiated => PayerStatus::Pending,
            PaymentState::Confirmed | PaymentState::ConfirmedUnsplit => PayerStatus::Success,
            PaymentState::Failed => PayerStatus::Failed,
        }
    }

    /// Applies a terminal transition, producing the new record.
    ///
    /// Fails if the payment has already left `initiated`.
    pub fn apply(&self, transition: PaymentTransition, at: DateTime<Utc>) -> Result<Self, PaymentError> {
        if self.state.is_terminal() {
            return Err(PaymentError::InvalidTransition(format!(
                "payment {} is already {}",
                self.id, self.state
            )));
        }

        let mut next = self.clone();
        next.completed_at = Some(at);
        match transition {
            PaymentTransition::Confirm {
                funds,
                split,
                recipients,
            } => {
                if split.total() != funds.amount.as_money() {
                    return Err(PaymentError::InvalidTransition(format!(
                        "split for payment {} does not match confirmed amount {}",
                        self.id, funds.amount
                    )));
                }
                next.state = PaymentState::Confirmed;
                next.receipt = Some(funds.receipt);
                next.confirmed_amount = Some(funds.amount);
                next.split = Some(split);
                next.recipients = Some(recipients);
            }
            PaymentTransition::ConfirmUnsplit { funds, reason } => {
                next.state = PaymentState::ConfirmedUnsplit;
                next.receipt = Some(funds.receipt);
                next.confirmed_amount = Some(funds.amount);
                next.unsplit_reason = Some(reason);
            }
            PaymentTransition::Fail(failure) => {
                next.state = PaymentState::Failed;
                next.failure = Some(failure);
            }
        }
        Ok(next)
    }
}
