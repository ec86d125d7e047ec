use super::ids::{BatchId, CorrelationToken, LineItemId, PaymentId, RecipientId};
use super::money::Money;
use super::rate::RecipientRole;
use crate::error::PaymentError;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Natural key of a settlement batch: one calendar day in the settlement
/// timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeriodKey(NaiveDate);

impl PeriodKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

pub const CLOSE_GRACE_SECS: i64 = 300;

/// A half-open `[start, end)` interval of confirmation timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPeriod {
    pub key: PeriodKey,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SettlementPeriod {
    /// The calendar day `date` as observed at `offset`.
    pub fn day(date: NaiveDate, offset: FixedOffset) -> Result<Self, PaymentError> {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| PaymentError::ValidationError(format!("invalid date {date}")))?;
        let start = offset
            .from_local_datetime(&midnight)
            .single()
            .ok_or_else(|| PaymentError::ValidationError(format!("ambiguous date {date}")))?
            .with_timezone(&Utc);
        Ok(Self {
            key: PeriodKey(date),
            start,
            end: start + Duration::days(1),
        })
    }

    /// The day containing `at`, as observed at `offset`.
    pub fn containing(at: DateTime<Utc>, offset: FixedOffset) -> Result<Self, PaymentError> {
        Self::day(at.with_timezone(&offset).date_naive(), offset)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// A day counts as closed [`CLOSE_GRACE_SECS`] after its end, so that
    /// confirmations stamped just before midnight are stored before the day
    /// is read.
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        self.end + Duration::seconds(CLOSE_GRACE_SECS) <= now
    }
}

/// Immutable grouping of the payments confirmed within one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementBatch {
    pub id: BatchId,
    pub period: SettlementPeriod,
    pub payments: Vec<PaymentId>,
    pub total_collected: Money,
    pub total_insurer: Money,
    pub total_tier1: Money,
    pub total_tier2: Money,
    pub total_residual: Money,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemState {
    Pending,
    Processing,
    Paid,
    /// Retry budget exhausted or no payable destination. Needs an operator.
    Failed,
}

impl fmt::Display for LineItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LineItemState::Pending => "pending",
            LineItemState::Processing => "processing",
            LineItemState::Paid => "paid",
            LineItemState::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for LineItemState {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(LineItemState::Pending),
            "processing" => Ok(LineItemState::Processing),
            "paid" => Ok(LineItemState::Paid),
            "failed" => Ok(LineItemState::Failed),
            other => Err(PaymentError::ValidationError(format!(
                "unknown line item state '{other}'"
            ))),
        }
    }
}

/// One commission amount owed to one recipient for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionPayoutLineItem {
    pub id: LineItemId,
    pub batch: BatchId,
    pub recipient: RecipientId,
    pub role: RecipientRole,
    pub amount: Money,
    pub state: LineItemState,
    /// Total attempts ever started; numbers the next transfer.
    pub attempts: u32,
    /// Attempts counted against the current retry budget.
    pub budget_used: u32,
    pub current_transfer: Option<CorrelationToken>,
    pub transfer_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A state change for a line item, applied atomically by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineItemUpdate {
    /// `pending → processing` for attempt number `attempt`.
    BeginAttempt {
        attempt: u32,
        transfer: CorrelationToken,
    },
    /// `processing → paid`.
    Paid {
        transfer: CorrelationToken,
        reference: String,
    },
    /// `processing → pending` (with a retry time) or `processing → failed`.
    AttemptFailed {
        transfer: CorrelationToken,
        reason: String,
        retry_after: Option<DateTime<Utc>>,
    },
    /// `processing → pending`, undoing `BeginAttempt` when no transfer could be
    /// recorded. The attempt number and budget are handed back.
    Release { transfer: CorrelationToken },
    /// `pending → failed` without an attempt, e.g. no payable destination.
    Block { reason: String },
    /// Operator action: `failed → pending` with a fresh retry budget.
    Requeue,
}

impl CommissionPayoutLineItem {
    pub fn new(
        batch: BatchId,
        recipient: RecipientId,
        role: RecipientRole,
        amount: Money,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: LineItemId::new(),
            batch,
            recipient,
            role,
            amount,
            state: LineItemState::Pending,
            attempts: 0,
            budget_used: 0,
            current_transfer: None,
            transfer_reference: None,
            failure_reason: None,
            retry_after: None,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == LineItemState::Pending && self.retry_after.is_none_or(|at| at <= now)
    }

    pub fn apply(&self, update: LineItemUpdate, at: DateTime<Utc>) -> Result<Self, PaymentError> {
        let mut next = self.clone();
        next.updated_at = at;

        match (self.state, update) {
            (LineItemState::Pending, LineItemUpdate::BeginAttempt { attempt, transfer }) => {
                if attempt != self.attempts + 1 {
                    return Err(self.rejected(&format!("attempt {attempt} out of sequence")));
                }
                next.state = LineItemState::Processing;
                next.attempts = attempt;
                next.budget_used += 1;
                next.current_transfer = Some(transfer);
                next.retry_after = None;
            }
            (LineItemState::Processing, LineItemUpdate::Paid { transfer, reference }) => {
                self.expect_transfer(&transfer)?;
                next.state = LineItemState::Paid;
                next.current_transfer = None;
                next.transfer_reference = Some(reference);
                next.failure_reason = None;
            }
            (
                LineItemState::Processing,
                LineItemUpdate::AttemptFailed {
                    transfer,
                    reason,
                    retry_after,
                },
            ) => {
                self.expect_transfer(&transfer)?;
                next.current_transfer = None;
                next.failure_reason = Some(reason);
                next.state = if retry_after.is_some() {
                    LineItemState::Pending
                } else {
                    LineItemState::Failed
                };
                next.retry_after = retry_after;
            }
            (LineItemState::Processing, LineItemUpdate::Release { transfer }) => {
                self.expect_transfer(&transfer)?;
                next.state = LineItemState::Pending;
                next.attempts = self.attempts.saturating_sub(1);
                next.budget_used = self.budget_used.saturating_sub(1);
                next.current_transfer = None;
                next.retry_after = None;
            }
            (LineItemState::Pending, LineItemUpdate::Block { reason }) => {
                next.state = LineItemState::Failed;
                next.failure_reason = Some(reason);
                next.retry_after = None;
            }
            (LineItemState::Failed, LineItemUpdate::Requeue) => {
                next.state = LineItemState::Pending;
                next.budget_used = 0;
                next.retry_after = None;
            }
            (_, update) => {
                return Err(self.rejected(&format!("{update:?} not allowed")));
            }
        }
        Ok(next)
    }

    fn expect_transfer(&self, transfer: &CorrelationToken) -> Result<(), PaymentError> {
        if self.current_transfer.as_ref() != Some(transfer) {
            return Err(self.rejected(&format!("transfer {transfer} is not the in-flight attempt")));
        }
        Ok(())
    }

    fn rejected(&self, detail: &str) -> PaymentError {
        PaymentError::InvalidTransition(format!(
            "line item {} is {}: {detail}",
            self.id, self.state
        ))
    }
}
