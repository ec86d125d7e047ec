//! Append-only audit trail of state transitions, consumed by compliance
//! reporting.

use super::ids::{BatchId, CorrelationToken, LineItemId, PaymentId, ReceiptId};
use super::money::{Amount, Money};
use super::payment::PaymentState;
use super::settlement::{LineItemState, PeriodKey};
use super::transfer::TransferStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum AuditSubject {
    Payment(PaymentId),
    Batch(BatchId),
    LineItem(LineItemId),
    Transfer(CorrelationToken),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    PaymentInitiated {
        token: CorrelationToken,
        amount: Amount,
    },
    PaymentTransitioned {
        from: PaymentState,
        to: PaymentState,
        detail: Option<String>,
    },
    /// The gateway collected a different amount than was requested.
    AmountDiscrepancy {
        requested: Amount,
        confirmed: Amount,
        receipt: ReceiptId,
    },
    DuplicateNotification {
        token: CorrelationToken,
        state: PaymentState,
    },
    BatchCreated {
        period: PeriodKey,
        payments: usize,
        total_collected: Money,
        line_items: usize,
    },
    LineItemTransitioned {
        from: LineItemState,
        to: LineItemState,
        detail: Option<String>,
    },
    TransferStarted {
        line_item: LineItemId,
        attempt: u32,
    },
    TransferSettled {
        attempt: u32,
        status: TransferStatus,
        detail: Option<String>,
    },
    /// The credit request may or may not have reached the gateway.
    TransferUnconfirmed { detail: String },
    /// A notification that cannot be applied without risking money
    /// correctness, e.g. success reported for an attempt already failed.
    PayoutAnomaly { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Assigned by the log on append; zero until then.
    pub sequence: u64,
    pub at: DateTime<Utc>,
    pub subject: AuditSubject,
    pub event: AuditEvent,
}

impl AuditEntry {
    pub fn new(at: DateTime<Utc>, subject: AuditSubject, event: AuditEvent) -> Self {
        Self {
            sequence: 0,
            at,
            subject,
            event,
        }
    }
}
