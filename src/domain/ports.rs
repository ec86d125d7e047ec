use super::audit::{AuditEntry, AuditSubject};
use super::gateway::{
    CreditAccepted, CreditRequest, DebitAccepted, DebitRequest, DebitStatus, GatewayError,
};
use super::ids::{
    BatchId, CorrelationToken, LineItemId, PayerId, PaymentId, RecipientId, SubscriptionId,
};
use super::payment::{Payment, PaymentTransition};
use super::phone::Msisdn;
use super::rate::{RateStructure, ReferralAssignment};
use super::settlement::{
    CommissionPayoutLineItem, LineItemState, LineItemUpdate, PeriodKey, SettlementBatch,
};
use super::transfer::{OutboundTransfer, TransferOutcome};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome<T> {
    /// The update was valid for the stored state and has been written.
    Applied(T),
    /// The stored record was not in a state the update applies to; nothing
    /// was written. Carries the current record.
    Unchanged(T),
}

impl<T> TransitionOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            TransitionOutcome::Applied(t) | TransitionOutcome::Unchanged(t) => t,
        }
    }
}

/// Payments indexed by correlation token.
///
/// `mark_terminal` is the only way a payment leaves `initiated`, and it is a
/// single compare-and-set against the stored state.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Fails with `DuplicateCorrelation` if the token is already known.
    async fn insert(&self, payment: Payment) -> Result<()>;
    async fn get(&self, id: PaymentId) -> Result<Option<Payment>>;
    async fn lookup_by_token(&self, token: &CorrelationToken) -> Result<Option<Payment>>;
    async fn lookup_by_request_id(&self, request_id: &str) -> Result<Option<Payment>>;
    /// Records the gateway's request id. Ignored once the payment is terminal.
    async fn bind_request_id(&self, token: &CorrelationToken, request_id: &str) -> Result<()>;
    /// Fails with `DuplicateReceipt` if another payment already holds the
    /// transition's receipt.
    async fn mark_terminal(
        &self,
        token: &CorrelationToken,
        transition: PaymentTransition,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome<Payment>>;
    /// Confirmed payments with `start <= completed_at < end`.
    async fn confirmed_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Payment>>;
    /// Payments still `initiated` that were created before `cutoff`.
    async fn initiated_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Payment>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchInsert {
    Created(SettlementBatch),
    /// A batch already exists for the period; nothing was written.
    PeriodExists(SettlementBatch),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineItemFilter {
    pub batch: Option<BatchId>,
    pub state: Option<LineItemState>,
    pub recipient: Option<RecipientId>,
}

impl LineItemFilter {
    pub fn matches(&self, item: &CommissionPayoutLineItem) -> bool {
        self.batch.is_none_or(|b| b == item.batch)
            && self.state.is_none_or(|s| s == item.state)
            && self.recipient.as_ref().is_none_or(|r| *r == item.recipient)
    }
}

/// Settlement batches and their payout line items.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn batch_for_period(&self, key: PeriodKey) -> Result<Option<SettlementBatch>>;
    async fn batch(&self, id: BatchId) -> Result<Option<SettlementBatch>>;
    async fn batches(&self) -> Result<Vec<SettlementBatch>>;
    async fn batch_of_payment(&self, payment: PaymentId) -> Result<Option<BatchId>>;
    /// Inserts the batch and its line items atomically if no batch exists for
    /// the period. Fails with `AlreadyClaimed` if any payment belongs to
    /// another batch.
    async fn create_batch(
        &self,
        batch: SettlementBatch,
        items: Vec<CommissionPayoutLineItem>,
    ) -> Result<BatchInsert>;
    async fn line_item(&self, id: LineItemId) -> Result<Option<CommissionPayoutLineItem>>;
    async fn line_items(&self, filter: &LineItemFilter) -> Result<Vec<CommissionPayoutLineItem>>;
    async fn update_line_item(
        &self,
        id: LineItemId,
        update: LineItemUpdate,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome<CommissionPayoutLineItem>>;
}

/// Outbound transfer attempts, indexed by correlation token.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Fails if the token or the `(line_item, attempt)` pair already exists.
    async fn insert_transfer(&self, transfer: OutboundTransfer) -> Result<()>;
    async fn transfer_by_token(&self, token: &CorrelationToken) -> Result<Option<OutboundTransfer>>;
    async fn bind_conversation(&self, token: &CorrelationToken, conversation_id: &str)
    -> Result<()>;
    async fn settle_transfer(
        &self,
        token: &CorrelationToken,
        outcome: TransferOutcome,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome<OutboundTransfer>>;
    /// All attempts for a line item, ordered by attempt number.
    async fn transfers_for(&self, line_item: LineItemId) -> Result<Vec<OutboundTransfer>>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Appends an entry and returns its sequence number.
    async fn append(&self, entry: AuditEntry) -> Result<u64>;
    async fn entries_for(&self, subject: &AuditSubject) -> Result<Vec<AuditEntry>>;
}

/// subscription → scheme → commission rates.
#[async_trait]
pub trait RateResolver: Send + Sync {
    async fn rate_for(&self, subscription: &SubscriptionId) -> Result<Option<RateStructure>>;
}

/// payer → current tier-1/tier-2 referral recipients.
#[async_trait]
pub trait HierarchyResolver: Send + Sync {
    async fn assignment_for(&self, payer: &PayerId) -> Result<Option<ReferralAssignment>>;
}

/// recipient → registered mobile-money number, if any.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn payable_destination(&self, recipient: &RecipientId) -> Result<Option<Msisdn>>;
}

#[async_trait]
pub trait CollectionGateway: Send + Sync {
    async fn request_debit(
        &self,
        request: DebitRequest,
    ) -> std::result::Result<DebitAccepted, GatewayError>;
    async fn query_debit(&self, request_id: &str) -> std::result::Result<DebitStatus, GatewayError>;
}

#[async_trait]
pub trait DisbursementGateway: Send + Sync {
    async fn request_credit(
        &self,
        request: CreditRequest,
    ) -> std::result::Result<CreditAccepted, GatewayError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type DynPaymentStore = Arc<dyn PaymentStore>;
pub type DynSettlementStore = Arc<dyn SettlementStore>;
pub type DynTransferStore = Arc<dyn TransferStore>;
pub type DynAuditLog = Arc<dyn AuditLog>;
pub type DynRateResolver = Arc<dyn RateResolver>;
pub type DynHierarchyResolver = Arc<dyn HierarchyResolver>;
pub type DynRecipientDirectory = Arc<dyn RecipientDirectory>;
pub type DynCollectionGateway = Arc<dyn CollectionGateway>;
pub type DynDisbursementGateway = Arc<dyn DisbursementGateway>;
pub type DynClock = Arc<dyn Clock>;
