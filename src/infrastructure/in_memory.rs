use crate::domain::audit::{AuditEntry, AuditSubject};
use crate::domain::ids::{BatchId, CorrelationToken, LineItemId, PaymentId};
use crate::domain::payment::{Payment, PaymentState, PaymentTransition};
use crate::domain::ports::{
    AuditLog, BatchInsert, LineItemFilter, PaymentStore, SettlementStore, TransferStore,
    TransitionOutcome,
};
use crate::domain::settlement::{
    CommissionPayoutLineItem, LineItemUpdate, PeriodKey, SettlementBatch,
};
use crate::domain::transfer::{OutboundTransfer, TransferOutcome};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Payments kept in insertion order, with secondary indices into the arena.
///
/// The indices are only touched under the store's write lock, so a lookup
/// and the compare-and-set that follows it observe the same state.
#[derive(Debug, Default)]
pub struct CorrelationIndex {
    payments: Vec<Payment>,
    by_id: HashMap<PaymentId, usize>,
    by_token: HashMap<CorrelationToken, usize>,
    by_request_id: HashMap<String, usize>,
    by_receipt: HashMap<String, usize>,
}

impl CorrelationIndex {
    pub fn insert(&mut self, payment: Payment) -> Result<()> {
        if self.by_token.contains_key(&payment.correlation) {
            return Err(PaymentError::DuplicateCorrelation(
                payment.correlation.to_string(),
            ));
        }
        let slot = self.payments.len();
        self.by_id.insert(payment.id, slot);
        self.by_token.insert(payment.correlation.clone(), slot);
        if let Some(request_id) = &payment.gateway_request_id {
            self.by_request_id.insert(request_id.clone(), slot);
        }
        self.payments.push(payment);
        Ok(())
    }

    pub fn lookup_by_token(&self, token: &CorrelationToken) -> Option<&Payment> {
        self.by_token.get(token).map(|&slot| &self.payments[slot])
    }

    pub fn lookup_by_request_id(&self, request_id: &str) -> Option<&Payment> {
        self.by_request_id
            .get(request_id)
            .map(|&slot| &self.payments[slot])
    }

    pub fn get(&self, id: PaymentId) -> Option<&Payment> {
        self.by_id.get(&id).map(|&slot| &self.payments[slot])
    }

    pub fn bind_request_id(&mut self, token: &CorrelationToken, request_id: &str) -> Result<()> {
        let slot = *self
            .by_token
            .get(token)
            .ok_or_else(|| PaymentError::NotFound(format!("payment {token}")))?;
        let payment = &mut self.payments[slot];
        if payment.state.is_terminal() || payment.gateway_request_id.is_some() {
            return Ok(());
        }
        payment.gateway_request_id = Some(request_id.to_string());
        self.by_request_id.insert(request_id.to_string(), slot);
        Ok(())
    }

    pub fn mark_terminal(
        &mut self,
        token: &CorrelationToken,
        transition: PaymentTransition,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome<Payment>> {
        let slot = *self
            .by_token
            .get(token)
            .ok_or_else(|| PaymentError::NotFound(format!("payment {token}")))?;
        let current = &self.payments[slot];
        if current.state != PaymentState::Initiated {
            return Ok(TransitionOutcome::Unchanged(current.clone()));
        }
        if let Some(receipt) = transition.receipt()
            && self.by_receipt.contains_key(receipt.as_str())
        {
            return Err(PaymentError::DuplicateReceipt(receipt.to_string()));
        }

        let next = current.apply(transition, at)?;
        if let Some(receipt) = &next.receipt {
            self.by_receipt.insert(receipt.as_str().to_string(), slot);
        }
        self.payments[slot] = next.clone();
        Ok(TransitionOutcome::Applied(next))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Payment> {
        self.payments.iter()
    }
}

/// A thread-safe in-memory payment store.
///
/// Every compare-and-set runs inside one write section of the `RwLock`.
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    index: Arc<RwLock<CorrelationIndex>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert(&self, payment: Payment) -> Result<()> {
        self.index.write().await.insert(payment)
    }

    async fn get(&self, id: PaymentId) -> Result<Option<Payment>> {
        Ok(self.index.read().await.get(id).cloned())
    }

    async fn lookup_by_token(&self, token: &CorrelationToken) -> Result<Option<Payment>> {
        Ok(self.index.read().await.lookup_by_token(token).cloned())
    }

    async fn lookup_by_request_id(&self, request_id: &str) -> Result<Option<Payment>> {
        Ok(self
            .index
            .read()
            .await
            .lookup_by_request_id(request_id)
            .cloned())
    }

    async fn bind_request_id(&self, token: &CorrelationToken, request_id: &str) -> Result<()> {
        self.index.write().await.bind_request_id(token, request_id)
    }

    async fn mark_terminal(
        &self,
        token: &CorrelationToken,
        transition: PaymentTransition,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome<Payment>> {
        self.index.write().await.mark_terminal(token, transition, at)
    }

    async fn confirmed_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Payment>> {
        let index = self.index.read().await;
        Ok(index
            .iter()
            .filter(|p| p.state == PaymentState::Confirmed)
            .filter(|p| p.completed_at.is_some_and(|at| start <= at && at < end))
            .cloned()
            .collect())
    }

    async fn initiated_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Payment>> {
        let index = self.index.read().await;
        Ok(index
            .iter()
            .filter(|p| p.state == PaymentState::Initiated && p.initiated_at < cutoff)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
struct SettlementState {
    batches: HashMap<BatchId, SettlementBatch>,
    by_period: HashMap<PeriodKey, BatchId>,
    claims: HashMap<PaymentId, BatchId>,
    line_items: HashMap<LineItemId, CommissionPayoutLineItem>,
}

/// In-memory settlement batches and payout line items.
#[derive(Default, Clone)]
pub struct InMemorySettlementStore {
    state: Arc<RwLock<SettlementState>>,
}

impl InMemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementStore for InMemorySettlementStore {
    async fn batch_for_period(&self, key: PeriodKey) -> Result<Option<SettlementBatch>> {
        let state = self.state.read().await;
        Ok(state
            .by_period
            .get(&key)
            .and_then(|id| state.batches.get(id))
            .cloned())
    }

    async fn batch(&self, id: BatchId) -> Result<Option<SettlementBatch>> {
        Ok(self.state.read().await.batches.get(&id).cloned())
    }

    async fn batches(&self) -> Result<Vec<SettlementBatch>> {
        let state = self.state.read().await;
        let mut batches: Vec<_> = state.batches.values().cloned().collect();
        batches.sort_by_key(|b| b.period.key);
        Ok(batches)
    }

    async fn batch_of_payment(&self, payment: PaymentId) -> Result<Option<BatchId>> {
        Ok(self.state.read().await.claims.get(&payment).copied())
    }

    async fn create_batch(
        &self,
        batch: SettlementBatch,
        items: Vec<CommissionPayoutLineItem>,
    ) -> Result<BatchInsert> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .by_period
            .get(&batch.period.key)
            .and_then(|id| state.batches.get(id))
        {
            return Ok(BatchInsert::PeriodExists(existing.clone()));
        }
        if let Some((payment, owner)) = batch
            .payments
            .iter()
            .find_map(|p| state.claims.get(p).map(|owner| (p, owner)))
        {
            return Err(PaymentError::AlreadyClaimed(
                payment.to_string(),
                owner.to_string(),
            ));
        }

        for payment in &batch.payments {
            state.claims.insert(*payment, batch.id);
        }
        for item in items {
            state.line_items.insert(item.id, item);
        }
        state.by_period.insert(batch.period.key, batch.id);
        state.batches.insert(batch.id, batch.clone());
        Ok(BatchInsert::Created(batch))
    }

    async fn line_item(&self, id: LineItemId) -> Result<Option<CommissionPayoutLineItem>> {
        Ok(self.state.read().await.line_items.get(&id).cloned())
    }

    async fn line_items(&self, filter: &LineItemFilter) -> Result<Vec<CommissionPayoutLineItem>> {
        let state = self.state.read().await;
        let mut items: Vec<_> = state
            .line_items
            .values()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn update_line_item(
        &self,
        id: LineItemId,
        update: LineItemUpdate,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome<CommissionPayoutLineItem>> {
        let mut state = self.state.write().await;
        let current = state
            .line_items
            .get(&id)
            .cloned()
            .ok_or_else(|| PaymentError::NotFound(format!("line item {id}")))?;
        match current.apply(update, at) {
            Ok(next) => {
                state.line_items.insert(id, next.clone());
                Ok(TransitionOutcome::Applied(next))
            }
            Err(PaymentError::InvalidTransition(_)) => Ok(TransitionOutcome::Unchanged(current)),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Default)]
struct TransferState {
    transfers: HashMap<CorrelationToken, OutboundTransfer>,
    by_line_item: HashMap<LineItemId, Vec<CorrelationToken>>,
}

/// In-memory outbound transfer attempts.
#[derive(Default, Clone)]
pub struct InMemoryTransferStore {
    state: Arc<RwLock<TransferState>>,
}

impl InMemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferStore for InMemoryTransferStore {
    async fn insert_transfer(&self, transfer: OutboundTransfer) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if state.transfers.contains_key(&transfer.correlation) {
            return Err(PaymentError::DuplicateCorrelation(
                transfer.correlation.to_string(),
            ));
        }
        let siblings = state.by_line_item.entry(transfer.line_item).or_default();
        let attempt_taken = siblings.iter().any(|token| {
            state
                .transfers
                .get(token)
                .is_some_and(|t| t.attempt == transfer.attempt)
        });
        if attempt_taken {
            return Err(PaymentError::Conflict(format!(
                "attempt {} already exists for line item {}",
                transfer.attempt, transfer.line_item
            )));
        }
        siblings.push(transfer.correlation.clone());
        state
            .transfers
            .insert(transfer.correlation.clone(), transfer);
        Ok(())
    }

    async fn transfer_by_token(&self, token: &CorrelationToken) -> Result<Option<OutboundTransfer>> {
        Ok(self.state.read().await.transfers.get(token).cloned())
    }

    async fn bind_conversation(
        &self,
        token: &CorrelationToken,
        conversation_id: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let transfer = state
            .transfers
            .get_mut(token)
            .ok_or_else(|| PaymentError::NotFound(format!("transfer {token}")))?;
        if transfer.conversation_id.is_none() {
            transfer.conversation_id = Some(conversation_id.to_string());
        }
        Ok(())
    }

    async fn settle_transfer(
        &self,
        token: &CorrelationToken,
        outcome: TransferOutcome,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome<OutboundTransfer>> {
        let mut state = self.state.write().await;
        let current = state
            .transfers
            .get(token)
            .cloned()
            .ok_or_else(|| PaymentError::NotFound(format!("transfer {token}")))?;
        match current.settle(outcome, at) {
            Ok(next) => {
                state.transfers.insert(token.clone(), next.clone());
                Ok(TransitionOutcome::Applied(next))
            }
            Err(PaymentError::InvalidTransition(_)) => Ok(TransitionOutcome::Unchanged(current)),
            Err(e) => Err(e),
        }
    }

    async fn transfers_for(&self, line_item: LineItemId) -> Result<Vec<OutboundTransfer>> {
        let state = self.state.read().await;
        let mut transfers: Vec<_> = state
            .by_line_item
            .get(&line_item)
            .into_iter()
            .flatten()
            .filter_map(|token| state.transfers.get(token).cloned())
            .collect();
        transfers.sort_by_key(|t| t.attempt);
        Ok(transfers)
    }
}

/// Append-only in-memory audit trail.
#[derive(Default, Clone)]
pub struct InMemoryAuditLog {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, mut entry: AuditEntry) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let sequence = entries.len() as u64 + 1;
        entry.sequence = sequence;
        entries.push(entry);
        Ok(sequence)
    }

    async fn entries_for(&self, subject: &AuditSubject) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| &e.subject == subject)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::AuditEvent;
    use crate::domain::ids::{PayerId, ReceiptId, RecipientId, SubscriptionId};
    use crate::domain::money::{Amount, Money};
    use crate::domain::payment::{CollectedFunds, PaymentFailure};
    use crate::domain::phone::Msisdn;
    use crate::domain::rate::RecipientRole;
    use crate::domain::settlement::{LineItemState, SettlementPeriod};
    use chrono::{FixedOffset, NaiveDate};
    use rust_decimal_macros::dec;

    fn payment() -> Payment {
        Payment::initiate(
            PayerId::from("member-1"),
            SubscriptionId::from("sub-1"),
            Msisdn::parse("254712345678").unwrap(),
            "Premium".to_string(),
            Amount::new(dec!(50)).unwrap(),
            Utc::now(),
        )
    }

    fn unsplit(receipt: &str) -> PaymentTransition {
        PaymentTransition::ConfirmUnsplit {
            funds: CollectedFunds {
                receipt: ReceiptId::from(receipt),
                amount: Amount::new(dec!(50)).unwrap(),
            },
            reason: "no rates".to_string(),
        }
    }

    fn empty_batch(day: u32) -> SettlementBatch {
        let eat = FixedOffset::east_opt(3 * 3600).unwrap();
        SettlementBatch {
            id: BatchId::new(),
            period: SettlementPeriod::day(NaiveDate::from_ymd_opt(2026, 3, day).unwrap(), eat)
                .unwrap(),
            payments: vec![],
            total_collected: Money::ZERO,
            total_insurer: Money::ZERO,
            total_tier1: Money::ZERO,
            total_tier2: Money::ZERO,
            total_residual: Money::ZERO,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_payment_store_rejects_duplicate_token() {
        let store = InMemoryPaymentStore::new();
        let payment = payment();
        store.insert(payment.clone()).await.unwrap();
        let again = store.insert(payment).await;
        assert!(matches!(again, Err(PaymentError::DuplicateCorrelation(_))));
    }

    #[tokio::test]
    async fn test_mark_terminal_is_compare_and_set() {
        let store = InMemoryPaymentStore::new();
        let payment = payment();
        store.insert(payment.clone()).await.unwrap();

        let first = store
            .mark_terminal(&payment.correlation, unsplit("R1"), Utc::now())
            .await
            .unwrap();
        assert!(first.is_applied());

        let second = store
            .mark_terminal(
                &payment.correlation,
                PaymentTransition::Fail(PaymentFailure::Declined {
                    code: 1032,
                    description: "cancelled".to_string(),
                }),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!second.is_applied());
        assert_eq!(second.into_inner().state, PaymentState::ConfirmedUnsplit);
    }

    #[tokio::test]
    async fn test_receipt_is_unique_across_payments() {
        let store = InMemoryPaymentStore::new();
        let (a, b) = (payment(), payment());
        store.insert(a.clone()).await.unwrap();
        store.insert(b.clone()).await.unwrap();

        store
            .mark_terminal(&a.correlation, unsplit("NLJ7RT61SV"), Utc::now())
            .await
            .unwrap();
        let result = store
            .mark_terminal(&b.correlation, unsplit("NLJ7RT61SV"), Utc::now())
            .await;
        assert!(matches!(result, Err(PaymentError::DuplicateReceipt(_))));

        let b = store.lookup_by_token(&b.correlation).await.unwrap().unwrap();
        assert_eq!(b.state, PaymentState::Initiated);
    }

    #[tokio::test]
    async fn test_request_id_lookup() {
        let store = InMemoryPaymentStore::new();
        let payment = payment();
        store.insert(payment.clone()).await.unwrap();
        store
            .bind_request_id(&payment.correlation, "ws_CO_123")
            .await
            .unwrap();

        let found = store.lookup_by_request_id("ws_CO_123").await.unwrap();
        assert_eq!(found.map(|p| p.id), Some(payment.id));
        assert!(store.lookup_by_request_id("ws_CO_999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_batch_per_period() {
        let store = InMemorySettlementStore::new();
        let first = empty_batch(14);
        let second = empty_batch(14);

        assert!(matches!(
            store.create_batch(first.clone(), vec![]).await.unwrap(),
            BatchInsert::Created(_)
        ));
        match store.create_batch(second, vec![]).await.unwrap() {
            BatchInsert::PeriodExists(existing) => assert_eq!(existing.id, first.id),
            other => panic!("expected PeriodExists, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_payment_claimed_by_one_batch_only() {
        let store = InMemorySettlementStore::new();
        let payment = PaymentId::new();
        let mut first = empty_batch(14);
        first.payments = vec![payment];
        let mut second = empty_batch(15);
        second.payments = vec![payment];

        store.create_batch(first.clone(), vec![]).await.unwrap();
        let result = store.create_batch(second.clone(), vec![]).await;
        assert!(matches!(result, Err(PaymentError::AlreadyClaimed(_, _))));
        assert_eq!(store.batch_of_payment(payment).await.unwrap(), Some(first.id));
        assert!(store.batch_for_period(second.period.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_line_item_update_leaves_paid_untouched() {
        let store = InMemorySettlementStore::new();
        let batch = empty_batch(14);
        let item = CommissionPayoutLineItem::new(
            batch.id,
            RecipientId::from("agent-1"),
            RecipientRole::Tier1,
            Money::from(6),
            Utc::now(),
        );
        store.create_batch(batch, vec![item.clone()]).await.unwrap();

        let token = CorrelationToken::generate();
        store
            .update_line_item(
                item.id,
                LineItemUpdate::BeginAttempt {
                    attempt: 1,
                    transfer: token.clone(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        store
            .update_line_item(
                item.id,
                LineItemUpdate::Paid {
                    transfer: token,
                    reference: "QK1".to_string(),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let outcome = store
            .update_line_item(item.id, LineItemUpdate::Requeue, Utc::now())
            .await
            .unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(outcome.into_inner().state, LineItemState::Paid);
    }

    #[tokio::test]
    async fn test_transfer_attempts_are_unique_per_line_item() {
        let store = InMemoryTransferStore::new();
        let line_item = LineItemId::new();
        store
            .insert_transfer(OutboundTransfer::start(
                line_item,
                1,
                CorrelationToken::generate(),
                Utc::now(),
            ))
            .await
            .unwrap();
        let result = store
            .insert_transfer(OutboundTransfer::start(
                line_item,
                1,
                CorrelationToken::generate(),
                Utc::now(),
            ))
            .await;
        assert!(matches!(result, Err(PaymentError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_audit_log_assigns_sequence() {
        let log = InMemoryAuditLog::new();
        let subject = AuditSubject::Payment(PaymentId::new());
        let event = AuditEvent::PaymentInitiated {
            token: CorrelationToken::generate(),
            amount: Amount::new(dec!(50)).unwrap(),
        };
        let first = log
            .append(AuditEntry::new(Utc::now(), subject.clone(), event.clone()))
            .await
            .unwrap();
        let second = log
            .append(AuditEntry::new(
                Utc::now(),
                AuditSubject::Batch(BatchId::new()),
                event,
            ))
            .await
            .unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(log.entries_for(&subject).await.unwrap().len(), 1);
    }
}
