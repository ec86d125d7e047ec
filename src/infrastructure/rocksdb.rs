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
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode,
    OptimisticTransactionDB, Options, Transaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub const CF_PAYMENTS: &str = "payments";
pub const CF_PAYMENT_TOKENS: &str = "payment_tokens";
pub const CF_PAYMENT_REQUESTS: &str = "payment_requests";
pub const CF_PAYMENT_RECEIPTS: &str = "payment_receipts";
pub const CF_BATCHES: &str = "batches";
pub const CF_BATCH_PERIODS: &str = "batch_periods";
pub const CF_BATCH_CLAIMS: &str = "batch_claims";
pub const CF_LINE_ITEMS: &str = "line_items";
pub const CF_TRANSFERS: &str = "transfers";
pub const CF_TRANSFER_ATTEMPTS: &str = "transfer_attempts";
pub const CF_AUDIT: &str = "audit";
pub const CF_META: &str = "meta";

const COLUMN_FAMILIES: [&str; 12] = [
    CF_PAYMENTS,
    CF_PAYMENT_TOKENS,
    CF_PAYMENT_REQUESTS,
    CF_PAYMENT_RECEIPTS,
    CF_BATCHES,
    CF_BATCH_PERIODS,
    CF_BATCH_CLAIMS,
    CF_LINE_ITEMS,
    CF_TRANSFERS,
    CF_TRANSFER_ATTEMPTS,
    CF_AUDIT,
    CF_META,
];

const AUDIT_SEQUENCE_KEY: &[u8] = b"audit_sequence";
const MAX_COMMIT_ATTEMPTS: usize = 8;

type Txn<'a> = Transaction<'a, OptimisticTransactionDB>;

/// A persistent store implementation using RocksDB.
///
/// Records are serde_json values in one column family per record type, with
/// index column families enforcing uniqueness (tokens, receipts, period keys,
/// payment claims, transfer attempts). Every conditional update runs in an
/// optimistic transaction that reads its preconditions with
/// `get_for_update` and is retried when a concurrent writer wins.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<OptimisticTransactionDB>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating any
    /// missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = OptimisticTransactionDB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            PaymentError::InternalError(Box::new(std::io::Error::other(format!(
                "{name} column family not found"
            ))))
        })
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        self.db
            .get_cf(self.cf(cf)?, key)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        self.db
            .iterator_cf(self.cf(cf)?, IteratorMode::Start)
            .map(|item| {
                let (_key, value) = item?;
                decode(&value)
            })
            .collect()
    }

    fn payment_id_for(&self, index: &str, key: &[u8]) -> Result<Option<PaymentId>> {
        self.read(index, key)
    }

    /// Runs `f` inside an optimistic transaction, retrying on write conflicts.
    /// An error from `f` rolls the transaction back.
    fn transact<R>(&self, mut f: impl FnMut(&Txn<'_>) -> Result<R>) -> Result<R> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let txn = self.db.transaction();
            let result = f(&txn)?;
            match txn.commit() {
                Ok(()) => return Ok(result),
                Err(e) if matches!(e.kind(), ErrorKind::Busy | ErrorKind::TryAgain) => {
                    debug!(attempt, "RocksDB write conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(PaymentError::Conflict(format!(
            "gave up after {MAX_COMMIT_ATTEMPTS} conflicting commits"
        )))
    }

    fn locked<T: DeserializeOwned>(&self, txn: &Txn<'_>, cf: &str, key: &[u8]) -> Result<Option<T>> {
        txn.get_for_update_cf(self.cf(cf)?, key, true)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn put<T: Serialize>(&self, txn: &Txn<'_>, cf: &str, key: &[u8], value: &T) -> Result<()> {
        txn.put_cf(self.cf(cf)?, key, encode(value)?)?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| PaymentError::InternalError(Box::new(e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| PaymentError::InternalError(Box::new(e)))
}

fn attempt_key(line_item: LineItemId, attempt: u32) -> Vec<u8> {
    let mut key = line_item.as_uuid().as_bytes().to_vec();
    key.extend_from_slice(&attempt.to_be_bytes());
    key
}

#[async_trait]
impl PaymentStore for RocksDBStore {
    async fn insert(&self, payment: Payment) -> Result<()> {
        self.transact(|txn| {
            let token = payment.correlation.as_str().as_bytes();
            if self.locked::<PaymentId>(txn, CF_PAYMENT_TOKENS, token)?.is_some() {
                return Err(PaymentError::DuplicateCorrelation(
                    payment.correlation.to_string(),
                ));
            }
            let key = payment.id.as_uuid().as_bytes();
            self.put(txn, CF_PAYMENTS, key, &payment)?;
            self.put(txn, CF_PAYMENT_TOKENS, token, &payment.id)?;
            if let Some(request_id) = &payment.gateway_request_id {
                self.put(txn, CF_PAYMENT_REQUESTS, request_id.as_bytes(), &payment.id)?;
            }
            Ok(())
        })
    }

    async fn get(&self, id: PaymentId) -> Result<Option<Payment>> {
        self.read(CF_PAYMENTS, id.as_uuid().as_bytes())
    }

    async fn lookup_by_token(&self, token: &CorrelationToken) -> Result<Option<Payment>> {
        match self.payment_id_for(CF_PAYMENT_TOKENS, token.as_str().as_bytes())? {
            Some(id) => self.read(CF_PAYMENTS, id.as_uuid().as_bytes()),
            None => Ok(None),
        }
    }

    async fn lookup_by_request_id(&self, request_id: &str) -> Result<Option<Payment>> {
        match self.payment_id_for(CF_PAYMENT_REQUESTS, request_id.as_bytes())? {
            Some(id) => self.read(CF_PAYMENTS, id.as_uuid().as_bytes()),
            None => Ok(None),
        }
    }

    async fn bind_request_id(&self, token: &CorrelationToken, request_id: &str) -> Result<()> {
        self.transact(|txn| {
            let id: PaymentId = self
                .locked(txn, CF_PAYMENT_TOKENS, token.as_str().as_bytes())?
                .ok_or_else(|| PaymentError::NotFound(format!("payment {token}")))?;
            let key = id.as_uuid().as_bytes();
            let mut payment: Payment = self
                .locked(txn, CF_PAYMENTS, key)?
                .ok_or_else(|| PaymentError::NotFound(format!("payment {id}")))?;
            if payment.state.is_terminal() || payment.gateway_request_id.is_some() {
                return Ok(());
            }
            payment.gateway_request_id = Some(request_id.to_string());
            self.put(txn, CF_PAYMENTS, key, &payment)?;
            self.put(txn, CF_PAYMENT_REQUESTS, request_id.as_bytes(), &id)
        })
    }

    async fn mark_terminal(
        &self,
        token: &CorrelationToken,
        transition: PaymentTransition,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome<Payment>> {
        self.transact(|txn| {
            let id: PaymentId = self
                .locked(txn, CF_PAYMENT_TOKENS, token.as_str().as_bytes())?
                .ok_or_else(|| PaymentError::NotFound(format!("payment {token}")))?;
            let key = id.as_uuid().as_bytes();
            let current: Payment = self
                .locked(txn, CF_PAYMENTS, key)?
                .ok_or_else(|| PaymentError::NotFound(format!("payment {id}")))?;
            if current.state != PaymentState::Initiated {
                return Ok(TransitionOutcome::Unchanged(current));
            }
            if let Some(receipt) = transition.receipt()
                && self
                    .locked::<PaymentId>(txn, CF_PAYMENT_RECEIPTS, receipt.as_str().as_bytes())?
                    .is_some()
            {
                return Err(PaymentError::DuplicateReceipt(receipt.to_string()));
            }

            let next = current.apply(transition.clone(), at)?;
            self.put(txn, CF_PAYMENTS, key, &next)?;
            if let Some(receipt) = &next.receipt {
                self.put(txn, CF_PAYMENT_RECEIPTS, receipt.as_str().as_bytes(), &id)?;
            }
            Ok(TransitionOutcome::Applied(next))
        })
    }

    async fn confirmed_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Payment>> {
        let payments: Vec<Payment> = self.scan(CF_PAYMENTS)?;
        Ok(payments
            .into_iter()
            .filter(|p| p.state == PaymentState::Confirmed)
            .filter(|p| p.completed_at.is_some_and(|at| start <= at && at < end))
            .collect())
    }

    async fn initiated_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Payment>> {
        let payments: Vec<Payment> = self.scan(CF_PAYMENTS)?;
        Ok(payments
            .into_iter()
            .filter(|p| p.state == PaymentState::Initiated && p.initiated_at < cutoff)
            .collect())
    }
}

#[async_trait]
impl SettlementStore for RocksDBStore {
    async fn batch_for_period(&self, key: PeriodKey) -> Result<Option<SettlementBatch>> {
        let id: Option<BatchId> = self.read(CF_BATCH_PERIODS, key.to_string().as_bytes())?;
        match id {
            Some(id) => self.read(CF_BATCHES, id.as_uuid().as_bytes()),
            None => Ok(None),
        }
    }

    async fn batch(&self, id: BatchId) -> Result<Option<SettlementBatch>> {
        self.read(CF_BATCHES, id.as_uuid().as_bytes())
    }

    async fn batches(&self) -> Result<Vec<SettlementBatch>> {
        let mut batches: Vec<SettlementBatch> = self.scan(CF_BATCHES)?;
        batches.sort_by_key(|b| b.period.key);
        Ok(batches)
    }

    async fn batch_of_payment(&self, payment: PaymentId) -> Result<Option<BatchId>> {
        self.read(CF_BATCH_CLAIMS, payment.as_uuid().as_bytes())
    }

    async fn create_batch(
        &self,
        batch: SettlementBatch,
        items: Vec<CommissionPayoutLineItem>,
    ) -> Result<BatchInsert> {
        let period_key = batch.period.key.to_string();
        self.transact(|txn| {
            if let Some(existing) =
                self.locked::<BatchId>(txn, CF_BATCH_PERIODS, period_key.as_bytes())?
            {
                let existing: SettlementBatch = self
                    .locked(txn, CF_BATCHES, existing.as_uuid().as_bytes())?
                    .ok_or_else(|| PaymentError::NotFound(format!("batch {existing}")))?;
                return Ok(BatchInsert::PeriodExists(existing));
            }
            for payment in &batch.payments {
                let claim = payment.as_uuid().as_bytes();
                if let Some(owner) = self.locked::<BatchId>(txn, CF_BATCH_CLAIMS, claim)? {
                    return Err(PaymentError::AlreadyClaimed(
                        payment.to_string(),
                        owner.to_string(),
                    ));
                }
                self.put(txn, CF_BATCH_CLAIMS, claim, &batch.id)?;
            }
            for item in &items {
                self.put(txn, CF_LINE_ITEMS, item.id.as_uuid().as_bytes(), item)?;
            }
            self.put(txn, CF_BATCHES, batch.id.as_uuid().as_bytes(), &batch)?;
            self.put(txn, CF_BATCH_PERIODS, period_key.as_bytes(), &batch.id)?;
            Ok(BatchInsert::Created(batch.clone()))
        })
    }

    async fn line_item(&self, id: LineItemId) -> Result<Option<CommissionPayoutLineItem>> {
        self.read(CF_LINE_ITEMS, id.as_uuid().as_bytes())
    }

    async fn line_items(&self, filter: &LineItemFilter) -> Result<Vec<CommissionPayoutLineItem>> {
        let items: Vec<CommissionPayoutLineItem> = self.scan(CF_LINE_ITEMS)?;
        let mut items: Vec<_> = items.into_iter().filter(|i| filter.matches(i)).collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn update_line_item(
        &self,
        id: LineItemId,
        update: LineItemUpdate,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome<CommissionPayoutLineItem>> {
        let key = id.as_uuid().as_bytes();
        self.transact(|txn| {
            let current: CommissionPayoutLineItem = self
                .locked(txn, CF_LINE_ITEMS, key)?
                .ok_or_else(|| PaymentError::NotFound(format!("line item {id}")))?;
            match current.apply(update.clone(), at) {
                Ok(next) => {
                    self.put(txn, CF_LINE_ITEMS, key, &next)?;
                    Ok(TransitionOutcome::Applied(next))
                }
                Err(PaymentError::InvalidTransition(_)) => Ok(TransitionOutcome::Unchanged(current)),
                Err(e) => Err(e),
            }
        })
    }
}

#[async_trait]
impl TransferStore for RocksDBStore {
    async fn insert_transfer(&self, transfer: OutboundTransfer) -> Result<()> {
        let attempt = attempt_key(transfer.line_item, transfer.attempt);
        self.transact(|txn| {
            let token = transfer.correlation.as_str().as_bytes();
            if self.locked::<OutboundTransfer>(txn, CF_TRANSFERS, token)?.is_some() {
                return Err(PaymentError::DuplicateCorrelation(
                    transfer.correlation.to_string(),
                ));
            }
            if self
                .locked::<CorrelationToken>(txn, CF_TRANSFER_ATTEMPTS, &attempt)?
                .is_some()
            {
                return Err(PaymentError::Conflict(format!(
                    "attempt {} already exists for line item {}",
                    transfer.attempt, transfer.line_item
                )));
            }
            self.put(txn, CF_TRANSFERS, token, &transfer)?;
            self.put(txn, CF_TRANSFER_ATTEMPTS, &attempt, &transfer.correlation)
        })
    }

    async fn transfer_by_token(&self, token: &CorrelationToken) -> Result<Option<OutboundTransfer>> {
        self.read(CF_TRANSFERS, token.as_str().as_bytes())
    }

    async fn bind_conversation(
        &self,
        token: &CorrelationToken,
        conversation_id: &str,
    ) -> Result<()> {
        let key = token.as_str().as_bytes();
        self.transact(|txn| {
            let mut transfer: OutboundTransfer = self
                .locked(txn, CF_TRANSFERS, key)?
                .ok_or_else(|| PaymentError::NotFound(format!("transfer {token}")))?;
            if transfer.conversation_id.is_none() {
                transfer.conversation_id = Some(conversation_id.to_string());
                self.put(txn, CF_TRANSFERS, key, &transfer)?;
            }
            Ok(())
        })
    }

    async fn settle_transfer(
        &self,
        token: &CorrelationToken,
        outcome: TransferOutcome,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome<OutboundTransfer>> {
        let key = token.as_str().as_bytes();
        self.transact(|txn| {
            let current: OutboundTransfer = self
                .locked(txn, CF_TRANSFERS, key)?
                .ok_or_else(|| PaymentError::NotFound(format!("transfer {token}")))?;
            match current.settle(outcome.clone(), at) {
                Ok(next) => {
                    self.put(txn, CF_TRANSFERS, key, &next)?;
                    Ok(TransitionOutcome::Applied(next))
                }
                Err(PaymentError::InvalidTransition(_)) => Ok(TransitionOutcome::Unchanged(current)),
                Err(e) => Err(e),
            }
        })
    }

    async fn transfers_for(&self, line_item: LineItemId) -> Result<Vec<OutboundTransfer>> {
        let prefix = line_item.as_uuid().as_bytes().to_vec();
        let iter = self.db.iterator_cf(
            self.cf(CF_TRANSFER_ATTEMPTS)?,
            IteratorMode::From(&prefix, Direction::Forward),
        );

        let mut transfers = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let token: CorrelationToken = decode(&value)?;
            if let Some(transfer) = self.read(CF_TRANSFERS, token.as_str().as_bytes())? {
                transfers.push(transfer);
            }
        }
        Ok(transfers)
    }
}

#[async_trait]
impl AuditLog for RocksDBStore {
    async fn append(&self, entry: AuditEntry) -> Result<u64> {
        self.transact(|txn| {
            let last: u64 = self.locked(txn, CF_META, AUDIT_SEQUENCE_KEY)?.unwrap_or(0);
            let sequence = last + 1;
            let mut entry = entry.clone();
            entry.sequence = sequence;
            self.put(txn, CF_AUDIT, &sequence.to_be_bytes(), &entry)?;
            self.put(txn, CF_META, AUDIT_SEQUENCE_KEY, &sequence)?;
            Ok(sequence)
        })
    }

    async fn entries_for(&self, subject: &AuditSubject) -> Result<Vec<AuditEntry>> {
        let entries: Vec<AuditEntry> = self.scan(CF_AUDIT)?;
        Ok(entries
            .into_iter()
            .filter(|e| &e.subject == subject)
            .collect())
    }
}
