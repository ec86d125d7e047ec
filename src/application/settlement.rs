use super::audit::Auditor;
use crate::domain::audit::{AuditEvent, AuditSubject};
use crate::domain::ids::{BatchId, RecipientId};
use crate::domain::money::Money;
use crate::domain::payment::Payment;
use crate::domain::ports::{BatchInsert, DynClock, DynPaymentStore, DynSettlementStore};
use crate::domain::rate::RecipientRole;
use crate::domain::settlement::{CommissionPayoutLineItem, SettlementBatch, SettlementPeriod};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    Created {
        batch: SettlementBatch,
        line_items: Vec<CommissionPayoutLineItem>,
    },
    /// A batch already exists for the period; nothing was written.
    AlreadySettled(SettlementBatch),
}

impl SettlementOutcome {
    pub fn batch(&self) -> &SettlementBatch {
        match self {
            SettlementOutcome::Created { batch, .. } | SettlementOutcome::AlreadySettled(batch) => {
                batch
            }
        }
    }
}

/// Groups a closed period's confirmed payments into one immutable batch with
/// a payout line item per `(recipient, role)`.
#[derive(Clone)]
pub struct SettlementAggregator {
    payments: DynPaymentStore,
    settlements: DynSettlementStore,
    auditor: Auditor,
    clock: DynClock,
    offset: FixedOffset,
}

impl SettlementAggregator {
    /// # Arguments
    ///
    /// * `offset` - The timezone whose calendar days define settlement periods.
    pub fn new(
        payments: DynPaymentStore,
        settlements: DynSettlementStore,
        auditor: Auditor,
        clock: DynClock,
        offset: FixedOffset,
    ) -> Self {
        Self {
            payments,
            settlements,
            auditor,
            clock,
            offset,
        }
    }

    pub async fn settle(&self, period: SettlementPeriod) -> Result<SettlementOutcome> {
        let now = self.clock.now();
        if !period.is_closed(now) {
            return Err(PaymentError::PeriodNotClosed(period.key.to_string()));
        }
        if let Some(existing) = self.settlements.batch_for_period(period.key).await? {
            return Ok(SettlementOutcome::AlreadySettled(existing));
        }

        let mut members = Vec::new();
        for payment in self.payments.confirmed_between(period.start, period.end).await? {
            if let Some(owner) = self.settlements.batch_of_payment(payment.id).await? {
                warn!(payment_id = %payment.id, batch = %owner, "Payment already settled in another batch");
                continue;
            }
            members.push(payment);
        }

        let batch_id = BatchId::new();
        let (batch, line_items) = aggregate(batch_id, period, &members, now);

        match self
            .settlements
            .create_batch(batch, line_items.clone())
            .await?
        {
            BatchInsert::Created(batch) => {
                self.auditor
                    .record(
                        AuditSubject::Batch(batch.id),
                        AuditEvent::BatchCreated {
                            period: batch.period.key,
                            payments: batch.payments.len(),
                            total_collected: batch.total_collected,
                            line_items: line_items.len(),
                        },
                    )
                    .await;
                info!(
                    period = %batch.period.key,
                    batch = %batch.id,
                    payments = batch.payments.len(),
                    line_items = line_items.len(),
                    total_collected = %batch.total_collected,
                    "Settlement batch created"
                );
                Ok(SettlementOutcome::Created { batch, line_items })
            }
            BatchInsert::PeriodExists(existing) => {
                info!(period = %existing.period.key, "Period settled concurrently");
                Ok(SettlementOutcome::AlreadySettled(existing))
            }
        }
    }

    pub async fn settle_day(&self, date: NaiveDate) -> Result<SettlementOutcome> {
        self.settle(SettlementPeriod::day(date, self.offset)?).await
    }

    /// Settles the previous day and every earlier closed day that still has
    /// confirmed payments outside any batch, oldest first.
    ///
    /// A payment whose day was already settled without it is reported, not
    /// added; batch membership is frozen.
    pub async fn settle_outstanding(&self) -> Result<Vec<SettlementOutcome>> {
        let now = self.clock.now();
        let today = SettlementPeriod::containing(now, self.offset)?;

        let mut unbatched: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        if let Some(yesterday) = today.key.date().pred_opt() {
            unbatched.insert(yesterday, 0);
        }
        for payment in self
            .payments
            .confirmed_between(DateTime::<Utc>::MIN_UTC, today.start)
            .await?
        {
            let Some(completed) = payment.completed_at else {
                continue;
            };
            if self.settlements.batch_of_payment(payment.id).await?.is_none() {
                let day = completed.with_timezone(&self.offset).date_naive();
                *unbatched.entry(day).or_default() += 1;
            }
        }

        let mut outcomes = Vec::with_capacity(unbatched.len());
        for (date, pending) in unbatched {
            let period = SettlementPeriod::day(date, self.offset)?;
            if !period.is_closed(now) {
                debug!(period = %period.key, "Period still within close grace");
                continue;
            }
            let outcome = self.settle(period).await?;
            if pending > 0 && matches!(outcome, SettlementOutcome::AlreadySettled(_)) {
                error!(
                    period = %period.key,
                    payments = pending,
                    "Confirmed payments missed their settlement batch and need manual resolution"
                );
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Settles the calendar day before today in the settlement timezone.
    pub async fn settle_previous_day(&self) -> Result<SettlementOutcome> {
        let today = SettlementPeriod::containing(self.clock.now(), self.offset)?;
        let yesterday = today.key.date().pred_opt().ok_or_else(|| {
            PaymentError::ValidationError(format!("no day before {}", today.key))
        })?;
        self.settle_day(yesterday).await
    }
}

fn aggregate(
    batch_id: BatchId,
    period: SettlementPeriod,
    members: &[Payment],
    now: DateTime<Utc>,
) -> (SettlementBatch, Vec<CommissionPayoutLineItem>) {
    let mut batch = SettlementBatch {
        id: batch_id,
        period,
        payments: Vec::with_capacity(members.len()),
        total_collected: Money::ZERO,
        total_insurer: Money::ZERO,
        total_tier1: Money::ZERO,
        total_tier2: Money::ZERO,
        total_residual: Money::ZERO,
        created_at: now,
    };
    let mut owed: BTreeMap<(RecipientId, RecipientRole), Money> = BTreeMap::new();

    for payment in members {
        // Confirmed payments always carry a split.
        let (Some(split), Some(confirmed)) = (payment.split, payment.confirmed_amount) else {
            continue;
        };
        let recipients = payment.recipients.clone().unwrap_or_default();

        batch.payments.push(payment.id);
        batch.total_collected += confirmed.as_money();
        batch.total_insurer += split.insurer();
        batch.total_tier1 += split.tier1();
        batch.total_tier2 += split.tier2();
        batch.total_residual += split.residual();

        let shares = [
            (recipients.tier1, RecipientRole::Tier1, split.tier1()),
            (recipients.tier2, RecipientRole::Tier2, split.tier2()),
        ];
        for (recipient, role, amount) in shares {
            if let Some(recipient) = recipient
                && !amount.is_zero()
            {
                *owed.entry((recipient, role)).or_default() += amount;
            }
        }
    }

    let line_items = owed
        .into_iter()
        .map(|((recipient, role), amount)| {
            CommissionPayoutLineItem::new(batch_id, recipient, role, amount, now)
        })
        .collect();
    (batch, line_items)
}
