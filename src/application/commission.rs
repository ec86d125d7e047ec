use crate::domain::ids::{PayerId, SchemeId, SubscriptionId};
use crate::domain::money::{Amount, Money};
use crate::domain::payment::{CommissionSplit, Recipients};
use crate::domain::ports::{DynHierarchyResolver, DynRateResolver};
use crate::domain::rate::RateStructure;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommissionError {
    #[error("no rate structure for subscription {0}")]
    MissingRates(SubscriptionId),
    #[error("scheme {scheme} allocates {allocated} out of a nominal unit of {nominal}")]
    RatesExceedNominal {
        scheme: SchemeId,
        allocated: Money,
        nominal: Amount,
    },
    #[error("portions {portions} exceed confirmed amount {confirmed}")]
    RatesExceedAmount { portions: Money, confirmed: Amount },
    #[error("lookup failed: {0}")]
    Lookup(String),
    #[error("arithmetic error: {0}")]
    Arithmetic(String),
}

/// Splits a confirmed amount into insurer, tier-1, tier-2 and residual
/// portions.
///
/// Each fixed portion is scaled by `confirmed / nominal_daily_unit` and
/// floored to whole units. The residual is whatever remains, so the four
/// portions always add up to the confirmed amount exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommissionCalculator;

impl CommissionCalculator {
    pub fn split(
        &self,
        confirmed: Amount,
        rates: &RateStructure,
        recipients: &Recipients,
    ) -> Result<CommissionSplit, CommissionError> {
        let allocated = rates.allocated();
        if allocated > rates.nominal_daily_unit.as_money() {
            return Err(CommissionError::RatesExceedNominal {
                scheme: rates.scheme.clone(),
                allocated,
                nominal: rates.nominal_daily_unit,
            });
        }

        let insurer = prorate(rates.insurer_portion, confirmed, rates.nominal_daily_unit)?;
        // A tier without a recipient earns nothing; its share stays with the platform.
        let tier1 = match recipients.tier1 {
            Some(_) => prorate(rates.tier1_commission, confirmed, rates.nominal_daily_unit)?,
            None => Money::ZERO,
        };
        let tier2 = match recipients.tier2 {
            Some(_) => prorate(rates.tier2_commission, confirmed, rates.nominal_daily_unit)?,
            None => Money::ZERO,
        };

        let portions = insurer + tier1 + tier2;
        let residual = confirmed
            .as_money()
            .checked_sub(portions)
            .ok_or(CommissionError::RatesExceedAmount {
                portions,
                confirmed,
            })?;

        CommissionSplit::from_parts(confirmed, insurer, tier1, tier2, residual)
            .map_err(|e| CommissionError::Arithmetic(e.to_string()))
    }
}

fn prorate(fixed: Money, confirmed: Amount, nominal: Amount) -> Result<Money, CommissionError> {
    let scaled = (fixed.value() * confirmed.value() / nominal.value()).floor();
    Money::new(scaled).map_err(|e| CommissionError::Arithmetic(e.to_string()))
}

/// Resolves rates and referral recipients for a payment, then computes its
/// split. Recipients are resolved once here and frozen onto the payment.
#[derive(Clone)]
pub struct CommissionService {
    rates: DynRateResolver,
    hierarchy: DynHierarchyResolver,
    calculator: CommissionCalculator,
}

impl CommissionService {
    pub fn new(rates: DynRateResolver, hierarchy: DynHierarchyResolver) -> Self {
        Self {
            rates,
            hierarchy,
            calculator: CommissionCalculator,
        }
    }

    pub async fn compute(
        &self,
        subscription: &SubscriptionId,
        payer: &PayerId,
        confirmed: Amount,
    ) -> Result<(CommissionSplit, Recipients), CommissionError> {
        let rates = self
            .rates
            .rate_for(subscription)
            .await
            .map_err(|e| CommissionError::Lookup(e.to_string()))?
            .ok_or_else(|| CommissionError::MissingRates(subscription.clone()))?;

        let assignment = self
            .hierarchy
            .assignment_for(payer)
            .await
            .map_err(|e| CommissionError::Lookup(e.to_string()))?
            .unwrap_or_default();

        let recipients = Recipients {
            tier1: assignment.tier1,
            tier2: assignment.tier2,
        };
        let split = self.calculator.split(confirmed, &rates, &recipients)?;
        Ok((split, recipients))
    }
}
