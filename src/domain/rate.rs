use super::ids::{RecipientId, SchemeId};
use super::money::{Amount, Money};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Commission configuration attached to a medical scheme.
///
/// Portions are fixed amounts quoted against one nominal daily premium
/// (`nominal_daily_unit`). Payments of a different size scale every portion
/// by `confirmed / nominal_daily_unit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateStructure {
    pub scheme: SchemeId,
    pub nominal_daily_unit: Amount,
    pub insurer_portion: Money,
    pub tier1_commission: Money,
    pub tier2_commission: Money,
}

impl RateStructure {
    /// Sum of the fixed portions; must not exceed the nominal unit.
    pub fn allocated(&self) -> Money {
        self.insurer_portion + self.tier1_commission + self.tier2_commission
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientRole {
    Tier1,
    Tier2,
}

impl fmt::Display for RecipientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipientRole::Tier1 => f.write_str("tier1"),
            RecipientRole::Tier2 => f.write_str("tier2"),
        }
    }
}

/// A payer's position in the referral hierarchy at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReferralAssignment {
    /// Direct referrer.
    pub tier1: Option<RecipientId>,
    /// The direct referrer's supervisor.
    pub tier2: Option<RecipientId>,
}
