use crate::domain::ids::{PayerId, RecipientId, SchemeId, SubscriptionId};
use crate::domain::phone::Msisdn;
use crate::domain::ports::{HierarchyResolver, RateResolver, RecipientDirectory};
use crate::domain::rate::{RateStructure, ReferralAssignment};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

/// Read-only snapshot of the lookups owned by other parts of the platform:
/// scheme rates, subscription → scheme, referral hierarchy and recipient
/// phone numbers.
///
/// ```json
/// {
///   "schemes": [{ "scheme": "afya-basic", "nominal_daily_unit": 50,
///                 "insurer_portion": 40, "tier1_commission": 6, "tier2_commission": 2 }],
///   "subscriptions": { "sub-1": "afya-basic" },
///   "referrals": { "member-1": { "tier1": "agent-1", "tier2": "supervisor-1" } },
///   "recipients": { "agent-1": "0712345678" }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticCatalog {
    #[serde(default)]
    schemes: Vec<RateStructure>,
    #[serde(default)]
    subscriptions: HashMap<SubscriptionId, SchemeId>,
    #[serde(default)]
    referrals: HashMap<PayerId, ReferralAssignment>,
    #[serde(default)]
    recipients: HashMap<RecipientId, String>,
}

impl StaticCatalog {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let catalog: Self = serde_json::from_str(raw)
            .map_err(|e| PaymentError::ConfigError(format!("invalid catalog: {e}")))?;
        for subscription in catalog.subscriptions.values() {
            if catalog.scheme(subscription).is_none() {
                warn!(scheme = %subscription, "Catalog references a scheme with no rates");
            }
        }
        Ok(catalog)
    }

    pub fn with_scheme(mut self, rates: RateStructure) -> Self {
        self.schemes.retain(|s| s.scheme != rates.scheme);
        self.schemes.push(rates);
        self
    }

    pub fn with_subscription(mut self, subscription: &str, scheme: &str) -> Self {
        self.subscriptions
            .insert(SubscriptionId::from(subscription), SchemeId::from(scheme));
        self
    }

    pub fn with_referral(mut self, payer: &str, assignment: ReferralAssignment) -> Self {
        self.referrals.insert(PayerId::from(payer), assignment);
        self
    }

    pub fn with_recipient(mut self, recipient: &str, phone: &str) -> Self {
        self.recipients
            .insert(RecipientId::from(recipient), phone.to_string());
        self
    }

    fn scheme(&self, scheme: &SchemeId) -> Option<&RateStructure> {
        self.schemes.iter().find(|s| &s.scheme == scheme)
    }
}

#[async_trait]
impl RateResolver for StaticCatalog {
    async fn rate_for(&self, subscription: &SubscriptionId) -> Result<Option<RateStructure>> {
        Ok(self
            .subscriptions
            .get(subscription)
            .and_then(|scheme| self.scheme(scheme))
            .cloned())
    }
}

#[async_trait]
impl HierarchyResolver for StaticCatalog {
    async fn assignment_for(&self, payer: &PayerId) -> Result<Option<ReferralAssignment>> {
        Ok(self.referrals.get(payer).cloned())
    }
}

#[async_trait]
impl RecipientDirectory for StaticCatalog {
    async fn payable_destination(&self, recipient: &RecipientId) -> Result<Option<Msisdn>> {
        let Some(raw) = self.recipients.get(recipient) else {
            return Ok(None);
        };
        match Msisdn::parse(raw) {
            Ok(phone) => Ok(Some(phone)),
            Err(e) => {
                warn!(%recipient, error = %e, "Recipient phone number is not payable");
                Ok(None)
            }
        }
    }
}
