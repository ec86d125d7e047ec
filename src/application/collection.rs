use super::audit::Auditor;
use crate::domain::audit::{AuditEvent, AuditSubject};
use crate::domain::gateway::{DebitRequest, GatewayError};
use crate::domain::ids::{CorrelationToken, PayerId, PaymentId, SubscriptionId};
use crate::domain::money::Amount;
use crate::domain::payment::{PayerStatus, Payment, PaymentFailure, PaymentState, PaymentTransition};
use crate::domain::phone::Msisdn;
use crate::domain::ports::{DynClock, DynCollectionGateway, DynPaymentStore};
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Gateway field limits for STK push requests.
pub const TRANSACTION_DESC_MAX: usize = 13;
pub const ACCOUNT_REFERENCE_MAX: usize = 12;

/// Accepted amount range, in whole currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub min_amount: u64,
    pub max_amount: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            min_amount: 1,
            max_amount: 250_000,
        }
    }
}

/// A request from the membership application to collect a premium.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRequest {
    pub payer: PayerId,
    pub subscription: SubscriptionId,
    pub phone: String,
    pub amount: Decimal,
    pub description: String,
}

/// Returned once the gateway has accepted the debit request and the payer's
/// handset is being prompted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionReceipt {
    pub payment_id: PaymentId,
    pub correlation: CorrelationToken,
    pub prompt: String,
}

/// Starts collections: persists the payment, then asks the gateway to debit
/// the payer exactly once.
#[derive(Clone)]
pub struct CollectionInitiator {
    payments: DynPaymentStore,
    gateway: DynCollectionGateway,
    auditor: Auditor,
    clock: DynClock,
    config: CollectionConfig,
}

impl CollectionInitiator {
    pub fn new(
        payments: DynPaymentStore,
        gateway: DynCollectionGateway,
        auditor: Auditor,
        clock: DynClock,
        config: CollectionConfig,
    ) -> Self {
        Self {
            payments,
            gateway,
            auditor,
            clock,
            config,
        }
    }

    pub async fn initiate(&self, request: CollectionRequest) -> Result<CollectionReceipt> {
        let amount = self.validate_amount(request.amount)?;
        let phone = Msisdn::parse(&request.phone)?;
        let description = request.description.trim();
        if description.is_empty() {
            return Err(PaymentError::ValidationError(
                "description must not be empty".to_string(),
            ));
        }

        let payment = Payment::initiate(
            request.payer,
            request.subscription,
            phone,
            description.to_string(),
            amount,
            self.clock.now(),
        );
        let token = payment.correlation.clone();
        // Persisted first so a callback racing the debit response always
        // finds its payment.
        self.payments.insert(payment.clone()).await?;
        self.auditor
            .record(
                AuditSubject::Payment(payment.id),
                AuditEvent::PaymentInitiated {
                    token: token.clone(),
                    amount,
                },
            )
            .await;
        info!(%token, payment_id = %payment.id, %amount, "Collection initiated");

        let debit = DebitRequest {
            token: token.clone(),
            phone: payment.phone.clone(),
            amount,
            account_reference: truncate(payment.subscription.as_str(), ACCOUNT_REFERENCE_MAX),
            description: truncate(&payment.description, TRANSACTION_DESC_MAX),
        };

        match self.gateway.request_debit(debit).await {
            Ok(accepted) => {
                self.payments
                    .bind_request_id(&token, &accepted.request_id)
                    .await?;
                info!(%token, request_id = %accepted.request_id, "Debit request accepted");
                Ok(CollectionReceipt {
                    payment_id: payment.id,
                    correlation: token,
                    prompt: accepted.customer_message,
                })
            }
            Err(source) => {
                let failure = match &source {
                    GatewayError::Rejected { code, description } => {
                        PaymentFailure::GatewayRejected {
                            code: code.clone(),
                            description: description.clone(),
                        }
                    }
                    other => PaymentFailure::GatewayUnreachable {
                        detail: other.to_string(),
                    },
                };
                warn!(%token, error = %source, "Debit request failed, payment marked failed");
                let outcome = self
                    .payments
                    .mark_terminal(
                        &token,
                        PaymentTransition::Fail(failure.clone()),
                        self.clock.now(),
                    )
                    .await?;
                if outcome.is_applied() {
                    self.auditor
                        .record(
                            AuditSubject::Payment(payment.id),
                            AuditEvent::PaymentTransitioned {
                                from: PaymentState::Initiated,
                                to: PaymentState::Failed,
                                detail: Some(failure.to_string()),
                            },
                        )
                        .await;
                }
                Err(PaymentError::CollectionNotSent { token, source })
            }
        }
    }

    /// Payer-visible status for a correlation token.
    pub async fn status(&self, token: &CorrelationToken) -> Result<Option<PayerStatus>> {
        Ok(self
            .payments
            .lookup_by_token(token)
            .await?
            .map(|p| p.payer_status()))
    }

    fn validate_amount(&self, raw: Decimal) -> Result<Amount> {
        let amount = Amount::new(raw)?;
        let value = amount.value();
        if value < Decimal::from(self.config.min_amount)
            || value > Decimal::from(self.config.max_amount)
        {
            return Err(PaymentError::ValidationError(format!(
                "amount {amount} outside allowed range {}..={}",
                self.config.min_amount, self.config.max_amount
            )));
        }
        Ok(amount)
    }
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}
