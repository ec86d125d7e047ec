//! Gateway-neutral request and response shapes for mobile-money debits
//! (collections) and credits (payouts).

use super::ids::{CorrelationToken, ReceiptId};
use super::money::Amount;
use super::phone::Msisdn;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The request did not complete: connection failure, TLS error or timeout.
    #[error("gateway unreachable: {0}")]
    Unreachable(String),
    /// The gateway answered but refused the request.
    #[error("gateway rejected request ({code}): {description}")]
    Rejected { code: String, description: String },
    /// Access token could not be obtained.
    #[error("gateway authentication failed: {0}")]
    Auth(String),
    /// The response could not be understood.
    #[error("malformed gateway response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebitRequest {
    pub token: CorrelationToken,
    pub phone: Msisdn,
    pub amount: Amount,
    pub account_reference: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebitAccepted {
    /// Gateway-assigned request id (`CheckoutRequestID`).
    pub request_id: String,
    pub merchant_request_id: String,
    /// Message suitable for showing to the payer.
    pub customer_message: String,
}

/// Result of a status query for a debit whose callback has not arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebitStatus {
    /// The gateway is still waiting on the payer.
    Pending,
    Completed {
        result_code: i64,
        description: String,
        receipt: Option<ReceiptId>,
        amount: Option<Amount>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditRequest {
    pub token: CorrelationToken,
    pub phone: Msisdn,
    pub amount: Amount,
    pub remarks: String,
    pub occasion: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditAccepted {
    pub conversation_id: String,
    pub originator_conversation_id: String,
}
