//! Typed bodies of the gateway's callbacks and the service API.
//!
//! Callbacks are deserialized into these structs first and only then turned
//! into domain notifications, so a payload that is missing a required field
//! is rejected as a whole instead of being half-applied.

use crate::application::collection::CollectionReceipt;
use crate::application::payout::{PayoutNotification, PayoutResult};
use crate::application::reconciler::{DebitNotification, DebitResult, NotificationSource};
use crate::domain::ids::{CorrelationToken, ReceiptId};
use crate::domain::money::Amount;
use crate::domain::payment::PayerStatus;
use crate::error::{PaymentError, Result};
use crate::infrastructure::gateway::types::parse_i64_from_string;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// `{"Body": {"stkCallback": {...}}}`
#[derive(Debug, Clone, Deserialize)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode", deserialize_with = "parse_i64_from_string")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: Option<Value>,
}

impl StkCallback {
    fn metadata(&self, name: &str) -> Option<&Value> {
        self.callback_metadata
            .as_ref()?
            .items
            .iter()
            .find(|item| item.name == name)?
            .value
            .as_ref()
    }

    /// Converts the callback into a debit notification.
    ///
    /// A success without a receipt number or amount is malformed: there is
    /// nothing to confirm the payment against.
    pub fn into_notification(self, token: Option<CorrelationToken>) -> Result<DebitNotification> {
        let result = if self.result_code == 0 {
            let receipt = self
                .metadata("MpesaReceiptNumber")
                .and_then(text)
                .ok_or_else(|| malformed("successful debit callback without MpesaReceiptNumber"))?;
            let amount = self
                .metadata("Amount")
                .and_then(decimal)
                .ok_or_else(|| malformed("successful debit callback without Amount"))?;
            DebitResult::Succeeded {
                receipt: ReceiptId::new(receipt),
                amount: Amount::new(amount)?,
            }
        } else {
            DebitResult::Declined {
                code: self.result_code,
                description: self.result_desc,
            }
        };

        Ok(DebitNotification {
            token,
            request_id: Some(self.checkout_request_id),
            result,
            source: NotificationSource::Callback,
        })
    }
}

/// The gateway sends a single parameter as an object and several as an array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(one) => std::slice::from_ref(one),
            OneOrMany::Many(many) => many,
        }
    }
}

/// `{"Result": {...}}`, posted to both the result and the timeout URL.
#[derive(Debug, Clone, Deserialize)]
pub struct B2cResultEnvelope {
    #[serde(rename = "Result")]
    pub result: B2cResult,
}

#[derive(Debug, Clone, Deserialize)]
pub struct B2cResult {
    #[serde(rename = "ResultType", default)]
    pub result_type: Option<Value>,
    #[serde(rename = "ResultCode", deserialize_with = "parse_i64_from_string")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "OriginatorConversationID")]
    pub originator_conversation_id: String,
    #[serde(rename = "ConversationID", default)]
    pub conversation_id: Option<String>,
    #[serde(rename = "TransactionID", default)]
    pub transaction_id: Option<String>,
    #[serde(rename = "ResultParameters", default)]
    pub result_parameters: Option<ResultParameters>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultParameters {
    #[serde(rename = "ResultParameter")]
    pub result_parameter: OneOrMany<ResultParameter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultParameter {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value", default)]
    pub value: Option<Value>,
}

impl B2cResult {
    fn parameter(&self, key: &str) -> Option<&Value> {
        self.result_parameters
            .as_ref()?
            .result_parameter
            .as_slice()
            .iter()
            .find(|p| p.key == key)?
            .value
            .as_ref()
    }

    /// Converts a result (or, with `timed_out`, a queue timeout) into a
    /// payout notification.
    pub fn into_notification(self, timed_out: bool) -> Result<PayoutNotification> {
        let token = CorrelationToken::parse(&self.originator_conversation_id).ok_or_else(|| {
            malformed(&format!(
                "OriginatorConversationID '{}' is not one of ours",
                self.originator_conversation_id
            ))
        })?;

        let result = if timed_out {
            PayoutResult::TimedOut {
                description: self.result_desc.clone(),
            }
        } else if self.result_code == 0 {
            let transaction_id = self
                .parameter("TransactionReceipt")
                .and_then(text)
                .or_else(|| self.transaction_id.clone().filter(|id| !id.is_empty()))
                .ok_or_else(|| malformed("successful payout result without a transaction id"))?;
            PayoutResult::Succeeded { transaction_id }
        } else {
            PayoutResult::Failed {
                code: self.result_code.to_string(),
                description: self.result_desc.clone(),
            }
        };

        Ok(PayoutNotification {
            token,
            conversation_id: self.conversation_id.filter(|id| !id.is_empty()),
            result,
        })
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn malformed(detail: &str) -> PaymentError {
    PaymentError::ValidationError(detail.to_string())
}

/// Acknowledgement the gateway expects for every well-formed callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    pub fn accepted() -> Self {
        Self {
            result_code: 0,
            result_desc: "Accepted".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatedPayment {
    pub payment_id: String,
    pub token: CorrelationToken,
    pub message: String,
}

impl From<CollectionReceipt> for InitiatedPayment {
    fn from(receipt: CollectionReceipt) -> Self {
        Self {
            payment_id: receipt.payment_id.to_string(),
            token: receipt.correlation,
            message: receipt.prompt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentStatusResponse {
    pub token: CorrelationToken,
    pub status: PayerStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LineItemQuery {
    pub state: Option<String>,
    pub batch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
