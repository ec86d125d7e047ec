//! Request and response bodies of the mobile-money gateway's REST API.
//!
//! Field names follow the gateway's own mixed `PascalCase`/`ID` spelling,
//! so most fields carry an explicit `rename`. Numeric fields that the
//! gateway sometimes sends as strings (`expires_in`, `ResultCode` on
//! queries) are accepted in either form.

use serde::{Deserialize, Deserializer, Serialize};

/// Accepts `"3599"` as well as `3599`.
pub fn parse_i64_from_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrInt {
        String(String),
        Int(i64),
    }

    match StringOrInt::deserialize(deserializer)? {
        StringOrInt::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        StringOrInt::Int(i) => Ok(i),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    #[serde(deserialize_with = "parse_i64_from_string")]
    pub expires_in: i64,
}

/// Error body returned with non-2xx statuses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub request_id: Option<String>,
    pub error_code: String,
    pub error_message: String,
}

/// Error code the status query returns while the payer has not answered.
pub const STILL_PROCESSING: &str = "500.001.1001";

#[derive(Debug, Clone, Serialize)]
pub struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Amount")]
    pub amount: u64,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    #[serde(rename = "AccountReference")]
    pub account_reference: String,
    #[serde(rename = "TransactionDesc")]
    pub transaction_desc: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription")]
    pub response_description: String,
    #[serde(rename = "CustomerMessage", default)]
    pub customer_message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StkQueryRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StkQueryResponse {
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    pub response_description: String,
    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode", deserialize_with = "parse_i64_from_string")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct B2cPaymentRequest {
    #[serde(rename = "OriginatorConversationID")]
    pub originator_conversation_id: String,
    #[serde(rename = "InitiatorName")]
    pub initiator_name: String,
    #[serde(rename = "SecurityCredential")]
    pub security_credential: String,
    #[serde(rename = "CommandID")]
    pub command_id: String,
    #[serde(rename = "Amount")]
    pub amount: u64,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "Remarks")]
    pub remarks: String,
    #[serde(rename = "QueueTimeOutURL")]
    pub queue_timeout_url: String,
    #[serde(rename = "ResultURL")]
    pub result_url: String,
    #[serde(rename = "Occasion")]
    pub occasion: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct B2cPaymentResponse {
    #[serde(rename = "ConversationID")]
    pub conversation_id: String,
    #[serde(rename = "OriginatorConversationID")]
    pub originator_conversation_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    pub response_description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expiry_accepts_string() {
        let token: AccessTokenResponse =
            serde_json::from_str(r#"{"access_token":"abc","expires_in":"3599"}"#).unwrap();
        assert_eq!(token.expires_in, 3599);
    }

    #[test]
    fn test_stk_push_request_uses_gateway_field_names() {
        let body = serde_json::to_value(StkPushRequest {
            business_short_code: "174379".to_string(),
            password: "pw".to_string(),
            timestamp: "20260314103000".to_string(),
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount: 50,
            party_a: "254712345678".to_string(),
            party_b: "174379".to_string(),
            phone_number: "254712345678".to_string(),
            callback_url: "https://example.test/callbacks/debit/t".to_string(),
            account_reference: "sub-1".to_string(),
            transaction_desc: "Premium".to_string(),
        })
        .unwrap();
        assert_eq!(body["BusinessShortCode"], "174379");
        assert_eq!(body["CallBackURL"], "https://example.test/callbacks/debit/t");
        assert_eq!(body["Amount"], 50);
    }

    #[test]
    fn test_query_result_code_as_string() {
        let response: StkQueryResponse = serde_json::from_str(
            r#"{"ResponseCode":"0","ResponseDescription":"The service request has been accepted successsfully","MerchantRequestID":"22205-34066-1","CheckoutRequestID":"ws_CO_13012021093521236557","ResultCode":"1032","ResultDesc":"Request cancelled by user"}"#,
        )
        .unwrap();
        assert_eq!(response.result_code, 1032);
    }
}
