//! HTTP adapter for the mobile-money gateway (Daraja-style REST API).
//!
//! | Method | Endpoint | Used for |
//! |--------|----------|----------|
//! | GET | `/oauth/v1/generate?grant_type=client_credentials` | access token |
//! | POST | `/mpesa/stkpush/v1/processrequest` | debit prompt on the payer's handset |
//! | POST | `/mpesa/stkpushquery/v1/query` | debit status when the callback is late |
//! | POST | `/mpesa/b2c/v3/paymentrequest` | commission payout |

pub mod client;
pub mod credentials;
pub mod token_cache;
pub mod types;

use serde::Deserialize;
use std::fmt;

pub use client::DarajaClient;

#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    /// Paybill or till receiving collections.
    pub shortcode: String,
    pub passkey: String,
    /// Shortcode funding payouts.
    pub b2c_shortcode: String,
    pub initiator_name: String,
    /// Initiator password encrypted with the gateway's public certificate,
    /// as issued by the gateway portal.
    pub security_credential: String,
    /// Public base URL of this service; callback paths are appended to it.
    pub callback_base: String,
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sandbox.safaricom.co.ke".to_string(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            shortcode: "174379".to_string(),
            passkey: String::new(),
            b2c_shortcode: "600000".to_string(),
            initiator_name: "testapi".to_string(),
            security_credential: String::new(),
            callback_base: "http://localhost:8080".to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("consumer_key", &redact(&self.consumer_key))
            .field("consumer_secret", &redact(&self.consumer_secret))
            .field("shortcode", &self.shortcode)
            .field("passkey", &redact(&self.passkey))
            .field("b2c_shortcode", &self.b2c_shortcode)
            .field("initiator_name", &self.initiator_name)
            .field("security_credential", &redact(&self.security_credential))
            .field("callback_base", &self.callback_base)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "<unset>" } else { "<redacted>" }
}
