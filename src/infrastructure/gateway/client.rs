use super::GatewayConfig;
use super::credentials;
use super::token_cache::{AccessToken, TokenCache, TokenSource};
use super::types::*;
use crate::domain::gateway::{
    CreditAccepted, CreditRequest, DebitAccepted, DebitRequest, DebitStatus, GatewayError,
};
use crate::domain::money::Amount;
use crate::domain::ports::{CollectionGateway, DisbursementGateway};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const TOKEN_PATH: &str = "/oauth/v1/generate?grant_type=client_credentials";
const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";
const STK_QUERY_PATH: &str = "/mpesa/stkpushquery/v1/query";
const B2C_PATH: &str = "/mpesa/b2c/v3/paymentrequest";

const ACCEPTED: &str = "0";

pub struct OAuthTokenSource {
    http: Client,
    url: String,
    authorization: String,
}

#[async_trait]
impl TokenSource for OAuthTokenSource {
    async fn fetch(&self) -> std::result::Result<AccessToken, GatewayError> {
        let response = self
            .http
            .get(&self.url)
            .header("Authorization", &self.authorization)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let text = response.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(GatewayError::Auth(format!("{status}: {text}")));
        }
        let token: AccessTokenResponse =
            serde_json::from_str(&text).map_err(|e| GatewayError::Malformed(e.to_string()))?;
        let lifetime = Duration::from_secs(token.expires_in.max(0).unsigned_abs());
        Ok(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}

/// Gateway client implementing both collection and disbursement.
pub struct DarajaClient {
    http: Client,
    config: GatewayConfig,
    tokens: TokenCache<OAuthTokenSource>,
}

impl DarajaClient {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| PaymentError::ConfigError(format!("HTTP client: {e}")))?;

        let tokens = TokenCache::new(OAuthTokenSource {
            http: http.clone(),
            url: format!("{}{TOKEN_PATH}", base(&config.base_url)),
            authorization: credentials::basic_auth(&config.consumer_key, &config.consumer_secret),
        });

        Ok(Self {
            http,
            config,
            tokens,
        })
    }

    fn callback(&self, path: &str) -> String {
        format!("{}{path}", base(&self.config.callback_base))
    }

    async fn post<T, R>(&self, path: &str, body: &T) -> std::result::Result<R, GatewayError>
    where
        T: Serialize + Sync,
        R: DeserializeOwned,
    {
        let token = self.tokens.get().await?;
        let url = format!("{}{path}", base(&self.config.base_url));
        debug!("POST {}", url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let text = response.text().await.map_err(transport)?;

        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
            return Err(GatewayError::Auth(format!("token rejected: {text}")));
        }
        if !status.is_success() {
            return Err(match serde_json::from_str::<ApiErrorResponse>(&text) {
                Ok(error) => GatewayError::Rejected {
                    code: error.error_code,
                    description: error.error_message,
                },
                Err(_) => GatewayError::Rejected {
                    code: status.as_u16().to_string(),
                    description: text,
                },
            });
        }
        serde_json::from_str(&text).map_err(|e| GatewayError::Malformed(e.to_string()))
    }

    fn stk_password(&self) -> (String, String) {
        let timestamp = credentials::timestamp(Utc::now());
        let password =
            credentials::password(&self.config.shortcode, &self.config.passkey, &timestamp);
        (password, timestamp)
    }
}

#[async_trait]
impl CollectionGateway for DarajaClient {
    async fn request_debit(
        &self,
        request: DebitRequest,
    ) -> std::result::Result<DebitAccepted, GatewayError> {
        let (password, timestamp) = self.stk_password();
        let body = StkPushRequest {
            business_short_code: self.config.shortcode.clone(),
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount: whole_units(request.amount)?,
            party_a: request.phone.to_string(),
            party_b: self.config.shortcode.clone(),
            phone_number: request.phone.to_string(),
            callback_url: self.callback(&format!("/callbacks/debit/{}", request.token)),
            account_reference: request.account_reference,
            transaction_desc: request.description,
        };

        let response: StkPushResponse = self.post(STK_PUSH_PATH, &body).await?;
        if response.response_code != ACCEPTED {
            warn!(token = %request.token, code = %response.response_code, "Debit request refused");
            return Err(GatewayError::Rejected {
                code: response.response_code,
                description: response.response_description,
            });
        }
        Ok(DebitAccepted {
            request_id: response.checkout_request_id,
            merchant_request_id: response.merchant_request_id,
            customer_message: response.customer_message,
        })
    }

    async fn query_debit(&self, request_id: &str) -> std::result::Result<DebitStatus, GatewayError> {
        let (password, timestamp) = self.stk_password();
        let body = StkQueryRequest {
            business_short_code: self.config.shortcode.clone(),
            password,
            timestamp,
            checkout_request_id: request_id.to_string(),
        };

        match self.post::<_, StkQueryResponse>(STK_QUERY_PATH, &body).await {
            Ok(response) => Ok(DebitStatus::Completed {
                result_code: response.result_code,
                description: response.result_desc,
                receipt: None,
                amount: None,
            }),
            Err(GatewayError::Rejected { code, .. }) if code == STILL_PROCESSING => {
                Ok(DebitStatus::Pending)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl DisbursementGateway for DarajaClient {
    async fn request_credit(
        &self,
        request: CreditRequest,
    ) -> std::result::Result<CreditAccepted, GatewayError> {
        let body = B2cPaymentRequest {
            originator_conversation_id: request.token.to_string(),
            initiator_name: self.config.initiator_name.clone(),
            security_credential: self.config.security_credential.clone(),
            command_id: "BusinessPayment".to_string(),
            amount: whole_units(request.amount)?,
            party_a: self.config.b2c_shortcode.clone(),
            party_b: request.phone.to_string(),
            remarks: request.remarks,
            queue_timeout_url: self.callback("/callbacks/payout/timeout"),
            result_url: self.callback("/callbacks/payout/result"),
            occasion: request.occasion,
        };

        let response: B2cPaymentResponse = self.post(B2C_PATH, &body).await?;
        if response.response_code != ACCEPTED {
            return Err(GatewayError::Rejected {
                code: response.response_code,
                description: response.response_description,
            });
        }
        Ok(CreditAccepted {
            conversation_id: response.conversation_id,
            originator_conversation_id: response.originator_conversation_id,
        })
    }
}

fn base(url: &str) -> &str {
    url.trim_end_matches('/')
}

fn whole_units(amount: Amount) -> std::result::Result<u64, GatewayError> {
    amount
        .value()
        .to_u64()
        .ok_or_else(|| GatewayError::Malformed(format!("amount {amount} is out of range")))
}

fn transport(e: reqwest::Error) -> GatewayError {
    GatewayError::Unreachable(e.to_string())
}
