use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use settlepay::domain::gateway::{CreditRequest, DebitRequest, DebitStatus, GatewayError};
use settlepay::domain::ids::CorrelationToken;
use settlepay::domain::money::Amount;
use settlepay::domain::phone::Msisdn;
use settlepay::domain::ports::{CollectionGateway, DisbursementGateway};
use settlepay::infrastructure::gateway::{DarajaClient, GatewayConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockGateway {
    token_fetches: AtomicUsize,
    requests: Mutex<Vec<Value>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer mock-token")
}

async fn oauth(State(mock): State<Arc<MockGateway>>, headers: HeaderMap) -> Response {
    let expected = format!("Basic {}", STANDARD.encode("key:secret"));
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    mock.token_fetches.fetch_add(1, Ordering::SeqCst);
    Json(json!({"access_token": "mock-token", "expires_in": "3599"})).into_response()
}

async fn stk_push(
    State(mock): State<Arc<MockGateway>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    mock.requests.lock().unwrap().push(body);
    Json(json!({
        "MerchantRequestID": "29115-34620561-1",
        "CheckoutRequestID": "ws_CO_191220191020363925",
        "ResponseCode": "0",
        "ResponseDescription": "Success. Request accepted for processing",
        "CustomerMessage": "Success. Request accepted for processing"
    }))
    .into_response()
}

async fn stk_query(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if body["CheckoutRequestID"] == "ws_CO_pending" {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "requestId": "8773-6337-1",
                "errorCode": "500.001.1001",
                "errorMessage": "The transaction is being processed"
            })),
        )
            .into_response();
    }
    Json(json!({
        "ResponseCode": "0",
        "ResponseDescription": "The service request has been accepted successsfully",
        "MerchantRequestID": "22205-34066-1",
        "CheckoutRequestID": body["CheckoutRequestID"],
        "ResultCode": "1032",
        "ResultDesc": "Request cancelled by user"
    }))
    .into_response()
}

async fn b2c(
    State(mock): State<Arc<MockGateway>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    mock.requests.lock().unwrap().push(body.clone());
    if body["Amount"].as_u64().unwrap_or(0) > 150_000 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "requestId": "11728-2929992-1",
                "errorCode": "400.002.02",
                "errorMessage": "Bad Request - Invalid Amount"
            })),
        )
            .into_response();
    }
    Json(json!({
        "ConversationID": "AG_20260315_00004e6f5b9c5e6e2ad0",
        "OriginatorConversationID": body["OriginatorConversationID"],
        "ResponseCode": "0",
        "ResponseDescription": "Accept the service request successfully."
    }))
    .into_response()
}

async fn start_mock() -> (String, Arc<MockGateway>) {
    let mock = Arc::new(MockGateway::default());
    let app = Router::new()
        .route("/oauth/v1/generate", get(oauth))
        .route("/mpesa/stkpush/v1/processrequest", post(stk_push))
        .route("/mpesa/stkpushquery/v1/query", post(stk_query))
        .route("/mpesa/b2c/v3/paymentrequest", post(b2c))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), mock)
}

fn client(base_url: &str) -> DarajaClient {
    DarajaClient::new(GatewayConfig {
        base_url: base_url.to_string(),
        consumer_key: "key".to_string(),
        consumer_secret: "secret".to_string(),
        passkey: "passkey".to_string(),
        security_credential: "encrypted".to_string(),
        callback_base: "https://settlepay.example/".to_string(),
        timeout_ms: 5_000,
        ..Default::default()
    })
    .unwrap()
}

fn debit(token: &CorrelationToken) -> DebitRequest {
    DebitRequest {
        token: token.clone(),
        phone: Msisdn::parse("0712345678").unwrap(),
        amount: Amount::try_from(50u64).unwrap(),
        account_reference: "sub-1".to_string(),
        description: "Daily premium".to_string(),
    }
}

#[tokio::test]
async fn test_debit_request_is_signed_and_token_reused() {
    let (url, mock) = start_mock().await;
    let client = client(&url);
    let token = CorrelationToken::generate();

    let accepted = client.request_debit(debit(&token)).await.unwrap();
    assert_eq!(accepted.request_id, "ws_CO_191220191020363925");
    client
        .request_debit(debit(&CorrelationToken::generate()))
        .await
        .unwrap();
    assert_eq!(mock.token_fetches.load(Ordering::SeqCst), 1);

    let body = mock.requests.lock().unwrap()[0].clone();
    assert_eq!(body["BusinessShortCode"], "174379");
    assert_eq!(body["TransactionType"], "CustomerPayBillOnline");
    assert_eq!(body["Amount"], 50);
    assert_eq!(body["PhoneNumber"], "254712345678");
    assert_eq!(
        body["CallBackURL"],
        format!("https://settlepay.example/callbacks/debit/{token}")
    );
    let timestamp = body["Timestamp"].as_str().unwrap();
    assert_eq!(timestamp.len(), 14);
    let password = STANDARD
        .decode(body["Password"].as_str().unwrap())
        .unwrap();
    assert_eq!(
        String::from_utf8(password).unwrap(),
        format!("174379passkey{timestamp}")
    );
}

#[tokio::test]
async fn test_status_query_maps_still_processing_to_pending() {
    let (url, _mock) = start_mock().await;
    let client = client(&url);

    assert_eq!(
        client.query_debit("ws_CO_pending").await.unwrap(),
        DebitStatus::Pending
    );
    let DebitStatus::Completed { result_code, .. } =
        client.query_debit("ws_CO_done").await.unwrap()
    else {
        panic!("expected a completed status");
    };
    assert_eq!(result_code, 1032);
}

#[tokio::test]
async fn test_credit_request_and_rejection() {
    let (url, mock) = start_mock().await;
    let client = client(&url);
    let token = CorrelationToken::generate();

    let accepted = client
        .request_credit(CreditRequest {
            token: token.clone(),
            phone: Msisdn::parse("0711000001").unwrap(),
            amount: Amount::try_from(60u64).unwrap(),
            remarks: "tier1 commission".to_string(),
            occasion: "batch".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(accepted.originator_conversation_id, token.to_string());

    let body = mock.requests.lock().unwrap()[0].clone();
    assert_eq!(body["CommandID"], "BusinessPayment");
    assert_eq!(body["PartyA"], "600000");
    assert_eq!(
        body["ResultURL"],
        "https://settlepay.example/callbacks/payout/result"
    );
    assert_eq!(
        body["QueueTimeOutURL"],
        "https://settlepay.example/callbacks/payout/timeout"
    );

    let rejected = client
        .request_credit(CreditRequest {
            token: CorrelationToken::generate(),
            phone: Msisdn::parse("0711000001").unwrap(),
            amount: Amount::try_from(200_000u64).unwrap(),
            remarks: "tier1 commission".to_string(),
            occasion: "batch".to_string(),
        })
        .await;
    assert_eq!(
        rejected.unwrap_err(),
        GatewayError::Rejected {
            code: "400.002.02".to_string(),
            description: "Bad Request - Invalid Amount".to_string(),
        }
    );
}

#[tokio::test]
async fn test_unreachable_gateway() {
    let client = client("http://127.0.0.1:1");
    let result = client
        .request_debit(debit(&CorrelationToken::generate()))
        .await;
    assert!(matches!(result, Err(GatewayError::Unreachable(_))));
}
