#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use rust_decimal::Decimal;
use settlepay::application::collection::{CollectionReceipt, CollectionRequest};
use settlepay::application::reconciler::{
    DebitNotification, DebitResult, NotificationSource, ReconcileOutcome,
};
use settlepay::application::{Ports, ServiceConfig, Services};
use settlepay::domain::gateway::{
    CreditAccepted, CreditRequest, DebitAccepted, DebitRequest, DebitStatus, GatewayError,
};
use settlepay::domain::ids::{CorrelationToken, PayerId, ReceiptId, RecipientId, SchemeId, SubscriptionId};
use settlepay::domain::money::{Amount, Money};
use settlepay::domain::ports::{CollectionGateway, DisbursementGateway};
use settlepay::domain::rate::{RateStructure, ReferralAssignment};
use settlepay::infrastructure::catalog::StaticCatalog;
use settlepay::infrastructure::clock::ManualClock;
use settlepay::infrastructure::in_memory::{
    InMemoryAuditLog, InMemoryPaymentStore, InMemorySettlementStore, InMemoryTransferStore,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const SCHEME: &str = "afya-basic";
pub const SUBSCRIPTION: &str = "sub-1";
pub const PAYER: &str = "member-1";
pub const AGENT: &str = "agent-1";
pub const SUPERVISOR: &str = "supervisor-1";

/// Gateway double. Responses are scripted per call in FIFO order; once a
/// script runs dry every request is accepted.
#[derive(Default)]
pub struct ScriptedGateway {
    debit_script: Mutex<VecDeque<Result<DebitAccepted, GatewayError>>>,
    credit_script: Mutex<VecDeque<Result<CreditAccepted, GatewayError>>>,
    query_script: Mutex<HashMap<String, Result<DebitStatus, GatewayError>>>,
    pub debits: Mutex<Vec<DebitRequest>>,
    pub credits: Mutex<Vec<CreditRequest>>,
    pub queries: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    pub fn script_debit(&self, response: Result<DebitAccepted, GatewayError>) {
        self.debit_script.lock().unwrap().push_back(response);
    }

    pub fn script_credit(&self, response: Result<CreditAccepted, GatewayError>) {
        self.credit_script.lock().unwrap().push_back(response);
    }

    pub fn script_query(&self, request_id: &str, response: Result<DebitStatus, GatewayError>) {
        self.query_script
            .lock()
            .unwrap()
            .insert(request_id.to_string(), response);
    }

    pub fn debit_count(&self) -> usize {
        self.debits.lock().unwrap().len()
    }

    pub fn credit_requests(&self) -> Vec<CreditRequest> {
        self.credits.lock().unwrap().clone()
    }
}

#[async_trait]
impl CollectionGateway for ScriptedGateway {
    async fn request_debit(&self, request: DebitRequest) -> Result<DebitAccepted, GatewayError> {
        let n = {
            let mut debits = self.debits.lock().unwrap();
            debits.push(request);
            debits.len()
        };
        self.debit_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(DebitAccepted {
                    request_id: format!("ws_CO_{n}"),
                    merchant_request_id: format!("m-{n}"),
                    customer_message: "Success. Request accepted for processing".to_string(),
                })
            })
    }

    async fn query_debit(&self, request_id: &str) -> Result<DebitStatus, GatewayError> {
        self.queries.lock().unwrap().push(request_id.to_string());
        self.query_script
            .lock()
            .unwrap()
            .remove(request_id)
            .unwrap_or(Ok(DebitStatus::Pending))
    }
}

#[async_trait]
impl DisbursementGateway for ScriptedGateway {
    async fn request_credit(&self, request: CreditRequest) -> Result<CreditAccepted, GatewayError> {
        let token = request.token.to_string();
        let n = {
            let mut credits = self.credits.lock().unwrap();
            credits.push(request);
            credits.len()
        };
        self.credit_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(CreditAccepted {
                    conversation_id: format!("AG_{n}"),
                    originator_conversation_id: token,
                })
            })
    }
}

pub fn eat() -> FixedOffset {
    FixedOffset::east_opt(3 * 3600).unwrap()
}

pub fn amount(units: u64) -> Amount {
    Amount::try_from(units).unwrap()
}

/// 50-unit scheme: 40 to the insurer, 6 to tier 1, 2 to tier 2.
pub fn catalog_scheme() -> RateStructure {
    RateStructure {
        scheme: SchemeId::from(SCHEME),
        nominal_daily_unit: amount(50),
        insurer_portion: Money::from(40),
        tier1_commission: Money::from(6),
        tier2_commission: Money::from(2),
    }
}

pub fn catalog() -> StaticCatalog {
    StaticCatalog::default()
        .with_scheme(catalog_scheme())
        .with_subscription(SUBSCRIPTION, SCHEME)
        .with_referral(
            PAYER,
            ReferralAssignment {
                tier1: Some(RecipientId::from(AGENT)),
                tier2: Some(RecipientId::from(SUPERVISOR)),
            },
        )
        .with_recipient(AGENT, "0711000001")
        .with_recipient(SUPERVISOR, "0711000002")
}

/// Services over in-memory stores, a scripted gateway and a manual clock
/// starting at 2026-03-14 09:00 EAT.
pub struct Harness {
    pub services: Services,
    pub gateway: Arc<ScriptedGateway>,
    pub clock: ManualClock,
    pub payments: Arc<InMemoryPaymentStore>,
    pub settlements: Arc<InMemorySettlementStore>,
    pub transfers: Arc<InMemoryTransferStore>,
    pub audit: Arc<InMemoryAuditLog>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_catalog(catalog())
    }

    pub fn with_catalog(catalog: StaticCatalog) -> Self {
        let gateway = Arc::new(ScriptedGateway::default());
        let clock = ManualClock::new(start());
        let payments = Arc::new(InMemoryPaymentStore::new());
        let settlements = Arc::new(InMemorySettlementStore::new());
        let transfers = Arc::new(InMemoryTransferStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let catalog = Arc::new(catalog);

        let ports = Ports {
            payments: payments.clone(),
            settlements: settlements.clone(),
            transfers: transfers.clone(),
            audit: audit.clone(),
            rates: catalog.clone(),
            hierarchy: catalog.clone(),
            directory: catalog,
            collections: gateway.clone(),
            disbursements: gateway.clone(),
            clock: Arc::new(clock.clone()),
        };

        Self {
            services: Services::new(ports, ServiceConfig::new(eat())),
            gateway,
            clock,
            payments,
            settlements,
            transfers,
            audit,
        }
    }

    pub async fn collect(&self, units: u64) -> CollectionReceipt {
        self.services
            .collection
            .initiate(CollectionRequest {
                payer: PayerId::from(PAYER),
                subscription: SubscriptionId::from(SUBSCRIPTION),
                phone: "0712345678".to_string(),
                amount: Decimal::from(units),
                description: "Daily premium".to_string(),
            })
            .await
            .unwrap()
    }

    pub async fn confirm(&self, token: &CorrelationToken, receipt: &str, units: u64) -> ReconcileOutcome {
        self.services
            .reconciler
            .reconcile_debit(success(token, receipt, units))
            .await
            .unwrap()
    }
}

pub fn start() -> DateTime<Utc> {
    // 09:00 EAT
    Utc.with_ymd_and_hms(2026, 3, 14, 6, 0, 0).unwrap()
}

pub fn success(token: &CorrelationToken, receipt: &str, units: u64) -> DebitNotification {
    DebitNotification {
        token: Some(token.clone()),
        request_id: None,
        result: DebitResult::Succeeded {
            receipt: ReceiptId::from(receipt),
            amount: amount(units),
        },
        source: NotificationSource::Callback,
    }
}
