//! Application layer: the use cases that move money.
//!
//! Each service owns only the ports it needs and is cheap to clone; [`Services`]
//! wires them together once at start-up so the HTTP layer, the CLI and the
//! background jobs share the same instances.

pub mod audit;
pub mod collection;
pub mod commission;
pub mod jobs;
pub mod payout;
pub mod reconciler;
pub mod settlement;

use self::audit::Auditor;
use self::collection::{CollectionConfig, CollectionInitiator};
use self::commission::CommissionService;
use self::payout::{PayoutProcessor, RetryPolicy};
use self::reconciler::CallbackReconciler;
use self::settlement::SettlementAggregator;
use crate::domain::ports::{
    DynAuditLog, DynClock, DynCollectionGateway, DynDisbursementGateway, DynHierarchyResolver,
    DynPaymentStore, DynRateResolver, DynRecipientDirectory, DynSettlementStore, DynTransferStore,
};
use chrono::FixedOffset;

/// Every adapter the services depend on.
#[derive(Clone)]
pub struct Ports {
    pub payments: DynPaymentStore,
    pub settlements: DynSettlementStore,
    pub transfers: DynTransferStore,
    pub audit: DynAuditLog,
    pub rates: DynRateResolver,
    pub hierarchy: DynHierarchyResolver,
    pub directory: DynRecipientDirectory,
    pub collections: DynCollectionGateway,
    pub disbursements: DynDisbursementGateway,
    pub clock: DynClock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    pub collection: CollectionConfig,
    pub retry: RetryPolicy,
    pub settlement_offset: FixedOffset,
}

impl ServiceConfig {
    /// Default amount bounds and retry policy, settling calendar days at `offset`.
    pub fn new(settlement_offset: FixedOffset) -> Self {
        Self {
            collection: CollectionConfig::default(),
            retry: RetryPolicy::default(),
            settlement_offset,
        }
    }
}

#[derive(Clone)]
pub struct Services {
    pub collection: CollectionInitiator,
    pub reconciler: CallbackReconciler,
    pub settlement: SettlementAggregator,
    pub payouts: PayoutProcessor,
    pub settlements: DynSettlementStore,
    pub audit: DynAuditLog,
}

impl Services {
    pub fn new(ports: Ports, config: ServiceConfig) -> Self {
        let auditor = Auditor::new(ports.audit.clone(), ports.clock.clone());

        let collection = CollectionInitiator::new(
            ports.payments.clone(),
            ports.collections.clone(),
            auditor.clone(),
            ports.clock.clone(),
            config.collection,
        );
        let payouts = PayoutProcessor::new(
            ports.settlements.clone(),
            ports.transfers.clone(),
            ports.directory.clone(),
            ports.disbursements.clone(),
            auditor.clone(),
            ports.clock.clone(),
            config.retry,
        );
        let reconciler = CallbackReconciler::new(
            ports.payments.clone(),
            ports.collections.clone(),
            CommissionService::new(ports.rates.clone(), ports.hierarchy.clone()),
            payouts.clone(),
            auditor.clone(),
            ports.clock.clone(),
        );
        let settlement = SettlementAggregator::new(
            ports.payments.clone(),
            ports.settlements.clone(),
            auditor,
            ports.clock.clone(),
            config.settlement_offset,
        );

        Self {
            collection,
            reconciler,
            settlement,
            payouts,
            settlements: ports.settlements,
            audit: ports.audit,
        }
    }
}
