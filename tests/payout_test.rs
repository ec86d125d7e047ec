mod common;

use chrono::{Duration, NaiveDate};
use common::{AGENT, Harness, SUPERVISOR};
use settlepay::application::payout::{PayoutNotification, PayoutOutcome, PayoutResult};
use settlepay::domain::audit::{AuditEvent, AuditSubject};
use settlepay::domain::gateway::GatewayError;
use settlepay::domain::ids::{CorrelationToken, LineItemId, RecipientId};
use settlepay::domain::ports::{AuditLog, Clock, LineItemFilter, SettlementStore, TransferStore};
use settlepay::domain::settlement::{CommissionPayoutLineItem, LineItemState};
use settlepay::domain::transfer::{OutboundTransfer, TransferStatus};
use settlepay::infrastructure::catalog::StaticCatalog;

/// Confirms one 50-unit payment on 14 March and settles that day.
async fn settled(h: &Harness) -> Vec<CommissionPayoutLineItem> {
    let collected = h.collect(50).await;
    h.confirm(&collected.correlation, "R1", 50).await;
    h.clock.advance(Duration::days(1));
    h.services
        .settlement
        .settle_day(NaiveDate::from_ymd_opt(2026, 3, 14).unwrap())
        .await
        .unwrap();
    h.settlements
        .line_items(&LineItemFilter::default())
        .await
        .unwrap()
}

fn item_for(items: &[CommissionPayoutLineItem], recipient: &str) -> LineItemId {
    items
        .iter()
        .find(|i| i.recipient == RecipientId::from(recipient))
        .unwrap()
        .id
}

fn last_credit_token(h: &Harness) -> CorrelationToken {
    h.gateway.credit_requests().last().unwrap().token.clone()
}

async fn report(h: &Harness, token: CorrelationToken, result: PayoutResult) -> PayoutOutcome {
    h.services
        .reconciler
        .reconcile_payout(PayoutNotification {
            token,
            conversation_id: Some("AG_20260315".to_string()),
            result,
        })
        .await
        .unwrap()
}

fn failed() -> PayoutResult {
    PayoutResult::Failed {
        code: "2001".to_string(),
        description: "The initiator information is invalid.".to_string(),
    }
}

#[tokio::test]
async fn test_fail_fail_succeed_uses_three_transfers() {
    let h = Harness::with_catalog(common::catalog());
    let items = settled(&h).await;
    let agent = item_for(&items, AGENT);
    let supervisor = item_for(&items, SUPERVISOR);

    let run = h.services.payouts.run_due().await.unwrap();
    assert_eq!(run.started, 2);
    // Settle the supervisor's transfer so only the agent's item is in play.
    let supervisor_token = h
        .settlements
        .line_item(supervisor)
        .await
        .unwrap()
        .unwrap()
        .current_transfer
        .unwrap();
    report(
        &h,
        supervisor_token,
        PayoutResult::Succeeded {
            transaction_id: "SUP1".to_string(),
        },
    )
    .await;

    for attempt in 1..=2 {
        let token = h
            .settlements
            .line_item(agent)
            .await
            .unwrap()
            .unwrap()
            .current_transfer
            .unwrap();
        let PayoutOutcome::RetryScheduled(item) = report(&h, token, failed()).await else {
            panic!("attempt {attempt} should schedule a retry");
        };
        assert_eq!(item.state, LineItemState::Pending);

        // Not due until the backoff has elapsed.
        assert_eq!(h.services.payouts.run_due().await.unwrap().started, 0);
        h.clock.advance(Duration::minutes(5 * attempt as i64));
        assert_eq!(h.services.payouts.run_due().await.unwrap().started, 1);
    }

    let PayoutOutcome::Paid(item) = report(
        &h,
        last_credit_token(&h),
        PayoutResult::Succeeded {
            transaction_id: "NLJ41HAY6Q".to_string(),
        },
    )
    .await
    else {
        panic!("third attempt should pay");
    };
    assert_eq!(item.state, LineItemState::Paid);
    assert_eq!(item.transfer_reference.as_deref(), Some("NLJ41HAY6Q"));

    let transfers = h.transfers.transfers_for(agent).await.unwrap();
    let statuses: Vec<_> = transfers.iter().map(|t| (t.attempt, t.status)).collect();
    assert_eq!(
        statuses,
        vec![
            (1, TransferStatus::Failed),
            (2, TransferStatus::Failed),
            (3, TransferStatus::Succeeded),
        ]
    );
}

#[tokio::test]
async fn test_paid_is_absorbing() {
    let h = Harness::new();
    let items = settled(&h).await;
    let agent = item_for(&items, AGENT);

    h.services.payouts.run_due().await.unwrap();
    let token = h
        .settlements
        .line_item(agent)
        .await
        .unwrap()
        .unwrap()
        .current_transfer
        .unwrap();
    let success = PayoutResult::Succeeded {
        transaction_id: "NLJ41HAY6Q".to_string(),
    };
    assert!(matches!(
        report(&h, token.clone(), success.clone()).await,
        PayoutOutcome::Paid(_)
    ));

    // Replays and contradicting reports leave the item paid.
    assert_eq!(report(&h, token.clone(), success).await, PayoutOutcome::Duplicate);
    assert_eq!(report(&h, token.clone(), failed()).await, PayoutOutcome::Duplicate);
    assert!(matches!(
        report(
            &h,
            token,
            PayoutResult::Succeeded {
                transaction_id: "OTHER".to_string()
            }
        )
        .await,
        PayoutOutcome::Anomaly(_)
    ));

    h.clock.advance(Duration::days(1));
    h.services.payouts.run_due().await.unwrap();
    let item = h.settlements.line_item(agent).await.unwrap().unwrap();
    assert_eq!(item.state, LineItemState::Paid);
    assert_eq!(item.attempts, 1);
}

#[tokio::test]
async fn test_retry_budget_exhaustion_and_requeue() {
    let h = Harness::new();
    let items = settled(&h).await;
    let agent = item_for(&items, AGENT);

    for _ in 0..3 {
        h.services.payouts.run_due().await.unwrap();
        let token = h
            .settlements
            .line_item(agent)
            .await
            .unwrap()
            .unwrap()
            .current_transfer
            .unwrap();
        report(&h, token, failed()).await;
        h.clock.advance(Duration::hours(1));
    }

    let item = h.settlements.line_item(agent).await.unwrap().unwrap();
    assert_eq!(item.state, LineItemState::Failed);
    assert_eq!(item.attempts, 3);
    assert_eq!(h.services.payouts.run_due().await.unwrap().started, 0);

    let requeued = h.services.payouts.requeue(agent).await.unwrap();
    assert_eq!(requeued.state, LineItemState::Pending);
    assert_eq!(requeued.budget_used, 0);
    h.services.payouts.run_due().await.unwrap();
    let item = h.settlements.line_item(agent).await.unwrap().unwrap();
    assert_eq!(item.state, LineItemState::Processing);
    assert_eq!(item.attempts, 4);

    // Only failed items can be requeued.
    assert!(h.services.payouts.requeue(agent).await.is_err());
}

#[tokio::test]
async fn test_timeout_counts_as_failed_attempt_and_late_success_is_flagged() {
    let h = Harness::new();
    let items = settled(&h).await;
    let agent = item_for(&items, AGENT);

    h.services.payouts.run_due().await.unwrap();
    let token = h
        .settlements
        .line_item(agent)
        .await
        .unwrap()
        .unwrap()
        .current_transfer
        .unwrap();
    let outcome = report(
        &h,
        token.clone(),
        PayoutResult::TimedOut {
            description: "The service request timed out.".to_string(),
        },
    )
    .await;
    assert!(matches!(outcome, PayoutOutcome::RetryScheduled(_)));
    let transfer = h.transfers.transfer_by_token(&token).await.unwrap().unwrap();
    assert_eq!(transfer.failure_code.as_deref(), Some("timeout"));

    let late = report(
        &h,
        token.clone(),
        PayoutResult::Succeeded {
            transaction_id: "LATE1".to_string(),
        },
    )
    .await;
    assert!(matches!(late, PayoutOutcome::Anomaly(_)));
    let trail = h
        .audit
        .entries_for(&AuditSubject::Transfer(token))
        .await
        .unwrap();
    assert!(
        trail
            .iter()
            .any(|e| matches!(e.event, AuditEvent::PayoutAnomaly { .. }))
    );
    let item = h.settlements.line_item(agent).await.unwrap().unwrap();
    assert_eq!(item.state, LineItemState::Pending);
}

#[tokio::test]
async fn test_recipient_without_destination_is_blocked() {
    let catalog = StaticCatalog::default()
        .with_scheme(common::catalog_scheme())
        .with_subscription(common::SUBSCRIPTION, common::SCHEME)
        .with_referral(
            common::PAYER,
            settlepay::domain::rate::ReferralAssignment {
                tier1: Some(RecipientId::from(AGENT)),
                tier2: None,
            },
        );
    let h = Harness::with_catalog(catalog);
    let items = settled(&h).await;
    assert_eq!(items.len(), 1);

    let run = h.services.payouts.run_due().await.unwrap();
    assert_eq!(run.blocked, 1);
    assert!(h.gateway.credit_requests().is_empty());
    let item = h.settlements.line_item(items[0].id).await.unwrap().unwrap();
    assert_eq!(item.state, LineItemState::Failed);
}

#[tokio::test]
async fn test_rejected_credit_request_schedules_retry() {
    let h = Harness::new();
    let items = settled(&h).await;
    h.gateway.script_credit(Err(GatewayError::Rejected {
        code: "400.002.02".to_string(),
        description: "Bad Request - Invalid Amount".to_string(),
    }));

    let run = h.services.payouts.run_due().await.unwrap();
    assert_eq!(run.failed_to_send, 1);
    assert_eq!(run.started, 1);

    let failed: Vec<_> = h
        .settlements
        .line_items(&LineItemFilter::default())
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.failure_reason.is_some())
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].state, LineItemState::Pending);
    assert!(failed[0].retry_after.is_some());
    assert!(items.iter().any(|i| i.id == failed[0].id));
}

#[tokio::test]
async fn test_lost_credit_response_is_not_resent() {
    let h = Harness::new();
    settled(&h).await;
    h.gateway
        .script_credit(Err(GatewayError::Unreachable("operation timed out".to_string())));

    let run = h.services.payouts.run_due().await.unwrap();
    assert_eq!(run.unconfirmed, 1);
    assert_eq!(run.started, 1);
    let in_doubt = h.gateway.credit_requests()[0].token.clone();

    h.clock.advance(Duration::minutes(6));
    let rerun = h.services.payouts.run_due().await.unwrap();
    assert_eq!(rerun.started, 0);
    assert_eq!(h.gateway.credit_requests().len(), 2);

    let transfer = h
        .transfers
        .transfer_by_token(&in_doubt)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transfer.status, TransferStatus::InFlight);
    let item = h
        .settlements
        .line_item(transfer.line_item)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.state, LineItemState::Processing);
    assert_eq!(item.current_transfer.as_ref(), Some(&in_doubt));

    // The gateway's result settles the original attempt.
    let outcome = report(
        &h,
        in_doubt,
        PayoutResult::Succeeded {
            transaction_id: "NLJ41HAY6Q".to_string(),
        },
    )
    .await;
    assert!(matches!(outcome, PayoutOutcome::Paid(_)));
    assert_eq!(h.transfers.transfers_for(item.id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_payout_passes_send_one_credit_per_item() {
    let h = Harness::new();
    let items = settled(&h).await;
    assert_eq!(items.len(), 2);

    let runs: Vec<_> = (0..4)
        .map(|_| {
            let payouts = h.services.payouts.clone();
            tokio::spawn(async move { payouts.run_due().await })
        })
        .collect();
    let mut started = 0;
    for run in runs {
        started += run.await.unwrap().unwrap().started;
    }

    assert_eq!(started, 2);
    assert_eq!(h.gateway.credit_requests().len(), 2);
    for item in items {
        let transfers = h.transfers.transfers_for(item.id).await.unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].attempt, 1);
    }
}

#[tokio::test]
async fn test_unrecorded_transfer_releases_attempt() {
    let h = Harness::new();
    let items = settled(&h).await;
    let agent = item_for(&items, AGENT);
    // Attempt 1 is already taken, so recording the new transfer fails.
    h.transfers
        .insert_transfer(OutboundTransfer::start(
            agent,
            1,
            CorrelationToken::generate(),
            h.clock.now(),
        ))
        .await
        .unwrap();

    h.services.payouts.run_due().await.unwrap();

    let item = h.settlements.line_item(agent).await.unwrap().unwrap();
    assert_eq!(item.state, LineItemState::Pending);
    assert_eq!(item.attempts, 0);
    assert_eq!(item.budget_used, 0);
    assert!(item.current_transfer.is_none());
    assert!(
        h.gateway
            .credit_requests()
            .iter()
            .all(|request| request.phone.as_str() != "254711000001")
    );
}
