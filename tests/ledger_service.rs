use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use credit_ledger::ledger::{
    ConsumeOutcome, ConsumeRequest, DenialReason, EntryKind, GrantRequest, HistoryQuery,
    LedgerService, MemoryLedgerStore, RefundOutcome, RefundRejection,
};
use credit_ledger::{LedgerConfig, LedgerError, StoreError};
use futures_util::future::join_all;
use uuid::Uuid;

// key: ledger-service-tests -> balances, gates, refunds, races

fn ledger() -> (Arc<MemoryLedgerStore>, LedgerService) {
    let store = Arc::new(MemoryLedgerStore::new());
    let config = LedgerConfig {
        retry_backoff: StdDuration::from_millis(1),
        ..LedgerConfig::default()
    };
    let service = LedgerService::new(store.clone(), config);
    (store, service)
}

fn consume_one(reference_id: &str) -> ConsumeRequest {
    ConsumeRequest::new("T1", "eq", reference_id, "test")
}

async fn assert_consistent(service: &LedgerService, tenant_id: &str, resource_type: &str) {
    let audit = service.reconcile(tenant_id, resource_type).await.unwrap();
    let entries = service.entries_for(tenant_id, resource_type).await.unwrap();
    let replayed: i64 = entries.iter().map(|entry| entry.amount).sum();
    let record = audit.record.expect("record exists");
    assert_eq!(replayed, record.available);
    assert_eq!(
        record.total_granted,
        record.used + record.available + record.expired
    );
    assert!(record.available >= 0 && record.used >= 0);
}

#[tokio::test]
async fn grant_consume_refund_scenario() {
    let (_store, service) = ledger();

    let grant = service
        .grant(GrantRequest::new("T1", "eq", 10).actor("superadmin-1"))
        .await
        .unwrap();
    assert_eq!(grant.kind, EntryKind::Grant);
    assert_eq!((grant.amount, grant.balance_before, grant.balance_after), (10, 0, 10));
    assert_eq!(grant.actor_id.as_deref(), Some("superadmin-1"));

    let balances = service.all_balances("T1").await.unwrap();
    assert_eq!(balances.len(), 1);
    assert_eq!(
        (balances[0].total_granted, balances[0].used, balances[0].available),
        (10, 0, 10)
    );

    let outcome = service.consume(consume_one("test-42")).await.unwrap();
    let ConsumeOutcome::Consumed {
        transaction_id,
        balance_after,
    } = outcome
    else {
        panic!("expected consumption to succeed, got {outcome:?}");
    };
    assert_eq!(balance_after, 9);

    let consumed = service.entry(transaction_id).await.unwrap().unwrap();
    assert_eq!(consumed.kind, EntryKind::Consume);
    assert_eq!(
        (consumed.amount, consumed.balance_before, consumed.balance_after),
        (-1, 10, 9)
    );
    assert_eq!(consumed.reference_id.as_deref(), Some("test-42"));
    assert_eq!(consumed.reference_kind.as_deref(), Some("test"));
    assert_eq!(service.balance("T1", "eq").await.unwrap(), 9);

    let refund = service
        .refund(transaction_id, "test creation failed", Some("worker-7".into()))
        .await
        .unwrap();
    let RefundOutcome::Refunded { refund_id, .. } = refund else {
        panic!("expected refund to succeed, got {refund:?}");
    };
    let refunded = service.entry(refund_id).await.unwrap().unwrap();
    assert_eq!(refunded.kind, EntryKind::Refund);
    assert_eq!(
        (refunded.amount, refunded.balance_before, refunded.balance_after),
        (1, 9, 10)
    );
    assert_eq!(
        refunded.reference_id.as_deref(),
        Some(transaction_id.to_string().as_str())
    );
    assert_eq!(refunded.metadata["reason"], "test creation failed");

    let record = &service.all_balances("T1").await.unwrap()[0];
    assert_eq!((record.total_granted, record.used, record.available), (10, 0, 10));
    assert_consistent(&service, "T1", "eq").await;
}

#[tokio::test]
async fn exhausted_balance_denies_without_mutation() {
    let (_store, service) = ledger();
    service.grant(GrantRequest::new("T1", "eq", 10)).await.unwrap();

    for n in 0..10 {
        let outcome = service
            .consume(consume_one(&format!("test-{n}")))
            .await
            .unwrap();
        assert!(outcome.is_ok());
    }

    let before = service.all_balances("T1").await.unwrap();
    let outcome = service.consume(consume_one("test-overflow")).await.unwrap();
    assert_eq!(
        outcome,
        ConsumeOutcome::Denied {
            reason: DenialReason::InsufficientBalance
        }
    );
    assert_eq!(service.all_balances("T1").await.unwrap(), before);
    assert_eq!(service.entries_for("T1", "eq").await.unwrap().len(), 11);

    let check = service.can_create("T1", "eq").await.unwrap();
    assert!(!check.can_create);
    assert_eq!(check.reason, Some(DenialReason::InsufficientBalance));
    assert_eq!(check.available, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumes_on_last_credit_yield_one_success() {
    let (_store, service) = ledger();
    let service = Arc::new(service);
    service.grant(GrantRequest::new("T1", "eq", 1)).await.unwrap();

    let racers = (0..2).map(|n| {
        let service = service.clone();
        tokio::spawn(async move { service.consume(consume_one(&format!("race-{n}"))).await })
    });
    let outcomes: Vec<ConsumeOutcome> = join_all(racers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|outcome| outcome.reason() == Some(DenialReason::InsufficientBalance)));
    assert_eq!(service.balance("T1", "eq").await.unwrap(), 0);
    assert_consistent(&service, "T1", "eq").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_consumes_never_overspend() {
    let (_store, service) = ledger();
    let service = Arc::new(service);
    let granted = 7;
    let callers = 40;
    service
        .grant(GrantRequest::new("T1", "eq", granted))
        .await
        .unwrap();

    let racers = (0..callers).map(|n| {
        let service = service.clone();
        tokio::spawn(async move { service.consume(consume_one(&format!("race-{n}"))).await })
    });
    let outcomes: Vec<ConsumeOutcome> = join_all(racers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let successes = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    let insufficient = outcomes
        .iter()
        .filter(|outcome| outcome.reason() == Some(DenialReason::InsufficientBalance))
        .count();
    assert_eq!(successes, granted as usize);
    assert_eq!(insufficient, callers - granted as usize);

    let record = &service.all_balances("T1").await.unwrap()[0];
    assert_eq!((record.available, record.used), (0, granted));
    assert_consistent(&service, "T1", "eq").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_pairs_progress_independently() {
    let (_store, service) = ledger();
    let service = Arc::new(service);
    for tenant in ["T1", "T2"] {
        for resource_type in ["eq", "writing"] {
            service
                .grant(GrantRequest::new(tenant, resource_type, 25))
                .await
                .unwrap();
        }
    }

    let tasks = (0..100).map(|n| {
        let service = service.clone();
        let tenant = if n % 2 == 0 { "T1" } else { "T2" };
        let resource_type = if n % 4 < 2 { "eq" } else { "writing" };
        tokio::spawn(async move {
            service
                .consume(ConsumeRequest::new(tenant, resource_type, format!("r-{n}"), "test"))
                .await
        })
    });
    for joined in join_all(tasks).await {
        assert!(joined.unwrap().unwrap().is_ok());
    }

    for tenant in ["T1", "T2"] {
        for resource_type in ["eq", "writing"] {
            assert_eq!(service.balance(tenant, resource_type).await.unwrap(), 0);
            assert_consistent(&service, tenant, resource_type).await;
        }
    }
}

#[tokio::test]
async fn multi_unit_consumption() {
    let (_store, service) = ledger();
    service.grant(GrantRequest::new("T1", "eq", 5)).await.unwrap();

    let outcome = service
        .consume(consume_one("bundle-1").amount(3))
        .await
        .unwrap();
    assert!(outcome.is_ok(), "three credits should be available");
    let denied = service
        .consume(consume_one("bundle-2").amount(3))
        .await
        .unwrap();
    assert_eq!(denied.reason(), Some(DenialReason::InsufficientBalance));
    assert_eq!(service.balance("T1", "eq").await.unwrap(), 2);

    let refund = service
        .refund(outcome.transaction_id().unwrap(), "bundle cancelled", None)
        .await
        .unwrap();
    assert!(refund.is_ok());
    assert_eq!(service.balance("T1", "eq").await.unwrap(), 5);
    assert_consistent(&service, "T1", "eq").await;
}

#[tokio::test]
async fn second_refund_is_rejected_without_mutation() {
    let (_store, service) = ledger();
    service.grant(GrantRequest::new("T1", "eq", 3)).await.unwrap();
    let transaction_id = service
        .consume(consume_one("test-1"))
        .await
        .unwrap()
        .transaction_id()
        .unwrap();

    assert!(service
        .refund(transaction_id, "first", None)
        .await
        .unwrap()
        .is_ok());
    let after_first = service.all_balances("T1").await.unwrap();

    let second = service.refund(transaction_id, "again", None).await.unwrap();
    assert_eq!(second.rejection(), Some(RefundRejection::AlreadyRefunded));
    assert_eq!(service.all_balances("T1").await.unwrap(), after_first);
    assert_eq!(service.entries_for("T1", "eq").await.unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refunds_credit_once() {
    let (_store, service) = ledger();
    let service = Arc::new(service);
    service.grant(GrantRequest::new("T1", "eq", 2)).await.unwrap();
    let transaction_id = service
        .consume(consume_one("test-1"))
        .await
        .unwrap()
        .transaction_id()
        .unwrap();

    let racers = (0..8).map(|_| {
        let service = service.clone();
        tokio::spawn(async move { service.refund(transaction_id, "retry storm", None).await })
    });
    let outcomes: Vec<RefundOutcome> = join_all(racers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .filter(|outcome| !outcome.is_ok())
        .all(|outcome| outcome.rejection() == Some(RefundRejection::AlreadyRefunded)));
    assert_eq!(service.balance("T1", "eq").await.unwrap(), 2);
    assert_consistent(&service, "T1", "eq").await;
}

#[tokio::test]
async fn refund_rejects_unknown_and_non_consumption_entries() {
    let (_store, service) = ledger();
    let grant = service.grant(GrantRequest::new("T1", "eq", 3)).await.unwrap();

    let missing = service.refund(Uuid::new_v4(), "typo", None).await.unwrap();
    assert_eq!(missing.rejection(), Some(RefundRejection::TransactionNotFound));

    let not_consume = service.refund(grant.id, "wrong entry", None).await.unwrap();
    assert_eq!(not_consume.rejection(), Some(RefundRejection::NotAConsumption));
    assert_eq!(service.balance("T1", "eq").await.unwrap(), 3);
}

#[tokio::test]
async fn disabled_type_denies_regardless_of_balance() {
    let (_store, service) = ledger();
    service.grant(GrantRequest::new("T1", "eq", 5)).await.unwrap();
    service.toggle_enabled("T1", "eq", false).await.unwrap();

    let outcome = service.consume(consume_one("test-1")).await.unwrap();
    assert_eq!(outcome.reason(), Some(DenialReason::Disabled));
    assert_eq!(service.balance("T1", "eq").await.unwrap(), 0);
    let check = service.can_create("T1", "eq").await.unwrap();
    assert_eq!(check.reason, Some(DenialReason::Disabled));
    assert!(service.permissions("T1").await.unwrap().is_empty());

    service.toggle_enabled("T1", "eq", true).await.unwrap();
    assert_eq!(service.balance("T1", "eq").await.unwrap(), 5);
    assert!(service.consume(consume_one("test-2")).await.unwrap().is_ok());
}

#[tokio::test]
async fn toggle_creates_missing_record() {
    let (_store, service) = ledger();
    service.toggle_enabled("T1", "writing", false).await.unwrap();

    let balances = service.all_balances("T1").await.unwrap();
    assert_eq!(balances.len(), 1);
    assert!(!balances[0].is_enabled);
    assert_eq!(balances[0].available, 0);
}

#[tokio::test]
async fn unknown_pair_is_not_configured() {
    let (_store, service) = ledger();
    let outcome = service.consume(consume_one("test-1")).await.unwrap();
    assert_eq!(outcome.reason(), Some(DenialReason::NotConfigured));

    let check = service.can_create("T1", "eq").await.unwrap();
    assert_eq!(check.reason, Some(DenialReason::NotConfigured));
    assert!(service.all_balances("T1").await.unwrap().is_empty());
    assert_eq!(service.balance("T1", "eq").await.unwrap(), 0);
}

#[tokio::test]
async fn inactive_record_is_denied_and_hidden_from_permissions() {
    let (_store, service) = ledger();
    service.grant(GrantRequest::new("T1", "eq", 4)).await.unwrap();
    service.grant(GrantRequest::new("T1", "writing", 4)).await.unwrap();
    service.set_active("T1", "eq", false).await.unwrap();

    let outcome = service.consume(consume_one("test-1")).await.unwrap();
    assert_eq!(outcome.reason(), Some(DenialReason::Inactive));
    assert_eq!(
        service.permissions("T1").await.unwrap(),
        BTreeSet::from(["writing".to_string()])
    );

    service.set_active("T1", "eq", true).await.unwrap();
    assert_eq!(service.balance("T1", "eq").await.unwrap(), 4);
}

#[tokio::test]
async fn lapsed_balance_reads_zero_before_sweep() {
    let (_store, service) = ledger();
    let yesterday = Utc::now() - Duration::days(1);
    service
        .grant(GrantRequest::new("T1", "eq", 5).expires_at(yesterday))
        .await
        .unwrap();

    assert_eq!(service.balance("T1", "eq").await.unwrap(), 0);
    let outcome = service.consume(consume_one("test-1")).await.unwrap();
    assert_eq!(outcome.reason(), Some(DenialReason::Expired));
    let check = service.can_create("T1", "eq").await.unwrap();
    assert_eq!(check.reason, Some(DenialReason::Expired));

    let record = &service.all_balances("T1").await.unwrap()[0];
    assert_eq!(record.available, 5, "physical balance waits for the reaper");
}

#[tokio::test]
async fn grant_onto_lapsed_balance_expires_leftovers_first() {
    let (_store, service) = ledger();
    let yesterday = Utc::now() - Duration::days(1);
    service
        .grant(GrantRequest::new("T1", "eq", 4).expires_at(yesterday))
        .await
        .unwrap();
    service.grant(GrantRequest::new("T1", "eq", 3)).await.unwrap();

    let kinds: Vec<(EntryKind, i64)> = service
        .entries_for("T1", "eq")
        .await
        .unwrap()
        .iter()
        .map(|entry| (entry.kind, entry.amount))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (EntryKind::Grant, 4),
            (EntryKind::Expire, -4),
            (EntryKind::Grant, 3)
        ]
    );

    let record = &service.all_balances("T1").await.unwrap()[0];
    assert_eq!(record.expires_at, None);
    assert_eq!(
        (record.total_granted, record.used, record.available, record.expired),
        (7, 0, 3, 4)
    );
    assert_eq!(service.balance("T1", "eq").await.unwrap(), 3);
    assert_consistent(&service, "T1", "eq").await;
}

#[tokio::test]
async fn grant_keeps_existing_deadline_unless_replaced() {
    let (_store, service) = ledger();
    let next_month = Utc::now() + Duration::days(30);
    service
        .grant(GrantRequest::new("T1", "eq", 2).expires_at(next_month))
        .await
        .unwrap();
    service.grant(GrantRequest::new("T1", "eq", 2)).await.unwrap();
    let record = &service.all_balances("T1").await.unwrap()[0];
    assert_eq!(record.expires_at, Some(next_month));

    let next_year = Utc::now() + Duration::days(365);
    service
        .grant(GrantRequest::new("T1", "eq", 1).expires_at(next_year))
        .await
        .unwrap();
    let record = &service.all_balances("T1").await.unwrap()[0];
    assert_eq!(record.expires_at, Some(next_year));
    assert_eq!(record.available, 5);
}

#[tokio::test]
async fn set_enabled_replaces_the_enabled_set() {
    let (_store, service) = ledger();
    service.set_enabled("T1", ["eq", "writing"]).await.unwrap();
    assert_eq!(
        service.permissions("T1").await.unwrap(),
        BTreeSet::from(["eq".to_string(), "writing".to_string()])
    );
    let created: Vec<String> = service
        .all_balances("T1")
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.resource_type)
        .collect();
    assert_eq!(created, vec!["eq", "writing"]);

    service
        .grant(GrantRequest::new("T1", "speaking", 3))
        .await
        .unwrap();
    service.set_enabled("T1", ["eq"]).await.unwrap();

    assert_eq!(
        service.permissions("T1").await.unwrap(),
        BTreeSet::from(["eq".to_string()])
    );
    let speaking = service
        .all_balances("T1")
        .await
        .unwrap()
        .into_iter()
        .find(|record| record.resource_type == "speaking")
        .unwrap();
    assert!(!speaking.is_enabled);
    assert_eq!(speaking.available, 3, "disabling keeps credits");
    assert_eq!(service.balance("T1", "speaking").await.unwrap(), 0);

    service.set_enabled("T1", ["eq", "speaking"]).await.unwrap();
    assert_eq!(service.balance("T1", "speaking").await.unwrap(), 3);
}

#[tokio::test]
async fn non_positive_amounts_are_rejected() {
    let (_store, service) = ledger();
    let err = service
        .grant(GrantRequest::new("T1", "eq", 0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InvalidAmount {
            operation: "grant",
            amount: 0
        }
    ));

    service.grant(GrantRequest::new("T1", "eq", 1)).await.unwrap();
    let err = service
        .consume(consume_one("test-1").amount(-1))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidAmount { .. }));
    assert_eq!(service.balance("T1", "eq").await.unwrap(), 1);
}

#[tokio::test]
async fn transient_conflicts_are_retried() {
    let (store, service) = ledger();
    store.inject_conflicts(2);
    let entry = service.grant(GrantRequest::new("T1", "eq", 6)).await.unwrap();
    assert_eq!(entry.balance_after, 6);
    assert_eq!(service.entries_for("T1", "eq").await.unwrap().len(), 1);

    store.inject_conflicts(100);
    let err = service
        .consume(consume_one("test-1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::RetriesExhausted {
            operation: "consume",
            attempts: 4,
            ..
        }
    ));
    store.inject_conflicts(0);
    assert_eq!(service.balance("T1", "eq").await.unwrap(), 6);
    assert_eq!(service.entries_for("T1", "eq").await.unwrap().len(), 1);
}

#[tokio::test]
async fn store_outage_leaves_no_partial_state() {
    let (store, service) = ledger();
    service.grant(GrantRequest::new("T1", "eq", 2)).await.unwrap();
    let before = service.all_balances("T1").await.unwrap();

    store.set_unavailable(true);
    let err = service.consume(consume_one("test-1")).await.unwrap_err();
    assert!(matches!(err, LedgerError::Store(StoreError::Unavailable(_))));
    store.set_unavailable(false);

    assert_eq!(service.all_balances("T1").await.unwrap(), before);
    assert_eq!(service.entries_for("T1", "eq").await.unwrap().len(), 1);
    assert_consistent(&service, "T1", "eq").await;
}

#[tokio::test]
async fn divergence_is_reported_not_repaired() {
    let (store, service) = ledger();
    service.grant(GrantRequest::new("T1", "eq", 3)).await.unwrap();

    let mut record = service.all_balances("T1").await.unwrap().remove(0);
    record.total_granted += 5;
    record.available += 5;
    store.tamper_record(record.clone()).await;

    let err = service.reconcile("T1", "eq").await.unwrap_err();
    assert!(err.is_invariant_violation());

    let err = service.consume(consume_one("test-1")).await.unwrap_err();
    assert!(err.is_invariant_violation());
    assert_eq!(service.all_balances("T1").await.unwrap()[0], record);
    assert_eq!(service.entries_for("T1", "eq").await.unwrap().len(), 1);
}

#[tokio::test]
async fn history_filters_and_pages_newest_first() {
    let (_store, service) = ledger();
    service.grant(GrantRequest::new("T1", "eq", 5)).await.unwrap();
    service
        .grant(GrantRequest::new("T1", "writing", 5))
        .await
        .unwrap();
    service
        .grant(GrantRequest::new("T2", "eq", 5))
        .await
        .unwrap();
    for n in 0..3 {
        service
            .consume(consume_one(&format!("test-{n}")))
            .await
            .unwrap();
    }

    let everything = service
        .history(&HistoryQuery::for_tenant("T1"))
        .await
        .unwrap();
    assert_eq!(everything.len(), 5);
    assert!(everything
        .windows(2)
        .all(|pair| pair[0].sequence > pair[1].sequence));
    assert!(everything.iter().all(|entry| entry.tenant_id == "T1"));

    let consumes = service
        .history(&HistoryQuery {
            kind: Some(EntryKind::Consume),
            ..HistoryQuery::for_tenant("T1")
        })
        .await
        .unwrap();
    assert_eq!(consumes.len(), 3);
    assert_eq!(consumes[0].reference_id.as_deref(), Some("test-2"));

    let page = service
        .history(&HistoryQuery {
            resource_type: Some("eq".to_string()),
            limit: Some(2),
            offset: Some(1),
            ..HistoryQuery::for_tenant("T1")
        })
        .await
        .unwrap();
    let references: Vec<Option<&str>> = page
        .iter()
        .map(|entry| entry.reference_id.as_deref())
        .collect();
    assert_eq!(references, vec![Some("test-1"), Some("test-0")]);

    let future_only = service
        .history(&HistoryQuery {
            start: Some(Utc::now() + Duration::hours(1)),
            ..HistoryQuery::for_tenant("T1")
        })
        .await
        .unwrap();
    assert!(future_only.is_empty());
}

#[tokio::test]
async fn grant_that_would_overflow_is_rejected_before_writing() {
    let (_store, service) = ledger();
    service
        .grant(GrantRequest::new("T1", "eq", i64::MAX))
        .await
        .unwrap();
    let before = service.all_balances("T1").await.unwrap();

    let err = service
        .grant(GrantRequest::new("T1", "eq", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::BalanceOverflow { amount: 1, .. }));
    assert!(!err.is_invariant_violation());

    assert_eq!(service.all_balances("T1").await.unwrap(), before);
    assert_eq!(service.entries_for("T1", "eq").await.unwrap().len(), 1);
    assert!(service.consume(consume_one("test-1")).await.unwrap().is_ok());
    assert_consistent(&service, "T1", "eq").await;
}

#[tokio::test]
async fn resource_types_are_case_insensitive() {
    let (_store, service) = ledger();
    service.set_enabled("T1", ["EQ", " Writing "]).await.unwrap();
    assert_eq!(
        service.permissions("T1").await.unwrap(),
        BTreeSet::from(["eq".to_string(), "writing".to_string()])
    );
    assert_eq!(service.all_balances("T1").await.unwrap().len(), 2);

    service.grant(GrantRequest::new("T1", "EQ", 3)).await.unwrap();
    assert_eq!(service.balance("T1", "eq").await.unwrap(), 3);
    let outcome = service
        .consume(ConsumeRequest::new("T1", "Eq", "test-1", "test"))
        .await
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!(service.balance("T1", "EQ").await.unwrap(), 2);

    let history = service
        .history(&HistoryQuery {
            resource_type: Some("EQ".to_string()),
            ..HistoryQuery::for_tenant("T1")
        })
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|entry| entry.resource_type == "eq"));
}
