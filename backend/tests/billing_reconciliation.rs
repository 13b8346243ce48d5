mod common;

use std::sync::Arc;

use care_marketplace::billing::{
    lifetime_end, BillingService, ManualGrant, ReconciliationOutcome, Revocation,
    SubscriptionStatus,
};
use chrono::{Datelike, Duration, TimeZone, Utc};
use common::{event, provider, snapshot, MemoryStore, StaticLookup};
use serde_json::json;

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 15, 30, 0).unwrap()
}

fn checkout_json(provider_id: uuid::Uuid, session: &str) -> serde_json::Value {
    json!({
        "id": format!("evt_{session}"),
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": session,
            "client_reference_id": provider_id.to_string(),
            "customer": "cus_new",
            "amount_total": 4900,
            "currency": "usd",
            "metadata": { "plan": "monthly" },
            "subscription": {
                "id": "sub_new",
                "status": "active",
                "customer": "cus_new",
                "current_period_start": 1780326000,
                "current_period_end": 1783004400
            }
        }}
    })
}

#[tokio::test]
async fn checkout_activates_provider_and_records_payment() {
    let pending = provider(SubscriptionStatus::Pending, None);
    let id = pending.id;
    let store = Arc::new(MemoryStore::with_providers([pending]));
    let service = BillingService::new(store.clone());

    let outcome = service
        .handle_event_at(&event(checkout_json(id, "cs_1")), now())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReconciliationOutcome::Applied {
            provider_id: id,
            status: SubscriptionStatus::Active,
            history_recorded: true,
        }
    );

    let updated = store.get(id);
    assert_eq!(updated.stripe_customer_id.as_deref(), Some("cus_new"));
    assert_eq!(updated.stripe_subscription_id.as_deref(), Some("sub_new"));
    assert_eq!(
        updated.subscription_start_date,
        Some(Utc.timestamp_opt(1780326000, 0).unwrap())
    );
    assert_eq!(
        updated.subscription_end_date,
        Some(Utc.timestamp_opt(1783004400, 0).unwrap())
    );

    let history = service.history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].external_id, "cs_1");
    assert_eq!(history[0].amount_cents, Some(4900));
    assert_eq!(history[0].plan.as_deref(), Some("monthly"));
}

#[tokio::test]
async fn duplicate_checkout_delivery_is_idempotent() {
    let pending = provider(SubscriptionStatus::Pending, None);
    let id = pending.id;
    let store = Arc::new(MemoryStore::with_providers([pending]));
    let service = BillingService::new(store.clone());
    let delivery = event(checkout_json(id, "cs_dup"));

    service.handle_event_at(&delivery, now()).await.unwrap();
    let after_first = store.snapshot();
    let second = service
        .handle_event_at(&delivery, now() + Duration::minutes(5))
        .await
        .unwrap();

    assert_eq!(
        second,
        ReconciliationOutcome::Duplicate {
            provider_id: id,
            external_id: "cs_dup".into(),
        }
    );
    assert_eq!(store.history_len(), 1);
    assert_eq!(store.snapshot(), after_first);
}

#[tokio::test]
async fn checkout_redelivered_after_cancellation_stays_expired() {
    let pending = provider(SubscriptionStatus::Pending, None);
    let id = pending.id;
    let store = Arc::new(MemoryStore::with_providers([pending]));
    let service = BillingService::new(store.clone());
    let checkout = event(checkout_json(id, "cs_late"));

    service.handle_event_at(&checkout, now()).await.unwrap();
    service
        .handle_event_at(
            &event(json!({
                "id": "evt_del",
                "type": "customer.subscription.deleted",
                "data": { "object": { "id": "sub_new", "status": "canceled" } }
            })),
            now() + Duration::days(3),
        )
        .await
        .unwrap();
    let cancelled = store.get(id);
    assert_eq!(cancelled.subscription_status, SubscriptionStatus::Expired);

    let retry = service
        .handle_event_at(&checkout, now() + Duration::days(4))
        .await
        .unwrap();
    assert!(matches!(retry, ReconciliationOutcome::Duplicate { .. }));
    assert_eq!(store.get(id), cancelled);
    assert_eq!(store.history_len(), 1);
}

#[tokio::test]
async fn checkout_falls_back_to_customer_lookup() {
    let mut existing = provider(SubscriptionStatus::Expired, Some("sub_old"));
    existing.stripe_customer_id = Some("cus_known".into());
    let id = existing.id;
    let store = Arc::new(MemoryStore::with_providers([existing]));
    let service = BillingService::new(store.clone());

    let delivery = event(json!({
        "id": "evt_cs",
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": "cs_cust",
            "customer": "cus_known",
            "subscription": { "id": "sub_again", "status": "active" }
        }}
    }));
    service.handle_event_at(&delivery, now()).await.unwrap();

    let updated = store.get(id);
    assert_eq!(updated.subscription_status, SubscriptionStatus::Active);
    assert_eq!(updated.stripe_subscription_id.as_deref(), Some("sub_again"));
    assert_eq!(updated.subscription_start_date, Some(now()));
}

#[tokio::test]
async fn legacy_lifetime_provider_survives_every_event() {
    let mut lifetime = provider(SubscriptionStatus::Active, None);
    lifetime.subscription_end_date = Some(lifetime_end());
    let id = lifetime.id;
    let store = Arc::new(MemoryStore::with_providers([lifetime]));
    let service = BillingService::new(store.clone());

    let outcome = service
        .handle_event_at(&event(checkout_json(id, "cs_life")), now())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReconciliationOutcome::ManualGrantPreserved {
            provider_id: id,
            grant: Some(ManualGrant::Lifetime),
            history_recorded: true,
        }
    );

    let after = store.get(id);
    assert_eq!(after.subscription_status, SubscriptionStatus::Active);
    assert!(after.subscription_end_date.unwrap().year() > 2090);
    assert_eq!(after.stripe_subscription_id, None);
}

#[tokio::test]
async fn explicit_grant_blocks_cancellation_and_failed_payment() {
    let mut granted = provider(SubscriptionStatus::Active, Some("sub_granted"));
    granted.manual_grant = Some(ManualGrant::ManualActivation);
    let id = granted.id;
    let store = Arc::new(MemoryStore::with_providers([granted]));
    let service = BillingService::new(store.clone());

    for delivery in [
        json!({
            "id": "evt_del",
            "type": "customer.subscription.deleted",
            "data": { "object": { "id": "sub_granted", "status": "canceled" } }
        }),
        json!({
            "id": "evt_fail",
            "type": "invoice.payment_failed",
            "data": { "object": { "id": "in_fail", "subscription": "sub_granted" } }
        }),
    ] {
        let outcome = service.handle_event_at(&event(delivery), now()).await.unwrap();
        assert!(matches!(
            outcome,
            ReconciliationOutcome::ManualGrantPreserved { .. }
        ));
    }
    assert_eq!(store.get(id).subscription_status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn unknown_subscription_mutates_nothing() {
    let store = Arc::new(MemoryStore::with_providers([provider(
        SubscriptionStatus::Active,
        Some("sub_123"),
    )]));
    let service = BillingService::new(store.clone());
    let before = store.snapshot();

    let outcome = service
        .handle_event_at(
            &event(json!({
                "id": "evt_unknown",
                "type": "invoice.payment_succeeded",
                "data": { "object": { "id": "in_1", "subscription": "sub_missing", "amount_paid": 4900 } }
            })),
            now(),
        )
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReconciliationOutcome::UnknownSubscription {
            subscription_id: "sub_missing".into()
        }
    );
    assert_eq!(store.snapshot(), before);
    assert_eq!(store.history_len(), 0);
}

#[tokio::test]
async fn subscription_deleted_expires_at_processing_time() {
    let active = provider(SubscriptionStatus::Active, Some("sub_123"));
    let id = active.id;
    let store = Arc::new(MemoryStore::with_providers([active]));
    let service = BillingService::new(store.clone());

    service
        .handle_event_at(
            &event(json!({
                "id": "evt_del",
                "type": "customer.subscription.deleted",
                "data": { "object": { "id": "sub_123", "status": "canceled" } }
            })),
            now(),
        )
        .await
        .unwrap();

    let updated = store.get(id);
    assert_eq!(updated.subscription_status, SubscriptionStatus::Expired);
    assert_eq!(updated.subscription_end_date, Some(now()));
}

#[tokio::test]
async fn invoice_success_reactivates_until_period_end() {
    let past_due = provider(SubscriptionStatus::PastDue, Some("sub_123"));
    let id = past_due.id;
    let store = Arc::new(MemoryStore::with_providers([past_due]));
    let service = BillingService::new(store.clone());
    let period_end = 1785682800;

    let outcome = service
        .handle_event_at(
            &event(json!({
                "id": "evt_paid",
                "type": "invoice.payment_succeeded",
                "data": { "object": {
                    "id": "in_42",
                    "subscription": "sub_123",
                    "amount_paid": 4900,
                    "currency": "usd",
                    "lines": { "data": [ { "period": { "end": period_end } } ] }
                }}
            })),
            now(),
        )
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ReconciliationOutcome::Applied {
            status: SubscriptionStatus::Active,
            history_recorded: true,
            ..
        }
    ));
    let updated = store.get(id);
    assert_eq!(updated.subscription_status, SubscriptionStatus::Active);
    assert_eq!(
        updated.subscription_end_date,
        Some(Utc.timestamp_opt(period_end, 0).unwrap())
    );
}

#[tokio::test]
async fn subscription_updates_follow_status_mapping() {
    let active = provider(SubscriptionStatus::Active, Some("sub_123"));
    let id = active.id;
    let store = Arc::new(MemoryStore::with_providers([active]));
    let service = BillingService::new(store.clone());

    for (external, expected) in [
        ("unpaid", SubscriptionStatus::PastDue),
        ("trialing", SubscriptionStatus::Trial),
        ("incomplete", SubscriptionStatus::Pending),
        ("active", SubscriptionStatus::Active),
    ] {
        service
            .handle_event_at(
                &event(json!({
                    "id": format!("evt_{external}"),
                    "type": "customer.subscription.updated",
                    "data": { "object": { "id": "sub_123", "status": external } }
                })),
                now(),
            )
            .await
            .unwrap();
        assert_eq!(store.get(id).subscription_status, expected, "{external}");
    }

    let before = store.snapshot();
    let outcome = service
        .handle_event_at(
            &event(json!({
                "id": "evt_paused",
                "type": "customer.subscription.updated",
                "data": { "object": { "id": "sub_123", "status": "paused" } }
            })),
            now(),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, ReconciliationOutcome::Unchanged { .. }));
    assert_eq!(store.snapshot(), before);
}

#[tokio::test]
async fn unsupported_events_are_ignored() {
    let store = Arc::new(MemoryStore::default());
    let service = BillingService::new(store);
    let outcome = service
        .handle_event_at(
            &event(json!({
                "id": "evt_x",
                "type": "customer.created",
                "data": { "object": { "id": "cus_1" } }
            })),
            now(),
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReconciliationOutcome::Ignored {
            event_type: "customer.created".into()
        }
    );
}

#[tokio::test]
async fn id_only_checkout_uses_fetched_subscription() {
    let pending = provider(SubscriptionStatus::Pending, None);
    let id = pending.id;
    let store = Arc::new(MemoryStore::with_providers([pending]));
    let trial_start = now() - Duration::hours(1);
    let trial_end = now() + Duration::days(14);
    let lookup = StaticLookup::with([snapshot(
        "sub_trial",
        "trialing",
        Some((trial_start, trial_end)),
    )]);
    let service = BillingService::new(store.clone()).with_subscription_lookup(Arc::new(lookup));

    let outcome = service
        .handle_event_at(
            &event(json!({
                "id": "evt_cs_trial",
                "type": "checkout.session.completed",
                "data": { "object": {
                    "id": "cs_trial",
                    "client_reference_id": id.to_string(),
                    "customer": "cus_trial",
                    "subscription": "sub_trial",
                    "amount_total": 0
                }}
            })),
            now(),
        )
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ReconciliationOutcome::Applied {
            status: SubscriptionStatus::Trial,
            history_recorded: true,
            ..
        }
    ));
    let updated = store.get(id);
    assert_eq!(updated.stripe_customer_id.as_deref(), Some("cus_trial"));
    assert_eq!(updated.stripe_subscription_id.as_deref(), Some("sub_trial"));
    assert_eq!(updated.subscription_start_date, Some(trial_start));
    assert_eq!(updated.subscription_end_date, Some(trial_end));
    assert_eq!(service.history(id).await.unwrap()[0].plan.as_deref(), Some("Monthly"));
}

#[tokio::test]
async fn id_only_checkout_without_lookup_links_and_waits() {
    let pending = provider(SubscriptionStatus::Pending, None);
    let id = pending.id;
    let store = Arc::new(MemoryStore::with_providers([pending]));
    let service = BillingService::new(store.clone());

    service
        .handle_event_at(
            &event(json!({
                "id": "evt_cs_plain",
                "type": "checkout.session.completed",
                "data": { "object": {
                    "id": "cs_plain",
                    "client_reference_id": id.to_string(),
                    "customer": "cus_plain",
                    "subscription": "sub_plain"
                }}
            })),
            now(),
        )
        .await
        .unwrap();

    let linked = store.get(id);
    assert_eq!(linked.subscription_status, SubscriptionStatus::Pending);
    assert_eq!(linked.stripe_subscription_id.as_deref(), Some("sub_plain"));
    assert_eq!(linked.subscription_end_date, None);
    assert_eq!(store.history_len(), 1);

    let trial_end = 1782000000;
    service
        .handle_event_at(
            &event(json!({
                "id": "evt_sub_created",
                "type": "customer.subscription.created",
                "data": { "object": {
                    "id": "sub_plain",
                    "status": "trialing",
                    "current_period_end": trial_end
                }}
            })),
            now(),
        )
        .await
        .unwrap();
    let trial = store.get(id);
    assert_eq!(trial.subscription_status, SubscriptionStatus::Trial);
    assert_eq!(
        trial.subscription_end_date,
        Some(Utc.timestamp_opt(trial_end, 0).unwrap())
    );
}

#[tokio::test]
async fn failed_lookup_still_links_checkout() {
    let pending = provider(SubscriptionStatus::Pending, None);
    let id = pending.id;
    let store = Arc::new(MemoryStore::with_providers([pending]));
    let service = BillingService::new(store.clone())
        .with_subscription_lookup(Arc::new(StaticLookup::default()));

    service
        .handle_event_at(
            &event(json!({
                "id": "evt_cs_down",
                "type": "checkout.session.completed",
                "data": { "object": {
                    "id": "cs_down",
                    "client_reference_id": id.to_string(),
                    "subscription": "sub_down"
                }}
            })),
            now(),
        )
        .await
        .unwrap();

    let linked = store.get(id);
    assert_eq!(linked.subscription_status, SubscriptionStatus::Pending);
    assert_eq!(linked.stripe_subscription_id.as_deref(), Some("sub_down"));
}

#[tokio::test]
async fn grants_and_revocation() {
    let external = provider(SubscriptionStatus::PastDue, Some("sub_ext"));
    let bare = provider(SubscriptionStatus::Pending, None);
    let (external_id, bare_id) = (external.id, bare.id);
    let store = Arc::new(MemoryStore::with_providers([external, bare]));
    let service = BillingService::new(store.clone());

    let granted = service.grant_lifetime(bare_id).await.unwrap().unwrap();
    assert_eq!(granted.manual_grant, Some(ManualGrant::Lifetime));
    assert_eq!(granted.subscription_status, SubscriptionStatus::Active);
    assert_eq!(granted.subscription_end_date, Some(lifetime_end()));

    assert!(service
        .grant_manual_activation(external_id, Some(now() - Duration::days(1)), now())
        .await
        .is_err());
    let until = now() + Duration::days(30);
    let activated = service
        .grant_manual_activation(external_id, Some(until), now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(activated.subscription_end_date, Some(until));

    let Revocation::Revoked(revoked) = service.revoke_manual_grant(external_id, now()).await.unwrap()
    else {
        panic!("expected revocation");
    };
    assert_eq!(revoked.manual_grant, None);
    assert_eq!(revoked.subscription_status, SubscriptionStatus::Active);
    assert_eq!(revoked.subscription_end_date, Some(until));

    let Revocation::Revoked(revoked) = service.revoke_manual_grant(bare_id, now()).await.unwrap()
    else {
        panic!("expected revocation");
    };
    assert_eq!(revoked.subscription_status, SubscriptionStatus::Expired);
    assert_eq!(revoked.subscription_end_date, Some(now()));

    assert_eq!(
        service
            .revoke_manual_grant(uuid::Uuid::new_v4(), now())
            .await
            .unwrap(),
        Revocation::NotFound
    );
}

#[tokio::test]
async fn revoking_without_a_grant_changes_nothing() {
    let mut past_due = provider(SubscriptionStatus::PastDue, Some("sub_123"));
    past_due.subscription_end_date = Some(Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap());
    let id = past_due.id;
    let store = Arc::new(MemoryStore::with_providers([past_due.clone()]));
    let service = BillingService::new(store.clone());

    assert_eq!(
        service.revoke_manual_grant(id, now()).await.unwrap(),
        Revocation::NoGrant
    );
    assert_eq!(store.get(id), past_due);
}

#[tokio::test]
async fn revocation_restores_external_subscription_state() {
    let mut granted = provider(SubscriptionStatus::Active, Some("sub_ext"));
    granted.manual_grant = Some(ManualGrant::Lifetime);
    granted.subscription_end_date = Some(lifetime_end());
    let id = granted.id;
    let store = Arc::new(MemoryStore::with_providers([granted]));
    let period_end = now() + Duration::days(10);
    let lookup = StaticLookup::with([snapshot(
        "sub_ext",
        "past_due",
        Some((now() - Duration::days(20), period_end)),
    )]);
    let service = BillingService::new(store.clone()).with_subscription_lookup(Arc::new(lookup));

    let Revocation::Revoked(revoked) = service.revoke_manual_grant(id, now()).await.unwrap() else {
        panic!("expected revocation");
    };
    assert_eq!(revoked.manual_grant, None);
    assert_eq!(revoked.subscription_status, SubscriptionStatus::PastDue);
    assert_eq!(revoked.subscription_end_date, Some(period_end));
}
