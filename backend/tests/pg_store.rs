use care_marketplace::billing::{
    BillingStore, ManualGrant, NewHistoryEntry, PgBillingStore, StatusWrite, SubscriptionStatus,
};
use care_marketplace::db::provider_billing;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

async fn insert_provider(pool: &PgPool, subscription_id: Option<&str>) -> Uuid {
    sqlx::query_scalar(
        "INSERT INTO providers (owner_id, business_name, email, stripe_subscription_id) \
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind("Riverbend Group Home")
    .bind("owner@riverbend.test")
    .bind(subscription_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

// key: billing-store-tests -> guard, idempotent ledger
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn status_writes_respect_manual_grants(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgBillingStore::new(pool.clone());
    let id = insert_provider(&pool, Some("sub_pg")).await;

    let found = store.provider_by_subscription("sub_pg").await.unwrap().unwrap();
    assert_eq!(found.id, id);
    assert_eq!(found.subscription_status, SubscriptionStatus::Pending);

    let end = Utc::now() + Duration::days(30);
    let write = StatusWrite {
        end_date: Some(end),
        stripe_customer_id: Some("cus_pg".into()),
        ..StatusWrite::status(SubscriptionStatus::Active)
    };
    let updated = store.apply_status(id, &write).await.unwrap().unwrap();
    assert_eq!(updated.subscription_status, SubscriptionStatus::Active);
    assert_eq!(updated.stripe_customer_id.as_deref(), Some("cus_pg"));
    assert_eq!(updated.stripe_subscription_id.as_deref(), Some("sub_pg"));
    assert!(store.provider_by_customer("cus_pg").await.unwrap().is_some());

    store
        .write_grant(id, Some(ManualGrant::Lifetime), SubscriptionStatus::Active, None)
        .await
        .unwrap();
    let refused = store
        .apply_status(id, &StatusWrite::status(SubscriptionStatus::Expired))
        .await
        .unwrap();
    assert!(refused.is_none());
    let current = store.provider_by_id(id).await.unwrap().unwrap();
    assert_eq!(current.subscription_status, SubscriptionStatus::Active);
    assert_eq!(current.manual_grant, Some(ManualGrant::Lifetime));

    let listed = provider_billing::list_by_status(&pool, Some(SubscriptionStatus::Active))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(provider_billing::list_by_status(&pool, Some(SubscriptionStatus::Expired))
        .await
        .unwrap()
        .is_empty());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn history_is_keyed_on_external_id(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgBillingStore::new(pool.clone());
    let id = insert_provider(&pool, None).await;

    let entry = NewHistoryEntry {
        provider_id: id,
        external_id: "in_pg_1".into(),
        event_type: "invoice.payment_succeeded".into(),
        amount_cents: Some(4900),
        currency: Some("usd".into()),
        plan: Some("monthly".into()),
        recorded_at: Utc::now(),
    };
    assert!(store.record_history(&entry).await.unwrap());
    assert!(!store.record_history(&entry).await.unwrap());

    let history = store.history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].amount_cents, Some(4900));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn active_plans_are_ordered_by_price(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    for (code, cents, active) in [("annual", 49000, true), ("monthly", 4900, true), ("legacy", 1900, false)] {
        sqlx::query(
            "INSERT INTO subscription_plans (code, name, billing_period, amount_cents, active) \
             VALUES ($1, $1, 'month', $2, $3)",
        )
        .bind(code)
        .bind(cents)
        .bind(active)
        .execute(&pool)
        .await
        .unwrap();
    }
    let store = PgBillingStore::new(pool);
    let codes: Vec<_> = store
        .active_plans()
        .await
        .unwrap()
        .into_iter()
        .map(|plan| plan.code)
        .collect();
    assert_eq!(codes, ["monthly", "annual"]);
}
