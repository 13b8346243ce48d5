use sqlx::{Executor, Postgres};
use uuid::Uuid;

use crate::billing::models::{NewHistoryEntry, SubscriptionHistoryEntry};

/// Inserts a ledger row keyed on its external id. Returns `false` when a row
/// with that id already exists, leaving the stored row unchanged.
pub async fn insert_entry<'c, E>(executor: E, entry: &NewHistoryEntry) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let inserted: Option<Uuid> = sqlx::query_scalar(
        r#"
        INSERT INTO subscription_history (
            id,
            provider_id,
            external_id,
            event_type,
            amount_cents,
            currency,
            plan,
            recorded_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (external_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(entry.provider_id)
    .bind(&entry.external_id)
    .bind(&entry.event_type)
    .bind(entry.amount_cents)
    .bind(entry.currency.as_deref())
    .bind(entry.plan.as_deref())
    .bind(entry.recorded_at)
    .fetch_optional(executor)
    .await?;

    Ok(inserted.is_some())
}

pub async fn list_for_provider<'c, E>(
    executor: E,
    provider_id: Uuid,
) -> Result<Vec<SubscriptionHistoryEntry>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, SubscriptionHistoryEntry>(
        "SELECT * FROM subscription_history WHERE provider_id = $1 ORDER BY recorded_at DESC",
    )
    .bind(provider_id)
    .fetch_all(executor)
    .await
}
