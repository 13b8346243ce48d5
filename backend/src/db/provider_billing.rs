use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Executor, Postgres, Row};
use uuid::Uuid;

use crate::billing::models::{ManualGrant, ProviderBilling, StatusWrite, SubscriptionStatus};

const BILLING_COLUMNS: &str = r#"
    id,
    owner_id,
    business_name,
    email,
    subscription_status,
    manual_grant,
    stripe_customer_id,
    stripe_subscription_id,
    subscription_start_date,
    subscription_end_date
"#;

pub async fn get_by_id<'c, E>(
    executor: E,
    provider_id: Uuid,
) -> Result<Option<ProviderBilling>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!("SELECT {BILLING_COLUMNS} FROM providers WHERE id = $1");
    let row = sqlx::query(&query)
        .bind(provider_id)
        .fetch_optional(executor)
        .await?;
    row.map(|row| map_row(&row)).transpose()
}

pub async fn get_by_subscription_id<'c, E>(
    executor: E,
    subscription_id: &str,
) -> Result<Option<ProviderBilling>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!(
        "SELECT {BILLING_COLUMNS} FROM providers WHERE stripe_subscription_id = $1 \
         ORDER BY updated_at DESC LIMIT 1"
    );
    let row = sqlx::query(&query)
        .bind(subscription_id)
        .fetch_optional(executor)
        .await?;
    row.map(|row| map_row(&row)).transpose()
}

pub async fn get_by_customer_id<'c, E>(
    executor: E,
    customer_id: &str,
) -> Result<Option<ProviderBilling>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!(
        "SELECT {BILLING_COLUMNS} FROM providers WHERE stripe_customer_id = $1 \
         ORDER BY updated_at DESC LIMIT 1"
    );
    let row = sqlx::query(&query)
        .bind(customer_id)
        .fetch_optional(executor)
        .await?;
    row.map(|row| map_row(&row)).transpose()
}

pub async fn list_by_status<'c, E>(
    executor: E,
    status: Option<SubscriptionStatus>,
) -> Result<Vec<ProviderBilling>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!(
        "SELECT {BILLING_COLUMNS} FROM providers \
         WHERE ($1::TEXT IS NULL OR subscription_status = $1) \
         ORDER BY business_name ASC"
    );
    let rows = sqlx::query(&query)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(executor)
        .await?;
    rows.iter().map(map_row).collect()
}

/// Applies a reconciliation write. Rows holding an explicit manual grant are
/// left untouched and `None` is returned.
pub async fn apply_status<'c, E>(
    executor: E,
    provider_id: Uuid,
    write: &StatusWrite,
) -> Result<Option<ProviderBilling>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!(
        r#"
        UPDATE providers SET
            subscription_status = $2,
            stripe_customer_id = COALESCE($3, stripe_customer_id),
            stripe_subscription_id = COALESCE($4, stripe_subscription_id),
            subscription_start_date = COALESCE($5, subscription_start_date),
            subscription_end_date = COALESCE($6, subscription_end_date),
            updated_at = NOW()
        WHERE id = $1 AND manual_grant IS NULL
        RETURNING {BILLING_COLUMNS}
        "#
    );
    let row = sqlx::query(&query)
        .bind(provider_id)
        .bind(write.status.as_str())
        .bind(write.stripe_customer_id.as_deref())
        .bind(write.stripe_subscription_id.as_deref())
        .bind(write.start_date)
        .bind(write.end_date)
        .fetch_optional(executor)
        .await?;
    row.map(|row| map_row(&row)).transpose()
}

/// Sets or clears the administrator grant together with the status it implies.
pub async fn write_grant<'c, E>(
    executor: E,
    provider_id: Uuid,
    grant: Option<ManualGrant>,
    status: SubscriptionStatus,
    end_date: Option<DateTime<Utc>>,
) -> Result<Option<ProviderBilling>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!(
        r#"
        UPDATE providers SET
            manual_grant = $2,
            subscription_status = $3,
            subscription_start_date = COALESCE(subscription_start_date, NOW()),
            subscription_end_date = $4,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {BILLING_COLUMNS}
        "#
    );
    let row = sqlx::query(&query)
        .bind(provider_id)
        .bind(grant.map(|g| g.as_str()))
        .bind(status.as_str())
        .bind(end_date)
        .fetch_optional(executor)
        .await?;
    row.map(|row| map_row(&row)).transpose()
}

fn map_row(row: &PgRow) -> Result<ProviderBilling, sqlx::Error> {
    let status: String = row.try_get("subscription_status")?;
    let grant: Option<String> = row.try_get("manual_grant")?;
    Ok(ProviderBilling {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        business_name: row.try_get("business_name")?,
        email: row.try_get("email")?,
        subscription_status: status
            .parse()
            .map_err(|err: anyhow::Error| sqlx::Error::Decode(err.into()))?,
        manual_grant: grant
            .map(|value| value.parse::<ManualGrant>())
            .transpose()
            .map_err(|err| sqlx::Error::Decode(err.into()))?,
        stripe_customer_id: row.try_get("stripe_customer_id")?,
        stripe_subscription_id: row.try_get("stripe_subscription_id")?,
        subscription_start_date: row.try_get("subscription_start_date")?,
        subscription_end_date: row.try_get("subscription_end_date")?,
    })
}
