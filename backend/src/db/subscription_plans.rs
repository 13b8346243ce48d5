use sqlx::{Executor, Postgres};

use crate::billing::models::SubscriptionPlan;

pub async fn list_active<'c, E>(executor: E) -> Result<Vec<SubscriptionPlan>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, SubscriptionPlan>(
        "SELECT * FROM subscription_plans WHERE active = TRUE ORDER BY amount_cents ASC",
    )
    .fetch_all(executor)
    .await
}
