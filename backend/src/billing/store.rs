use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{
    ManualGrant, NewHistoryEntry, ProviderBilling, StatusWrite, SubscriptionHistoryEntry,
    SubscriptionPlan, SubscriptionStatus,
};
use crate::db::{provider_billing, subscription_history, subscription_plans};

/// key: billing-store -> persistence seam injected into the billing service
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn provider_by_id(&self, provider_id: Uuid) -> Result<Option<ProviderBilling>>;
    async fn provider_by_subscription(&self, subscription_id: &str)
        -> Result<Option<ProviderBilling>>;
    async fn provider_by_customer(&self, customer_id: &str) -> Result<Option<ProviderBilling>>;

    /// Returns `None` when the provider is missing or holds a manual grant.
    async fn apply_status(
        &self,
        provider_id: Uuid,
        write: &StatusWrite,
    ) -> Result<Option<ProviderBilling>>;

    /// Returns `true` when a new row was written, `false` for a repeat of an
    /// already recorded external id.
    async fn record_history(&self, entry: &NewHistoryEntry) -> Result<bool>;

    async fn write_grant(
        &self,
        provider_id: Uuid,
        grant: Option<ManualGrant>,
        status: SubscriptionStatus,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<Option<ProviderBilling>>;

    async fn history(&self, provider_id: Uuid) -> Result<Vec<SubscriptionHistoryEntry>>;
    async fn active_plans(&self) -> Result<Vec<SubscriptionPlan>>;
}

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn provider_by_id(&self, provider_id: Uuid) -> Result<Option<ProviderBilling>> {
        Ok(provider_billing::get_by_id(&self.pool, provider_id).await?)
    }

    async fn provider_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<ProviderBilling>> {
        Ok(provider_billing::get_by_subscription_id(&self.pool, subscription_id).await?)
    }

    async fn provider_by_customer(&self, customer_id: &str) -> Result<Option<ProviderBilling>> {
        Ok(provider_billing::get_by_customer_id(&self.pool, customer_id).await?)
    }

    async fn apply_status(
        &self,
        provider_id: Uuid,
        write: &StatusWrite,
    ) -> Result<Option<ProviderBilling>> {
        Ok(provider_billing::apply_status(&self.pool, provider_id, write).await?)
    }

    async fn record_history(&self, entry: &NewHistoryEntry) -> Result<bool> {
        Ok(subscription_history::insert_entry(&self.pool, entry).await?)
    }

    async fn write_grant(
        &self,
        provider_id: Uuid,
        grant: Option<ManualGrant>,
        status: SubscriptionStatus,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<Option<ProviderBilling>> {
        Ok(provider_billing::write_grant(&self.pool, provider_id, grant, status, end_date).await?)
    }

    async fn history(&self, provider_id: Uuid) -> Result<Vec<SubscriptionHistoryEntry>> {
        Ok(subscription_history::list_for_provider(&self.pool, provider_id).await?)
    }

    async fn active_plans(&self) -> Result<Vec<SubscriptionPlan>> {
        Ok(subscription_plans::list_active(&self.pool).await?)
    }
}
