#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use care_marketplace::billing::{
    parse_event, BillingEvent, BillingStore, ExternalStatus, ManualGrant, NewHistoryEntry,
    ProviderBilling, StatusWrite, SubscriptionHistoryEntry, SubscriptionLookup, SubscriptionPlan,
    SubscriptionSnapshot, SubscriptionStatus,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// In-memory stand-in for the Postgres billing store. Mirrors the
/// `manual_grant IS NULL` guard and the unique history key.
#[derive(Default)]
pub struct MemoryStore {
    providers: Mutex<HashMap<Uuid, ProviderBilling>>,
    history: Mutex<Vec<SubscriptionHistoryEntry>>,
    plans: Mutex<Vec<SubscriptionPlan>>,
}

impl MemoryStore {
    pub fn with_providers(providers: impl IntoIterator<Item = ProviderBilling>) -> Self {
        let store = Self::default();
        {
            let mut map = store.providers.lock().unwrap();
            for provider in providers {
                map.insert(provider.id, provider);
            }
        }
        store
    }

    pub fn get(&self, id: Uuid) -> ProviderBilling {
        self.providers.lock().unwrap()[&id].clone()
    }

    pub fn snapshot(&self) -> Vec<ProviderBilling> {
        let mut all: Vec<_> = self.providers.lock().unwrap().values().cloned().collect();
        all.sort_by_key(|p| p.id);
        all
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap().len()
    }

    pub fn add_plan(&self, plan: SubscriptionPlan) {
        self.plans.lock().unwrap().push(plan);
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn provider_by_id(&self, provider_id: Uuid) -> Result<Option<ProviderBilling>> {
        Ok(self.providers.lock().unwrap().get(&provider_id).cloned())
    }

    async fn provider_by_subscription(&self, subscription_id: &str) -> Result<Option<ProviderBilling>> {
        Ok(self
            .providers
            .lock()
            .unwrap()
            .values()
            .find(|p| p.stripe_subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }

    async fn provider_by_customer(&self, customer_id: &str) -> Result<Option<ProviderBilling>> {
        Ok(self
            .providers
            .lock()
            .unwrap()
            .values()
            .find(|p| p.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn apply_status(&self, provider_id: Uuid, write: &StatusWrite) -> Result<Option<ProviderBilling>> {
        let mut providers = self.providers.lock().unwrap();
        let Some(provider) = providers.get_mut(&provider_id) else {
            return Ok(None);
        };
        if provider.manual_grant.is_some() {
            return Ok(None);
        }
        provider.subscription_status = write.status;
        if let Some(customer) = &write.stripe_customer_id {
            provider.stripe_customer_id = Some(customer.clone());
        }
        if let Some(subscription) = &write.stripe_subscription_id {
            provider.stripe_subscription_id = Some(subscription.clone());
        }
        if write.start_date.is_some() {
            provider.subscription_start_date = write.start_date;
        }
        if write.end_date.is_some() {
            provider.subscription_end_date = write.end_date;
        }
        Ok(Some(provider.clone()))
    }

    async fn record_history(&self, entry: &NewHistoryEntry) -> Result<bool> {
        let mut history = self.history.lock().unwrap();
        if history.iter().any(|h| h.external_id == entry.external_id) {
            return Ok(false);
        }
        history.push(SubscriptionHistoryEntry {
            id: Uuid::new_v4(),
            provider_id: entry.provider_id,
            external_id: entry.external_id.clone(),
            event_type: entry.event_type.clone(),
            amount_cents: entry.amount_cents,
            currency: entry.currency.clone(),
            plan: entry.plan.clone(),
            recorded_at: entry.recorded_at,
        });
        Ok(true)
    }

    async fn write_grant(
        &self,
        provider_id: Uuid,
        grant: Option<ManualGrant>,
        status: SubscriptionStatus,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<Option<ProviderBilling>> {
        let mut providers = self.providers.lock().unwrap();
        let Some(provider) = providers.get_mut(&provider_id) else {
            return Ok(None);
        };
        provider.manual_grant = grant;
        provider.subscription_status = status;
        provider.subscription_start_date = provider.subscription_start_date.or(Some(Utc::now()));
        provider.subscription_end_date = end_date;
        Ok(Some(provider.clone()))
    }

    async fn history(&self, provider_id: Uuid) -> Result<Vec<SubscriptionHistoryEntry>> {
        let mut entries: Vec<_> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.provider_id == provider_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(entries)
    }

    async fn active_plans(&self) -> Result<Vec<SubscriptionPlan>> {
        Ok(self
            .plans
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.active)
            .cloned()
            .collect())
    }
}

/// Serves fixed subscriptions; unknown ids fail like an unreachable API.
#[derive(Default)]
pub struct StaticLookup {
    subscriptions: HashMap<String, SubscriptionSnapshot>,
}

impl StaticLookup {
    pub fn with(snapshots: impl IntoIterator<Item = SubscriptionSnapshot>) -> Self {
        Self {
            subscriptions: snapshots
                .into_iter()
                .map(|snapshot| (snapshot.subscription_id.clone(), snapshot))
                .collect(),
        }
    }
}

#[async_trait]
impl SubscriptionLookup for StaticLookup {
    async fn subscription(&self, subscription_id: &str) -> Result<SubscriptionSnapshot> {
        self.subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such subscription {subscription_id}"))
    }
}

pub fn snapshot(
    subscription_id: &str,
    status: &str,
    period: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> SubscriptionSnapshot {
    SubscriptionSnapshot {
        subscription_id: subscription_id.into(),
        customer_id: Some("cus_123".into()),
        status: ExternalStatus::from(status),
        period_start: period.map(|(start, _)| start),
        period_end: period.map(|(_, end)| end),
        plan: Some("Monthly".into()),
    }
}

pub fn provider(status: SubscriptionStatus, subscription_id: Option<&str>) -> ProviderBilling {
    ProviderBilling {
        id: Uuid::new_v4(),
        owner_id: Uuid::new_v4(),
        business_name: "Lakeside Adult Day".into(),
        email: Some("owner@lakeside.test".into()),
        subscription_status: status,
        manual_grant: None,
        stripe_customer_id: subscription_id.map(|_| "cus_123".to_string()),
        stripe_subscription_id: subscription_id.map(str::to_string),
        subscription_start_date: None,
        subscription_end_date: None,
    }
}

pub fn event(value: serde_json::Value) -> BillingEvent {
    parse_event(value.to_string().as_bytes()).expect("fixture parses")
}
