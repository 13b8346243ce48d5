use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::events::BillingEvent;
use super::lookup::SubscriptionLookup;
use super::models::{
    ManualGrant, ProviderBilling, SubscriptionHistoryEntry, SubscriptionPlan, SubscriptionSource,
    SubscriptionStatus, LIFETIME_SENTINEL_YEAR,
};
use super::reconciliation::{decide, history_entry, local_status, Decision};
use super::store::BillingStore;

/// key: billing-outcome -> what a delivery did to local state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    Applied {
        provider_id: Uuid,
        status: SubscriptionStatus,
        history_recorded: bool,
    },
    ManualGrantPreserved {
        provider_id: Uuid,
        grant: Option<ManualGrant>,
        history_recorded: bool,
    },
    Unchanged {
        provider_id: Uuid,
        reason: String,
    },
    /// The session or invoice was already recorded; nothing was written.
    Duplicate {
        provider_id: Uuid,
        external_id: String,
    },
    UnknownSubscription {
        subscription_id: String,
    },
    UnknownProvider {
        event_id: String,
    },
    Ignored {
        event_type: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Revocation {
    Revoked(ProviderBilling),
    NoGrant,
    NotFound,
}

/// key: billing-service -> provider subscription lifecycle
#[derive(Clone)]
pub struct BillingService {
    store: Arc<dyn BillingStore>,
    lookup: Option<Arc<dyn SubscriptionLookup>>,
}

impl BillingService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self {
            store,
            lookup: None,
        }
    }

    pub fn with_subscription_lookup(mut self, lookup: Arc<dyn SubscriptionLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub async fn handle_event(&self, event: &BillingEvent) -> Result<ReconciliationOutcome> {
        self.handle_event_at(event, Utc::now()).await
    }

    pub async fn handle_event_at(
        &self,
        event: &BillingEvent,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationOutcome> {
        let event_id = event.event_id();
        let event_type = event.event_type();
        if let BillingEvent::Unsupported { event_type, .. } = event {
            info!(%event_id, %event_type, "ignoring unsupported billing event");
            return Ok(ReconciliationOutcome::Ignored {
                event_type: event_type.clone(),
            });
        }

        let completed = self.complete_checkout(event).await;
        let event: &BillingEvent = &completed;

        let Some(provider) = self.locate(event).await? else {
            return Ok(match event.subscription_id() {
                Some(subscription_id) if !matches!(event, BillingEvent::CheckoutCompleted(_)) => {
                    warn!(
                        %event_id,
                        %event_type,
                        %subscription_id,
                        "billing event references unknown subscription"
                    );
                    ReconciliationOutcome::UnknownSubscription {
                        subscription_id: subscription_id.to_string(),
                    }
                }
                None if !matches!(event, BillingEvent::CheckoutCompleted(_)) => {
                    info!(%event_id, %event_type, "billing event without subscription reference");
                    ReconciliationOutcome::Ignored {
                        event_type: event_type.to_string(),
                    }
                }
                _ => {
                    warn!(%event_id, %event_type, "checkout matches no provider");
                    ReconciliationOutcome::UnknownProvider {
                        event_id: event_id.to_string(),
                    }
                }
            });
        };

        // a repeated session or invoice writes nothing
        let history_recorded = match history_entry(event, provider.id, now) {
            Some(entry) => {
                if !self.store.record_history(&entry).await? {
                    info!(
                        %event_id,
                        external_id = %entry.external_id,
                        provider_id = %provider.id,
                        "duplicate billing delivery skipped"
                    );
                    return Ok(ReconciliationOutcome::Duplicate {
                        provider_id: provider.id,
                        external_id: entry.external_id,
                    });
                }
                true
            }
            None => false,
        };

        match decide(event, &provider, now) {
            Decision::Write(write) => match self.store.apply_status(provider.id, &write).await? {
                Some(updated) => {
                    info!(
                        %event_id,
                        %event_type,
                        provider_id = %updated.id,
                        from = %provider.subscription_status,
                        to = %updated.subscription_status,
                        "reconciled provider subscription"
                    );
                    Ok(ReconciliationOutcome::Applied {
                        provider_id: updated.id,
                        status: updated.subscription_status,
                        history_recorded,
                    })
                }
                None => {
                    warn!(
                        %event_id,
                        provider_id = %provider.id,
                        "status write refused; provider gained a manual grant or was removed"
                    );
                    Ok(ReconciliationOutcome::ManualGrantPreserved {
                        provider_id: provider.id,
                        grant: None,
                        history_recorded,
                    })
                }
            },
            Decision::PreserveManualGrant(grant) => {
                info!(
                    %event_id,
                    %event_type,
                    provider_id = %provider.id,
                    grant = grant.as_str(),
                    "manual grant takes precedence over billing event"
                );
                Ok(ReconciliationOutcome::ManualGrantPreserved {
                    provider_id: provider.id,
                    grant: Some(grant),
                    history_recorded,
                })
            }
            Decision::NoChange { reason } => {
                info!(%event_id, provider_id = %provider.id, %reason, "billing event left status unchanged");
                Ok(ReconciliationOutcome::Unchanged {
                    provider_id: provider.id,
                    reason,
                })
            }
        }
    }

    /// Fetches the subscription behind a checkout that only carried its id.
    /// Without a lookup, or when it fails, the checkout is used as delivered.
    async fn complete_checkout<'a>(&self, event: &'a BillingEvent) -> Cow<'a, BillingEvent> {
        let BillingEvent::CheckoutCompleted(checkout) = event else {
            return Cow::Borrowed(event);
        };
        let Some(subscription_id) = checkout
            .subscription_id
            .as_deref()
            .filter(|_| checkout.needs_subscription_details())
        else {
            return Cow::Borrowed(event);
        };
        let Some(lookup) = self.lookup.as_ref() else {
            info!(
                event_id = %checkout.event_id,
                %subscription_id,
                "no subscription lookup configured; checkout links ids only"
            );
            return Cow::Borrowed(event);
        };
        match lookup.subscription(subscription_id).await {
            Ok(snapshot) => {
                let mut checkout = checkout.clone();
                checkout.apply_snapshot(snapshot);
                Cow::Owned(BillingEvent::CheckoutCompleted(checkout))
            }
            Err(err) => {
                warn!(
                    ?err,
                    event_id = %checkout.event_id,
                    %subscription_id,
                    "subscription lookup failed; checkout links ids only"
                );
                Cow::Borrowed(event)
            }
        }
    }

    async fn locate(&self, event: &BillingEvent) -> Result<Option<ProviderBilling>> {
        if let BillingEvent::CheckoutCompleted(checkout) = event {
            if let Some(provider_id) = checkout.provider_ref {
                if let Some(provider) = self.store.provider_by_id(provider_id).await? {
                    return Ok(Some(provider));
                }
            }
            if let Some(customer_id) = checkout.customer_id.as_deref() {
                if let Some(provider) = self.store.provider_by_customer(customer_id).await? {
                    return Ok(Some(provider));
                }
            }
        }
        match event.subscription_id() {
            Some(subscription_id) => self.store.provider_by_subscription(subscription_id).await,
            None => Ok(None),
        }
    }

    pub async fn grant_lifetime(&self, provider_id: Uuid) -> Result<Option<ProviderBilling>> {
        let provider = self
            .store
            .write_grant(
                provider_id,
                Some(ManualGrant::Lifetime),
                SubscriptionStatus::Active,
                Some(lifetime_end()),
            )
            .await?;
        if provider.is_some() {
            info!(%provider_id, "granted lifetime access");
        }
        Ok(provider)
    }

    /// Activates a provider by hand until `until`, or indefinitely.
    pub async fn grant_manual_activation(
        &self,
        provider_id: Uuid,
        until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<ProviderBilling>> {
        if let Some(until) = until {
            if until <= now {
                return Err(anyhow!("manual activation must end in the future"));
            }
        }
        let provider = self
            .store
            .write_grant(
                provider_id,
                Some(ManualGrant::ManualActivation),
                SubscriptionStatus::Active,
                Some(until.unwrap_or_else(lifetime_end)),
            )
            .await?;
        if provider.is_some() {
            info!(%provider_id, ?until, "granted manual activation");
        }
        Ok(provider)
    }

    /// Removes an administrator grant. Providers without an external
    /// subscription expire immediately. Linked providers take the external
    /// subscription's current state when it can be fetched and otherwise keep
    /// their present status and end date until the next billing event.
    pub async fn revoke_manual_grant(
        &self,
        provider_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Revocation> {
        let Some(provider) = self.store.provider_by_id(provider_id).await? else {
            return Ok(Revocation::NotFound);
        };
        let SubscriptionSource::ManualGrant(grant) = provider.source() else {
            return Ok(Revocation::NoGrant);
        };
        let (status, end_date) = match provider
            .stripe_subscription_id
            .as_deref()
            .filter(|id| !id.is_empty())
        {
            Some(subscription_id) => self.external_state(&provider, subscription_id).await,
            None => (SubscriptionStatus::Expired, Some(now)),
        };
        let Some(updated) = self
            .store
            .write_grant(provider_id, None, status, end_date)
            .await?
        else {
            return Ok(Revocation::NotFound);
        };
        info!(%provider_id, grant = grant.as_str(), %status, "revoked manual grant");
        Ok(Revocation::Revoked(updated))
    }

    async fn external_state(
        &self,
        provider: &ProviderBilling,
        subscription_id: &str,
    ) -> (SubscriptionStatus, Option<DateTime<Utc>>) {
        let kept_end = provider
            .subscription_end_date
            .filter(|end| end.year() <= LIFETIME_SENTINEL_YEAR);
        let Some(lookup) = self.lookup.as_ref() else {
            return (provider.subscription_status, kept_end);
        };
        match lookup.subscription(subscription_id).await {
            Ok(snapshot) => (
                local_status(&snapshot.status).unwrap_or(provider.subscription_status),
                snapshot.period_end.or(kept_end),
            ),
            Err(err) => {
                warn!(
                    ?err,
                    provider_id = %provider.id,
                    %subscription_id,
                    "subscription lookup failed during revocation"
                );
                (provider.subscription_status, kept_end)
            }
        }
    }

    pub async fn provider(&self, provider_id: Uuid) -> Result<Option<ProviderBilling>> {
        self.store.provider_by_id(provider_id).await
    }

    pub async fn history(&self, provider_id: Uuid) -> Result<Vec<SubscriptionHistoryEntry>> {
        self.store.history(provider_id).await
    }

    pub async fn plans(&self) -> Result<Vec<SubscriptionPlan>> {
        self.store.active_plans().await
    }
}

/// End date written for lifetime grants; past the sentinel year.
pub fn lifetime_end() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2099, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
