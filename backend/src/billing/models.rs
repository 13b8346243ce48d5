use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Year after which an end date is treated as the legacy "lifetime" sentinel.
pub const LIFETIME_SENTINEL_YEAR: i32 = 2090;

/// key: billing-models -> local provider subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Trial,
    Active,
    PastDue,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// Whether a provider in this status is shown in public search.
    pub fn is_listable(&self) -> bool {
        matches!(self, SubscriptionStatus::Trial | SubscriptionStatus::Active)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(SubscriptionStatus::Pending),
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(anyhow::anyhow!("unknown subscription status `{other}`")),
        }
    }
}

/// Administrator-set access that is not backed by an external subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualGrant {
    Lifetime,
    ManualActivation,
}

impl ManualGrant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManualGrant::Lifetime => "lifetime",
            ManualGrant::ManualActivation => "manual_activation",
        }
    }
}

impl FromStr for ManualGrant {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "lifetime" => Ok(ManualGrant::Lifetime),
            "manual_activation" => Ok(ManualGrant::ManualActivation),
            other => Err(anyhow::anyhow!("unknown manual grant `{other}`")),
        }
    }
}

/// Where a provider's current status comes from. A manual grant always takes
/// precedence over external billing events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionSource {
    ManualGrant(ManualGrant),
    External(String),
    None,
}

/// key: billing-provider-model -> billing columns of `providers`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderBilling {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub business_name: String,
    pub email: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub manual_grant: Option<ManualGrant>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub subscription_start_date: Option<DateTime<Utc>>,
    pub subscription_end_date: Option<DateTime<Utc>>,
}

impl ProviderBilling {
    pub fn source(&self) -> SubscriptionSource {
        if let Some(grant) = self.manual_grant {
            return SubscriptionSource::ManualGrant(grant);
        }
        let lifetime_sentinel = self
            .subscription_end_date
            .map(|end| end.year() > LIFETIME_SENTINEL_YEAR)
            .unwrap_or(false);
        match self.stripe_subscription_id.as_deref() {
            None if lifetime_sentinel => SubscriptionSource::ManualGrant(ManualGrant::Lifetime),
            Some(id) if !id.is_empty() => SubscriptionSource::External(id.to_string()),
            _ => SubscriptionSource::None,
        }
    }
}

/// A status write computed by reconciliation. `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWrite {
    pub status: SubscriptionStatus,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl StatusWrite {
    pub fn status(status: SubscriptionStatus) -> Self {
        Self {
            status,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            start_date: None,
            end_date: None,
        }
    }
}

/// key: billing-history-model -> append-only payment ledger
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionHistoryEntry {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub external_id: String,
    pub event_type: String,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub plan: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryEntry {
    pub provider_id: Uuid,
    pub external_id: String,
    pub event_type: String,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub plan: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub billing_period: String,
    pub currency: String,
    pub amount_cents: i32,
    pub stripe_price_id: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}
