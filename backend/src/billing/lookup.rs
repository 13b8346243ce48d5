use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;

use super::events::{parse_subscription, SubscriptionSnapshot};
use crate::config::{STRIPE_API_BASE, STRIPE_SECRET_KEY};

/// key: billing-lookup -> current state of an external subscription
#[async_trait]
pub trait SubscriptionLookup: Send + Sync {
    async fn subscription(&self, subscription_id: &str) -> Result<SubscriptionSnapshot>;
}

/// Reads subscriptions from the billing provider's REST API.
pub struct HttpSubscriptionLookup {
    base_url: String,
    secret_key: String,
    client: Client,
}

impl HttpSubscriptionLookup {
    pub fn from_config() -> Option<Self> {
        let secret_key = STRIPE_SECRET_KEY.clone()?;
        Self::new(STRIPE_API_BASE.as_str(), secret_key).ok()
    }

    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("build billing API client")?,
        })
    }
}

#[async_trait]
impl SubscriptionLookup for HttpSubscriptionLookup {
    async fn subscription(&self, subscription_id: &str) -> Result<SubscriptionSnapshot> {
        let url = format!("{}/v1/subscriptions/{subscription_id}", self.base_url);
        let body = self
            .client
            .get(&url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .context("billing API unreachable")?
            .error_for_status()
            .context("billing API rejected subscription lookup")?
            .bytes()
            .await
            .context("read subscription body")?;
        Ok(parse_subscription(&body)?)
    }
}
