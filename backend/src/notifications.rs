use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{extract::Extension, routing::post, Json, Router};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::billing::SubscriptionStatus;
use crate::config::{EMAIL_API_KEY, EMAIL_API_URL, EMAIL_FROM};
use crate::db::provider_billing;
use crate::error::{AppError, AppResult};
use crate::extractor::AdminUser;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
}

/// key: mailer -> transactional email seam
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<()>;
}

pub type SharedMailer = Arc<dyn Mailer>;

/// Posts messages as JSON to an HTTP email API using a bearer key.
pub struct HttpMailer {
    endpoint: String,
    api_key: String,
    from: String,
    client: Client,
}

impl HttpMailer {
    pub fn from_config() -> Option<Self> {
        let endpoint = EMAIL_API_URL.clone()?;
        let api_key = EMAIL_API_KEY.clone()?;
        Self::new(endpoint, api_key, EMAIL_FROM.as_str()).ok()
    }

    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            from: from.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("build email client")?,
        })
    }
}

#[derive(Serialize)]
struct EmailPayload<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<()> {
        let payload = EmailPayload {
            from: &self.from,
            to: [email.to.as_str()],
            subject: &email.subject,
            text: &email.text,
        };
        self.client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("email API unreachable")?
            .error_for_status()
            .context("email API rejected message")?;
        Ok(())
    }
}

/// Used when no email API is configured; logs and drops every message.
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<()> {
        info!(to = %email.to, subject = %email.subject, "email API not configured; message dropped");
        Ok(())
    }
}

pub fn mailer_from_config() -> SharedMailer {
    match HttpMailer::from_config() {
        Some(mailer) => Arc::new(mailer),
        None => {
            warn!("EMAIL_API_URL or EMAIL_API_KEY unset; outbound email disabled");
            Arc::new(NoopMailer)
        }
    }
}

pub fn routes() -> Router {
    Router::new().route("/api/admin/broadcast", post(broadcast))
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub status: Option<SubscriptionStatus>,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    pub failed: usize,
}

/// Sends one message per recipient; failures are counted, never fatal.
pub async fn send_all(
    mailer: &dyn Mailer,
    recipients: impl IntoIterator<Item = String>,
    subject: &str,
    text: &str,
) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    for to in recipients {
        let email = OutgoingEmail {
            to,
            subject: subject.to_string(),
            text: text.to_string(),
        };
        match mailer.send(&email).await {
            Ok(()) => report.sent += 1,
            Err(err) => {
                warn!(?err, to = %email.to, "broadcast delivery failed");
                report.failed += 1;
            }
        }
    }
    report
}

pub async fn broadcast(
    Extension(pool): Extension<PgPool>,
    Extension(mailer): Extension<SharedMailer>,
    AdminUser { user_id: admin_id }: AdminUser,
    Json(payload): Json<BroadcastRequest>,
) -> AppResult<Json<BroadcastReport>> {
    let subject = payload.subject.trim();
    let body = payload.body.trim();
    if subject.is_empty() || body.is_empty() {
        return Err(AppError::BadRequest("subject and body are required".into()));
    }
    let providers = provider_billing::list_by_status(&pool, payload.status).await?;
    let recipients = providers
        .into_iter()
        .filter_map(|provider| provider.email)
        .filter(|email| !email.trim().is_empty());
    let report = send_all(mailer.as_ref(), recipients, subject, body).await;
    info!(
        %admin_id,
        status = ?payload.status,
        sent = report.sent,
        failed = report.failed,
        "provider broadcast finished"
    );
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<OutgoingEmail>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, email: &OutgoingEmail) -> Result<()> {
            if email.to.ends_with("@bounce.test") {
                anyhow::bail!("mailbox unavailable");
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_all_counts_failures_and_continues() {
        let mailer = RecordingMailer::default();
        let report = send_all(
            &mailer,
            vec![
                "a@care.test".to_string(),
                "b@bounce.test".to_string(),
                "c@care.test".to_string(),
            ],
            "Renewal reminder",
            "Your listing renews soon.",
        )
        .await;
        assert_eq!(report, BroadcastReport { sent: 2, failed: 1 });
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].to, "c@care.test");
        assert_eq!(sent[1].subject, "Renewal reminder");
    }

    #[tokio::test]
    async fn noop_mailer_accepts_everything() {
        let email = OutgoingEmail {
            to: "x@care.test".into(),
            subject: "s".into(),
            text: "t".into(),
        };
        assert!(NoopMailer.send(&email).await.is_ok());
    }
}
