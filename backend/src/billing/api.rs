use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::events::parse_event;
use super::models::{
    ManualGrant, ProviderBilling, SubscriptionHistoryEntry, SubscriptionPlan, SubscriptionSource,
};
use super::service::{BillingService, ReconciliationOutcome, Revocation};
use super::signature::WebhookVerifier;
use crate::error::{AppError, AppResult};
use crate::extractor::{is_admin, AdminUser, AuthUser};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// key: billing-api -> rest endpoints
pub fn routes() -> Router {
    Router::new()
        .route("/api/billing/webhook", post(billing_webhook))
        .route("/api/billing/plans", get(list_plans))
        .route(
            "/api/providers/:id/subscription",
            get(get_provider_subscription),
        )
        .route(
            "/api/admin/providers/:id/grant",
            post(grant_access).delete(revoke_access),
        )
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookAck {
    pub received: bool,
}

/// Verifies and reconciles one billing delivery. Once the signature checks
/// out the delivery is always acknowledged: processing failures are logged
/// and left to the provider's own redelivery plus the history idempotency key.
pub async fn billing_webhook(
    Extension(service): Extension<BillingService>,
    Extension(verifier): Extension<WebhookVerifier>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::BadRequest("Missing signature".into()))?;
    if let Err(err) = verifier.verify(signature, &body, Utc::now().timestamp()) {
        warn!(%err, "rejecting billing webhook with bad signature");
        return Err(AppError::BadRequest("Bad signature".into()));
    }

    let event = match parse_event(&body) {
        Ok(event) => event,
        Err(err) => {
            error!(%err, "unparseable billing event acknowledged without processing");
            return Ok(Json(WebhookAck { received: true }));
        }
    };

    match service.handle_event(&event).await {
        Ok(ReconciliationOutcome::UnknownSubscription { subscription_id }) => {
            info!(
                event_id = event.event_id(),
                %subscription_id,
                "acknowledged event for unknown subscription"
            );
        }
        Ok(outcome) => {
            info!(event_id = event.event_id(), ?outcome, "billing event processed");
        }
        Err(err) => {
            error!(
                ?err,
                event_id = event.event_id(),
                event_type = event.event_type(),
                "failed to reconcile billing event; acknowledging anyway"
            );
        }
    }
    Ok(Json(WebhookAck { received: true }))
}

pub async fn list_plans(
    Extension(service): Extension<BillingService>,
) -> AppResult<Json<Vec<SubscriptionPlan>>> {
    Ok(Json(service.plans().await?))
}

#[derive(Debug, Serialize)]
pub struct SubscriptionEnvelope {
    pub provider: ProviderBilling,
    pub source: &'static str,
    pub history: Vec<SubscriptionHistoryEntry>,
}

pub async fn get_provider_subscription(
    Extension(service): Extension<BillingService>,
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Path(provider_id): Path<Uuid>,
) -> AppResult<Json<SubscriptionEnvelope>> {
    let provider = service
        .provider(provider_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if provider.owner_id != user_id && !is_admin(&pool, user_id).await? {
        return Err(AppError::Forbidden);
    }
    let source = match provider.source() {
        SubscriptionSource::ManualGrant(grant) => grant.as_str(),
        SubscriptionSource::External(_) => "external",
        SubscriptionSource::None => "none",
    };
    let history = service.history(provider_id).await?;
    Ok(Json(SubscriptionEnvelope {
        provider,
        source,
        history,
    }))
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub kind: ManualGrant,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

pub async fn grant_access(
    Extension(service): Extension<BillingService>,
    AdminUser { user_id: admin_id }: AdminUser,
    Path(provider_id): Path<Uuid>,
    Json(payload): Json<GrantRequest>,
) -> AppResult<Json<ProviderBilling>> {
    let now = Utc::now();
    let updated = match payload.kind {
        ManualGrant::Lifetime => {
            if payload.until.is_some() {
                return Err(AppError::BadRequest(
                    "lifetime grants do not take an end date".into(),
                ));
            }
            service.grant_lifetime(provider_id).await?
        }
        ManualGrant::ManualActivation => {
            if matches!(payload.until, Some(until) if until <= now) {
                return Err(AppError::BadRequest(
                    "manual activation must end in the future".into(),
                ));
            }
            service
                .grant_manual_activation(provider_id, payload.until, now)
                .await?
        }
    };
    let updated = updated.ok_or(AppError::NotFound)?;
    info!(%admin_id, %provider_id, kind = payload.kind.as_str(), "admin granted access");
    Ok(Json(updated))
}

pub async fn revoke_access(
    Extension(service): Extension<BillingService>,
    AdminUser { user_id: admin_id }: AdminUser,
    Path(provider_id): Path<Uuid>,
) -> AppResult<Json<ProviderBilling>> {
    match service.revoke_manual_grant(provider_id, Utc::now()).await? {
        Revocation::Revoked(updated) => {
            info!(%admin_id, %provider_id, "admin revoked access");
            Ok(Json(updated))
        }
        Revocation::NoGrant => Err(AppError::BadRequest(
            "provider holds no manual grant".into(),
        )),
        Revocation::NotFound => Err(AppError::NotFound),
    }
}
