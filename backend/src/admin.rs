use axum::{
    extract::{Extension, Path, Query},
    routing::{get, patch},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

use crate::billing::{ProviderBilling, SubscriptionStatus};
use crate::db::provider_billing;
use crate::error::{AppError, AppResult};
use crate::extractor::AdminUser;
use crate::inquiries::ContactSubmission;

pub fn routes() -> Router {
    Router::new()
        .route("/api/admin/providers", get(list_providers))
        .route("/api/admin/providers/:id/visibility", patch(set_visibility))
        .route("/api/admin/contact-submissions", get(list_contact_submissions))
}

#[derive(Debug, Default, Deserialize)]
pub struct ProviderFilter {
    pub status: Option<SubscriptionStatus>,
}

pub async fn list_providers(
    Extension(pool): Extension<PgPool>,
    AdminUser { .. }: AdminUser,
    Query(filter): Query<ProviderFilter>,
) -> AppResult<Json<Vec<ProviderBilling>>> {
    let providers = provider_billing::list_by_status(&pool, filter.status)
        .await
        .map_err(|e| {
            error!(?e, "DB error listing providers for admin");
            AppError::Db(e)
        })?;
    Ok(Json(providers))
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Visibility {
    pub is_active: bool,
}

pub async fn set_visibility(
    Extension(pool): Extension<PgPool>,
    AdminUser { user_id: admin_id }: AdminUser,
    Path(provider_id): Path<Uuid>,
    Json(payload): Json<Visibility>,
) -> AppResult<Json<Visibility>> {
    let is_active: bool = sqlx::query_scalar(
        "UPDATE providers SET is_active = $2, updated_at = NOW() WHERE id = $1 RETURNING is_active",
    )
    .bind(provider_id)
    .bind(payload.is_active)
    .fetch_optional(&pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error updating provider visibility");
        AppError::Db(e)
    })?
    .ok_or(AppError::NotFound)?;
    info!(%admin_id, %provider_id, is_active, "provider visibility changed");
    Ok(Json(Visibility { is_active }))
}

pub async fn list_contact_submissions(
    Extension(pool): Extension<PgPool>,
    AdminUser { .. }: AdminUser,
) -> AppResult<Json<Vec<ContactSubmission>>> {
    let submissions = sqlx::query_as::<_, ContactSubmission>(
        "SELECT id, name, email, subject, message, created_at FROM contact_submissions \
         ORDER BY created_at DESC",
    )
    .fetch_all(&pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error listing contact submissions");
        AppError::Db(e)
    })?;
    Ok(Json(submissions))
}
