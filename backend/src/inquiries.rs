use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::listings::ensure_owner;
use crate::validation::{self, ValidationError};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Inquiry {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ContactSubmission {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub subject: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct NewInquiry {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub message: String,
}

impl NewInquiry {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::required("name", &self.name)?;
        validation::email("email", validation::required("email", &self.email)?)?;
        validation::optional_phone("phone", self.phone.as_deref())?;
        validation::required("message", &self.message)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct NewContact {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub message: String,
}

impl NewContact {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::required("name", &self.name)?;
        validation::email("email", validation::required("email", &self.email)?)?;
        validation::required("message", &self.message)?;
        Ok(())
    }
}

pub fn routes() -> Router {
    Router::new()
        .route(
            "/api/providers/:id/inquiries",
            post(create_inquiry).get(list_inquiries),
        )
        .route("/api/contact", post(submit_contact))
}

pub async fn create_inquiry(
    Extension(pool): Extension<PgPool>,
    Path(provider_id): Path<Uuid>,
    Json(payload): Json<NewInquiry>,
) -> AppResult<(StatusCode, Json<Inquiry>)> {
    payload.validate()?;
    let inquiry = sqlx::query_as::<_, Inquiry>(
        r#"
        INSERT INTO provider_inquiries (provider_id, name, email, phone, message)
        SELECT id, $2, $3, $4, $5 FROM providers WHERE id = $1 AND is_active = TRUE
        RETURNING id, provider_id, name, email, phone, message, created_at
        "#,
    )
    .bind(provider_id)
    .bind(payload.name.trim())
    .bind(payload.email.trim())
    .bind(payload.phone.as_deref().map(str::trim).filter(|v| !v.is_empty()))
    .bind(payload.message.trim())
    .fetch_optional(&pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error storing inquiry");
        AppError::Db(e)
    })?
    .ok_or(AppError::NotFound)?;
    info!(inquiry_id = %inquiry.id, %provider_id, "provider inquiry received");
    Ok((StatusCode::CREATED, Json(inquiry)))
}

pub async fn list_inquiries(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Path(provider_id): Path<Uuid>,
) -> AppResult<Json<Vec<Inquiry>>> {
    ensure_owner(&pool, provider_id, user_id).await?;
    let inquiries = sqlx::query_as::<_, Inquiry>(
        "SELECT id, provider_id, name, email, phone, message, created_at \
         FROM provider_inquiries WHERE provider_id = $1 ORDER BY created_at DESC",
    )
    .bind(provider_id)
    .fetch_all(&pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error listing inquiries");
        AppError::Db(e)
    })?;
    Ok(Json(inquiries))
}

pub async fn submit_contact(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<NewContact>,
) -> AppResult<(StatusCode, Json<ContactSubmission>)> {
    payload.validate()?;
    let submission = sqlx::query_as::<_, ContactSubmission>(
        "INSERT INTO contact_submissions (name, email, subject, message) VALUES ($1, $2, $3, $4) \
         RETURNING id, name, email, subject, message, created_at",
    )
    .bind(payload.name.trim())
    .bind(payload.email.trim())
    .bind(payload.subject.as_deref().map(str::trim).filter(|v| !v.is_empty()))
    .bind(payload.message.trim())
    .fetch_one(&pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error storing contact submission");
        AppError::Db(e)
    })?;
    info!(submission_id = %submission.id, "contact form submitted");
    Ok((StatusCode::CREATED, Json(submission)))
}
